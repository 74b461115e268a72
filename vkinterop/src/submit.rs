// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Queue submissions that signal and wait on synchronization primitives.
//!
//! [`CommandSubmission`] is implemented for [`Queue`]. The submissions it makes are either empty
//! or carry a batch of GPU work described by a [`SubmissionConfig`], so that the signal
//! operations are still pending when the call returns.
//!
//! [`SyncPrimitive`] lets code that checks payload sharing be written once for semaphores and
//! fences.

use crate::{
    capabilities::{query_fence_support, query_semaphore_support},
    carrier::ExternalHandleCarrier,
    device::{Device, DeviceOwned, Queue},
    driver::{SubmitInfo, WorkInfo},
    handle::NativeHandle,
    sync::{
        ExternalFenceHandleType, ExternalSemaphoreHandleType, Fence, Permanence, Semaphore,
        SemaphoreCreateInfo,
    },
    InteropError, VulkanObject,
};
use ash::vk;
use smallvec::SmallVec;
use std::{sync::Arc, time::Duration};

/// How much GPU work a submission runs before its signal operations.
///
/// The amount is chosen once per process, with [`SubmissionConfig::calibrate`] or by hand, and
/// passed to every submission that needs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SubmissionConfig {
    /// The size in bytes of the buffer the work writes to.
    ///
    /// The default value is 1 MiB.
    pub work_buffer_size: u64,

    /// How many times the work is repeated in one submission.
    ///
    /// The default value is `1`.
    pub work_iterations: u32,

    /// How long waits on fences may take before they are considered failed. `None` waits
    /// forever.
    ///
    /// The default value is 10 seconds.
    pub wait_timeout: Option<Duration>,
}

impl Default for SubmissionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            work_buffer_size: 1 << 20,
            work_iterations: 1,
            wait_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl SubmissionConfig {
    const MAX_ITERATIONS: u32 = 1 << 12;

    /// Finds an amount of work that is still running right after the submit call returns.
    ///
    /// The iteration count is doubled until a fence signaled after the work is observed
    /// unsignaled by a zero-timeout poll. If no count up to an internal limit achieves this, the
    /// largest is returned.
    pub fn calibrate(queue: &Queue, base: SubmissionConfig) -> Result<Self, InteropError> {
        let fence = Fence::new(queue.device().clone(), Default::default())?;
        let mut config = SubmissionConfig {
            work_iterations: base.work_iterations.max(1),
            ..base
        };

        loop {
            queue.submit_work_then_signal(&config, &[], Some(&fence))?;
            let still_running = !fence.wait(Some(Duration::ZERO))?;

            if !fence.wait(config.wait_timeout)? {
                return Err(InteropError::Timeout);
            }
            fence.reset()?;

            if still_running || config.work_iterations >= Self::MAX_ITERATIONS {
                log::debug!(
                    "calibrated submissions to {} iterations over {} bytes",
                    config.work_iterations,
                    config.work_buffer_size,
                );

                return Ok(config);
            }

            config.work_iterations *= 2;
        }
    }

    #[inline]
    fn work_info(&self) -> WorkInfo {
        WorkInfo {
            buffer_size: self.work_buffer_size,
            iterations: self.work_iterations,
        }
    }
}

/// Submission of signal and wait operations to a queue.
pub trait CommandSubmission {
    /// Submits a batch that only signals `semaphore`.
    fn submit_empty_signal(&self, semaphore: &Semaphore) -> Result<(), InteropError>;

    /// Submits a batch that only waits on `semaphore`. The wait consumes the payload, and undoes
    /// a temporary import.
    fn submit_empty_wait(&self, semaphore: &Semaphore) -> Result<(), InteropError>;

    /// Submits a batch that only signals `fence`. The fence must not be signaled.
    fn submit_empty_signal_fence(&self, fence: &Fence) -> Result<(), InteropError>;

    /// Submits GPU work followed by signal operations on `semaphores` and `fence`.
    fn submit_work_then_signal(
        &self,
        config: &SubmissionConfig,
        semaphores: &[&Semaphore],
        fence: Option<&Fence>,
    ) -> Result<(), InteropError>;

    /// Waits until every batch submitted so far has completed.
    fn wait_idle(&self) -> Result<(), InteropError>;
}

impl CommandSubmission for Queue {
    #[inline]
    fn submit_empty_signal(&self, semaphore: &Semaphore) -> Result<(), InteropError> {
        submit(self, &[], &[semaphore], None, None)
    }

    #[inline]
    fn submit_empty_wait(&self, semaphore: &Semaphore) -> Result<(), InteropError> {
        submit(self, &[semaphore], &[], None, None)
    }

    #[inline]
    fn submit_empty_signal_fence(&self, fence: &Fence) -> Result<(), InteropError> {
        submit(self, &[], &[], Some(fence), None)
    }

    #[inline]
    fn submit_work_then_signal(
        &self,
        config: &SubmissionConfig,
        semaphores: &[&Semaphore],
        fence: Option<&Fence>,
    ) -> Result<(), InteropError> {
        submit(self, &[], semaphores, fence, Some(config.work_info()))
    }

    fn wait_idle(&self) -> Result<(), InteropError> {
        let _state = self.lock();

        // SAFETY: the queue is locked.
        unsafe { self.device().driver().queue_wait_idle() }?;

        Ok(())
    }
}

fn submit(
    queue: &Queue,
    wait_semaphores: &[&Semaphore],
    signal_semaphores: &[&Semaphore],
    fence: Option<&Fence>,
    work: Option<WorkInfo>,
) -> Result<(), InteropError> {
    let device = queue.device();
    let foreign = wait_semaphores
        .iter()
        .chain(signal_semaphores)
        .any(|semaphore| semaphore.device().id() != device.id())
        || fence.is_some_and(|fence| fence.device().id() != device.id());

    if foreign {
        return Err(InteropError::validation(
            "Queue::submit",
            "a semaphore or fence of the submission belongs to another device",
        ));
    }

    if let Some(fence) = fence {
        fence.check_submittable()?;
    }

    let wait_handles: SmallVec<[vk::Semaphore; 4]> =
        wait_semaphores.iter().map(|s| s.handle()).collect();
    let signal_handles: SmallVec<[vk::Semaphore; 4]> =
        signal_semaphores.iter().map(|s| s.handle()).collect();

    let mut state = queue.lock();

    // SAFETY: every object belongs to the device of the queue, and the queue is locked.
    unsafe {
        device.driver().queue_submit(&SubmitInfo {
            wait_semaphores: &wait_handles,
            signal_semaphores: &signal_handles,
            fence: fence.map(|fence| fence.handle()),
            work,
        })
    }?;

    state.submission_count += 1;

    for semaphore in wait_semaphores {
        semaphore.wait_submitted();
    }

    for semaphore in signal_semaphores {
        semaphore.signal_submitted();
    }

    if let Some(fence) = fence {
        fence.signal_submitted();
    }

    log::trace!(
        "submission {} on queue {:?}: wait {:?}, signal {:?}, fence {:?}, work {:?}",
        state.submission_count,
        queue.handle(),
        wait_handles,
        signal_handles,
        fence.map(|fence| fence.handle()),
        work,
    );

    Ok(())
}

/// A semaphore or a fence, as seen by code that checks how payloads are shared.
pub trait SyncPrimitive: ExternalHandleCarrier<ImportInfo = Permanence> {
    /// A short name of the object class.
    const CLASS: &'static str;

    /// Creates an object that can be exported as `handle_type`.
    fn new_exportable(
        device: Arc<Device>,
        handle_type: Self::HandleType,
    ) -> Result<Self, InteropError>;

    /// Creates an object that cannot be exported, to import into.
    fn new_unexportable(device: Arc<Device>) -> Result<Self, InteropError>;

    /// Returns [`InteropError::NotSupported`] unless the physical device of `device` can both
    /// export and import `handle_type`.
    fn check_support(device: &Device, handle_type: Self::HandleType) -> Result<(), InteropError>;

    /// The permanence to import `handle_type` with when the scenario does not care.
    fn default_permanence(handle_type: Self::HandleType) -> Permanence;

    /// Imports `handle` into `self`, replacing its payload.
    fn import_into(
        &self,
        handle_type: Self::HandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<(), InteropError>;

    /// Submits a batch to `queue` that signals the object.
    fn submit_signal(&self, queue: &Queue) -> Result<(), InteropError>;

    /// Submits a batch to `queue` that signals the object after a batch of GPU work.
    fn submit_work_then_signal(
        &self,
        queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<(), InteropError>;

    /// Waits until the object is signaled, and returns it to the unsignaled state.
    ///
    /// For a semaphore this submits a wait and waits for the queue to be idle. For a fence this
    /// waits on the host for at most `config.wait_timeout`, returning
    /// [`InteropError::Timeout`] if it elapses, and then resets the fence. Both undo a temporary
    /// import.
    fn wait_signaled(&self, queue: &Queue, config: &SubmissionConfig) -> Result<(), InteropError>;

    /// Checks that `self` has its own payload again after a temporary import from `exporter`
    /// was undone by [`wait_signaled`](Self::wait_signaled). Returns `Ok(false)`, or the error
    /// the driver reports, if `self` still uses the imported payload.
    ///
    /// The objects are left unsignaled.
    fn check_import_undone(
        &self,
        exporter: &Self,
        queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<bool, InteropError>;

    /// Returns whether the object currently uses a temporarily imported payload.
    fn has_temporary_import(&self) -> bool;
}

impl SyncPrimitive for Semaphore {
    const CLASS: &'static str = "semaphore";

    #[inline]
    fn new_exportable(
        device: Arc<Device>,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<Self, InteropError> {
        Semaphore::new_exportable(device, handle_type)
    }

    #[inline]
    fn new_unexportable(device: Arc<Device>) -> Result<Self, InteropError> {
        Semaphore::new(device, SemaphoreCreateInfo::default())
    }

    #[inline]
    fn check_support(
        device: &Device,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<(), InteropError> {
        query_semaphore_support(device.physical_device(), handle_type).require_export_import()
    }

    #[inline]
    fn default_permanence(handle_type: ExternalSemaphoreHandleType) -> Permanence {
        handle_type.default_permanence()
    }

    #[inline]
    fn import_into(
        &self,
        handle_type: ExternalSemaphoreHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<(), InteropError> {
        self.import(handle_type, handle, permanence)
    }

    #[inline]
    fn submit_signal(&self, queue: &Queue) -> Result<(), InteropError> {
        queue.submit_empty_signal(self)
    }

    #[inline]
    fn submit_work_then_signal(
        &self,
        queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<(), InteropError> {
        queue.submit_work_then_signal(config, &[self], None)
    }

    fn wait_signaled(
        &self,
        queue: &Queue,
        _config: &SubmissionConfig,
    ) -> Result<(), InteropError> {
        queue.submit_empty_wait(self)?;
        queue.wait_idle()
    }

    fn check_import_undone(
        &self,
        exporter: &Self,
        queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<bool, InteropError> {
        // The payload of a binary semaphore cannot be queried. If `self` still used the
        // imported payload, both signals would land on it and the second wait would find
        // nothing to wait for.
        self.submit_signal(queue)?;
        exporter.submit_signal(queue)?;
        exporter.wait_signaled(queue, config)?;
        self.wait_signaled(queue, config)?;

        Ok(true)
    }

    #[inline]
    fn has_temporary_import(&self) -> bool {
        self.current_import().is_some_and(|import| import.is_temporary())
    }
}

impl SyncPrimitive for Fence {
    const CLASS: &'static str = "fence";

    #[inline]
    fn new_exportable(
        device: Arc<Device>,
        handle_type: ExternalFenceHandleType,
    ) -> Result<Self, InteropError> {
        Fence::new_exportable(device, handle_type)
    }

    #[inline]
    fn new_unexportable(device: Arc<Device>) -> Result<Self, InteropError> {
        Fence::new(device, Default::default())
    }

    #[inline]
    fn check_support(
        device: &Device,
        handle_type: ExternalFenceHandleType,
    ) -> Result<(), InteropError> {
        query_fence_support(device.physical_device(), handle_type).require_export_import()
    }

    #[inline]
    fn default_permanence(handle_type: ExternalFenceHandleType) -> Permanence {
        handle_type.default_permanence()
    }

    #[inline]
    fn import_into(
        &self,
        handle_type: ExternalFenceHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<(), InteropError> {
        self.import(handle_type, handle, permanence)
    }

    #[inline]
    fn submit_signal(&self, queue: &Queue) -> Result<(), InteropError> {
        queue.submit_empty_signal_fence(self)
    }

    #[inline]
    fn submit_work_then_signal(
        &self,
        queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<(), InteropError> {
        queue.submit_work_then_signal(config, &[], Some(self))
    }

    fn wait_signaled(
        &self,
        _queue: &Queue,
        config: &SubmissionConfig,
    ) -> Result<(), InteropError> {
        if !self.wait(config.wait_timeout)? {
            return Err(InteropError::Timeout);
        }

        self.reset()
    }

    fn check_import_undone(
        &self,
        _exporter: &Self,
        _queue: &Queue,
        _config: &SubmissionConfig,
    ) -> Result<bool, InteropError> {
        // The imported payload was signaled, and the reset only touched the permanent one.
        Ok(!self.is_signaled()?)
    }

    #[inline]
    fn has_temporary_import(&self) -> bool {
        self.current_import().is_some_and(|import| import.is_temporary())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{submit, CommandSubmission, SubmissionConfig, SyncPrimitive};
    use crate::{
        device::{DeviceExtensions, DeviceOwned},
        sync::{ExternalSemaphoreHandleType, Fence, Semaphore, SignalState},
        InteropError,
    };
    use std::time::Duration;

    #[test]
    fn work_keeps_the_signal_pending() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let fence = Fence::new(device, Default::default()).unwrap();

        fence
            .submit_work_then_signal(&queue, &SubmissionConfig::default())
            .unwrap();
        assert!(!fence.wait(Some(Duration::ZERO)).unwrap());

        queue.wait_idle().unwrap();
        assert!(fence.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn calibration_stops_once_work_is_observable() {
        let (_device, queue) = soft_device!(DeviceExtensions::empty());

        let config = SubmissionConfig::calibrate(&queue, SubmissionConfig::default()).unwrap();
        assert_eq!(config.work_iterations, 1);
    }

    #[test]
    fn objects_of_another_device_are_rejected() {
        let (_device_a, queue_a) = soft_device!(DeviceExtensions::empty());
        let (device_b, _queue_b) = soft_device!(DeviceExtensions::empty());
        let semaphore = Semaphore::new(device_b, Default::default()).unwrap();

        assert_ne!(queue_a.device().id(), semaphore.device().id());
        assert!(matches!(
            queue_a.submit_empty_signal(&semaphore),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn semaphore_wait_consumes_the_signal() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));
        let semaphore = <Semaphore as SyncPrimitive>::new_exportable(device, handle_type).unwrap();

        semaphore.submit_signal(&queue).unwrap();
        assert_eq!(semaphore.signal_state(), SignalState::Signaled);

        semaphore
            .wait_signaled(&queue, &SubmissionConfig::default())
            .unwrap();
        assert_eq!(semaphore.signal_state(), SignalState::Unsignaled);
    }

    #[test]
    fn fence_wait_gives_up_after_the_timeout() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let fence = Fence::new(device, Default::default()).unwrap();
        let config = SubmissionConfig::default();

        fence.submit_work_then_signal(&queue, &config).unwrap();
        let impatient = SubmissionConfig {
            wait_timeout: Some(Duration::ZERO),
            ..config
        };
        assert!(matches!(
            fence.wait_signaled(&queue, &impatient),
            Err(InteropError::Timeout),
        ));

        fence.wait_signaled(&queue, &config).unwrap();
        assert_eq!(fence.signal_state(), SignalState::Unsignaled);
    }

    #[test]
    fn failed_wait_leaves_other_semaphores_signaled() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let signaled = Semaphore::new(device.clone(), Default::default()).unwrap();
        let unsignaled = Semaphore::new(device, Default::default()).unwrap();

        queue.submit_empty_signal(&signaled).unwrap();
        assert!(matches!(
            submit(&queue, &[&signaled, &unsignaled], &[], None, None),
            Err(InteropError::DeviceLost),
        ));

        // The signal of `signaled` was not consumed by the rejected batch.
        queue.submit_empty_wait(&signaled).unwrap();
        queue.wait_idle().unwrap();
    }
}
