// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A fence provides synchronization between the device and the host, or between an external
//! source and the host.

use super::{
    ExternalFenceHandleType, ExternalFenceHandleTypes, ImportedPayload, Permanence, SignalState,
    Transference,
};
use crate::{
    device::{Device, DeviceExtensions, DeviceOwned},
    handle::{ImportOwnership, NativeHandle},
    macros::impl_id_counter,
    InteropError, NonExhaustive, VulkanObject,
};
use ash::vk;
use parking_lot::Mutex;
use std::{num::NonZero, sync::Arc, time::Duration};

/// A two-state synchronization primitive that is signalled by the device and waited on by the
/// host.
///
/// Unlike a semaphore, a fence stays signaled after a wait. Only [`reset`](Fence::reset) makes
/// it unsignaled again, and only a reset undoes a temporary import.
#[derive(Debug)]
pub struct Fence {
    handle: vk::Fence,
    device: Arc<Device>,
    id: NonZero<u64>,

    export_handle_types: ExternalFenceHandleTypes,

    state: Mutex<FenceState>,
}

impl Fence {
    /// Creates a new `Fence`.
    pub fn new(device: Arc<Device>, create_info: FenceCreateInfo) -> Result<Fence, InteropError> {
        let FenceCreateInfo {
            signaled,
            export_handle_types,
            _ne: _,
        } = create_info;

        for handle_type in export_handle_types.iter() {
            device.check_extensions(&DeviceExtensions::for_fence(handle_type))?;

            let properties = device
                .physical_device()
                .external_fence_properties(handle_type);

            if !properties.exportable {
                return Err(InteropError::not_supported(format!(
                    "fences cannot be exported as {}",
                    handle_type.name(),
                )));
            }

            if !properties
                .compatible_handle_types
                .contains(export_handle_types)
            {
                return Err(InteropError::validation(
                    "Fence::new",
                    format!(
                        "export_handle_types contains {:?}, which is not compatible with {:?}",
                        export_handle_types - properties.compatible_handle_types,
                        handle_type,
                    ),
                ));
            }
        }

        // SAFETY: the driver belongs to `device`.
        let handle = unsafe {
            device
                .driver()
                .create_fence(signaled, export_handle_types)
        }?;

        Ok(Fence {
            handle,
            device,
            id: Self::next_id(),
            export_handle_types,
            state: Mutex::new(FenceState {
                signal_state: if signaled {
                    SignalState::Signaled
                } else {
                    SignalState::Unsignaled
                },
                current_import: None,
            }),
        })
    }

    /// Creates a new unsignaled `Fence` that can be exported as `handle_type`.
    #[inline]
    pub fn new_exportable(
        device: Arc<Device>,
        handle_type: ExternalFenceHandleType,
    ) -> Result<Fence, InteropError> {
        Self::new(
            device,
            FenceCreateInfo {
                export_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
    }

    /// Creates a new `Fence` and imports `handle` into it.
    ///
    /// Ownership of `handle` follows [`import`](Self::import).
    pub fn new_imported(
        device: Arc<Device>,
        handle_type: ExternalFenceHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<Fence, InteropError> {
        let fence = Self::new(device, FenceCreateInfo::default())?;
        fence.import(handle_type, handle, permanence)?;

        Ok(fence)
    }

    /// Returns the handle types that can be exported from the fence.
    #[inline]
    pub fn export_handle_types(&self) -> ExternalFenceHandleTypes {
        self.export_handle_types
    }

    /// Returns what the layer knows about the current payload, without asking the driver.
    #[inline]
    pub fn signal_state(&self) -> SignalState {
        self.state.lock().signal_state
    }

    /// Returns the payload currently imported into the fence, if any.
    #[inline]
    pub fn current_import(&self) -> Option<ImportedPayload<ExternalFenceHandleType>> {
        self.state.lock().current_import
    }

    /// Returns true if the fence is signaled.
    pub fn is_signaled(&self) -> Result<bool, InteropError> {
        // SAFETY: the fence belongs to the driver of `self.device`.
        let signaled = unsafe { self.device.driver().fence_status(self.handle) }?;

        if signaled {
            self.state.lock().signal_state = SignalState::Signaled;
        }

        Ok(signaled)
    }

    /// Waits until the fence is signaled, or at least until the timeout duration has elapsed.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first; a zero timeout polls the fence. `None`
    /// waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, InteropError> {
        let timeout_ns = timeout.map_or(u64::MAX, |timeout| {
            timeout
                .as_secs()
                .saturating_mul(1_000_000_000)
                .saturating_add(timeout.subsec_nanos() as u64)
        });

        // SAFETY: the fence belongs to the driver of `self.device`.
        let signaled = unsafe { self.device.driver().wait_for_fence(self.handle, timeout_ns) }?;

        if signaled {
            self.state.lock().signal_state = SignalState::Signaled;
        }

        Ok(signaled)
    }

    /// Resets the fence to unsignaled. A temporary import is undone, and the fence has the
    /// payload it had before that import again.
    pub fn reset(&self) -> Result<(), InteropError> {
        let mut state = self.state.lock();

        // SAFETY: the fence belongs to the driver of `self.device`.
        unsafe { self.device.driver().reset_fence(self.handle) }?;
        state.reset_completed();

        Ok(())
    }

    /// Exports the payload of the fence as a native handle.
    ///
    /// Every call returns a new handle; earlier handles stay valid. Exporting a handle type with
    /// [`Transference::Copy`] has the side effects of a reset. Such an export may return the
    /// already-signaled sentinel ([`NativeHandle::is_signaled_sentinel`]), but never for a fence
    /// that is known to be unsignaled.
    pub fn export(
        &self,
        handle_type: ExternalFenceHandleType,
    ) -> Result<NativeHandle, InteropError> {
        if !self.export_handle_types.contains_enum(handle_type) {
            return Err(InteropError::ExportFailed(
                format!(
                    "the fence was not created exportable as {}",
                    handle_type.name(),
                )
                .into(),
            ));
        }

        self.device
            .check_extensions(&DeviceExtensions::for_fence(handle_type))?;

        let mut state = self.state.lock();

        // SAFETY: the fence was created exportable as `handle_type` on this driver.
        let raw = unsafe { self.device.driver().export_fence(self.handle, handle_type) }
            .map_err(InteropError::from_export)?;

        // SAFETY: the driver hands ownership of `raw` to the caller.
        let handle = unsafe { NativeHandle::from_raw(handle_type.handle_kind(), raw) }?;

        if handle.is_signaled_sentinel() && state.signal_state == SignalState::Unsignaled {
            return Err(InteropError::ExportFailed(
                "the driver returned the signaled sentinel for an unsignaled fence".into(),
            ));
        }

        if handle_type.transference() == Transference::Copy {
            state.reset_completed();
        }

        log::debug!(
            "exported {:?} from fence {:?} as {:?}",
            handle_type,
            self.handle,
            handle,
        );

        Ok(handle)
    }

    /// Imports a payload from a native handle into the fence, replacing the current one.
    ///
    /// On success, the ownership of `handle` follows
    /// [`ExternalFenceHandleType::import_ownership`]. On failure, the caller always keeps the
    /// handle.
    pub fn import(
        &self,
        handle_type: ExternalFenceHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<(), InteropError> {
        self.device
            .check_extensions(&DeviceExtensions::for_fence(handle_type))?;

        if !handle_type.supports_permanence(permanence) {
            return Err(InteropError::validation(
                "Fence::import",
                format!(
                    "{} handles cannot be imported with {:?} permanence",
                    handle_type.name(),
                    permanence,
                ),
            ));
        }

        if !self
            .device
            .physical_device()
            .external_fence_properties(handle_type)
            .importable
        {
            return Err(InteropError::not_supported(format!(
                "fences cannot be imported from {}",
                handle_type.name(),
            )));
        }

        handle.check_importable(
            handle_type.handle_kind(),
            handle_type.transference() == Transference::Copy,
        )?;

        let mut state = self.state.lock();

        // SAFETY: `handle` owns its value, and keeps it if the import fails.
        unsafe {
            self.device
                .driver()
                .import_fence(self.handle, handle_type, handle.raw(), permanence)
        }
        .map_err(InteropError::from_import)?;

        log::debug!(
            "imported {:?} into fence {:?} with {:?} permanence",
            handle,
            self.handle,
            permanence,
        );

        state.signal_state = if handle.is_signaled_sentinel() {
            SignalState::Signaled
        } else {
            SignalState::Unknown
        };
        state.current_import = Some(ImportedPayload {
            handle_type,
            permanence,
        });

        if handle_type.import_ownership() == ImportOwnership::Transferred {
            handle.release();
        }

        Ok(())
    }

    /// Checks that the fence can be given to a queue submission.
    pub(crate) fn check_submittable(&self) -> Result<(), InteropError> {
        if self.state.lock().signal_state == SignalState::Signaled {
            return Err(InteropError::validation(
                "Fence::submit",
                "the fence is signaled and must be reset before it is submitted",
            ));
        }

        Ok(())
    }

    /// Records that a signal operation was submitted.
    #[inline]
    pub(crate) fn signal_submitted(&self) {
        self.state.lock().signal_state = SignalState::Unknown;
    }
}

impl Drop for Fence {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the fence is owned by `self` and no longer used.
        unsafe { self.device.driver().destroy_fence(self.handle) };
    }
}

unsafe impl VulkanObject for Fence {
    type Handle = vk::Fence;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Fence {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Fence);

/// Parameters to create a new `Fence`.
#[derive(Clone, Debug)]
pub struct FenceCreateInfo {
    /// Whether the fence is created in the signaled state.
    ///
    /// The default value is `false`.
    pub signaled: bool,

    /// The handle types that can be exported from the fence.
    ///
    /// The default value is [`ExternalFenceHandleTypes::empty()`].
    pub export_handle_types: ExternalFenceHandleTypes,

    pub _ne: NonExhaustive,
}

impl Default for FenceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            signaled: false,
            export_handle_types: ExternalFenceHandleTypes::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// The fence configuration to query in
/// [`PhysicalDevice::external_fence_properties`](crate::device::PhysicalDevice::external_fence_properties).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalFenceProperties {
    /// Whether handles of this type can be exported from a fence.
    pub exportable: bool,

    /// Whether handles of this type can be imported into a fence.
    pub importable: bool,

    /// The handle types that can be exported from a fence whose payload was imported from
    /// this handle type.
    pub export_from_imported_handle_types: ExternalFenceHandleTypes,

    /// The handle types that can be specified together with this one when creating a fence.
    pub compatible_handle_types: ExternalFenceHandleTypes,
}

#[derive(Debug)]
struct FenceState {
    signal_state: SignalState,
    current_import: Option<ImportedPayload<ExternalFenceHandleType>>,
}

impl FenceState {
    fn reset_completed(&mut self) {
        self.signal_state = SignalState::Unsignaled;

        if self
            .current_import
            .is_some_and(|payload| payload.is_temporary())
        {
            self.current_import = None;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{Fence, FenceCreateInfo};
    use crate::{
        device::DeviceExtensions,
        submit::SyncPrimitive,
        sync::{ExternalFenceHandleType, Permanence, SignalState},
        InteropError,
    };
    use std::time::Duration;

    #[test]
    fn wait_and_reset() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let fence = Fence::new(
            device,
            FenceCreateInfo {
                signaled: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(fence.is_signaled().unwrap());
        assert!(fence.wait(Some(Duration::ZERO)).unwrap());

        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
        assert!(!fence.wait(Some(Duration::ZERO)).unwrap());

        fence.submit_signal(&queue).unwrap();
        assert!(fence.wait(None).unwrap());
        assert_eq!(fence.signal_state(), SignalState::Signaled);
    }

    #[test]
    fn signaled_fence_cannot_be_submitted() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let fence = Fence::new(
            device,
            FenceCreateInfo {
                signaled: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            fence.submit_signal(&queue),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn reference_import_aliases_payload() {
        let handle_type = ExternalFenceHandleType::OpaqueFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_fence(handle_type));

        let fence_a = Fence::new_exportable(device.clone(), handle_type).unwrap();
        let mut handle = fence_a.export(handle_type).unwrap();
        let fence_b =
            Fence::new_imported(device, handle_type, &mut handle, Permanence::Permanent).unwrap();
        assert!(!handle.has_value());

        fence_a.submit_signal(&queue).unwrap();
        assert!(fence_b.wait(None).unwrap());

        fence_b.reset().unwrap();
        assert!(!fence_a.is_signaled().unwrap());
    }

    #[test]
    fn temporary_import_is_undone_by_reset_only() {
        let handle_type = ExternalFenceHandleType::OpaqueFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_fence(handle_type));

        let fence_a = Fence::new_exportable(device.clone(), handle_type).unwrap();
        let fence_b = Fence::new(device, FenceCreateInfo::default()).unwrap();
        let mut handle = fence_a.export(handle_type).unwrap();

        fence_b
            .import(handle_type, &mut handle, Permanence::Temporary)
            .unwrap();

        fence_a.submit_signal(&queue).unwrap();
        assert!(fence_b.wait(None).unwrap());
        assert!(fence_b.current_import().is_some());

        fence_b.reset().unwrap();
        assert_eq!(fence_b.current_import(), None);

        // `fence_b` has its own payload again; signaling it does not touch `fence_a`.
        fence_a.reset().unwrap();
        fence_b.submit_signal(&queue).unwrap();
        assert!(fence_b.wait(None).unwrap());
        assert!(!fence_a.is_signaled().unwrap());
    }

    #[test]
    fn sync_fd_export_acts_as_reset() {
        let handle_type = ExternalFenceHandleType::SyncFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_fence(handle_type));

        let fence = Fence::new_exportable(device.clone(), handle_type).unwrap();
        fence.submit_signal(&queue).unwrap();
        fence.wait(None).unwrap();

        let mut handle = fence.export(handle_type).unwrap();
        assert_eq!(fence.signal_state(), SignalState::Unsignaled);

        let imported =
            Fence::new_imported(device, handle_type, &mut handle, Permanence::Temporary).unwrap();
        assert!(imported.wait(None).unwrap());
    }
}
