// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A semaphore provides synchronization between multiple queues, with non-command buffer
//! commands on the same queue, or between the device and an external source.

use super::{
    ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes, ImportedPayload, Permanence,
    SignalState, Transference,
};
use crate::{
    device::{Device, DeviceExtensions, DeviceOwned},
    handle::{ImportOwnership, NativeHandle},
    macros::impl_id_counter,
    InteropError, NonExhaustive, VulkanObject,
};
use ash::vk;
use parking_lot::Mutex;
use std::{num::NonZero, sync::Arc};

/// Used to provide synchronization between queues, and between the device and an external
/// source.
#[derive(Debug)]
pub struct Semaphore {
    handle: vk::Semaphore,
    device: Arc<Device>,
    id: NonZero<u64>,

    export_handle_types: ExternalSemaphoreHandleTypes,

    state: Mutex<SemaphoreState>,
}

impl Semaphore {
    /// Creates a new `Semaphore`.
    ///
    /// Every handle type of `create_info.export_handle_types` must be exportable on the physical
    /// device, and the device must have the extensions of
    /// [`DeviceExtensions::for_semaphore`] enabled for it.
    pub fn new(
        device: Arc<Device>,
        create_info: SemaphoreCreateInfo,
    ) -> Result<Semaphore, InteropError> {
        let SemaphoreCreateInfo {
            export_handle_types,
            _ne: _,
        } = create_info;

        for handle_type in export_handle_types.iter() {
            device.check_extensions(&DeviceExtensions::for_semaphore(handle_type))?;

            let properties = device
                .physical_device()
                .external_semaphore_properties(handle_type);

            if !properties.exportable {
                return Err(InteropError::not_supported(format!(
                    "semaphores cannot be exported as {}",
                    handle_type.name(),
                )));
            }

            if !properties
                .compatible_handle_types
                .contains(export_handle_types)
            {
                return Err(InteropError::validation(
                    "Semaphore::new",
                    format!(
                        "export_handle_types contains {:?}, which is not compatible with {:?}",
                        export_handle_types - properties.compatible_handle_types,
                        handle_type,
                    ),
                ));
            }
        }

        // SAFETY: the driver belongs to `device`.
        let handle = unsafe { device.driver().create_semaphore(export_handle_types) }?;

        Ok(Semaphore {
            handle,
            device,
            id: Self::next_id(),
            export_handle_types,
            state: Mutex::new(SemaphoreState::default()),
        })
    }

    /// Creates a new `Semaphore` that can be exported as `handle_type`.
    #[inline]
    pub fn new_exportable(
        device: Arc<Device>,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<Semaphore, InteropError> {
        Self::new(
            device,
            SemaphoreCreateInfo {
                export_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
    }

    /// Creates a new `Semaphore` and imports `handle` into it.
    ///
    /// Ownership of `handle` follows [`import`](Self::import).
    pub fn new_imported(
        device: Arc<Device>,
        handle_type: ExternalSemaphoreHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<Semaphore, InteropError> {
        let semaphore = Self::new(device, SemaphoreCreateInfo::default())?;
        semaphore.import(handle_type, handle, permanence)?;

        Ok(semaphore)
    }

    /// Returns the handle types that can be exported from the semaphore.
    #[inline]
    pub fn export_handle_types(&self) -> ExternalSemaphoreHandleTypes {
        self.export_handle_types
    }

    /// Returns what the layer knows about the current payload.
    #[inline]
    pub fn signal_state(&self) -> SignalState {
        self.state.lock().signal_state
    }

    /// Returns the payload currently imported into the semaphore, if any.
    #[inline]
    pub fn current_import(&self) -> Option<ImportedPayload<ExternalSemaphoreHandleType>> {
        self.state.lock().current_import
    }

    /// Exports the payload of the semaphore as a native handle.
    ///
    /// Every call returns a new handle; earlier handles stay valid. Exporting a handle type with
    /// [`Transference::Copy`] has the side effects of a wait on the semaphore: the semaphore is
    /// unsignaled afterwards and a temporary import is undone. Such an export requires a pending
    /// or completed signal, and may return the already-signaled sentinel
    /// ([`NativeHandle::is_signaled_sentinel`]).
    pub fn export(
        &self,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<NativeHandle, InteropError> {
        if !self.export_handle_types.contains_enum(handle_type) {
            return Err(InteropError::ExportFailed(
                format!(
                    "the semaphore was not created exportable as {}",
                    handle_type.name(),
                )
                .into(),
            ));
        }

        self.device
            .check_extensions(&DeviceExtensions::for_semaphore(handle_type))?;

        let mut state = self.state.lock();
        let transference = handle_type.transference();

        if transference == Transference::Copy && state.signal_state == SignalState::Unsignaled {
            return Err(InteropError::validation(
                "Semaphore::export",
                format!(
                    "{} can only be exported from a semaphore with a pending or completed signal",
                    handle_type.name(),
                ),
            ));
        }

        // SAFETY: the semaphore was created exportable as `handle_type` on this driver.
        let raw = unsafe {
            self.device
                .driver()
                .export_semaphore(self.handle, handle_type)
        }
        .map_err(InteropError::from_export)?;

        // SAFETY: the driver hands ownership of `raw` to the caller.
        let handle = unsafe { NativeHandle::from_raw(handle_type.handle_kind(), raw) }?;

        if transference == Transference::Copy {
            state.wait_completed();
        }

        log::debug!(
            "exported {:?} from semaphore {:?} as {:?}",
            handle_type,
            self.handle,
            handle,
        );

        Ok(handle)
    }

    /// Imports a payload from a native handle into the semaphore, replacing the current one.
    ///
    /// On success, the ownership of `handle` follows
    /// [`ExternalSemaphoreHandleType::import_ownership`]: with
    /// [`ImportOwnership::Transferred`] the handle is emptied, otherwise the caller still owns
    /// it. On failure, the caller always keeps the handle.
    pub fn import(
        &self,
        handle_type: ExternalSemaphoreHandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<(), InteropError> {
        self.device
            .check_extensions(&DeviceExtensions::for_semaphore(handle_type))?;

        if !handle_type.supports_permanence(permanence) {
            return Err(InteropError::validation(
                "Semaphore::import",
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
            .external_semaphore_properties(handle_type)
            .importable
        {
            return Err(InteropError::not_supported(format!(
                "semaphores cannot be imported from {}",
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
            self.device.driver().import_semaphore(
                self.handle,
                handle_type,
                handle.raw(),
                permanence,
            )
        }
        .map_err(InteropError::from_import)?;

        log::debug!(
            "imported {:?} into semaphore {:?} with {:?} permanence",
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

    /// Records that a signal operation was submitted.
    #[inline]
    pub(crate) fn signal_submitted(&self) {
        self.state.lock().signal_state = SignalState::Signaled;
    }

    /// Records that a wait operation was submitted.
    #[inline]
    pub(crate) fn wait_submitted(&self) {
        self.state.lock().wait_completed();
    }
}

impl Drop for Semaphore {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the semaphore is owned by `self` and no longer used.
        unsafe { self.device.driver().destroy_semaphore(self.handle) };
    }
}

unsafe impl VulkanObject for Semaphore {
    type Handle = vk::Semaphore;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Semaphore {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Semaphore);

/// Parameters to create a new `Semaphore`.
#[derive(Clone, Debug)]
pub struct SemaphoreCreateInfo {
    /// The handle types that can be exported from the semaphore.
    ///
    /// The default value is [`ExternalSemaphoreHandleTypes::empty()`].
    pub export_handle_types: ExternalSemaphoreHandleTypes,

    pub _ne: NonExhaustive,
}

impl Default for SemaphoreCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            export_handle_types: ExternalSemaphoreHandleTypes::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// The semaphore configuration to query in
/// [`PhysicalDevice::external_semaphore_properties`](crate::device::PhysicalDevice::external_semaphore_properties).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalSemaphoreProperties {
    /// Whether handles of this type can be exported from a semaphore.
    pub exportable: bool,

    /// Whether handles of this type can be imported into a semaphore.
    pub importable: bool,

    /// The handle types that can be exported from a semaphore whose payload was imported from
    /// this handle type.
    pub export_from_imported_handle_types: ExternalSemaphoreHandleTypes,

    /// The handle types that can be specified together with this one when creating a
    /// semaphore.
    pub compatible_handle_types: ExternalSemaphoreHandleTypes,
}

#[derive(Debug, Default)]
struct SemaphoreState {
    signal_state: SignalState,
    current_import: Option<ImportedPayload<ExternalSemaphoreHandleType>>,
}

impl SemaphoreState {
    fn wait_completed(&mut self) {
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
    use super::{Semaphore, SemaphoreCreateInfo};
    use crate::{
        device::DeviceExtensions,
        handle::NativeHandle,
        submit::CommandSubmission,
        sync::{
            ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes, Permanence, SignalState,
        },
        InteropError,
    };

    #[test]
    fn not_exportable_without_handle_type() {
        let (device, _queue) = soft_device!(DeviceExtensions::for_semaphore(
            ExternalSemaphoreHandleType::OpaqueFd
        ));
        let semaphore = Semaphore::new(device, SemaphoreCreateInfo::default()).unwrap();

        assert!(matches!(
            semaphore.export(ExternalSemaphoreHandleType::OpaqueFd),
            Err(InteropError::ExportFailed(_)),
        ));
    }

    #[test]
    fn missing_extension() {
        let (device, _queue) = soft_device!(DeviceExtensions::for_fence(
            crate::sync::ExternalFenceHandleType::OpaqueFd
        ));

        assert!(matches!(
            Semaphore::new_exportable(device, ExternalSemaphoreHandleType::OpaqueFd),
            Err(InteropError::ExtensionNotPresent { .. }),
        ));
    }

    #[test]
    fn unsupported_handle_type_is_a_skip() {
        let (device, _queue) = soft_device!(DeviceExtensions::for_semaphore(
            ExternalSemaphoreHandleType::OpaqueFd
        ));

        // The soft driver only implements fd handle types.
        let err = Semaphore::new(
            device,
            SemaphoreCreateInfo {
                export_handle_types: ExternalSemaphoreHandleTypes::OPAQUE_WIN32,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn opaque_fd_import_consumes_handle() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));

        let semaphore = Semaphore::new_exportable(device.clone(), handle_type).unwrap();
        let mut handle = semaphore.export(handle_type).unwrap();
        assert!(handle.has_value());

        let imported =
            Semaphore::new_imported(device, handle_type, &mut handle, Permanence::Permanent)
                .unwrap();

        assert!(!handle.has_value());
        assert_eq!(imported.signal_state(), SignalState::Unknown);
        assert!(imported.current_import().is_some());
    }

    #[test]
    fn temporary_import_is_undone_by_a_wait() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));

        let semaphore_a = Semaphore::new_exportable(device.clone(), handle_type).unwrap();
        let semaphore_b = Semaphore::new(device, SemaphoreCreateInfo::default()).unwrap();
        let mut handle = semaphore_a.export(handle_type).unwrap();

        semaphore_b
            .import(handle_type, &mut handle, Permanence::Temporary)
            .unwrap();

        queue.submit_empty_signal(&semaphore_a).unwrap();
        queue.submit_empty_wait(&semaphore_b).unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(semaphore_b.current_import(), None);

        // `semaphore_b` has its own payload again; signaling it leaves the shared payload
        // unsignaled, so a wait on `semaphore_a` has nothing to wait for.
        queue.submit_empty_signal(&semaphore_b).unwrap();
        assert!(matches!(
            queue.submit_empty_wait(&semaphore_a),
            Err(InteropError::DeviceLost),
        ));

        queue.submit_empty_wait(&semaphore_b).unwrap();
        queue.wait_idle().unwrap();
    }

    #[test]
    fn failed_import_keeps_handle() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));
        let semaphore = Semaphore::new(device, SemaphoreCreateInfo::default()).unwrap();

        // A socket is not an exported payload.
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut handle = NativeHandle::from_fd(a.into());

        assert!(matches!(
            semaphore.import(handle_type, &mut handle, Permanence::Permanent),
            Err(InteropError::ImportFailed(_)),
        ));
        assert!(handle.has_value());
    }

    #[test]
    fn sync_fd_needs_a_signal_and_temporary_permanence() {
        let handle_type = ExternalSemaphoreHandleType::SyncFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));
        let semaphore = Semaphore::new_exportable(device.clone(), handle_type).unwrap();

        assert!(matches!(
            semaphore.export(handle_type),
            Err(InteropError::ValidationFailed { .. }),
        ));

        queue.submit_empty_signal(&semaphore).unwrap();
        let mut handle = semaphore.export(handle_type).unwrap();

        // The export acted as a wait.
        assert_eq!(semaphore.signal_state(), SignalState::Unsignaled);

        let target = Semaphore::new(device, SemaphoreCreateInfo::default()).unwrap();
        assert!(matches!(
            target.import(handle_type, &mut handle, Permanence::Permanent),
            Err(InteropError::ValidationFailed { .. }),
        ));

        target
            .import(handle_type, &mut handle, Permanence::Temporary)
            .unwrap();
        queue.submit_empty_wait(&target).unwrap();
        queue.wait_idle().unwrap();

        assert_eq!(target.current_import(), None);
    }

    #[test]
    fn signaled_sentinel_is_accepted_by_sync_fd_only() {
        let (device, queue) = soft_device!(DeviceExtensions::for_semaphore(
            ExternalSemaphoreHandleType::SyncFd
        )
        .union(&DeviceExtensions::for_semaphore(
            ExternalSemaphoreHandleType::OpaqueFd
        )));
        let semaphore = Semaphore::new(device, SemaphoreCreateInfo::default()).unwrap();

        let mut sentinel = NativeHandle::signaled_sync_fd();
        assert!(matches!(
            semaphore.import(
                ExternalSemaphoreHandleType::OpaqueFd,
                &mut sentinel,
                Permanence::Temporary,
            ),
            Err(InteropError::InvalidHandle(_)),
        ));

        semaphore
            .import(
                ExternalSemaphoreHandleType::SyncFd,
                &mut sentinel,
                Permanence::Temporary,
            )
            .unwrap();
        assert_eq!(semaphore.signal_state(), SignalState::Signaled);

        queue.submit_empty_wait(&semaphore).unwrap();
        queue.wait_idle().unwrap();
    }
}
