// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The operations shared by every object that carries an external handle.
//!
//! Semaphores, fences and device memory each have their own handle type enum and their own
//! import parameters, but export and import work the same way for all of them. Code that only
//! moves payloads around, like [`export_then_import`], is written once against
//! [`ExternalHandleCarrier`].

use crate::{
    device::{Device, DeviceExtensions},
    handle::{HandleKind, ImportOwnership, NativeHandle},
    memory::{DeviceMemory, ExternalMemoryHandleType, MemoryAllocateInfo},
    sync::{
        ExternalFenceHandleType, ExternalSemaphoreHandleType, Fence, Permanence, Semaphore,
        Transference,
    },
    InteropError,
};
use std::{fmt::Debug, hash::Hash, sync::Arc};

/// A single external handle type of some object class.
pub trait ExternalHandleType: Copy + Debug + Eq + Hash + Send + Sync + 'static {
    /// Whether an import aliases the payload or receives a snapshot of it.
    fn transference(self) -> Transference;

    /// The kind of OS handle that carries the payload.
    fn handle_kind(self) -> HandleKind;

    /// Who owns the native handle after a successful import.
    fn import_ownership(self) -> ImportOwnership;

    /// The name of the handle type, as used in logs and scenario names.
    fn name(self) -> &'static str;

    /// The device extensions needed to export and import handles of this type.
    fn device_extensions(self) -> DeviceExtensions;
}

macro_rules! impl_external_handle_type {
    ($($ty:ty => $extensions:path),+ $(,)?) => {
        $(
            impl ExternalHandleType for $ty {
                #[inline]
                fn transference(self) -> Transference {
                    <$ty>::transference(self)
                }

                #[inline]
                fn handle_kind(self) -> HandleKind {
                    <$ty>::handle_kind(self)
                }

                #[inline]
                fn import_ownership(self) -> ImportOwnership {
                    <$ty>::import_ownership(self)
                }

                #[inline]
                fn name(self) -> &'static str {
                    <$ty>::name(self)
                }

                #[inline]
                fn device_extensions(self) -> DeviceExtensions {
                    $extensions(self)
                }
            }
        )+
    };
}

impl_external_handle_type!(
    ExternalSemaphoreHandleType => DeviceExtensions::for_semaphore,
    ExternalFenceHandleType => DeviceExtensions::for_fence,
    ExternalMemoryHandleType => DeviceExtensions::for_memory,
);

/// An object whose payload can be exported as a [`NativeHandle`] and imported from one.
pub trait ExternalHandleCarrier: Sized {
    type HandleType: ExternalHandleType;

    /// What [`import_handle`](Self::import_handle) needs besides the handle.
    type ImportInfo: Clone;

    /// Returns whether importing a handle of `handle_type` aliases the payload of the exporter
    /// or receives a snapshot of it.
    #[inline]
    fn classify(handle_type: Self::HandleType) -> Transference {
        handle_type.transference()
    }

    /// Exports the payload of `self` as a new native handle.
    fn export_handle(&self, handle_type: Self::HandleType) -> Result<NativeHandle, InteropError>;

    /// Creates a new object on `device` whose payload is imported from `handle`.
    ///
    /// On success, `handle` is emptied if the handle type transfers ownership. On failure, the
    /// caller keeps it.
    fn import_handle(
        device: &Arc<Device>,
        handle_type: Self::HandleType,
        handle: &mut NativeHandle,
        import_info: Self::ImportInfo,
    ) -> Result<Self, InteropError>;
}

impl ExternalHandleCarrier for Semaphore {
    type HandleType = ExternalSemaphoreHandleType;
    type ImportInfo = Permanence;

    #[inline]
    fn export_handle(&self, handle_type: Self::HandleType) -> Result<NativeHandle, InteropError> {
        self.export(handle_type)
    }

    #[inline]
    fn import_handle(
        device: &Arc<Device>,
        handle_type: Self::HandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<Self, InteropError> {
        Semaphore::new_imported(device.clone(), handle_type, handle, permanence)
    }
}

impl ExternalHandleCarrier for Fence {
    type HandleType = ExternalFenceHandleType;
    type ImportInfo = Permanence;

    #[inline]
    fn export_handle(&self, handle_type: Self::HandleType) -> Result<NativeHandle, InteropError> {
        self.export(handle_type)
    }

    #[inline]
    fn import_handle(
        device: &Arc<Device>,
        handle_type: Self::HandleType,
        handle: &mut NativeHandle,
        permanence: Permanence,
    ) -> Result<Self, InteropError> {
        Fence::new_imported(device.clone(), handle_type, handle, permanence)
    }
}

/// The allocation parameters of imported memory that is not dedicated to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryImportInfo {
    pub allocation_size: u64,
    pub memory_type_index: u32,
}

impl ExternalHandleCarrier for DeviceMemory {
    type HandleType = ExternalMemoryHandleType;
    type ImportInfo = MemoryImportInfo;

    #[inline]
    fn export_handle(&self, handle_type: Self::HandleType) -> Result<NativeHandle, InteropError> {
        self.export(handle_type)
    }

    #[inline]
    fn import_handle(
        device: &Arc<Device>,
        handle_type: Self::HandleType,
        handle: &mut NativeHandle,
        import_info: MemoryImportInfo,
    ) -> Result<Self, InteropError> {
        DeviceMemory::import_with_info(
            device.clone(),
            MemoryAllocateInfo {
                allocation_size: import_info.allocation_size,
                memory_type_index: import_info.memory_type_index,
                ..Default::default()
            },
            handle_type,
            handle,
        )
    }
}

/// Exports `object` as `handle_type` and imports the handle into a new object on `device`.
///
/// The exported handle is closed if the import did not consume it.
pub fn export_then_import<C: ExternalHandleCarrier>(
    object: &C,
    device: &Arc<Device>,
    handle_type: C::HandleType,
    import_info: C::ImportInfo,
) -> Result<C, InteropError> {
    let mut handle = object.export_handle(handle_type)?;

    C::import_handle(device, handle_type, &mut handle, import_info)
}

/// Imports `handle` twice, through two independent duplicates.
///
/// Duplicates of descriptors and Win32 handles must have distinct values; the signaled sentinel
/// and KMT handles are duplicated by value.
pub fn import_twice<C: ExternalHandleCarrier>(
    device: &Arc<Device>,
    handle_type: C::HandleType,
    handle: &NativeHandle,
    import_info: C::ImportInfo,
) -> Result<(C, C), InteropError> {
    let mut first = handle.duplicate()?;
    let mut second = handle.duplicate()?;

    let by_reference = matches!(handle.kind(), HandleKind::Fd | HandleKind::Win32)
        && !handle.is_signaled_sentinel();

    if by_reference && first.raw() == second.raw() {
        return Err(InteropError::validation(
            "import_twice",
            "two duplicates of a handle have the same value",
        ));
    }

    let a = C::import_handle(device, handle_type, &mut first, import_info.clone())?;
    let b = C::import_handle(device, handle_type, &mut second, import_info)?;

    Ok((a, b))
}

#[cfg(all(test, unix))]
mod tests {
    use super::{export_then_import, import_twice, ExternalHandleCarrier, MemoryImportInfo};
    use crate::{
        device::DeviceExtensions,
        memory::{choose_host_visible_memory_type, DeviceMemory, ExternalMemoryHandleType},
        submit::SyncPrimitive,
        sync::{ExternalSemaphoreHandleType, Permanence, Semaphore, Transference},
    };

    #[test]
    fn classification() {
        assert_eq!(
            Semaphore::classify(ExternalSemaphoreHandleType::SyncFd),
            Transference::Copy,
        );
        assert_eq!(
            DeviceMemory::classify(ExternalMemoryHandleType::DmaBuf),
            Transference::Reference,
        );
    }

    #[test]
    fn semaphore_round_trip() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, queue) = soft_device!(DeviceExtensions::for_semaphore(handle_type));

        let semaphore = Semaphore::new_exportable(device.clone(), handle_type).unwrap();
        let imported =
            export_then_import(&semaphore, &device, handle_type, Permanence::Permanent).unwrap();

        semaphore.submit_signal(&queue).unwrap();
        imported
            .wait_signaled(&queue, &Default::default())
            .unwrap();
    }

    #[test]
    fn memory_imported_twice() {
        let handle_type = ExternalMemoryHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(handle_type));
        let memory_type_index =
            choose_host_visible_memory_type(device.physical_device(), u32::MAX).unwrap();

        let memory = DeviceMemory::allocate_exportable(
            device.clone(),
            512,
            memory_type_index,
            handle_type,
            None,
        )
        .unwrap();
        let handle = memory.export_handle(handle_type).unwrap();

        let (a, b) = import_twice::<DeviceMemory>(
            &device,
            handle_type,
            &handle,
            MemoryImportInfo {
                allocation_size: 512,
                memory_type_index,
            },
        )
        .unwrap();
        assert!(handle.has_value());
        assert_eq!(a.allocation_size(), b.allocation_size());
    }
}
