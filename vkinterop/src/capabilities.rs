// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Whether an object class supports export and import of a handle type.
//!
//! These queries are read-only and answered from the per-physical-device cache after the first
//! call. A scenario checks them before creating anything: when the answer is negative,
//! [`ExternalCapabilities::require_export_import`] returns [`InteropError::NotSupported`] and
//! the scenario is skipped.
//!
//! ```
//! use vkinterop::{capabilities, device::PhysicalDevice, sync::ExternalFenceHandleType};
//!
//! fn check(physical_device: &PhysicalDevice) -> Result<(), vkinterop::InteropError> {
//!     capabilities::query_fence_support(physical_device, ExternalFenceHandleType::SyncFd)
//!         .require_export_import()
//! }
//! ```

pub use crate::driver::{ExternalBufferInfo, ExternalImageInfo};
use crate::{
    device::PhysicalDevice,
    memory::{BufferUsage, ExternalMemoryHandleType, ExternalMemoryHandleTypes, Format, ImageUsage},
    sync::{
        ExternalFenceHandleType, ExternalFenceHandleTypes, ExternalSemaphoreHandleType,
        ExternalSemaphoreHandleTypes,
    },
    InteropError,
};

/// What a physical device supports for one object class and handle type.
///
/// `T` is the set type of the handle types of the class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalCapabilities<T> {
    /// Whether objects can be exported as the handle type.
    pub exportable: bool,

    /// Whether handles of the type can be imported.
    pub importable: bool,

    /// Whether memory of the handle type must be a dedicated allocation. Always `false` for
    /// semaphores and fences.
    pub dedicated_only: bool,

    /// The handle types that can be requested together with this one.
    pub compatible_handle_types: T,
}

impl<T> ExternalCapabilities<T> {
    /// Returns [`InteropError::NotSupported`] unless the handle type can be both exported and
    /// imported.
    pub fn require_export_import(&self) -> Result<(), InteropError> {
        match (self.exportable, self.importable) {
            (true, true) => Ok(()),
            (false, _) => Err(InteropError::not_supported(
                "the handle type cannot be exported",
            )),
            (true, false) => Err(InteropError::not_supported(
                "the handle type cannot be imported",
            )),
        }
    }
}

/// Queries the support of semaphores for `handle_type`.
pub fn query_semaphore_support(
    physical_device: &PhysicalDevice,
    handle_type: ExternalSemaphoreHandleType,
) -> ExternalCapabilities<ExternalSemaphoreHandleTypes> {
    let properties = physical_device.external_semaphore_properties(handle_type);

    ExternalCapabilities {
        exportable: properties.exportable,
        importable: properties.importable,
        dedicated_only: false,
        compatible_handle_types: properties.compatible_handle_types,
    }
}

/// Queries the support of fences for `handle_type`.
pub fn query_fence_support(
    physical_device: &PhysicalDevice,
    handle_type: ExternalFenceHandleType,
) -> ExternalCapabilities<ExternalFenceHandleTypes> {
    let properties = physical_device.external_fence_properties(handle_type);

    ExternalCapabilities {
        exportable: properties.exportable,
        importable: properties.importable,
        dedicated_only: false,
        compatible_handle_types: properties.compatible_handle_types,
    }
}

/// Queries the support of memory of `handle_type` bound to buffers with `usage`.
pub fn query_buffer_support(
    physical_device: &PhysicalDevice,
    handle_type: ExternalMemoryHandleType,
    usage: BufferUsage,
) -> ExternalCapabilities<ExternalMemoryHandleTypes> {
    let properties =
        physical_device.external_buffer_properties(ExternalBufferInfo { handle_type, usage });

    ExternalCapabilities {
        exportable: properties.exportable,
        importable: properties.importable,
        dedicated_only: properties.dedicated_only,
        compatible_handle_types: properties.compatible_handle_types,
    }
}

/// Queries the support of memory of `handle_type` bound to 2D optimally tiled images.
///
/// An image configuration the device cannot create at all is reported as supporting neither
/// export nor import.
pub fn query_image_support(
    physical_device: &PhysicalDevice,
    handle_type: ExternalMemoryHandleType,
    format: Format,
    usage: ImageUsage,
) -> Result<ExternalCapabilities<ExternalMemoryHandleTypes>, InteropError> {
    let properties = physical_device
        .external_image_format_properties(ExternalImageInfo {
            handle_type,
            format,
            usage,
        })?
        .unwrap_or_default();

    Ok(ExternalCapabilities {
        exportable: properties.exportable,
        importable: properties.importable,
        dedicated_only: properties.dedicated_only,
        compatible_handle_types: properties.compatible_handle_types,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::{query_buffer_support, query_fence_support, query_image_support};
    use crate::{
        driver::soft::SoftDriverConfig,
        memory::{BufferUsage, ExternalMemoryHandleType, Format, ImageUsage},
        sync::ExternalFenceHandleType,
        InteropError,
    };

    #[test]
    fn supported_and_unsupported_types() {
        let physical_device = soft_physical_device!();

        let sync_fd = query_fence_support(&physical_device, ExternalFenceHandleType::SyncFd);
        assert!(sync_fd.exportable && sync_fd.importable);
        sync_fd.require_export_import().unwrap();

        let win32 = query_fence_support(&physical_device, ExternalFenceHandleType::OpaqueWin32);
        assert!(matches!(
            win32.require_export_import(),
            Err(InteropError::NotSupported(_)),
        ));
    }

    #[test]
    fn dedicated_only_is_reported() {
        let physical_device = soft_physical_device!(SoftDriverConfig {
            dedicated_only_memory_handle_types: ExternalMemoryHandleType::DmaBuf.into(),
            ..Default::default()
        });

        let buffer = query_buffer_support(
            &physical_device,
            ExternalMemoryHandleType::DmaBuf,
            BufferUsage::TRANSFER_SRC,
        );
        assert!(buffer.dedicated_only);

        let image = query_image_support(
            &physical_device,
            ExternalMemoryHandleType::OpaqueFd,
            Format::R8G8B8A8_UNORM,
            ImageUsage::TRANSFER_DST,
        )
        .unwrap();
        assert!(!image.dedicated_only);
        image.require_export_import().unwrap();

        let unsupported = query_image_support(
            &physical_device,
            ExternalMemoryHandleType::AndroidHardwareBuffer,
            Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED,
        )
        .unwrap();
        assert!(unsupported.require_export_import().unwrap_err().is_skip());
    }
}
