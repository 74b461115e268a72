// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory that can be shared through native handles.
//!
//! Memory export always has [`Transference::Reference`]: every exported handle refers to the
//! same allocation, and an import aliases it for as long as the imported [`DeviceMemory`]
//! lives.
//!
//! Some handle types can only be used with dedicated allocations, which are bound to exactly
//! one [`Buffer`] or [`Image`]. Whether that is the case is reported by
//! [`ExternalMemoryProperties::dedicated_only`] and reflected in the
//! [`MemoryRequirements`] of resources created with that handle type.
//!
//! # Host access
//!
//! Host-visible memory is accessed through a [`MappedMemory`] guard. The memory types chosen
//! by [`choose_host_visible_memory_type`] need not be coherent: writes must be followed by
//! [`MappedMemory::flush`] before another context reads them, and reads of data written
//! elsewhere must be preceded by [`MappedMemory::invalidate`].

pub use self::{
    device_memory::{DeviceMemory, MappedMemory, MemoryAllocateInfo},
    resource::{Buffer, BufferCreateInfo, Image, ImageCreateInfo},
};
use crate::{
    device::PhysicalDevice,
    handle::{HandleKind, ImportOwnership},
    macros::{vulkan_bitflags, vulkan_bitflags_enum, vulkan_enum},
    sync::Transference,
    InteropError,
};
use std::num::NonZero;

mod device_memory;
mod resource;

vulkan_bitflags_enum! {
    /// A set of [`ExternalMemoryHandleType`] values.
    ExternalMemoryHandleTypes,

    /// A handle type used to export or import memory to/from an external source.
    ExternalMemoryHandleType impl {
        /// Returns [`Transference::Reference`]: memory handles always alias the allocation.
        #[inline]
        pub const fn transference(self) -> Transference {
            Transference::Reference
        }

        /// Returns the kind of native handle that carries this handle type.
        #[inline]
        pub const fn handle_kind(self) -> HandleKind {
            match self {
                Self::OpaqueFd | Self::DmaBuf => HandleKind::Fd,
                Self::OpaqueWin32 => HandleKind::Win32,
                Self::OpaqueWin32Kmt => HandleKind::Win32Kmt,
                Self::AndroidHardwareBuffer => HandleKind::AndroidHardwareBuffer,
            }
        }

        /// Returns what happens to the caller's native handle when an import succeeds.
        ///
        /// An imported `AHardwareBuffer` is retained by the driver, so the caller still owns
        /// its own reference.
        #[inline]
        pub const fn import_ownership(self) -> ImportOwnership {
            match self.handle_kind() {
                HandleKind::Fd => ImportOwnership::Transferred,
                _ => ImportOwnership::Retained,
            }
        }

        /// Returns whether the properties of a handle of this type can be queried before it is
        /// imported. Opaque handles only carry meaning to the driver that exported them.
        #[inline]
        pub const fn has_queryable_properties(self) -> bool {
            matches!(self, Self::DmaBuf | Self::AndroidHardwareBuffer)
        }

        /// Returns a short lowercase name, used in scenario names and logs.
        #[inline]
        pub const fn name(self) -> &'static str {
            match self {
                Self::OpaqueFd => "opaque_fd",
                Self::OpaqueWin32 => "opaque_win32",
                Self::OpaqueWin32Kmt => "opaque_win32_kmt",
                Self::DmaBuf => "dma_buf",
                Self::AndroidHardwareBuffer => "android_hardware_buffer",
            }
        }
    },

    = ExternalMemoryHandleTypeFlags(u32);

    /// A POSIX file descriptor handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_FD, OpaqueFd = OPAQUE_FD,

    /// A Windows NT handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32, OpaqueWin32 = OPAQUE_WIN32,

    /// A Windows global share handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32_KMT, OpaqueWin32Kmt = OPAQUE_WIN32_KMT,

    /// A POSIX file descriptor handle that refers to a Linux dma-buf.
    DMA_BUF, DmaBuf = DMA_BUF_EXT,

    /// A pointer to an `AHardwareBuffer` object.
    ANDROID_HARDWARE_BUFFER, AndroidHardwareBuffer = ANDROID_HARDWARE_BUFFER_ANDROID,
}

/// The external memory properties supported for a buffer or image configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalMemoryProperties {
    /// Whether memory of this handle type can only be a dedicated allocation.
    pub dedicated_only: bool,

    /// Whether memory of this handle type can be exported.
    pub exportable: bool,

    /// Whether memory of this handle type can be imported.
    pub importable: bool,

    /// The handle types that can be exported from memory imported from this handle type.
    pub export_from_imported_handle_types: ExternalMemoryHandleTypes,

    /// The handle types that can be specified together with this one when creating a resource
    /// or allocating memory.
    pub compatible_handle_types: ExternalMemoryHandleTypes,
}

vulkan_bitflags! {
    /// Properties of a memory type.
    MemoryPropertyFlags = MemoryPropertyFlags(u32);

    /// The memory is located on the device.
    DEVICE_LOCAL = DEVICE_LOCAL,

    /// The memory can be mapped on the host.
    HOST_VISIBLE = HOST_VISIBLE,

    /// Host writes and device writes are visible to each other without flushing or
    /// invalidating.
    HOST_COHERENT = HOST_COHERENT,

    /// The memory is cached on the host.
    HOST_CACHED = HOST_CACHED,

    /// The memory is only allocated when it is first used.
    LAZILY_ALLOCATED = LAZILY_ALLOCATED,
}

vulkan_bitflags! {
    /// How a buffer is going to be used.
    BufferUsage = BufferUsageFlags(u32);

    TRANSFER_SRC = TRANSFER_SRC,
    TRANSFER_DST = TRANSFER_DST,
    UNIFORM_BUFFER = UNIFORM_BUFFER,
    STORAGE_BUFFER = STORAGE_BUFFER,
    INDEX_BUFFER = INDEX_BUFFER,
    VERTEX_BUFFER = VERTEX_BUFFER,
}

vulkan_bitflags! {
    /// How an image is going to be used.
    ImageUsage = ImageUsageFlags(u32);

    TRANSFER_SRC = TRANSFER_SRC,
    TRANSFER_DST = TRANSFER_DST,
    SAMPLED = SAMPLED,
    STORAGE = STORAGE,
    COLOR_ATTACHMENT = COLOR_ATTACHMENT,
}

vulkan_enum! {
    /// The format of the texels of an image.
    Format impl {
        /// Returns the size in bytes of one texel.
        #[inline]
        pub const fn block_size(self) -> u64 {
            match self {
                Self::R8_UNORM => 1,
                Self::R8G8B8A8_UNORM | Self::B8G8R8A8_UNORM | Self::R32_UINT => 4,
                Self::R16G16B16A16_SFLOAT => 8,
            }
        }
    }
    = Format(i32);

    R8_UNORM = R8_UNORM,
    R8G8B8A8_UNORM = R8G8B8A8_UNORM,
    B8G8R8A8_UNORM = B8G8R8A8_UNORM,
    R16G16B16A16_SFLOAT = R16G16B16A16_SFLOAT,
    R32_UINT = R32_UINT,
}

/// Memory requirements of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// The number of bytes the resource needs.
    pub size: u64,

    /// The alignment of the offset the resource is bound at.
    pub alignment: u64,

    /// Indicates which memory types can be used. Each bit that is set to 1 means that the
    /// memory type whose index is the same as the position of the bit can be used.
    pub memory_type_bits: u32,

    /// Whether the implementation prefers a dedicated allocation for this resource.
    pub prefers_dedicated_allocation: bool,

    /// Whether the resource can only be bound to a dedicated allocation. This is the case when
    /// one of its external memory handle types is dedicated-only.
    pub requires_dedicated_allocation: bool,
}

/// Indicates a specific resource to allocate memory for.
///
/// A dedicated allocation must not be bound to any resource other than the one given here, and
/// its size must be the size of the memory requirements of that resource.
#[derive(Clone, Copy, Debug)]
pub enum DedicatedAllocation<'a> {
    /// Allocation dedicated to a buffer.
    Buffer(&'a Buffer),
    /// Allocation dedicated to an image.
    Image(&'a Image),
}

impl DedicatedAllocation<'_> {
    pub(crate) fn requirements(&self) -> &MemoryRequirements {
        match self {
            Self::Buffer(buffer) => buffer.memory_requirements(),
            Self::Image(image) => image.memory_requirements(),
        }
    }
}

/// The resource a dedicated [`DeviceMemory`] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum DedicatedTo {
    Buffer(NonZero<u64>),
    Image(NonZero<u64>),
}

impl From<DedicatedAllocation<'_>> for DedicatedTo {
    fn from(dedicated_allocation: DedicatedAllocation<'_>) -> Self {
        match dedicated_allocation {
            DedicatedAllocation::Buffer(buffer) => Self::Buffer(buffer.id()),
            DedicatedAllocation::Image(image) => Self::Image(image.id()),
        }
    }
}

/// Returns the lowest memory type index set in `memory_type_bits`.
#[inline]
pub fn choose_memory_type(memory_type_bits: u32) -> Result<u32, InteropError> {
    if memory_type_bits == 0 {
        return Err(InteropError::not_supported(
            "no memory type is compatible with the resource",
        ));
    }

    Ok(memory_type_bits.trailing_zeros())
}

/// Returns the lowest memory type index set in `memory_type_bits` whose memory can be mapped
/// on the host.
pub fn choose_host_visible_memory_type(
    physical_device: &PhysicalDevice,
    memory_type_bits: u32,
) -> Result<u32, InteropError> {
    let host_visible_bits = physical_device
        .memory_types()
        .iter()
        .enumerate()
        .filter(|(_, memory_type)| {
            memory_type
                .property_flags
                .contains(MemoryPropertyFlags::HOST_VISIBLE)
        })
        .fold(0u32, |bits, (index, _)| bits | (1 << index));

    choose_memory_type(memory_type_bits & host_visible_bits).map_err(|_| {
        InteropError::not_supported("no host-visible memory type is compatible with the resource")
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::{
        choose_host_visible_memory_type, choose_memory_type, ExternalMemoryHandleType,
        ExternalMemoryHandleTypes, MemoryPropertyFlags,
    };
    use crate::{
        handle::{HandleKind, ImportOwnership},
        sync::Transference,
        InteropError,
    };

    #[test]
    fn lowest_bit_wins() {
        assert_eq!(choose_memory_type(0b1010).unwrap(), 1);
        assert_eq!(choose_memory_type(1 << 31).unwrap(), 31);
        assert!(matches!(
            choose_memory_type(0),
            Err(InteropError::NotSupported(_)),
        ));
    }

    #[test]
    fn host_visible_selection() {
        let physical_device = soft_physical_device!();
        let host_visible = physical_device
            .memory_types()
            .iter()
            .position(|t| t.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE))
            .unwrap() as u32;

        assert_eq!(
            choose_host_visible_memory_type(&physical_device, u32::MAX).unwrap(),
            host_visible,
        );
        assert!(choose_host_visible_memory_type(&physical_device, 0b1)
            .unwrap_err()
            .is_skip());
    }

    #[test]
    fn memory_handles_are_references() {
        for &handle_type in ExternalMemoryHandleType::ALL {
            assert_eq!(handle_type.transference(), Transference::Reference);
        }

        assert_eq!(
            ExternalMemoryHandleType::DmaBuf.import_ownership(),
            ImportOwnership::Transferred,
        );
        assert_eq!(
            ExternalMemoryHandleType::AndroidHardwareBuffer.import_ownership(),
            ImportOwnership::Retained,
        );
        assert_eq!(
            ExternalMemoryHandleType::AndroidHardwareBuffer.handle_kind(),
            HandleKind::AndroidHardwareBuffer,
        );
        assert!(!ExternalMemoryHandleType::OpaqueFd.has_queryable_properties());
    }

    #[test]
    fn ffi_bits() {
        assert_eq!(
            ash::vk::ExternalMemoryHandleTypeFlags::from(ExternalMemoryHandleTypes::DMA_BUF),
            ash::vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        );
    }
}
