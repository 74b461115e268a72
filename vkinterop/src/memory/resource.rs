// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffers and images whose memory can come from an external source.

use super::{
    BufferUsage, DedicatedTo, DeviceMemory, ExternalMemoryHandleTypes, ExternalMemoryProperties,
    Format, ImageUsage, MemoryRequirements,
};
use crate::{
    device::{Device, DeviceExtensions, DeviceOwned},
    driver::{BufferDriverCreateInfo, ExternalBufferInfo, ExternalImageInfo, ImageDriverCreateInfo},
    macros::impl_id_counter,
    InteropError, NonExhaustive, VulkanObject,
};
use ash::vk;
use parking_lot::Mutex;
use std::{num::NonZero, sync::Arc};

/// Checks that every handle type of `handle_types` can be used with a resource, and returns
/// whether one of them forces dedicated allocations.
fn check_external_memory(
    device: &Device,
    handle_types: ExternalMemoryHandleTypes,
    mut properties_of: impl FnMut(
        super::ExternalMemoryHandleType,
    ) -> Result<Option<ExternalMemoryProperties>, InteropError>,
) -> Result<bool, InteropError> {
    let mut dedicated_only = false;

    for handle_type in handle_types.iter() {
        device.check_extensions(&DeviceExtensions::for_memory(handle_type))?;

        let properties = properties_of(handle_type)?
            .filter(|properties| properties.exportable || properties.importable)
            .ok_or_else(|| {
                InteropError::not_supported(format!(
                    "the resource cannot be backed by {} memory",
                    handle_type.name(),
                ))
            })?;

        if !properties.compatible_handle_types.contains(handle_types) {
            return Err(InteropError::validation(
                "external_memory_handle_types",
                format!(
                    "{:?} is not compatible with {:?}",
                    handle_types - properties.compatible_handle_types,
                    handle_type,
                ),
            ));
        }

        dedicated_only |= properties.dedicated_only;
    }

    Ok(dedicated_only)
}

/// Checks the rules shared by buffer and image binds.
fn check_bind(
    context: &'static str,
    device: &Device,
    self_dedicated_to: DedicatedTo,
    requirements: &MemoryRequirements,
    external_memory_handle_types: ExternalMemoryHandleTypes,
    memory: &DeviceMemory,
    offset: u64,
) -> Result<(), InteropError> {
    if memory.device().id() != device.id() {
        return Err(InteropError::validation(
            context,
            "the memory was not allocated on the device of the resource",
        ));
    }

    if requirements.memory_type_bits & (1 << memory.memory_type_index()) == 0 {
        return Err(InteropError::validation(
            context,
            format!(
                "the memory type {} is not allowed by the memory requirements",
                memory.memory_type_index(),
            ),
        ));
    }

    if offset % requirements.alignment != 0 {
        return Err(InteropError::validation(
            context,
            format!(
                "offset {} is not a multiple of the required alignment {}",
                offset, requirements.alignment,
            ),
        ));
    }

    if offset
        .checked_add(requirements.size)
        .is_none_or(|end| end > memory.allocation_size())
    {
        return Err(InteropError::validation(
            context,
            "the resource does not fit in the memory at this offset",
        ));
    }

    match memory.dedicated_to() {
        Some(dedicated_to) if dedicated_to != self_dedicated_to => {
            return Err(InteropError::validation(
                context,
                "the memory is a dedicated allocation for another resource",
            ));
        }
        None if requirements.requires_dedicated_allocation => {
            return Err(InteropError::validation(
                context,
                "the resource requires a dedicated allocation",
            ));
        }
        _ => (),
    }

    if let Some(handle_type) = memory.imported_handle_type() {
        if !external_memory_handle_types.contains_enum(handle_type) {
            return Err(InteropError::validation(
                context,
                format!(
                    "the memory was imported from {} but the resource was not created with that \
                    handle type",
                    handle_type.name(),
                ),
            ));
        }
    }

    let export_handle_types = memory.export_handle_types();

    if !export_handle_types.is_empty()
        && !export_handle_types.intersects(external_memory_handle_types)
    {
        return Err(InteropError::validation(
            context,
            "the memory is exportable as handle types the resource was not created with",
        ));
    }

    Ok(())
}

/// A buffer that has not necessarily got memory bound yet.
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    device: Arc<Device>,
    id: NonZero<u64>,

    size: u64,
    usage: BufferUsage,
    external_memory_handle_types: ExternalMemoryHandleTypes,
    memory_requirements: MemoryRequirements,

    memory: Mutex<Option<(Arc<DeviceMemory>, u64)>>,
}

impl Buffer {
    /// Creates a new `Buffer`.
    ///
    /// Every handle type of `create_info.external_memory_handle_types` must be exportable or
    /// importable for buffers with this usage.
    pub fn new(device: Arc<Device>, create_info: BufferCreateInfo) -> Result<Buffer, InteropError> {
        let BufferCreateInfo {
            size,
            usage,
            external_memory_handle_types,
            _ne: _,
        } = create_info;

        if size == 0 {
            return Err(InteropError::validation(
                "Buffer::new",
                "size must not be zero",
            ));
        }

        let physical_device = device.physical_device().clone();
        let dedicated_only =
            check_external_memory(&device, external_memory_handle_types, |handle_type| {
                Ok(Some(physical_device.external_buffer_properties(
                    ExternalBufferInfo { handle_type, usage },
                )))
            })?;

        // SAFETY: the driver belongs to `device`.
        let (handle, mut memory_requirements) = unsafe {
            device.driver().create_buffer(&BufferDriverCreateInfo {
                size,
                usage,
                external_memory_handle_types,
            })
        }?;

        if dedicated_only {
            memory_requirements.prefers_dedicated_allocation = true;
            memory_requirements.requires_dedicated_allocation = true;
        }

        Ok(Buffer {
            handle,
            device,
            id: Self::next_id(),
            size,
            usage,
            external_memory_handle_types,
            memory_requirements,
            memory: Mutex::new(None),
        })
    }

    /// Returns the size of the buffer in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Returns the handle types the memory of the buffer can be exported or imported as.
    #[inline]
    pub fn external_memory_handle_types(&self) -> ExternalMemoryHandleTypes {
        self.external_memory_handle_types
    }

    /// Returns the memory requirements of the buffer.
    #[inline]
    pub fn memory_requirements(&self) -> &MemoryRequirements {
        &self.memory_requirements
    }

    /// Returns the memory bound to the buffer and the offset it is bound at, if any.
    #[inline]
    pub fn memory(&self) -> Option<(Arc<DeviceMemory>, u64)> {
        self.memory.lock().clone()
    }

    /// Binds `memory` to the buffer at `offset`. A buffer can only be bound once.
    pub fn bind_memory(&self, memory: Arc<DeviceMemory>, offset: u64) -> Result<(), InteropError> {
        let mut bound = self.memory.lock();

        if bound.is_some() {
            return Err(InteropError::validation(
                "Buffer::bind_memory",
                "the buffer already has memory bound",
            ));
        }

        check_bind(
            "Buffer::bind_memory",
            &self.device,
            DedicatedTo::Buffer(self.id),
            &self.memory_requirements,
            self.external_memory_handle_types,
            &memory,
            offset,
        )?;

        // SAFETY: the buffer and the memory belong to the driver of `self.device`.
        unsafe {
            self.device
                .driver()
                .bind_buffer_memory(self.handle, memory.handle(), offset)
        }?;

        *bound = Some((memory, offset));

        Ok(())
    }
}

impl Drop for Buffer {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the buffer is owned by `self` and no longer used.
        unsafe { self.device.driver().destroy_buffer(self.handle) };
    }
}

unsafe impl VulkanObject for Buffer {
    type Handle = vk::Buffer;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Buffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Buffer);

/// Parameters to create a new `Buffer`.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: u64,

    /// How the buffer is going to be used.
    ///
    /// The default value is [`BufferUsage::TRANSFER_SRC`] | [`BufferUsage::TRANSFER_DST`].
    pub usage: BufferUsage,

    /// The external memory handle types that are going to be used with the buffer.
    ///
    /// The default value is [`ExternalMemoryHandleTypes::empty()`].
    pub external_memory_handle_types: ExternalMemoryHandleTypes,

    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            external_memory_handle_types: ExternalMemoryHandleTypes::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// A 2D, single-sampled, optimally tiled image.
#[derive(Debug)]
pub struct Image {
    handle: vk::Image,
    device: Arc<Device>,
    id: NonZero<u64>,

    format: Format,
    extent: [u32; 2],
    usage: ImageUsage,
    external_memory_handle_types: ExternalMemoryHandleTypes,
    memory_requirements: MemoryRequirements,

    memory: Mutex<Option<(Arc<DeviceMemory>, u64)>>,
}

impl Image {
    /// Creates a new `Image`.
    ///
    /// Returns [`InteropError::NotSupported`] if the physical device cannot create images with
    /// this format and usage together with one of the external memory handle types.
    pub fn new(device: Arc<Device>, create_info: ImageCreateInfo) -> Result<Image, InteropError> {
        let ImageCreateInfo {
            format,
            extent,
            usage,
            external_memory_handle_types,
            _ne: _,
        } = create_info;

        if extent.contains(&0) {
            return Err(InteropError::validation(
                "Image::new",
                "extent must not contain zero",
            ));
        }

        let physical_device = device.physical_device().clone();
        let dedicated_only =
            check_external_memory(&device, external_memory_handle_types, |handle_type| {
                physical_device.external_image_format_properties(ExternalImageInfo {
                    handle_type,
                    format,
                    usage,
                })
            })?;

        // SAFETY: the driver belongs to `device`.
        let (handle, mut memory_requirements) = unsafe {
            device.driver().create_image(&ImageDriverCreateInfo {
                format,
                extent,
                usage,
                external_memory_handle_types,
            })
        }?;

        if dedicated_only {
            memory_requirements.prefers_dedicated_allocation = true;
            memory_requirements.requires_dedicated_allocation = true;
        }

        Ok(Image {
            handle,
            device,
            id: Self::next_id(),
            format,
            extent,
            usage,
            external_memory_handle_types,
            memory_requirements,
            memory: Mutex::new(None),
        })
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    #[inline]
    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    /// Returns the handle types the memory of the image can be exported or imported as.
    #[inline]
    pub fn external_memory_handle_types(&self) -> ExternalMemoryHandleTypes {
        self.external_memory_handle_types
    }

    /// Returns the memory requirements of the image.
    #[inline]
    pub fn memory_requirements(&self) -> &MemoryRequirements {
        &self.memory_requirements
    }

    /// Returns the memory bound to the image and the offset it is bound at, if any.
    #[inline]
    pub fn memory(&self) -> Option<(Arc<DeviceMemory>, u64)> {
        self.memory.lock().clone()
    }

    /// Binds `memory` to the image at `offset`. An image can only be bound once.
    pub fn bind_memory(&self, memory: Arc<DeviceMemory>, offset: u64) -> Result<(), InteropError> {
        let mut bound = self.memory.lock();

        if bound.is_some() {
            return Err(InteropError::validation(
                "Image::bind_memory",
                "the image already has memory bound",
            ));
        }

        check_bind(
            "Image::bind_memory",
            &self.device,
            DedicatedTo::Image(self.id),
            &self.memory_requirements,
            self.external_memory_handle_types,
            &memory,
            offset,
        )?;

        // SAFETY: the image and the memory belong to the driver of `self.device`.
        unsafe {
            self.device
                .driver()
                .bind_image_memory(self.handle, memory.handle(), offset)
        }?;

        *bound = Some((memory, offset));

        Ok(())
    }
}

impl Drop for Image {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the image is owned by `self` and no longer used.
        unsafe { self.device.driver().destroy_image(self.handle) };
    }
}

unsafe impl VulkanObject for Image {
    type Handle = vk::Image;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Image {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Image);

/// Parameters to create a new `Image`.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    /// The format of the texels.
    ///
    /// The default value is [`Format::R8G8B8A8_UNORM`].
    pub format: Format,

    /// The width and height of the image.
    ///
    /// The default value is `[64, 64]`.
    pub extent: [u32; 2],

    /// How the image is going to be used.
    ///
    /// The default value is [`ImageUsage::TRANSFER_SRC`] | [`ImageUsage::TRANSFER_DST`].
    pub usage: ImageUsage,

    /// The external memory handle types that are going to be used with the image.
    ///
    /// The default value is [`ExternalMemoryHandleTypes::empty()`].
    pub external_memory_handle_types: ExternalMemoryHandleTypes,

    pub _ne: NonExhaustive,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            format: Format::R8G8B8A8_UNORM,
            extent: [64, 64],
            usage: ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
            external_memory_handle_types: ExternalMemoryHandleTypes::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{Buffer, BufferCreateInfo, Image, ImageCreateInfo};
    use crate::{
        device::DeviceExtensions,
        driver::soft::SoftDriverConfig,
        memory::{
            choose_memory_type, DedicatedAllocation, DeviceMemory, ExternalMemoryHandleType,
            ExternalMemoryHandleTypes, MemoryAllocateInfo,
        },
        InteropError,
    };
    use std::sync::Arc;

    #[test]
    fn zero_sized_buffer() {
        let (device, _queue) = soft_device!(DeviceExtensions::empty());

        assert!(matches!(
            Buffer::new(device, BufferCreateInfo::default()),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn bind_once() {
        let (device, _queue) = soft_device!(DeviceExtensions::empty());
        let buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo {
                size: 1024,
                ..Default::default()
            },
        )
        .unwrap();
        let requirements = *buffer.memory_requirements();

        let memory = Arc::new(
            DeviceMemory::allocate(
                device,
                MemoryAllocateInfo {
                    allocation_size: requirements.size * 2,
                    memory_type_index: choose_memory_type(requirements.memory_type_bits).unwrap(),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        assert!(matches!(
            buffer.bind_memory(memory.clone(), 1),
            Err(InteropError::ValidationFailed { .. }),
        ));
        buffer.bind_memory(memory.clone(), 0).unwrap();
        assert!(matches!(
            buffer.bind_memory(memory, 0),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn dedicated_only_handle_type_requires_dedicated_memory() {
        let handle_type = ExternalMemoryHandleType::DmaBuf;
        let (device, _queue) = soft_device!(
            DeviceExtensions::for_memory(handle_type),
            SoftDriverConfig {
                dedicated_only_memory_handle_types: handle_type.into(),
                ..Default::default()
            }
        );

        let buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo {
                size: 1024,
                external_memory_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
        .unwrap();
        let requirements = *buffer.memory_requirements();
        assert!(requirements.requires_dedicated_allocation);

        let memory_type_index = choose_memory_type(requirements.memory_type_bits).unwrap();
        assert!(matches!(
            DeviceMemory::allocate_exportable(
                device.clone(),
                requirements.size,
                memory_type_index,
                handle_type,
                None,
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));

        let shared = DeviceMemory::allocate(
            device.clone(),
            MemoryAllocateInfo {
                allocation_size: requirements.size,
                memory_type_index,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            buffer.bind_memory(Arc::new(shared), 0),
            Err(InteropError::ValidationFailed { .. }),
        ));

        // A dedicated allocation must have exactly the size of the requirements.
        assert!(matches!(
            DeviceMemory::allocate_exportable(
                device.clone(),
                requirements.size * 2,
                memory_type_index,
                handle_type,
                Some(DedicatedAllocation::Buffer(&buffer)),
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));

        let dedicated = DeviceMemory::allocate_exportable(
            device,
            requirements.size,
            memory_type_index,
            handle_type,
            Some(DedicatedAllocation::Buffer(&buffer)),
        )
        .unwrap();
        buffer.bind_memory(Arc::new(dedicated), 0).unwrap();
    }

    #[test]
    fn dedicated_memory_belongs_to_one_resource() {
        let (device, _queue) = soft_device!(DeviceExtensions::empty());
        let create_info = BufferCreateInfo {
            size: 256,
            ..Default::default()
        };
        let a = Buffer::new(device.clone(), create_info.clone()).unwrap();
        let b = Buffer::new(device.clone(), create_info).unwrap();

        let memory = DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: a.memory_requirements().size,
                memory_type_index: 0,
                dedicated_allocation: Some(DedicatedAllocation::Buffer(&a)),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            b.bind_memory(Arc::new(memory), 0),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn image_with_unsupported_handle_type_is_a_skip() {
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(
            ExternalMemoryHandleType::OpaqueFd
        ));

        let image = Image::new(
            device.clone(),
            ImageCreateInfo {
                external_memory_handle_types: ExternalMemoryHandleTypes::OPAQUE_FD,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(image.extent(), [64, 64]);
        assert!(image.memory_requirements().size >= 64 * 64 * 4);

        let err = Image::new(
            device,
            ImageCreateInfo {
                external_memory_handle_types: ExternalMemoryHandleTypes::OPAQUE_WIN32,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.is_skip());
    }
}
