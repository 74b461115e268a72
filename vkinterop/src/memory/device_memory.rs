// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    choose_memory_type, BufferUsage, DedicatedAllocation, DedicatedTo, ExternalMemoryHandleType,
    ExternalMemoryHandleTypes, MemoryPropertyFlags, MemoryRequirements,
};
use crate::{
    device::{Device, DeviceExtensions, DeviceOwned},
    driver::{DedicatedTarget, ExternalBufferInfo, MemoryDriverAllocateInfo},
    handle::{ImportOwnership, NativeHandle},
    macros::impl_id_counter,
    InteropError, NonExhaustive, VulkanObject,
};
use ash::vk;
use bytemuck::Pod;
use std::{
    num::NonZero,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Represents memory that has been allocated from the device, or imported into it.
///
/// The destructor of `DeviceMemory` automatically frees the memory. An imported allocation
/// stays alive in the driver as long as any importer or the exporter holds it.
#[derive(Debug)]
pub struct DeviceMemory {
    handle: vk::DeviceMemory,
    device: Arc<Device>,
    id: NonZero<u64>,

    allocation_size: u64,
    memory_type_index: u32,
    dedicated_to: Option<DedicatedTo>,
    export_handle_types: ExternalMemoryHandleTypes,
    imported_handle_type: Option<ExternalMemoryHandleType>,

    mapped: AtomicBool,
}

impl DeviceMemory {
    /// Allocates a block of memory from the device.
    pub fn allocate(
        device: Arc<Device>,
        allocate_info: MemoryAllocateInfo<'_>,
    ) -> Result<DeviceMemory, InteropError> {
        Self::validate_allocate(&device, &allocate_info, None)?;

        // SAFETY: validated above.
        unsafe { Self::allocate_unchecked(device, allocate_info, None) }
    }

    /// Allocates memory that can be exported as `handle_type`, optionally dedicated to one
    /// resource.
    pub fn allocate_exportable(
        device: Arc<Device>,
        allocation_size: u64,
        memory_type_index: u32,
        handle_type: ExternalMemoryHandleType,
        dedicated_allocation: Option<DedicatedAllocation<'_>>,
    ) -> Result<DeviceMemory, InteropError> {
        Self::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size,
                memory_type_index,
                dedicated_allocation,
                export_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
    }

    /// Imports `handle` as memory that satisfies `requirements`.
    ///
    /// On success, the ownership of `handle` follows
    /// [`ExternalMemoryHandleType::import_ownership`]. On failure, the caller keeps it.
    ///
    /// For [`ExternalMemoryHandleType::AndroidHardwareBuffer`], `memory_type_index` and the size
    /// are ignored: they are dictated by the buffer and queried from it.
    pub fn import(
        device: Arc<Device>,
        requirements: &MemoryRequirements,
        handle_type: ExternalMemoryHandleType,
        memory_type_index: u32,
        handle: &mut NativeHandle,
    ) -> Result<DeviceMemory, InteropError> {
        Self::import_with_info(
            device,
            MemoryAllocateInfo {
                allocation_size: requirements.size,
                memory_type_index,
                ..Default::default()
            },
            handle_type,
            handle,
        )
    }

    /// Same as [`import`](Self::import), but the imported memory is a dedicated allocation for
    /// `dedicated_allocation`.
    pub fn import_dedicated(
        device: Arc<Device>,
        dedicated_allocation: DedicatedAllocation<'_>,
        handle_type: ExternalMemoryHandleType,
        memory_type_index: u32,
        handle: &mut NativeHandle,
    ) -> Result<DeviceMemory, InteropError> {
        Self::import_with_info(
            device,
            MemoryAllocateInfo {
                allocation_size: dedicated_allocation.requirements().size,
                memory_type_index,
                dedicated_allocation: Some(dedicated_allocation),
                ..Default::default()
            },
            handle_type,
            handle,
        )
    }

    /// Imports `handle` with full control over the allocation parameters.
    pub fn import_with_info(
        device: Arc<Device>,
        mut allocate_info: MemoryAllocateInfo<'_>,
        handle_type: ExternalMemoryHandleType,
        handle: &mut NativeHandle,
    ) -> Result<DeviceMemory, InteropError> {
        device.check_extensions(&DeviceExtensions::for_memory(handle_type))?;
        handle.check_importable(handle_type.handle_kind(), false)?;

        if handle_type.has_queryable_properties() {
            // SAFETY: `handle` is a live handle of the kind of `handle_type`.
            let properties = unsafe {
                device
                    .driver()
                    .imported_memory_properties(handle_type, handle.raw())
            }
            .map_err(InteropError::from_import)?;

            if handle_type == ExternalMemoryHandleType::AndroidHardwareBuffer {
                // The buffer decides, whatever the caller asked for.
                allocate_info.memory_type_index = choose_memory_type(properties.memory_type_bits)?;
            } else if properties.memory_type_bits
                & 1u32.checked_shl(allocate_info.memory_type_index).unwrap_or(0)
                == 0
            {
                return Err(InteropError::validation(
                    "DeviceMemory::import",
                    format!(
                        "memory type {} cannot hold a {} handle (allowed types: {:#b})",
                        allocate_info.memory_type_index,
                        handle_type.name(),
                        properties.memory_type_bits,
                    ),
                ));
            }

            if let Some(allocation_size) = properties.allocation_size {
                allocate_info.allocation_size = allocation_size;
            }
        }

        Self::validate_allocate(&device, &allocate_info, Some(handle_type))?;

        // SAFETY: validated above, and `handle` owns its value.
        let memory = unsafe {
            Self::allocate_unchecked(device, allocate_info, Some((handle_type, handle.raw())))
        }
        .map_err(|err| match err {
            InteropError::Vulkan(err) => InteropError::from_import(err),
            err => err,
        })?;

        log::debug!(
            "imported {:?} as {:?} memory {:?} of {} bytes",
            handle,
            handle_type,
            memory.handle,
            memory.allocation_size,
        );

        if handle_type.import_ownership() == ImportOwnership::Transferred {
            handle.release();
        }

        Ok(memory)
    }

    fn validate_allocate(
        device: &Device,
        allocate_info: &MemoryAllocateInfo<'_>,
        import_handle_type: Option<ExternalMemoryHandleType>,
    ) -> Result<(), InteropError> {
        let &MemoryAllocateInfo {
            allocation_size,
            memory_type_index,
            dedicated_allocation,
            export_handle_types,
            _ne: _,
        } = allocate_info;

        if allocation_size == 0 {
            return Err(InteropError::validation(
                "MemoryAllocateInfo",
                "allocation_size must not be zero",
            ));
        }

        let memory_type_count = device.physical_device().memory_types().len();

        if memory_type_index as usize >= memory_type_count {
            return Err(InteropError::validation(
                "MemoryAllocateInfo",
                format!(
                    "memory_type_index is {} but the physical device only has {} memory types",
                    memory_type_index, memory_type_count,
                ),
            ));
        }

        for handle_type in export_handle_types.iter() {
            device.check_extensions(&DeviceExtensions::for_memory(handle_type))?;
        }

        if dedicated_allocation.is_none() {
            let handle_types = export_handle_types
                | import_handle_type.map_or(ExternalMemoryHandleTypes::empty(), Into::into);

            for handle_type in handle_types.iter() {
                let properties =
                    device
                        .physical_device()
                        .external_buffer_properties(ExternalBufferInfo {
                            handle_type,
                            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                        });

                if properties.dedicated_only {
                    return Err(InteropError::validation(
                        "MemoryAllocateInfo",
                        format!(
                            "{} memory can only be a dedicated allocation, but \
                            dedicated_allocation is None",
                            handle_type.name(),
                        ),
                    ));
                }
            }
        }

        if let Some(dedicated_allocation) = dedicated_allocation {
            let (resource_device, required_size) = match dedicated_allocation {
                DedicatedAllocation::Buffer(buffer) => {
                    (buffer.device(), buffer.memory_requirements().size)
                }
                DedicatedAllocation::Image(image) => {
                    (image.device(), image.memory_requirements().size)
                }
            };

            if resource_device.id() != device.id() {
                return Err(InteropError::validation(
                    "MemoryAllocateInfo",
                    "the dedicated resource belongs to another device",
                ));
            }

            if allocation_size != required_size {
                return Err(InteropError::validation(
                    "MemoryAllocateInfo",
                    format!(
                        "a dedicated allocation must be {} bytes, the size required by its \
                        resource, but allocation_size is {}",
                        required_size, allocation_size,
                    ),
                ));
            }
        }

        Ok(())
    }

    unsafe fn allocate_unchecked(
        device: Arc<Device>,
        allocate_info: MemoryAllocateInfo<'_>,
        import: Option<(ExternalMemoryHandleType, isize)>,
    ) -> Result<DeviceMemory, InteropError> {
        let MemoryAllocateInfo {
            allocation_size,
            memory_type_index,
            dedicated_allocation,
            export_handle_types,
            _ne: _,
        } = allocate_info;

        let dedicated = dedicated_allocation.map(|dedicated_allocation| match dedicated_allocation {
            DedicatedAllocation::Buffer(buffer) => DedicatedTarget::Buffer(buffer.handle()),
            DedicatedAllocation::Image(image) => DedicatedTarget::Image(image.handle()),
        });

        let handle = unsafe {
            device.driver().allocate_memory(&MemoryDriverAllocateInfo {
                allocation_size,
                memory_type_index,
                export_handle_types,
                dedicated,
                import,
            })
        }?;

        Ok(DeviceMemory {
            handle,
            device,
            id: Self::next_id(),
            allocation_size,
            memory_type_index,
            dedicated_to: dedicated_allocation.map(DedicatedTo::from),
            export_handle_types,
            imported_handle_type: import.map(|(handle_type, _)| handle_type),
            mapped: AtomicBool::new(false),
        })
    }

    /// Returns the size in bytes of the memory allocation.
    #[inline]
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    /// Returns the index of the memory type that this memory was allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns whether the memory is a dedicated allocation.
    #[inline]
    pub fn is_dedicated(&self) -> bool {
        self.dedicated_to.is_some()
    }

    #[inline]
    pub(crate) fn dedicated_to(&self) -> Option<DedicatedTo> {
        self.dedicated_to
    }

    /// Returns the handle types that can be exported from the memory.
    #[inline]
    pub fn export_handle_types(&self) -> ExternalMemoryHandleTypes {
        self.export_handle_types
    }

    /// Returns the handle type the memory was imported from, if it was imported.
    #[inline]
    pub fn imported_handle_type(&self) -> Option<ExternalMemoryHandleType> {
        self.imported_handle_type
    }

    /// Exports the memory as a native handle.
    ///
    /// Every call returns a new handle referring to the same allocation; earlier handles stay
    /// valid.
    pub fn export(
        &self,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<NativeHandle, InteropError> {
        if !self.export_handle_types.contains_enum(handle_type) {
            return Err(InteropError::ExportFailed(
                format!(
                    "the memory was not allocated exportable as {}",
                    handle_type.name(),
                )
                .into(),
            ));
        }

        self.device
            .check_extensions(&DeviceExtensions::for_memory(handle_type))?;

        // SAFETY: the memory was allocated exportable as `handle_type` on this driver.
        let raw = unsafe { self.device.driver().export_memory(self.handle, handle_type) }
            .map_err(InteropError::from_export)?;

        // SAFETY: the driver hands ownership of `raw` to the caller.
        let handle = unsafe { NativeHandle::from_raw(handle_type.handle_kind(), raw) }?;

        log::debug!(
            "exported memory {:?} as {:?} {:?}",
            self.handle,
            handle_type,
            handle,
        );

        Ok(handle)
    }

    /// Maps the whole allocation for host access.
    ///
    /// The memory type must be host-visible. Only one mapping can exist at a time.
    pub fn map(&self) -> Result<MappedMemory<'_>, InteropError> {
        let property_flags = self
            .device
            .physical_device()
            .memory_types()
            .get(self.memory_type_index as usize)
            .map_or(MemoryPropertyFlags::empty(), |memory_type| {
                memory_type.property_flags
            });

        if !property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(InteropError::validation(
                "DeviceMemory::map",
                format!(
                    "memory type {} is not host-visible",
                    self.memory_type_index,
                ),
            ));
        }

        if self
            .mapped
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(InteropError::validation(
                "DeviceMemory::map",
                "the memory is already mapped",
            ));
        }

        // SAFETY: the memory is host-visible and not mapped.
        match unsafe { self.device.driver().map_memory(self.handle) } {
            Ok(ptr) => Ok(MappedMemory { memory: self, ptr }),
            Err(err) => {
                self.mapped.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }
}

impl Drop for DeviceMemory {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the memory is owned by `self`. A mapping borrows `self`, so none is alive.
        unsafe { self.device.driver().free_memory(self.handle) };
    }
}

unsafe impl VulkanObject for DeviceMemory {
    type Handle = vk::DeviceMemory;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for DeviceMemory {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(DeviceMemory);

/// Parameters to allocate a new `DeviceMemory`.
#[derive(Clone, Debug)]
pub struct MemoryAllocateInfo<'d> {
    /// Number of bytes to allocate.
    ///
    /// The default value is `0`, which must be overridden.
    pub allocation_size: u64,

    /// The index of the memory type that should be allocated.
    ///
    /// The default value is [`u32::MAX`], which must be overridden.
    pub memory_type_index: u32,

    /// Allocates memory for a specific buffer or image.
    ///
    /// The default value is `None`.
    pub dedicated_allocation: Option<DedicatedAllocation<'d>>,

    /// The handle types that can be exported from the allocated memory.
    ///
    /// The default value is [`ExternalMemoryHandleTypes::empty()`].
    pub export_handle_types: ExternalMemoryHandleTypes,

    pub _ne: NonExhaustive,
}

impl Default for MemoryAllocateInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self {
            allocation_size: 0,
            memory_type_index: u32::MAX,
            dedicated_allocation: None,
            export_handle_types: ExternalMemoryHandleTypes::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Host access to mapped [`DeviceMemory`]. The memory is unmapped when this is dropped.
///
/// The mapping may not be coherent. Call [`flush`](Self::flush) after writing and before
/// another context reads, and [`invalidate`](Self::invalidate) before reading what another
/// context wrote.
#[derive(Debug)]
pub struct MappedMemory<'a> {
    memory: &'a DeviceMemory,
    ptr: *mut u8,
}

impl MappedMemory<'_> {
    /// Returns the memory this mapping belongs to.
    #[inline]
    pub fn memory(&self) -> &DeviceMemory {
        self.memory
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), InteropError> {
        if offset
            .checked_add(len as u64)
            .is_none_or(|end| end > self.memory.allocation_size)
        {
            return Err(InteropError::validation(
                "MappedMemory",
                format!(
                    "{} bytes at offset {} do not fit in an allocation of {} bytes",
                    len, offset, self.memory.allocation_size,
                ),
            ));
        }

        Ok(())
    }

    /// Copies `data` into the mapping at `offset`.
    pub fn write<T: Pod>(&mut self, offset: u64, data: &[T]) -> Result<(), InteropError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_range(offset, bytes.len())?;

        // SAFETY: the range is within the mapping, which cannot overlap `data`.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset as usize), bytes.len())
        };

        Ok(())
    }

    /// Copies the mapping at `offset` into `data`.
    pub fn read<T: Pod>(&self, offset: u64, data: &mut [T]) -> Result<(), InteropError> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
        self.check_range(offset, bytes.len())?;

        // SAFETY: the range is within the mapping, which cannot overlap `data`.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset as usize), bytes.as_mut_ptr(), bytes.len())
        };

        Ok(())
    }

    /// Makes host writes to the mapping visible to the device and to other importers.
    pub fn flush(&self) -> Result<(), InteropError> {
        // SAFETY: the memory is mapped.
        unsafe { self.memory.device.driver().flush_memory(self.memory.handle) }?;

        Ok(())
    }

    /// Makes writes by the device or by other importers visible to the mapping.
    pub fn invalidate(&self) -> Result<(), InteropError> {
        // SAFETY: the memory is mapped.
        unsafe { self.memory.device.driver().invalidate_memory(self.memory.handle) }?;

        Ok(())
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        // SAFETY: the memory is mapped, and this is the only mapping.
        unsafe { self.memory.device.driver().unmap_memory(self.memory.handle) };
        self.memory.mapped.store(false, Ordering::Release);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{DeviceMemory, MemoryAllocateInfo};
    use crate::{
        device::DeviceExtensions,
        driver::{soft::SoftDriverConfig, MemoryDriverAllocateInfo},
        handle::NativeHandle,
        memory::{
            choose_host_visible_memory_type, Buffer, BufferCreateInfo, DedicatedAllocation,
            ExternalMemoryHandleType, ExternalMemoryHandleTypes, MemoryRequirements,
        },
        InteropError, VulkanError,
    };

    fn host_visible(device: &crate::device::Device) -> u32 {
        choose_host_visible_memory_type(device.physical_device(), u32::MAX).unwrap()
    }

    #[test]
    fn not_exportable_without_handle_type() {
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(
            ExternalMemoryHandleType::OpaqueFd
        ));
        let memory = DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: 1024,
                memory_type_index: 0,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            memory.export(ExternalMemoryHandleType::OpaqueFd),
            Err(InteropError::ExportFailed(_)),
        ));
    }

    #[test]
    fn invalid_memory_type() {
        let (device, _queue) = soft_device!(DeviceExtensions::empty());

        assert!(matches!(
            DeviceMemory::allocate(
                device,
                MemoryAllocateInfo {
                    allocation_size: 1024,
                    ..Default::default()
                },
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn import_aliases_the_allocation() {
        let handle_type = ExternalMemoryHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(handle_type));
        let memory_type_index = host_visible(&device);

        let exported = DeviceMemory::allocate_exportable(
            device.clone(),
            1024,
            memory_type_index,
            handle_type,
            None,
        )
        .unwrap();
        let mut handle = exported.export(handle_type).unwrap();

        let requirements = MemoryRequirements {
            size: 1024,
            alignment: 1,
            memory_type_bits: u32::MAX,
            prefers_dedicated_allocation: false,
            requires_dedicated_allocation: false,
        };
        let imported = DeviceMemory::import(
            device,
            &requirements,
            handle_type,
            memory_type_index,
            &mut handle,
        )
        .unwrap();
        assert!(!handle.has_value());
        assert_eq!(imported.imported_handle_type(), Some(handle_type));

        let data: Vec<u32> = (0..256).collect();
        {
            let mut mapping = exported.map().unwrap();
            mapping.write(0, &data).unwrap();
            mapping.flush().unwrap();
        }

        let mapping = imported.map().unwrap();
        mapping.invalidate().unwrap();
        let mut read = vec![0u32; 256];
        mapping.read(0, &mut read).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn writes_need_a_flush() {
        let handle_type = ExternalMemoryHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(handle_type));
        let memory_type_index = host_visible(&device);

        let a = DeviceMemory::allocate_exportable(
            device.clone(),
            256,
            memory_type_index,
            handle_type,
            None,
        )
        .unwrap();
        let mut handle = a.export(handle_type).unwrap();
        let b = DeviceMemory::import_with_info(
            device,
            MemoryAllocateInfo {
                allocation_size: 256,
                memory_type_index,
                ..Default::default()
            },
            handle_type,
            &mut handle,
        )
        .unwrap();

        let mut mapping_a = a.map().unwrap();
        let mapping_b = b.map().unwrap();
        mapping_a.write(0, &[0xAAu8; 16]).unwrap();

        let mut read = [0u8; 16];
        mapping_b.invalidate().unwrap();
        mapping_b.read(0, &mut read).unwrap();
        assert_eq!(read, [0; 16]);

        mapping_a.flush().unwrap();
        mapping_b.invalidate().unwrap();
        mapping_b.read(0, &mut read).unwrap();
        assert_eq!(read, [0xAA; 16]);
    }

    #[test]
    fn mapping_rules() {
        let (device, _queue) = soft_device!(DeviceExtensions::empty());
        let memory = DeviceMemory::allocate(
            device.clone(),
            MemoryAllocateInfo {
                allocation_size: 64,
                memory_type_index: host_visible(&device),
                ..Default::default()
            },
        )
        .unwrap();

        let mut mapping = memory.map().unwrap();
        assert!(matches!(
            memory.map(),
            Err(InteropError::ValidationFailed { .. }),
        ));
        assert!(matches!(
            mapping.write(60, &[0u32; 2]),
            Err(InteropError::ValidationFailed { .. }),
        ));
        drop(mapping);
        memory.map().unwrap();
    }

    #[test]
    fn failed_import_keeps_handle() {
        let handle_type = ExternalMemoryHandleType::OpaqueFd;
        let (device, _queue) = soft_device!(DeviceExtensions::for_memory(handle_type));

        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut handle = NativeHandle::from_fd(a.into());

        assert!(matches!(
            DeviceMemory::import_with_info(
                device,
                MemoryAllocateInfo {
                    allocation_size: 64,
                    memory_type_index: 0,
                    ..Default::default()
                },
                handle_type,
                &mut handle,
            ),
            Err(InteropError::ImportFailed(_)),
        ));
        assert!(handle.has_value());
    }

    #[test]
    fn dedicated_only_handle_type_without_resource() {
        let handle_type = ExternalMemoryHandleType::DmaBuf;
        let (device, _queue) = soft_device!(
            DeviceExtensions::for_memory(handle_type),
            SoftDriverConfig {
                dedicated_only_memory_handle_types: handle_type.into(),
                ..Default::default()
            }
        );
        let memory_type_index = host_visible(&device);

        assert!(matches!(
            DeviceMemory::allocate_exportable(
                device.clone(),
                1024,
                memory_type_index,
                handle_type,
                None,
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));

        // The driver refuses on its own too.
        // SAFETY: the allocation, if any, is freed right away.
        let result = unsafe {
            device.driver().allocate_memory(&MemoryDriverAllocateInfo {
                allocation_size: 1024,
                memory_type_index,
                export_handle_types: ExternalMemoryHandleTypes::DMA_BUF,
                dedicated: None,
                import: None,
            })
        };
        if let Ok(handle) = result {
            // SAFETY: `handle` was just allocated and is not used anywhere else.
            unsafe { device.driver().free_memory(handle) };
            panic!("non-dedicated {:?} memory was allocated", handle_type);
        }
        assert_eq!(result, Err(VulkanError::FeatureNotPresent));

        let create_info = BufferCreateInfo {
            size: 1024,
            external_memory_handle_types: handle_type.into(),
            ..Default::default()
        };
        let exporter_buffer = Buffer::new(device.clone(), create_info.clone()).unwrap();
        let exported = DeviceMemory::allocate_exportable(
            device.clone(),
            exporter_buffer.memory_requirements().size,
            memory_type_index,
            handle_type,
            Some(DedicatedAllocation::Buffer(&exporter_buffer)),
        )
        .unwrap();
        assert!(exported.is_dedicated());
        let mut handle = exported.export(handle_type).unwrap();

        assert!(matches!(
            DeviceMemory::import(
                device.clone(),
                exporter_buffer.memory_requirements(),
                handle_type,
                memory_type_index,
                &mut handle,
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));
        assert!(handle.has_value());

        let importer_buffer = Buffer::new(device.clone(), create_info).unwrap();
        let imported = DeviceMemory::import_dedicated(
            device,
            DedicatedAllocation::Buffer(&importer_buffer),
            handle_type,
            memory_type_index,
            &mut handle,
        )
        .unwrap();
        assert!(imported.is_dedicated());
        assert!(!handle.has_value());
    }
}
