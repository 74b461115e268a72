// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The boundary between the interop layer and an implementation of Vulkan.
//!
//! [`InstanceDriver`] and [`DeviceDriver`] are the raw entry points the object wrappers call.
//! They take and return raw object handles and raw native handle values; ownership rules and
//! validation live in the wrappers, not here.
//!
//! Two implementations exist:
//!
//! - [`vulkan`] calls the Vulkan implementation of the system, loaded at runtime.
//! - [`soft`] (unix only) is an in-process driver that exports real file descriptors. It lets
//!   every scenario run on machines without a GPU.

use crate::{
    device::{DeviceExtensions, InstanceExtensions},
    memory::{
        BufferUsage, ExternalMemoryHandleType, ExternalMemoryHandleTypes, ExternalMemoryProperties,
        Format, ImageUsage, MemoryPropertyFlags, MemoryRequirements,
    },
    sync::{
        ExternalFenceHandleType, ExternalFenceHandleTypes, ExternalFenceProperties,
        ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes, ExternalSemaphoreProperties,
        Permanence,
    },
    VulkanError,
};
use ash::vk;
use std::{fmt::Debug, sync::Arc};

#[cfg(unix)]
pub mod soft;
pub mod vulkan;

/// Properties of a physical device that the interop layer needs.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceProperties {
    pub device_name: String,
    pub api_version: u32,
    pub supported_extensions: DeviceExtensions,
    pub queue_families: Vec<QueueFamilyProperties>,
    pub memory_types: Vec<MemoryType>,
    pub non_coherent_atom_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyProperties {
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// Parameters of an external buffer capability query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExternalBufferInfo {
    pub handle_type: ExternalMemoryHandleType,
    pub usage: BufferUsage,
}

/// Parameters of an external image capability query. Images are always 2D, optimally tiled
/// and single-sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExternalImageInfo {
    pub handle_type: ExternalMemoryHandleType,
    pub format: Format,
    pub usage: ImageUsage,
}

/// What the device driver needs to create a device.
#[derive(Clone, Debug)]
pub struct DeviceDriverCreateInfo {
    pub queue_family_index: u32,
    pub enabled_extensions: DeviceExtensions,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDriverCreateInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub external_memory_handle_types: ExternalMemoryHandleTypes,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDriverCreateInfo {
    pub format: Format,
    pub extent: [u32; 2],
    pub usage: ImageUsage,
    pub external_memory_handle_types: ExternalMemoryHandleTypes,
}

/// The single resource a dedicated allocation is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryDriverAllocateInfo {
    pub allocation_size: u64,
    pub memory_type_index: u32,
    pub export_handle_types: ExternalMemoryHandleTypes,
    pub dedicated: Option<DedicatedTarget>,

    /// The payload to import instead of allocating new memory. Ownership of the raw value
    /// follows the rules of the handle type.
    pub import: Option<(ExternalMemoryHandleType, isize)>,
}

/// Memory properties of a native handle that is about to be imported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportedMemoryProperties {
    pub memory_type_bits: u32,

    /// The size dictated by the handle itself, for handle types that carry one.
    pub allocation_size: Option<u64>,
}

/// GPU work executed before the signal operations of a submission, so that they are still
/// pending when the submit call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkInfo {
    pub buffer_size: u64,
    pub iterations: u32,
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
    pub work: Option<WorkInfo>,
}

/// Entry points of an instance of a Vulkan implementation.
pub trait InstanceDriver: Debug + Send + Sync {
    fn api_version(&self) -> u32;

    fn enabled_extensions(&self) -> &InstanceExtensions;

    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, VulkanError>;

    unsafe fn physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceProperties;

    unsafe fn external_semaphore_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        handle_type: ExternalSemaphoreHandleType,
    ) -> ExternalSemaphoreProperties;

    unsafe fn external_fence_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        handle_type: ExternalFenceHandleType,
    ) -> ExternalFenceProperties;

    unsafe fn external_buffer_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &ExternalBufferInfo,
    ) -> ExternalMemoryProperties;

    /// Returns `None` if the image parameters are not supported at all with this handle type.
    unsafe fn external_image_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &ExternalImageInfo,
    ) -> Result<Option<ExternalMemoryProperties>, VulkanError>;

    unsafe fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &DeviceDriverCreateInfo,
    ) -> Result<Arc<dyn DeviceDriver>, VulkanError>;
}

/// Entry points of a logical device with a single queue.
///
/// Raw native handle values are `isize`: file descriptors, Win32 handles and
/// `AHardwareBuffer` pointers alike. Exported values are owned by the caller. Imported values
/// follow the ownership rule of their handle type when the call succeeds, and stay with the
/// caller when it fails.
///
/// # Safety
///
/// Every object handle passed to a method must have been created by the same driver and not be
/// destroyed yet.
pub trait DeviceDriver: Debug + Send + Sync {
    fn queue(&self) -> vk::Queue;

    unsafe fn create_semaphore(
        &self,
        export_handle_types: ExternalSemaphoreHandleTypes,
    ) -> Result<vk::Semaphore, VulkanError>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn export_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<isize, VulkanError>;

    unsafe fn import_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError>;

    unsafe fn create_fence(
        &self,
        signaled: bool,
        export_handle_types: ExternalFenceHandleTypes,
    ) -> Result<vk::Fence, VulkanError>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    unsafe fn export_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
    ) -> Result<isize, VulkanError>;

    unsafe fn import_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError>;

    /// Returns `Ok(false)` if `timeout_ns` elapsed before the fence was signaled.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64)
        -> Result<bool, VulkanError>;

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError>;

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError>;

    unsafe fn create_buffer(
        &self,
        create_info: &BufferDriverCreateInfo,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError>;

    unsafe fn create_image(
        &self,
        create_info: &ImageDriverCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError>;

    unsafe fn destroy_image(&self, image: vk::Image);

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError>;

    unsafe fn allocate_memory(
        &self,
        allocate_info: &MemoryDriverAllocateInfo,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    unsafe fn export_memory(
        &self,
        memory: vk::DeviceMemory,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<isize, VulkanError>;

    /// Queries the memory properties of a native handle before importing it. Not valid for
    /// opaque handle types.
    unsafe fn imported_memory_properties(
        &self,
        handle_type: ExternalMemoryHandleType,
        raw: isize,
    ) -> Result<ImportedMemoryProperties, VulkanError>;

    /// Maps the whole allocation.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<*mut u8, VulkanError>;

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Makes host writes to the mapping visible to the device.
    unsafe fn flush_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError>;

    /// Makes device writes visible to the mapping.
    unsafe fn invalidate_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError>;

    unsafe fn queue_submit(&self, submit_info: &SubmitInfo<'_>) -> Result<(), VulkanError>;

    unsafe fn queue_wait_idle(&self) -> Result<(), VulkanError>;
}
