// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The Vulkan implementation of the system, loaded at runtime.
//!
//! The library is opened with `libloading` and every entry point is resolved through
//! `vkGetInstanceProcAddr` and `vkGetDeviceProcAddr` into the function tables of `ash`.
//! Entry points of extensions that are not enabled are never called.

use super::{
    BufferDriverCreateInfo, DedicatedTarget, DeviceDriver, DeviceDriverCreateInfo,
    ExternalBufferInfo, ExternalImageInfo, ImageDriverCreateInfo, ImportedMemoryProperties,
    InstanceDriver, MemoryDriverAllocateInfo, MemoryType, PhysicalDeviceProperties,
    QueueFamilyProperties, SubmitInfo, WorkInfo,
};
use crate::{
    device::{DeviceExtensions, InstanceExtensions, API_VERSION_1_1},
    handle::HandleKind,
    memory::{
        ExternalMemoryHandleType, ExternalMemoryProperties, MemoryPropertyFlags,
        MemoryRequirements,
    },
    sync::{
        ExternalFenceHandleType, ExternalFenceHandleTypes, ExternalFenceProperties,
        ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes, ExternalSemaphoreProperties,
        Permanence,
    },
    InteropError, VulkanError,
};
use ash::vk;
use libloading::Library;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    ffi::{c_void, CStr, CString},
    fmt::{Debug, Error as FmtError, Formatter},
    mem, ptr, slice,
    sync::Arc,
};

fn check(result: vk::Result) -> Result<(), VulkanError> {
    result.result().map_err(VulkanError::from)
}

/// Calls a Vulkan enumeration function twice, first for the count and then for the data.
unsafe fn enumerate<T: Clone + Default>(
    mut call: impl FnMut(&mut u32, *mut T) -> vk::Result,
) -> Result<Vec<T>, VulkanError> {
    loop {
        let mut count = 0;
        check(call(&mut count, ptr::null_mut()))?;

        let mut data = vec![T::default(); count as usize];
        let result = call(&mut count, data.as_mut_ptr());

        if result == vk::Result::INCOMPLETE {
            // The count changed between the calls.
            continue;
        }

        check(result)?;
        data.truncate(count as usize);

        return Ok(data);
    }
}

fn open_library() -> Result<(Library, vk::PFN_vkGetInstanceProcAddr), InteropError> {
    #[cfg(windows)]
    const PATHS: [&str; 1] = ["vulkan-1.dll"];
    #[cfg(all(unix, not(target_os = "android"), not(target_os = "macos")))]
    const PATHS: [&str; 1] = ["libvulkan.so.1"];
    #[cfg(target_os = "macos")]
    const PATHS: [&str; 4] = [
        "libvulkan.dylib",
        "libvulkan.1.dylib",
        "libMoltenVK.dylib",
        "/usr/local/lib/libvulkan.dylib",
    ];
    #[cfg(target_os = "android")]
    const PATHS: [&str; 2] = ["libvulkan.so.1", "libvulkan.so"];
    #[cfg(not(any(unix, windows)))]
    const PATHS: [&str; 0] = [];

    let mut last_err = None;

    for path in PATHS {
        // SAFETY: a library with this name is assumed to be a Vulkan implementation.
        let library = match unsafe { Library::new(path) } {
            Ok(library) => library,
            Err(err) => {
                log::debug!("failed to open {}: {}", path, err);
                last_err = Some(err);
                continue;
            }
        };

        // SAFETY: the symbol has the signature of `vkGetInstanceProcAddr`.
        let get_instance_proc_addr =
            *unsafe { library.get::<vk::PFN_vkGetInstanceProcAddr>(b"vkGetInstanceProcAddr") }?;

        log::debug!("loaded Vulkan from {}", path);

        return Ok((library, get_instance_proc_addr));
    }

    match last_err {
        Some(err) => Err(err.into()),
        None => Err(InteropError::not_supported(
            "there is no Vulkan library on this platform",
        )),
    }
}

/// An instance of the Vulkan implementation of the system.
pub struct VulkanInstance {
    handle: vk::Instance,
    v1_0: ash::InstanceFnV1_0,
    v1_1: ash::InstanceFnV1_1,
    enabled_extensions: InstanceExtensions,

    // Dropped last.
    _library: Library,
}

impl VulkanInstance {
    /// Loads the Vulkan library and creates a Vulkan 1.1 instance.
    pub fn new(
        application_name: Option<&str>,
        enabled_extensions: &InstanceExtensions,
    ) -> Result<Self, InteropError> {
        let (library, get_instance_proc_addr) = open_library()?;
        let load_global = |name: &CStr| {
            // SAFETY: global commands are loaded with a null instance.
            unsafe { get_instance_proc_addr(vk::Instance::null(), name.as_ptr()) }
                .map_or(ptr::null(), |func| func as *const c_void)
        };
        let entry = ash::EntryFnV1_0::load(load_global);

        // A missing `vkEnumerateInstanceVersion` means a Vulkan 1.0 implementation.
        let api_version = match load_global(c"vkEnumerateInstanceVersion") {
            func if func.is_null() => vk::API_VERSION_1_0,
            func => {
                // SAFETY: the pointer is the `vkEnumerateInstanceVersion` of the library.
                let func: vk::PFN_vkEnumerateInstanceVersion = unsafe { mem::transmute(func) };
                let mut version = 0;
                // SAFETY: `version` is a valid output pointer.
                check(unsafe { func(&mut version) })?;
                version
            }
        };

        if api_version < API_VERSION_1_1 {
            return Err(InteropError::not_supported(format!(
                "the Vulkan implementation only supports Vulkan {}.{}",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
            )));
        }

        let requested = enabled_extensions.without_core(API_VERSION_1_1);
        // SAFETY: the arguments follow the two-call idiom.
        let supported = unsafe {
            enumerate(|count, data| {
                (entry.enumerate_instance_extension_properties)(ptr::null(), count, data)
            })
        }?;
        let supported = InstanceExtensions::from_names(
            supported
                .iter()
                .filter_map(|property| property.extension_name_as_c_str().ok()),
        );

        if let Some(extension) = requested.difference(&supported).first_set() {
            return Err(InteropError::ExtensionNotPresent { extension });
        }

        let application_name = application_name
            .map(CString::new)
            .transpose()
            .map_err(|_| {
                InteropError::validation(
                    "InstanceCreateInfo",
                    "application_name must not contain a nul byte",
                )
            })?;
        let mut application_info = vk::ApplicationInfo::default()
            .engine_name(c"vkinterop")
            .api_version(API_VERSION_1_1);

        if let Some(application_name) = &application_name {
            application_info = application_info.application_name(application_name);
        }

        let extension_names = requested.names();
        let extension_ptrs: SmallVec<[_; 4]> =
            extension_names.iter().map(|name| name.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_extension_names(&extension_ptrs);

        let handle = {
            let mut output = vk::Instance::null();
            // SAFETY: `create_info` and everything it points to outlive the call.
            check(unsafe { (entry.create_instance)(&create_info, ptr::null(), &mut output) })?;
            output
        };

        let load = |name: &CStr| {
            // SAFETY: `handle` is a live instance of the library.
            unsafe { get_instance_proc_addr(handle, name.as_ptr()) }
                .map_or(ptr::null(), |func| func as *const c_void)
        };

        Ok(VulkanInstance {
            handle,
            v1_0: ash::InstanceFnV1_0::load(load),
            v1_1: ash::InstanceFnV1_1::load(load),
            enabled_extensions: *enabled_extensions,
            _library: library,
        })
    }
}

impl Drop for VulkanInstance {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: every device created from the instance holds its physical device, which holds
        // the instance, so none is left.
        unsafe { (self.v1_0.destroy_instance)(self.handle, ptr::null()) };
    }
}

impl Debug for VulkanInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("VulkanInstance")
            .field("handle", &self.handle)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish_non_exhaustive()
    }
}

impl InstanceDriver for VulkanInstance {
    #[inline]
    fn api_version(&self) -> u32 {
        API_VERSION_1_1
    }

    #[inline]
    fn enabled_extensions(&self) -> &InstanceExtensions {
        &self.enabled_extensions
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, VulkanError> {
        // SAFETY: the arguments follow the two-call idiom.
        unsafe {
            enumerate(|count, data| {
                (self.v1_0.enumerate_physical_devices)(self.handle, count, data)
            })
        }
    }

    unsafe fn physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceProperties {
        let properties = {
            let mut output = vk::PhysicalDeviceProperties::default();
            unsafe { (self.v1_0.get_physical_device_properties)(physical_device, &mut output) };
            output
        };

        let supported_extensions = unsafe {
            enumerate(|count, data| {
                (self.v1_0.enumerate_device_extension_properties)(
                    physical_device,
                    ptr::null(),
                    count,
                    data,
                )
            })
        }
        .map(|properties| {
            DeviceExtensions::from_names(
                properties
                    .iter()
                    .filter_map(|property| property.extension_name_as_c_str().ok()),
            )
        })
        .unwrap_or_else(|err| {
            log::warn!("failed to enumerate the device extensions: {}", err);
            DeviceExtensions::empty()
        });

        let queue_families = {
            let mut count = 0;
            unsafe {
                (self.v1_0.get_physical_device_queue_family_properties)(
                    physical_device,
                    &mut count,
                    ptr::null_mut(),
                )
            };
            let mut output = vec![vk::QueueFamilyProperties::default(); count as usize];
            unsafe {
                (self.v1_0.get_physical_device_queue_family_properties)(
                    physical_device,
                    &mut count,
                    output.as_mut_ptr(),
                )
            };
            output.truncate(count as usize);
            output
        };

        let memory_properties = {
            let mut output = vk::PhysicalDeviceMemoryProperties::default();
            unsafe {
                (self.v1_0.get_physical_device_memory_properties)(physical_device, &mut output)
            };
            output
        };

        PhysicalDeviceProperties {
            device_name: properties
                .device_name_as_c_str()
                .map_or_else(|_| String::new(), |name| name.to_string_lossy().into_owned()),
            api_version: properties.api_version,
            supported_extensions,
            queue_families: queue_families
                .iter()
                .map(|family| QueueFamilyProperties {
                    queue_flags: family.queue_flags,
                    queue_count: family.queue_count,
                })
                .collect(),
            memory_types: memory_properties.memory_types
                [..memory_properties.memory_type_count as usize]
                .iter()
                .map(|memory_type| MemoryType {
                    property_flags: MemoryPropertyFlags::from(memory_type.property_flags),
                    heap_index: memory_type.heap_index,
                })
                .collect(),
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
        }
    }

    unsafe fn external_semaphore_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        handle_type: ExternalSemaphoreHandleType,
    ) -> ExternalSemaphoreProperties {
        let info =
            vk::PhysicalDeviceExternalSemaphoreInfo::default().handle_type(handle_type.into());
        let mut output = vk::ExternalSemaphoreProperties::default();

        unsafe {
            (self.v1_1.get_physical_device_external_semaphore_properties)(
                physical_device,
                &info,
                &mut output,
            )
        };

        let features = output.external_semaphore_features;

        ExternalSemaphoreProperties {
            exportable: features.contains(vk::ExternalSemaphoreFeatureFlags::EXPORTABLE),
            importable: features.contains(vk::ExternalSemaphoreFeatureFlags::IMPORTABLE),
            export_from_imported_handle_types: output.export_from_imported_handle_types.into(),
            compatible_handle_types: output.compatible_handle_types.into(),
        }
    }

    unsafe fn external_fence_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        handle_type: ExternalFenceHandleType,
    ) -> ExternalFenceProperties {
        let info = vk::PhysicalDeviceExternalFenceInfo::default().handle_type(handle_type.into());
        let mut output = vk::ExternalFenceProperties::default();

        unsafe {
            (self.v1_1.get_physical_device_external_fence_properties)(
                physical_device,
                &info,
                &mut output,
            )
        };

        let features = output.external_fence_features;

        ExternalFenceProperties {
            exportable: features.contains(vk::ExternalFenceFeatureFlags::EXPORTABLE),
            importable: features.contains(vk::ExternalFenceFeatureFlags::IMPORTABLE),
            export_from_imported_handle_types: output.export_from_imported_handle_types.into(),
            compatible_handle_types: output.compatible_handle_types.into(),
        }
    }

    unsafe fn external_buffer_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &ExternalBufferInfo,
    ) -> ExternalMemoryProperties {
        let buffer_info = vk::PhysicalDeviceExternalBufferInfo::default()
            .usage(info.usage.into())
            .handle_type(info.handle_type.into());
        let mut output = vk::ExternalBufferProperties::default();

        unsafe {
            (self.v1_1.get_physical_device_external_buffer_properties)(
                physical_device,
                &buffer_info,
                &mut output,
            )
        };

        convert_memory_properties(&output.external_memory_properties)
    }

    unsafe fn external_image_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &ExternalImageInfo,
    ) -> Result<Option<ExternalMemoryProperties>, VulkanError> {
        let mut external_info = vk::PhysicalDeviceExternalImageFormatInfo::default()
            .handle_type(info.handle_type.into());
        let format_info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(info.format.into())
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage.into())
            .push_next(&mut external_info);
        let mut external_output = vk::ExternalImageFormatProperties::default();
        let mut output = vk::ImageFormatProperties2::default().push_next(&mut external_output);

        let result = unsafe {
            (self.v1_1.get_physical_device_image_format_properties2)(
                physical_device,
                &format_info,
                &mut output,
            )
        };

        match result {
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Ok(None),
            result => {
                check(result)?;
                Ok(Some(convert_memory_properties(
                    &external_output.external_memory_properties,
                )))
            }
        }
    }

    unsafe fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &DeviceDriverCreateInfo,
    ) -> Result<Arc<dyn DeviceDriver>, VulkanError> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(create_info.queue_family_index)
            .queue_priorities(&queue_priorities);
        let extension_names = create_info.enabled_extensions.names();
        let extension_ptrs: SmallVec<[_; 8]> =
            extension_names.iter().map(|name| name.as_ptr()).collect();
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);

        let handle = {
            let mut output = vk::Device::null();
            check(unsafe {
                (self.v1_0.create_device)(
                    physical_device,
                    &device_create_info,
                    ptr::null(),
                    &mut output,
                )
            })?;
            output
        };

        let get_device_proc_addr = self.v1_0.get_device_proc_addr;
        let load = |name: &CStr| {
            // SAFETY: `handle` is a live device.
            unsafe { get_device_proc_addr(handle, name.as_ptr()) }
                .map_or(ptr::null(), |func| func as *const c_void)
        };
        let fns = DeviceFunctions {
            v1_0: ash::DeviceFnV1_0::load(load),
            v1_1: ash::DeviceFnV1_1::load(load),
            khr_external_semaphore_fd: ash::khr::external_semaphore_fd::DeviceFn::load(load),
            khr_external_semaphore_win32: ash::khr::external_semaphore_win32::DeviceFn::load(load),
            khr_external_fence_fd: ash::khr::external_fence_fd::DeviceFn::load(load),
            khr_external_fence_win32: ash::khr::external_fence_win32::DeviceFn::load(load),
            khr_external_memory_fd: ash::khr::external_memory_fd::DeviceFn::load(load),
            khr_external_memory_win32: ash::khr::external_memory_win32::DeviceFn::load(load),
            android_external_memory_android_hardware_buffer:
                ash::android::external_memory_android_hardware_buffer::DeviceFn::load(load),
        };

        let queue = {
            let mut output = vk::Queue::null();
            unsafe {
                (fns.v1_0.get_device_queue)(handle, create_info.queue_family_index, 0, &mut output)
            };
            output
        };

        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(create_info.queue_family_index);
        let command_pool = {
            let mut output = vk::CommandPool::null();
            let result = unsafe {
                (fns.v1_0.create_command_pool)(handle, &pool_create_info, ptr::null(), &mut output)
            };

            if let Err(err) = check(result) {
                unsafe { (fns.v1_0.destroy_device)(handle, ptr::null()) };
                return Err(err);
            }

            output
        };

        let memory_properties = {
            let mut output = vk::PhysicalDeviceMemoryProperties::default();
            unsafe {
                (self.v1_0.get_physical_device_memory_properties)(physical_device, &mut output)
            };
            output
        };

        Ok(Arc::new(VulkanDevice {
            handle,
            queue,
            fns,
            command_pool,
            memory_types: memory_properties.memory_types
                [..memory_properties.memory_type_count as usize]
                .to_vec(),
            pending_work: Mutex::new(Vec::new()),
        }))
    }
}

fn convert_memory_properties(
    properties: &vk::ExternalMemoryProperties,
) -> ExternalMemoryProperties {
    let features = properties.external_memory_features;

    ExternalMemoryProperties {
        dedicated_only: features.contains(vk::ExternalMemoryFeatureFlags::DEDICATED_ONLY),
        exportable: features.contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE),
        importable: features.contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE),
        export_from_imported_handle_types: properties.export_from_imported_handle_types.into(),
        compatible_handle_types: properties.compatible_handle_types.into(),
    }
}

struct DeviceFunctions {
    v1_0: ash::DeviceFnV1_0,
    v1_1: ash::DeviceFnV1_1,
    khr_external_semaphore_fd: ash::khr::external_semaphore_fd::DeviceFn,
    khr_external_semaphore_win32: ash::khr::external_semaphore_win32::DeviceFn,
    khr_external_fence_fd: ash::khr::external_fence_fd::DeviceFn,
    khr_external_fence_win32: ash::khr::external_fence_win32::DeviceFn,
    khr_external_memory_fd: ash::khr::external_memory_fd::DeviceFn,
    khr_external_memory_win32: ash::khr::external_memory_win32::DeviceFn,
    android_external_memory_android_hardware_buffer:
        ash::android::external_memory_android_hardware_buffer::DeviceFn,
}

/// The resources of a batch of GPU work, kept until the queue is idle.
#[derive(Debug)]
struct PendingWork {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    command_buffer: vk::CommandBuffer,
}

/// A device of the Vulkan implementation of the system, with a single queue.
pub struct VulkanDevice {
    handle: vk::Device,
    queue: vk::Queue,
    fns: DeviceFunctions,
    command_pool: vk::CommandPool,
    memory_types: Vec<vk::MemoryType>,
    pending_work: Mutex<Vec<PendingWork>>,
}

impl Debug for VulkanDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("VulkanDevice")
            .field("handle", &self.handle)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = check((self.fns.v1_0.device_wait_idle)(self.handle)) {
                log::error!("failed to wait for the device before destroying it: {}", err);
            }

            for work in mem::take(self.pending_work.get_mut()) {
                self.free_work(work);
            }

            (self.fns.v1_0.destroy_command_pool)(self.handle, self.command_pool, ptr::null());
            (self.fns.v1_0.destroy_device)(self.handle, ptr::null());
        }
    }
}

impl VulkanDevice {
    unsafe fn free_work(&self, work: PendingWork) {
        let fns = &self.fns.v1_0;

        unsafe {
            if work.command_buffer != vk::CommandBuffer::null() {
                (fns.free_command_buffers)(
                    self.handle,
                    self.command_pool,
                    1,
                    &work.command_buffer,
                );
            }

            (fns.destroy_buffer)(self.handle, work.buffer, ptr::null());
            (fns.free_memory)(self.handle, work.memory, ptr::null());
        }
    }

    /// Records `iterations` fills of a fresh device-local buffer.
    unsafe fn record_work(&self, work: WorkInfo) -> Result<PendingWork, VulkanError> {
        let mut pending = PendingWork {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            command_buffer: vk::CommandBuffer::null(),
        };

        let result = unsafe { self.record_work_into(work, &mut pending) };

        if let Err(err) = result {
            unsafe { self.free_work(pending) };
            return Err(err);
        }

        Ok(pending)
    }

    unsafe fn record_work_into(
        &self,
        work: WorkInfo,
        pending: &mut PendingWork,
    ) -> Result<(), VulkanError> {
        let fns = &self.fns.v1_0;

        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(work.buffer_size.max(4))
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        check(unsafe {
            (fns.create_buffer)(
                self.handle,
                &buffer_create_info,
                ptr::null(),
                &mut pending.buffer,
            )
        })?;

        let requirements = {
            let mut output = vk::MemoryRequirements::default();
            unsafe {
                (fns.get_buffer_memory_requirements)(self.handle, pending.buffer, &mut output)
            };
            output
        };
        let memory_type_index = (0..self.memory_types.len() as u32)
            .filter(|&index| requirements.memory_type_bits & (1 << index) != 0)
            .min_by_key(|&index| {
                let flags = self.memory_types[index as usize].property_flags;
                !flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .ok_or(VulkanError::OutOfDeviceMemory)?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        check(unsafe {
            (fns.allocate_memory)(self.handle, &allocate_info, ptr::null(), &mut pending.memory)
        })?;
        check(unsafe { (fns.bind_buffer_memory)(self.handle, pending.buffer, pending.memory, 0) })?;

        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        check(unsafe {
            (fns.allocate_command_buffers)(
                self.handle,
                &command_buffer_info,
                &mut pending.command_buffer,
            )
        })?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        check(unsafe { (fns.begin_command_buffer)(pending.command_buffer, &begin_info) })?;

        for iteration in 0..work.iterations {
            unsafe {
                (fns.cmd_fill_buffer)(
                    pending.command_buffer,
                    pending.buffer,
                    0,
                    vk::WHOLE_SIZE,
                    iteration,
                )
            };
        }

        check(unsafe { (fns.end_command_buffer)(pending.command_buffer) })
    }

    fn memory_requirements(
        requirements: &vk::MemoryRequirements,
        dedicated: &vk::MemoryDedicatedRequirements<'_>,
    ) -> MemoryRequirements {
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            prefers_dedicated_allocation: dedicated.prefers_dedicated_allocation != vk::FALSE,
            requires_dedicated_allocation: dedicated.requires_dedicated_allocation != vk::FALSE,
        }
    }
}

impl DeviceDriver for VulkanDevice {
    #[inline]
    fn queue(&self) -> vk::Queue {
        self.queue
    }

    unsafe fn create_semaphore(
        &self,
        export_handle_types: ExternalSemaphoreHandleTypes,
    ) -> Result<vk::Semaphore, VulkanError> {
        let mut export_info =
            vk::ExportSemaphoreCreateInfo::default().handle_types(export_handle_types.into());
        let mut create_info = vk::SemaphoreCreateInfo::default();

        if !export_handle_types.is_empty() {
            create_info = create_info.push_next(&mut export_info);
        }

        let mut output = vk::Semaphore::null();
        check(unsafe {
            (self.fns.v1_0.create_semaphore)(self.handle, &create_info, ptr::null(), &mut output)
        })?;

        Ok(output)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { (self.fns.v1_0.destroy_semaphore)(self.handle, semaphore, ptr::null()) };
    }

    unsafe fn export_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<isize, VulkanError> {
        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let info = vk::SemaphoreGetFdInfoKHR::default()
                    .semaphore(semaphore)
                    .handle_type(handle_type.into());
                let mut output = -1;
                check(unsafe {
                    (self.fns.khr_external_semaphore_fd.get_semaphore_fd_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let info = vk::SemaphoreGetWin32HandleInfoKHR::default()
                    .semaphore(semaphore)
                    .handle_type(handle_type.into());
                let mut output: vk::HANDLE = 0;
                check(unsafe {
                    (self.fns.khr_external_semaphore_win32.get_semaphore_win32_handle_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::None | HandleKind::AndroidHardwareBuffer => {
                Err(VulkanError::InvalidExternalHandle)
            }
        }
    }

    unsafe fn import_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError> {
        let flags = match permanence {
            Permanence::Permanent => vk::SemaphoreImportFlags::empty(),
            Permanence::Temporary => vk::SemaphoreImportFlags::TEMPORARY,
        };

        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let info = vk::ImportSemaphoreFdInfoKHR::default()
                    .semaphore(semaphore)
                    .flags(flags)
                    .handle_type(handle_type.into())
                    .fd(raw as i32);

                check(unsafe {
                    (self.fns.khr_external_semaphore_fd.import_semaphore_fd_khr)(self.handle, &info)
                })
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let info = vk::ImportSemaphoreWin32HandleInfoKHR::default()
                    .semaphore(semaphore)
                    .flags(flags)
                    .handle_type(handle_type.into())
                    .handle(raw as vk::HANDLE);

                check(unsafe {
                    (self.fns.khr_external_semaphore_win32.import_semaphore_win32_handle_khr)(
                        self.handle,
                        &info,
                    )
                })
            }
            HandleKind::None | HandleKind::AndroidHardwareBuffer => {
                Err(VulkanError::InvalidExternalHandle)
            }
        }
    }

    unsafe fn create_fence(
        &self,
        signaled: bool,
        export_handle_types: ExternalFenceHandleTypes,
    ) -> Result<vk::Fence, VulkanError> {
        let mut export_info =
            vk::ExportFenceCreateInfo::default().handle_types(export_handle_types.into());
        let mut create_info = vk::FenceCreateInfo::default();

        if signaled {
            create_info = create_info.flags(vk::FenceCreateFlags::SIGNALED);
        }

        if !export_handle_types.is_empty() {
            create_info = create_info.push_next(&mut export_info);
        }

        let mut output = vk::Fence::null();
        check(unsafe {
            (self.fns.v1_0.create_fence)(self.handle, &create_info, ptr::null(), &mut output)
        })?;

        Ok(output)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { (self.fns.v1_0.destroy_fence)(self.handle, fence, ptr::null()) };
    }

    unsafe fn export_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
    ) -> Result<isize, VulkanError> {
        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let info = vk::FenceGetFdInfoKHR::default()
                    .fence(fence)
                    .handle_type(handle_type.into());
                let mut output = -1;
                check(unsafe {
                    (self.fns.khr_external_fence_fd.get_fence_fd_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let info = vk::FenceGetWin32HandleInfoKHR::default()
                    .fence(fence)
                    .handle_type(handle_type.into());
                let mut output: vk::HANDLE = 0;
                check(unsafe {
                    (self.fns.khr_external_fence_win32.get_fence_win32_handle_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::None | HandleKind::AndroidHardwareBuffer => {
                Err(VulkanError::InvalidExternalHandle)
            }
        }
    }

    unsafe fn import_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError> {
        let flags = match permanence {
            Permanence::Permanent => vk::FenceImportFlags::empty(),
            Permanence::Temporary => vk::FenceImportFlags::TEMPORARY,
        };

        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let info = vk::ImportFenceFdInfoKHR::default()
                    .fence(fence)
                    .flags(flags)
                    .handle_type(handle_type.into())
                    .fd(raw as i32);

                check(unsafe {
                    (self.fns.khr_external_fence_fd.import_fence_fd_khr)(self.handle, &info)
                })
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let info = vk::ImportFenceWin32HandleInfoKHR::default()
                    .fence(fence)
                    .flags(flags)
                    .handle_type(handle_type.into())
                    .handle(raw as vk::HANDLE);

                check(unsafe {
                    (self.fns.khr_external_fence_win32.import_fence_win32_handle_khr)(
                        self.handle,
                        &info,
                    )
                })
            }
            HandleKind::None | HandleKind::AndroidHardwareBuffer => {
                Err(VulkanError::InvalidExternalHandle)
            }
        }
    }

    unsafe fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<bool, VulkanError> {
        let result = unsafe {
            (self.fns.v1_0.wait_for_fences)(self.handle, 1, &fence, vk::TRUE, timeout_ns)
        };

        match result {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::TIMEOUT => Ok(false),
            err => Err(err.into()),
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        check(unsafe { (self.fns.v1_0.reset_fences)(self.handle, 1, &fence) })
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError> {
        match unsafe { (self.fns.v1_0.get_fence_status)(self.handle, fence) } {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            err => Err(err.into()),
        }
    }

    unsafe fn create_buffer(
        &self,
        create_info: &BufferDriverCreateInfo,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError> {
        let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
            .handle_types(create_info.external_memory_handle_types.into());
        let mut buffer_create_info = vk::BufferCreateInfo::default()
            .size(create_info.size)
            .usage(create_info.usage.into())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        if !create_info.external_memory_handle_types.is_empty() {
            buffer_create_info = buffer_create_info.push_next(&mut external_info);
        }

        let mut buffer = vk::Buffer::null();
        check(unsafe {
            (self.fns.v1_0.create_buffer)(
                self.handle,
                &buffer_create_info,
                ptr::null(),
                &mut buffer,
            )
        })?;

        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut output = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe { (self.fns.v1_1.get_buffer_memory_requirements2)(self.handle, &info, &mut output) };
        let requirements = output.memory_requirements;

        Ok((buffer, Self::memory_requirements(&requirements, &dedicated)))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { (self.fns.v1_0.destroy_buffer)(self.handle, buffer, ptr::null()) };
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError> {
        check(unsafe { (self.fns.v1_0.bind_buffer_memory)(self.handle, buffer, memory, offset) })
    }

    unsafe fn create_image(
        &self,
        create_info: &ImageDriverCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError> {
        let [width, height] = create_info.extent;
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(create_info.external_memory_handle_types.into());
        let mut image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(create_info.format.into())
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(create_info.usage.into())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        if !create_info.external_memory_handle_types.is_empty() {
            image_create_info = image_create_info.push_next(&mut external_info);
        }

        let mut image = vk::Image::null();
        check(unsafe {
            (self.fns.v1_0.create_image)(self.handle, &image_create_info, ptr::null(), &mut image)
        })?;

        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut output = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe { (self.fns.v1_1.get_image_memory_requirements2)(self.handle, &info, &mut output) };
        let requirements = output.memory_requirements;

        Ok((image, Self::memory_requirements(&requirements, &dedicated)))
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { (self.fns.v1_0.destroy_image)(self.handle, image, ptr::null()) };
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError> {
        check(unsafe { (self.fns.v1_0.bind_image_memory)(self.handle, image, memory, offset) })
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &MemoryDriverAllocateInfo,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let &MemoryDriverAllocateInfo {
            allocation_size,
            memory_type_index,
            export_handle_types,
            dedicated,
            import,
        } = allocate_info;

        let mut export_info =
            vk::ExportMemoryAllocateInfo::default().handle_types(export_handle_types.into());
        let mut dedicated_info = match dedicated {
            Some(DedicatedTarget::Buffer(buffer)) => {
                vk::MemoryDedicatedAllocateInfo::default().buffer(buffer)
            }
            Some(DedicatedTarget::Image(image)) => {
                vk::MemoryDedicatedAllocateInfo::default().image(image)
            }
            None => vk::MemoryDedicatedAllocateInfo::default(),
        };
        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::default();
        let mut import_win32_info = vk::ImportMemoryWin32HandleInfoKHR::default();
        let mut import_ahb_info = vk::ImportAndroidHardwareBufferInfoANDROID::default();

        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index);

        if !export_handle_types.is_empty() {
            info = info.push_next(&mut export_info);
        }

        if dedicated.is_some() {
            info = info.push_next(&mut dedicated_info);
        }

        if let Some((handle_type, raw)) = import {
            match handle_type.handle_kind() {
                HandleKind::Fd => {
                    import_fd_info = import_fd_info
                        .handle_type(handle_type.into())
                        .fd(raw as i32);
                    info = info.push_next(&mut import_fd_info);
                }
                HandleKind::Win32 | HandleKind::Win32Kmt => {
                    import_win32_info = import_win32_info
                        .handle_type(handle_type.into())
                        .handle(raw as vk::HANDLE);
                    info = info.push_next(&mut import_win32_info);
                }
                HandleKind::AndroidHardwareBuffer => {
                    import_ahb_info = import_ahb_info.buffer(raw as *mut vk::AHardwareBuffer);
                    info = info.push_next(&mut import_ahb_info);
                }
                HandleKind::None => return Err(VulkanError::InvalidExternalHandle),
            }
        }

        let mut output = vk::DeviceMemory::null();
        check(unsafe {
            (self.fns.v1_0.allocate_memory)(self.handle, &info, ptr::null(), &mut output)
        })?;

        Ok(output)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { (self.fns.v1_0.free_memory)(self.handle, memory, ptr::null()) };
    }

    unsafe fn export_memory(
        &self,
        memory: vk::DeviceMemory,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<isize, VulkanError> {
        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let info = vk::MemoryGetFdInfoKHR::default()
                    .memory(memory)
                    .handle_type(handle_type.into());
                let mut output = -1;
                check(unsafe {
                    (self.fns.khr_external_memory_fd.get_memory_fd_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let info = vk::MemoryGetWin32HandleInfoKHR::default()
                    .memory(memory)
                    .handle_type(handle_type.into());
                let mut output: vk::HANDLE = 0;
                check(unsafe {
                    (self.fns.khr_external_memory_win32.get_memory_win32_handle_khr)(
                        self.handle,
                        &info,
                        &mut output,
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::AndroidHardwareBuffer => {
                let info = vk::MemoryGetAndroidHardwareBufferInfoANDROID::default().memory(memory);
                let mut output = ptr::null_mut();
                check(unsafe {
                    (self
                        .fns
                        .android_external_memory_android_hardware_buffer
                        .get_memory_android_hardware_buffer_android)(
                        self.handle, &info, &mut output
                    )
                })?;

                Ok(output as isize)
            }
            HandleKind::None => Err(VulkanError::InvalidExternalHandle),
        }
    }

    unsafe fn imported_memory_properties(
        &self,
        handle_type: ExternalMemoryHandleType,
        raw: isize,
    ) -> Result<ImportedMemoryProperties, VulkanError> {
        match handle_type.handle_kind() {
            HandleKind::Fd => {
                let mut output = vk::MemoryFdPropertiesKHR::default();
                check(unsafe {
                    (self.fns.khr_external_memory_fd.get_memory_fd_properties_khr)(
                        self.handle,
                        handle_type.into(),
                        raw as i32,
                        &mut output,
                    )
                })?;

                Ok(ImportedMemoryProperties {
                    memory_type_bits: output.memory_type_bits,
                    allocation_size: None,
                })
            }
            HandleKind::Win32 | HandleKind::Win32Kmt => {
                let mut output = vk::MemoryWin32HandlePropertiesKHR::default();
                check(unsafe {
                    (self
                        .fns
                        .khr_external_memory_win32
                        .get_memory_win32_handle_properties_khr)(
                        self.handle,
                        handle_type.into(),
                        raw as vk::HANDLE,
                        &mut output,
                    )
                })?;

                Ok(ImportedMemoryProperties {
                    memory_type_bits: output.memory_type_bits,
                    allocation_size: None,
                })
            }
            HandleKind::AndroidHardwareBuffer => {
                let mut output = vk::AndroidHardwareBufferPropertiesANDROID::default();
                check(unsafe {
                    (self
                        .fns
                        .android_external_memory_android_hardware_buffer
                        .get_android_hardware_buffer_properties_android)(
                        self.handle,
                        raw as *const vk::AHardwareBuffer,
                        &mut output,
                    )
                })?;

                Ok(ImportedMemoryProperties {
                    memory_type_bits: output.memory_type_bits,
                    allocation_size: Some(output.allocation_size),
                })
            }
            HandleKind::None => Err(VulkanError::InvalidExternalHandle),
        }
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<*mut u8, VulkanError> {
        let mut output = ptr::null_mut();
        check(unsafe {
            (self.fns.v1_0.map_memory)(
                self.handle,
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
                &mut output,
            )
        })?;

        Ok(output.cast())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { (self.fns.v1_0.unmap_memory)(self.handle, memory) };
    }

    unsafe fn flush_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        check(unsafe { (self.fns.v1_0.flush_mapped_memory_ranges)(self.handle, 1, &range) })
    }

    unsafe fn invalidate_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        check(unsafe { (self.fns.v1_0.invalidate_mapped_memory_ranges)(self.handle, 1, &range) })
    }

    unsafe fn queue_submit(&self, submit_info: &SubmitInfo<'_>) -> Result<(), VulkanError> {
        let work = match submit_info.work {
            Some(work) => Some(unsafe { self.record_work(work) }?),
            None => None,
        };

        let wait_stages: SmallVec<[_; 4]> = submit_info
            .wait_semaphores
            .iter()
            .map(|_| vk::PipelineStageFlags::ALL_COMMANDS)
            .collect();
        let command_buffers: SmallVec<[_; 1]> =
            work.iter().map(|work| work.command_buffer).collect();
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submit_info.wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(submit_info.signal_semaphores);

        let result = unsafe {
            (self.fns.v1_0.queue_submit)(
                self.queue,
                1,
                &info,
                submit_info.fence.unwrap_or_default(),
            )
        };

        match (check(result), work) {
            (Ok(()), Some(work)) => {
                self.pending_work.lock().push(work);
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(err), work) => {
                if let Some(work) = work {
                    unsafe { self.free_work(work) };
                }

                Err(err)
            }
        }
    }

    unsafe fn queue_wait_idle(&self) -> Result<(), VulkanError> {
        check(unsafe { (self.fns.v1_0.queue_wait_idle)(self.queue) })?;

        for work in self.pending_work.lock().drain(..) {
            unsafe { self.free_work(work) };
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use crate::{
        device::DeviceExtensions,
        submit::{CommandSubmission, SyncPrimitive},
        sync::{ExternalSemaphoreHandleType, Permanence, Semaphore},
    };

    #[test]
    fn opaque_fd_semaphore_round_trip() {
        let handle_type = ExternalSemaphoreHandleType::OpaqueFd;
        let (device, queue) = vulkan_device!(DeviceExtensions::for_semaphore(handle_type));

        if Semaphore::check_support(&device, handle_type).is_err() {
            return;
        }

        let semaphore = Semaphore::new_exportable(device.clone(), handle_type).unwrap();
        let mut handle = semaphore.export(handle_type).unwrap();
        let imported =
            Semaphore::new_imported(device, handle_type, &mut handle, Permanence::Permanent)
                .unwrap();

        queue.submit_empty_signal(&semaphore).unwrap();
        imported
            .wait_signaled(&queue, &Default::default())
            .unwrap();
        queue.wait_idle().unwrap();
    }
}
