// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Provisioning of instances, devices and queues.
//!
//! Every scenario starts here: create an [`Instance`] on a [`Backend`], pick a
//! [`PhysicalDevice`], then create a [`Device`] with the extensions implied by the handle types
//! in play. The bundles are given by [`DeviceExtensions::for_semaphore`],
//! [`DeviceExtensions::for_fence`] and [`DeviceExtensions::for_memory`].
//!
//! ```no_run
//! use vkinterop::{
//!     device::{Backend, Device, DeviceCreateInfo, DeviceExtensions, Instance, InstanceCreateInfo},
//!     sync::ExternalSemaphoreHandleType,
//! };
//!
//! # fn main() -> Result<(), vkinterop::InteropError> {
//! let instance = Instance::new(Backend::Vulkan, InstanceCreateInfo::default())?;
//! let physical_device = instance.enumerate_physical_devices()?.next().unwrap();
//!
//! let (device, queue) = Device::new(
//!     physical_device,
//!     DeviceCreateInfo {
//!         enabled_extensions: DeviceExtensions::for_semaphore(
//!             ExternalSemaphoreHandleType::OpaqueFd,
//!         ),
//!         ..Default::default()
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

pub use self::extensions::{DeviceExtensions, InstanceExtensions, API_VERSION_1_1};
#[cfg(unix)]
use crate::driver::soft::{SoftDriverConfig, SoftInstance};
use crate::{
    cache::OnceCache,
    driver::{
        vulkan::VulkanInstance, DeviceDriver, DeviceDriverCreateInfo, ExternalBufferInfo,
        ExternalImageInfo, InstanceDriver, MemoryType, PhysicalDeviceProperties,
    },
    macros::impl_id_counter,
    memory::ExternalMemoryProperties,
    sync::{
        ExternalFenceHandleType, ExternalFenceProperties, ExternalSemaphoreHandleType,
        ExternalSemaphoreProperties,
    },
    InteropError, NonExhaustive, VulkanObject,
};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::{convert::Infallible, num::NonZero, ops::Deref, sync::Arc};

mod extensions;

/// The implementation of Vulkan an [`Instance`] runs on.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum Backend {
    /// The Vulkan implementation of the system, loaded at runtime.
    #[default]
    Vulkan,

    /// The in-process reference driver.
    #[cfg(unix)]
    Soft(SoftDriverConfig),
}

/// Parameters to create a new [`Instance`].
#[derive(Clone, Debug)]
pub struct InstanceCreateInfo {
    /// A string of your choice stating the name of your application.
    ///
    /// The default value is `None`.
    pub application_name: Option<String>,

    /// The extensions to enable on the instance. Extensions that are part of the core API of
    /// the instance are not requested from the driver.
    ///
    /// The default value is [`InstanceExtensions::for_external_handles`].
    pub enabled_extensions: InstanceExtensions,

    pub _ne: NonExhaustive,
}

impl Default for InstanceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            application_name: None,
            enabled_extensions: InstanceExtensions::for_external_handles(),
            _ne: NonExhaustive(()),
        }
    }
}

/// An instance of a Vulkan implementation.
#[derive(Debug)]
pub struct Instance {
    driver: Arc<dyn InstanceDriver>,
    id: NonZero<u64>,
}

impl Instance {
    /// Creates a new `Instance` on `backend`.
    ///
    /// A missing Vulkan library is reported as [`InteropError::LoadingFailed`].
    pub fn new(
        backend: Backend,
        create_info: InstanceCreateInfo,
    ) -> Result<Arc<Instance>, InteropError> {
        let InstanceCreateInfo {
            application_name,
            enabled_extensions,
            _ne: _,
        } = create_info;

        let driver: Arc<dyn InstanceDriver> = match backend {
            Backend::Vulkan => Arc::new(VulkanInstance::new(
                application_name.as_deref(),
                &enabled_extensions,
            )?),
            #[cfg(unix)]
            Backend::Soft(config) => Arc::new(SoftInstance::new(config, enabled_extensions)),
        };

        log::debug!(
            "created instance with API version {}.{}",
            vk::api_version_major(driver.api_version()),
            vk::api_version_minor(driver.api_version()),
        );

        Ok(Arc::new(Instance {
            driver,
            id: Self::next_id(),
        }))
    }

    #[inline]
    pub(crate) fn driver(&self) -> &dyn InstanceDriver {
        &*self.driver
    }

    /// Returns the Vulkan version supported by the instance.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.driver.api_version()
    }

    /// Returns the extensions that have been enabled on the instance.
    #[inline]
    pub fn enabled_extensions(&self) -> &InstanceExtensions {
        self.driver.enabled_extensions()
    }

    /// Returns the physical devices of the instance, in the order the driver reports them.
    pub fn enumerate_physical_devices(
        self: &Arc<Self>,
    ) -> Result<impl ExactSizeIterator<Item = Arc<PhysicalDevice>>, InteropError> {
        let handles = self.driver.enumerate_physical_devices()?;
        let instance = self.clone();

        Ok(handles.into_iter().map(move |handle| {
            // SAFETY: `handle` was just returned by the driver of `instance`.
            let properties = unsafe { instance.driver.physical_device_properties(handle) };

            Arc::new(PhysicalDevice {
                handle,
                instance: instance.clone(),
                properties,
                semaphore_properties: OnceCache::new(),
                fence_properties: OnceCache::new(),
                buffer_properties: OnceCache::new(),
                image_properties: OnceCache::new(),
            })
        }))
    }
}

impl_id_counter!(Instance);

/// A Vulkan implementation the instance can see, usually a GPU.
///
/// External handle properties are queried from the driver once and cached.
#[derive(Debug)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    instance: Arc<Instance>,
    properties: PhysicalDeviceProperties,

    semaphore_properties: OnceCache<ExternalSemaphoreHandleType, ExternalSemaphoreProperties>,
    fence_properties: OnceCache<ExternalFenceHandleType, ExternalFenceProperties>,
    buffer_properties: OnceCache<ExternalBufferInfo, ExternalMemoryProperties>,
    image_properties: OnceCache<ExternalImageInfo, Option<ExternalMemoryProperties>>,
}

impl PhysicalDevice {
    /// Returns the instance the physical device belongs to.
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    #[inline]
    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.properties
    }

    /// Returns the Vulkan version supported by the physical device.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.properties.api_version
    }

    /// Returns the device extensions the physical device supports.
    #[inline]
    pub fn supported_extensions(&self) -> &DeviceExtensions {
        &self.properties.supported_extensions
    }

    #[inline]
    pub fn memory_types(&self) -> &[MemoryType] {
        &self.properties.memory_types
    }

    /// Returns the first queue family whose queues support all of `required_flags`.
    pub fn choose_queue_family_index(&self, required_flags: vk::QueueFlags) -> Option<u32> {
        self.properties
            .queue_families
            .iter()
            .position(|family| {
                family.queue_count > 0 && family.queue_flags.contains(required_flags)
            })
            .map(|index| index as u32)
    }

    /// Retrieves the external handle properties supported for semaphores with a given
    /// configuration.
    ///
    /// The result of this function is cached, so that later calls are cheap.
    pub fn external_semaphore_properties(
        &self,
        handle_type: ExternalSemaphoreHandleType,
    ) -> ExternalSemaphoreProperties {
        self.semaphore_properties
            .get_or_try_insert(handle_type, |&handle_type| {
                // SAFETY: `self.handle` belongs to the driver of `self.instance`.
                Ok::<_, Infallible>(unsafe {
                    self.instance
                        .driver
                        .external_semaphore_properties(self.handle, handle_type)
                })
            })
            .unwrap_or_else(|err| match err {})
    }

    /// Retrieves the external handle properties supported for fences with a given
    /// configuration.
    ///
    /// The result of this function is cached, so that later calls are cheap.
    pub fn external_fence_properties(
        &self,
        handle_type: ExternalFenceHandleType,
    ) -> ExternalFenceProperties {
        self.fence_properties
            .get_or_try_insert(handle_type, |&handle_type| {
                // SAFETY: `self.handle` belongs to the driver of `self.instance`.
                Ok::<_, Infallible>(unsafe {
                    self.instance
                        .driver
                        .external_fence_properties(self.handle, handle_type)
                })
            })
            .unwrap_or_else(|err| match err {})
    }

    /// Retrieves the external memory properties supported for buffers with a given
    /// configuration.
    ///
    /// The result of this function is cached, so that later calls are cheap.
    pub fn external_buffer_properties(&self, info: ExternalBufferInfo) -> ExternalMemoryProperties {
        self.buffer_properties
            .get_or_try_insert(info, |info| {
                // SAFETY: `self.handle` belongs to the driver of `self.instance`.
                Ok::<_, Infallible>(unsafe {
                    self.instance
                        .driver
                        .external_buffer_properties(self.handle, info)
                })
            })
            .unwrap_or_else(|err| match err {})
    }

    /// Retrieves the external memory properties supported for 2D optimally tiled images with a
    /// given configuration. Returns `None` if such images cannot be created at all.
    ///
    /// The result of this function is cached, so that later calls are cheap.
    pub fn external_image_format_properties(
        &self,
        info: ExternalImageInfo,
    ) -> Result<Option<ExternalMemoryProperties>, InteropError> {
        self.image_properties
            .get_or_try_insert(info, |info| {
                // SAFETY: `self.handle` belongs to the driver of `self.instance`.
                unsafe {
                    self.instance
                        .driver
                        .external_image_format_properties(self.handle, info)
                }
            })
            .map_err(InteropError::from)
    }
}

unsafe impl VulkanObject for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

/// Parameters to create a new [`Device`].
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The extensions to enable on the device.
    ///
    /// Extensions that are core in the API version of the device are accepted and treated as
    /// enabled without being requested from the driver.
    ///
    /// The default value is [`DeviceExtensions::empty()`].
    pub enabled_extensions: DeviceExtensions,

    /// The queue family to create the single queue of the device from.
    ///
    /// The default value is `0`.
    pub queue_family_index: u32,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            enabled_extensions: DeviceExtensions::empty(),
            queue_family_index: 0,
            _ne: NonExhaustive(()),
        }
    }
}

/// Represents a Vulkan context with one queue.
#[derive(Debug)]
pub struct Device {
    driver: Arc<dyn DeviceDriver>,
    physical_device: Arc<PhysicalDevice>,
    id: NonZero<u64>,

    api_version: u32,
    enabled_extensions: DeviceExtensions,
    queue_family_index: u32,
}

impl Device {
    /// Creates a new `Device` and its queue.
    ///
    /// Fails with [`InteropError::ExtensionNotPresent`] if the physical device does not support
    /// one of `create_info.enabled_extensions`.
    pub fn new(
        physical_device: Arc<PhysicalDevice>,
        create_info: DeviceCreateInfo,
    ) -> Result<(Arc<Device>, Arc<Queue>), InteropError> {
        let DeviceCreateInfo {
            enabled_extensions,
            queue_family_index,
            _ne: _,
        } = create_info;

        let queue_families = &physical_device.properties.queue_families;

        if queue_family_index as usize >= queue_families.len() {
            return Err(InteropError::validation(
                "Device::new",
                format!(
                    "queue_family_index is {} but the physical device only has {} queue families",
                    queue_family_index,
                    queue_families.len(),
                ),
            ));
        }

        let api_version = physical_device
            .api_version()
            .min(physical_device.instance.api_version());
        let requested = enabled_extensions.without_core(api_version);

        if let Some(extension) = requested
            .difference(physical_device.supported_extensions())
            .first_set()
        {
            return Err(InteropError::ExtensionNotPresent { extension });
        }

        // SAFETY: `physical_device.handle` belongs to the driver of its instance.
        let driver = unsafe {
            physical_device.instance.driver.create_device(
                physical_device.handle,
                &DeviceDriverCreateInfo {
                    queue_family_index,
                    enabled_extensions: requested,
                },
            )
        }?;

        log::debug!(
            "created device on {} with extensions {:?}",
            physical_device.properties.device_name,
            requested.names(),
        );

        let device = Arc::new(Device {
            driver,
            physical_device,
            id: Self::next_id(),
            api_version,
            enabled_extensions,
            queue_family_index,
        });

        let queue = Arc::new(Queue {
            handle: device.driver.queue(),
            device: device.clone(),
            queue_family_index,
            state: Mutex::new(QueueState::default()),
        });

        Ok((device, queue))
    }

    #[inline]
    pub(crate) fn driver(&self) -> &dyn DeviceDriver {
        &*self.driver
    }

    /// Returns the physical device that was used to create this device.
    #[inline]
    pub fn physical_device(&self) -> &Arc<PhysicalDevice> {
        &self.physical_device
    }

    /// Returns the instance used to create this device.
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        self.physical_device.instance()
    }

    /// Returns the Vulkan version supported by the device, the lower of the instance and
    /// physical device versions.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Returns the extensions that have been enabled on the device.
    #[inline]
    pub fn enabled_extensions(&self) -> &DeviceExtensions {
        &self.enabled_extensions
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Returns an error naming the first extension of `required` that is not enabled, ignoring
    /// extensions that are core in the device API version.
    pub(crate) fn check_extensions(&self, required: &DeviceExtensions) -> Result<(), InteropError> {
        match required
            .without_core(self.api_version)
            .difference(&self.enabled_extensions)
            .first_set()
        {
            Some(extension) => Err(InteropError::ExtensionNotPresent { extension }),
            None => Ok(()),
        }
    }

    /// Waits until all work on the device has finished.
    pub fn wait_idle(&self) -> Result<(), InteropError> {
        // SAFETY: the device has a single queue, owned by the driver.
        unsafe { self.driver.queue_wait_idle() }?;

        Ok(())
    }
}

impl_id_counter!(Device);

/// Implemented on objects that belong to a Vulkan device.
///
/// # Safety
///
/// - `device()` must return the correct device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

unsafe impl<T> DeviceOwned for T
where
    T: Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}

/// The queue of a [`Device`].
#[derive(Debug)]
pub struct Queue {
    handle: vk::Queue,
    device: Arc<Device>,
    queue_family_index: u32,
    state: Mutex<QueueState>,
}

impl Queue {
    /// Returns the index of the queue family the queue belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Locks the queue for the duration of a submission.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }
}

unsafe impl VulkanObject for Queue {
    type Handle = vk::Queue;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Queue {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) submission_count: u64,
}

#[cfg(all(test, unix))]
mod tests {
    use super::{Device, DeviceCreateInfo, DeviceExtensions};
    use crate::{
        sync::{ExternalFenceHandleType, ExternalSemaphoreHandleType},
        InteropError,
    };
    use ash::vk;

    #[test]
    fn missing_extension_is_reported() {
        let physical_device = soft_physical_device!();

        match Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: DeviceExtensions::for_semaphore(
                    ExternalSemaphoreHandleType::OpaqueWin32,
                ),
                ..Default::default()
            },
        ) {
            Err(InteropError::ExtensionNotPresent { extension }) => {
                assert_eq!(extension, "khr_external_semaphore_win32");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn invalid_queue_family() {
        let physical_device = soft_physical_device!();

        assert!(matches!(
            Device::new(
                physical_device,
                DeviceCreateInfo {
                    queue_family_index: 42,
                    ..Default::default()
                },
            ),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn core_extensions_count_as_enabled() {
        let (device, queue) = soft_device!(DeviceExtensions::for_fence(
            ExternalFenceHandleType::OpaqueFd
        ));

        assert_eq!(queue.queue_family_index(), device.queue_family_index());
        assert!(device
            .check_extensions(&DeviceExtensions {
                khr_external_fence: true,
                ..DeviceExtensions::empty()
            })
            .is_ok());
        assert!(matches!(
            device.check_extensions(&DeviceExtensions::for_semaphore(
                ExternalSemaphoreHandleType::SyncFd
            )),
            Err(InteropError::ExtensionNotPresent { .. }),
        ));
    }

    #[test]
    fn queue_family_selection() {
        let physical_device = soft_physical_device!();

        assert_eq!(
            physical_device.choose_queue_family_index(vk::QueueFlags::empty()),
            Some(0),
        );
        assert_eq!(
            physical_device.choose_queue_family_index(vk::QueueFlags::SPARSE_BINDING),
            None,
        );
    }

    #[test]
    fn capability_answers_are_cached() {
        let physical_device = soft_physical_device!();

        let first =
            physical_device.external_semaphore_properties(ExternalSemaphoreHandleType::SyncFd);
        let second =
            physical_device.external_semaphore_properties(ExternalSemaphoreHandleType::SyncFd);

        assert_eq!(first, second);
        assert_eq!(physical_device.semaphore_properties.len(), 1);
    }
}
