// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An in-process driver that shares payloads through real file descriptors.
//!
//! Every exported handle is one end of a fresh `socketpair`. The driver remembers which payload
//! each socket stands for, keyed by the identity of the open file description, so that any
//! duplicate of the descriptor (through `dup`, `dup2`, `dup3` or `SCM_RIGHTS`) imports the same
//! payload. The other end of the pair is kept to find out when every copy of the exported
//! descriptor has been closed.
//!
//! Payload semantics follow Vulkan:
//!
//! - Opaque fd exports alias the payload. Sync fd exports snapshot it, and act as a wait
//!   (semaphores) or a reset (fences) on the exporter.
//! - A wait consumes the signal of a semaphore, and undoes a temporary import. A fence reset
//!   undoes a temporary import and then unsignals the permanent payload.
//! - Submissions with work leave their signal operations pending until the queue is waited on,
//!   or a fence wait needs them.
//! - Host-visible memory is not coherent: a mapping works on a private copy that reaches the
//!   allocation on flush, and is refreshed from it on invalidate.

use super::{
    BufferDriverCreateInfo, DedicatedTarget, DeviceDriver, DeviceDriverCreateInfo,
    ExternalBufferInfo, ExternalImageInfo, ImageDriverCreateInfo, ImportedMemoryProperties,
    InstanceDriver, MemoryDriverAllocateInfo, MemoryType, PhysicalDeviceProperties,
    QueueFamilyProperties, SubmitInfo,
};
use crate::{
    device::{DeviceExtensions, InstanceExtensions, API_VERSION_1_1},
    memory::{
        ExternalMemoryHandleType, ExternalMemoryHandleTypes, ExternalMemoryProperties,
        MemoryPropertyFlags, MemoryRequirements,
    },
    os::{self, DescriptorIdentity},
    sync::{
        ExternalFenceHandleType, ExternalFenceHandleTypes, ExternalFenceProperties,
        ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes, ExternalSemaphoreProperties,
        Permanence, Transference,
    },
    VulkanError,
};
use ash::vk::{self, Handle};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    io,
    os::unix::{
        io::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
        net::UnixStream,
    },
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

const RESOURCE_ALIGNMENT: u64 = 256;
const NON_COHERENT_ATOM_SIZE: u64 = 64;
const DEVICE_LOCAL_TYPE: u32 = 0;
const HOST_VISIBLE_TYPE: u32 = 1;
const MEMORY_TYPE_BITS: u32 = (1 << DEVICE_LOCAL_TYPE) | (1 << HOST_VISIBLE_TYPE);

/// What the soft driver supports.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SoftDriverConfig {
    /// The handle types semaphores can be exported and imported as. Only file descriptor handle
    /// types are implemented; others are ignored.
    ///
    /// The default value is [`ExternalSemaphoreHandleTypes::OPAQUE_FD`] |
    /// [`ExternalSemaphoreHandleTypes::SYNC_FD`].
    pub semaphore_handle_types: ExternalSemaphoreHandleTypes,

    /// The handle types fences can be exported and imported as.
    ///
    /// The default value is [`ExternalFenceHandleTypes::OPAQUE_FD`] |
    /// [`ExternalFenceHandleTypes::SYNC_FD`].
    pub fence_handle_types: ExternalFenceHandleTypes,

    /// The handle types memory can be exported and imported as.
    ///
    /// The default value is [`ExternalMemoryHandleTypes::OPAQUE_FD`] |
    /// [`ExternalMemoryHandleTypes::DMA_BUF`].
    pub memory_handle_types: ExternalMemoryHandleTypes,

    /// The memory handle types that can only be used with dedicated allocations.
    ///
    /// The default value is [`ExternalMemoryHandleTypes::empty()`].
    pub dedicated_only_memory_handle_types: ExternalMemoryHandleTypes,

    /// Whether sync fd exports of a payload that is already signaled return `-1` instead of a
    /// descriptor.
    ///
    /// The default value is `false`.
    pub sync_fd_signaled_sentinel: bool,
}

impl Default for SoftDriverConfig {
    #[inline]
    fn default() -> Self {
        Self {
            semaphore_handle_types: ExternalSemaphoreHandleTypes::OPAQUE_FD
                | ExternalSemaphoreHandleTypes::SYNC_FD,
            fence_handle_types: ExternalFenceHandleTypes::OPAQUE_FD
                | ExternalFenceHandleTypes::SYNC_FD,
            memory_handle_types: ExternalMemoryHandleTypes::OPAQUE_FD
                | ExternalMemoryHandleTypes::DMA_BUF,
            dedicated_only_memory_handle_types: ExternalMemoryHandleTypes::empty(),
            sync_fd_signaled_sentinel: false,
        }
    }
}

impl SoftDriverConfig {
    fn semaphore_types(&self) -> ExternalSemaphoreHandleTypes {
        self.semaphore_handle_types
            & (ExternalSemaphoreHandleTypes::OPAQUE_FD | ExternalSemaphoreHandleTypes::SYNC_FD)
    }

    fn fence_types(&self) -> ExternalFenceHandleTypes {
        self.fence_handle_types
            & (ExternalFenceHandleTypes::OPAQUE_FD | ExternalFenceHandleTypes::SYNC_FD)
    }

    fn memory_types(&self) -> ExternalMemoryHandleTypes {
        self.memory_handle_types
            & (ExternalMemoryHandleTypes::OPAQUE_FD | ExternalMemoryHandleTypes::DMA_BUF)
    }

    fn memory_properties(&self, handle_type: ExternalMemoryHandleType) -> ExternalMemoryProperties {
        if !self.memory_types().contains_enum(handle_type) {
            return ExternalMemoryProperties::default();
        }

        ExternalMemoryProperties {
            dedicated_only: self
                .dedicated_only_memory_handle_types
                .contains_enum(handle_type),
            exportable: true,
            importable: true,
            export_from_imported_handle_types: self.memory_types(),
            compatible_handle_types: self.memory_types(),
        }
    }
}

/// An instance of the soft driver. It has exactly one physical device.
#[derive(Debug)]
pub struct SoftInstance {
    config: SoftDriverConfig,
    enabled_extensions: InstanceExtensions,
}

impl SoftInstance {
    #[inline]
    pub fn new(config: SoftDriverConfig, enabled_extensions: InstanceExtensions) -> Self {
        SoftInstance {
            config,
            enabled_extensions,
        }
    }
}

impl InstanceDriver for SoftInstance {
    #[inline]
    fn api_version(&self) -> u32 {
        API_VERSION_1_1
    }

    #[inline]
    fn enabled_extensions(&self) -> &InstanceExtensions {
        &self.enabled_extensions
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, VulkanError> {
        Ok(vec![vk::PhysicalDevice::from_raw(1)])
    }

    unsafe fn physical_device_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceProperties {
        let supported_extensions = self
            .config
            .semaphore_types()
            .iter()
            .map(DeviceExtensions::for_semaphore)
            .chain(self.config.fence_types().iter().map(DeviceExtensions::for_fence))
            .chain(self.config.memory_types().iter().map(DeviceExtensions::for_memory))
            .fold(DeviceExtensions::empty(), |acc, extensions| {
                acc.union(&extensions)
            });

        PhysicalDeviceProperties {
            device_name: "Soft interop device".to_owned(),
            api_version: API_VERSION_1_1,
            supported_extensions,
            queue_families: vec![QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 1,
            }],
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            non_coherent_atom_size: NON_COHERENT_ATOM_SIZE,
        }
    }

    unsafe fn external_semaphore_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        handle_type: ExternalSemaphoreHandleType,
    ) -> ExternalSemaphoreProperties {
        let supported = self.config.semaphore_types();

        if !supported.contains_enum(handle_type) {
            return ExternalSemaphoreProperties::default();
        }

        ExternalSemaphoreProperties {
            exportable: true,
            importable: true,
            export_from_imported_handle_types: supported,
            compatible_handle_types: supported,
        }
    }

    unsafe fn external_fence_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        handle_type: ExternalFenceHandleType,
    ) -> ExternalFenceProperties {
        let supported = self.config.fence_types();

        if !supported.contains_enum(handle_type) {
            return ExternalFenceProperties::default();
        }

        ExternalFenceProperties {
            exportable: true,
            importable: true,
            export_from_imported_handle_types: supported,
            compatible_handle_types: supported,
        }
    }

    unsafe fn external_buffer_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        info: &ExternalBufferInfo,
    ) -> ExternalMemoryProperties {
        self.config.memory_properties(info.handle_type)
    }

    unsafe fn external_image_format_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        info: &ExternalImageInfo,
    ) -> Result<Option<ExternalMemoryProperties>, VulkanError> {
        if !self.config.memory_types().contains_enum(info.handle_type) {
            return Ok(None);
        }

        Ok(Some(self.config.memory_properties(info.handle_type)))
    }

    unsafe fn create_device(
        &self,
        _physical_device: vk::PhysicalDevice,
        create_info: &DeviceDriverCreateInfo,
    ) -> Result<Arc<dyn DeviceDriver>, VulkanError> {
        if create_info.queue_family_index != 0 {
            return Err(VulkanError::InitializationFailed);
        }

        Ok(Arc::new(SoftDevice::new(self.config.clone())))
    }
}

/// GPU work whose completion is observed lazily.
#[derive(Debug, Default)]
struct SoftWork {
    done: AtomicBool,
}

impl SoftWork {
    #[inline]
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    #[inline]
    fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }
}

#[derive(Clone, Debug)]
enum PayloadState {
    Unsignaled,
    Signaled,
    Pending(Arc<SoftWork>),
}

impl PayloadState {
    fn is_signaled(&self) -> bool {
        match self {
            PayloadState::Unsignaled => false,
            PayloadState::Signaled => true,
            PayloadState::Pending(work) => work.is_done(),
        }
    }
}

/// The payload of a semaphore or fence, shared by every object that references it.
#[derive(Debug)]
struct SoftPayload {
    state: Mutex<PayloadState>,
}

impl SoftPayload {
    fn new(state: PayloadState) -> Arc<Self> {
        Arc::new(SoftPayload {
            state: Mutex::new(state),
        })
    }
}

#[derive(Debug)]
struct SoftSyncObject<T> {
    permanent: Arc<SoftPayload>,
    temporary: Option<Arc<SoftPayload>>,
    export_types: T,
}

impl<T> SoftSyncObject<T> {
    fn new(state: PayloadState, export_types: T) -> Self {
        SoftSyncObject {
            permanent: SoftPayload::new(state),
            temporary: None,
            export_types,
        }
    }

    #[inline]
    fn current(&self) -> &Arc<SoftPayload> {
        self.temporary.as_ref().unwrap_or(&self.permanent)
    }

    /// A semaphore wait: the current payload loses its signal, then a temporary import is
    /// undone.
    fn consume(&mut self) {
        *self.current().state.lock() = PayloadState::Unsignaled;
        self.temporary = None;
    }

    /// A fence reset: a temporary import is undone, then the permanent payload is unsignaled.
    fn reset(&mut self) {
        self.temporary = None;
        *self.permanent.state.lock() = PayloadState::Unsignaled;
    }

    fn install(&mut self, payload: Arc<SoftPayload>, permanence: Permanence) {
        match permanence {
            Permanence::Permanent => {
                self.permanent = payload;
                self.temporary = None;
            }
            Permanence::Temporary => self.temporary = Some(payload),
        }
    }
}

/// The contents of an allocation, shared by every memory object that imported it.
#[derive(Debug)]
struct SoftBlock {
    bytes: Mutex<Box<[u8]>>,
}

#[derive(Debug)]
struct SoftMemory {
    block: Arc<SoftBlock>,
    size: usize,
    memory_type_index: u32,
    export_types: ExternalMemoryHandleTypes,
    staging: Option<Box<[u8]>>,
}

#[derive(Debug)]
struct SoftResource {
    requirements: MemoryRequirements,
    bound: Option<vk::DeviceMemory>,
}

#[derive(Debug, Default)]
struct SoftObjects {
    semaphores: HashMap<u64, SoftSyncObject<ExternalSemaphoreHandleTypes>>,
    fences: HashMap<u64, SoftSyncObject<ExternalFenceHandleTypes>>,
    buffers: HashMap<u64, SoftResource>,
    images: HashMap<u64, SoftResource>,
    memories: HashMap<u64, SoftMemory>,
}

#[derive(Debug, Default)]
struct SoftQueue {
    pending: Vec<Arc<SoftWork>>,
}

impl SoftQueue {
    /// Completes `work` and everything submitted before it.
    fn complete_until(&mut self, work: &Arc<SoftWork>) {
        let Some(position) = self.pending.iter().position(|w| Arc::ptr_eq(w, work)) else {
            // Submitted to another queue, or already retired.
            work.complete();
            return;
        };

        for work in self.pending.drain(..=position) {
            work.complete();
        }
    }

    fn complete_all(&mut self) {
        for work in self.pending.drain(..) {
            work.complete();
        }
    }
}

/// A device of the soft driver.
#[derive(Debug)]
pub struct SoftDevice {
    config: SoftDriverConfig,
    next_handle: AtomicU64,
    queue: Mutex<SoftQueue>,
    objects: Mutex<SoftObjects>,
}

impl SoftDevice {
    fn new(config: SoftDriverConfig) -> Self {
        SoftDevice {
            config,
            next_handle: AtomicU64::new(1),
            queue: Mutex::new(SoftQueue::default()),
            objects: Mutex::new(SoftObjects::default()),
        }
    }

    #[inline]
    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the state `work` leaves signal operations in.
    fn signal_state(work: Option<&Arc<SoftWork>>) -> PayloadState {
        match work {
            Some(work) if !work.is_done() => PayloadState::Pending(work.clone()),
            _ => PayloadState::Signaled,
        }
    }

    fn export_sync<T>(
        &self,
        object: &SoftSyncObject<T>,
        transference: Transference,
        make_export: impl FnOnce(Arc<SoftPayload>) -> ExportedPayload,
    ) -> Result<isize, VulkanError> {
        match transference {
            Transference::Reference => register_export(make_export(object.current().clone())),
            Transference::Copy => {
                let snapshot = object.current().state.lock().clone();

                if self.config.sync_fd_signaled_sentinel && snapshot.is_signaled() {
                    return Ok(-1);
                }

                register_export(make_export(SoftPayload::new(snapshot)))
            }
        }
    }

    /// Resolves the payload a sync object import refers to. Consumes `raw` on success.
    fn import_sync(
        transference: Transference,
        raw: isize,
        resolve: impl FnOnce(ExportedPayload) -> Option<Arc<SoftPayload>>,
    ) -> Result<Arc<SoftPayload>, VulkanError> {
        if raw == -1 {
            return match transference {
                Transference::Copy => Ok(SoftPayload::new(PayloadState::Signaled)),
                Transference::Reference => Err(VulkanError::InvalidExternalHandle),
            };
        }

        let exported = lookup_export(raw)?;
        let payload = resolve(exported).ok_or(VulkanError::InvalidExternalHandle)?;

        let payload = match transference {
            Transference::Reference => payload,
            Transference::Copy => SoftPayload::new(payload.state.lock().clone()),
        };

        close_imported(raw);

        Ok(payload)
    }
}

impl DeviceDriver for SoftDevice {
    #[inline]
    fn queue(&self) -> vk::Queue {
        vk::Queue::from_raw(1)
    }

    unsafe fn create_semaphore(
        &self,
        export_handle_types: ExternalSemaphoreHandleTypes,
    ) -> Result<vk::Semaphore, VulkanError> {
        let raw = self.next_handle();
        self.objects.lock().semaphores.insert(
            raw,
            SoftSyncObject::new(PayloadState::Unsignaled, export_handle_types),
        );

        Ok(vk::Semaphore::from_raw(raw))
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.objects.lock().semaphores.remove(&semaphore.as_raw());
    }

    unsafe fn export_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
    ) -> Result<isize, VulkanError> {
        let mut objects = self.objects.lock();
        let object = objects
            .semaphores
            .get_mut(&semaphore.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        if !object.export_types.contains_enum(handle_type) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let transference = handle_type.transference();
        let raw = self.export_sync(object, transference, |payload| {
            ExportedPayload::Semaphore(handle_type, payload)
        })?;

        if transference == Transference::Copy {
            object.consume();
        }

        log::trace!("soft: exported semaphore {:?} as {} ({:?})", semaphore, raw, handle_type);

        Ok(raw)
    }

    unsafe fn import_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalSemaphoreHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError> {
        if !self.config.semaphore_types().contains_enum(handle_type) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let mut objects = self.objects.lock();
        let object = objects
            .semaphores
            .get_mut(&semaphore.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        let payload = Self::import_sync(handle_type.transference(), raw, |exported| {
            match exported {
                ExportedPayload::Semaphore(ty, payload) if ty == handle_type => Some(payload),
                _ => None,
            }
        })?;
        object.install(payload, permanence);

        log::trace!("soft: imported {} into semaphore {:?} ({:?})", raw, semaphore, permanence);

        Ok(())
    }

    unsafe fn create_fence(
        &self,
        signaled: bool,
        export_handle_types: ExternalFenceHandleTypes,
    ) -> Result<vk::Fence, VulkanError> {
        let raw = self.next_handle();
        let state = if signaled {
            PayloadState::Signaled
        } else {
            PayloadState::Unsignaled
        };
        self.objects.lock().fences.insert(
            raw,
            SoftSyncObject::new(state, export_handle_types),
        );

        Ok(vk::Fence::from_raw(raw))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.objects.lock().fences.remove(&fence.as_raw());
    }

    unsafe fn export_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
    ) -> Result<isize, VulkanError> {
        let mut objects = self.objects.lock();
        let object = objects
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        if !object.export_types.contains_enum(handle_type) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let transference = handle_type.transference();
        let raw = self.export_sync(object, transference, |payload| {
            ExportedPayload::Fence(handle_type, payload)
        })?;

        if transference == Transference::Copy {
            object.reset();
        }

        log::trace!("soft: exported fence {:?} as {} ({:?})", fence, raw, handle_type);

        Ok(raw)
    }

    unsafe fn import_fence(
        &self,
        fence: vk::Fence,
        handle_type: ExternalFenceHandleType,
        raw: isize,
        permanence: Permanence,
    ) -> Result<(), VulkanError> {
        if !self.config.fence_types().contains_enum(handle_type) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let mut objects = self.objects.lock();
        let object = objects
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        let payload = Self::import_sync(handle_type.transference(), raw, |exported| {
            match exported {
                ExportedPayload::Fence(ty, payload) if ty == handle_type => Some(payload),
                _ => None,
            }
        })?;
        object.install(payload, permanence);

        log::trace!("soft: imported {} into fence {:?} ({:?})", raw, fence, permanence);

        Ok(())
    }

    unsafe fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<bool, VulkanError> {
        let mut queue = self.queue.lock();
        let state = {
            let objects = self.objects.lock();
            let object = objects
                .fences
                .get(&fence.as_raw())
                .ok_or(VulkanError::InitializationFailed)?;
            let state = object.current().state.lock().clone();
            state
        };

        match state {
            PayloadState::Signaled => Ok(true),
            PayloadState::Pending(work) if work.is_done() => Ok(true),
            PayloadState::Pending(_) if timeout_ns == 0 => Ok(false),
            PayloadState::Pending(work) => {
                queue.complete_until(&work);
                Ok(true)
            }
            PayloadState::Unsignaled => {
                if timeout_ns != 0 {
                    log::warn!(
                        "soft: waiting for fence {:?}, which nothing is going to signal",
                        fence,
                    );
                }

                Ok(false)
            }
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        let mut objects = self.objects.lock();
        let object = objects
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;
        object.reset();

        Ok(())
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError> {
        let objects = self.objects.lock();
        let object = objects
            .fences
            .get(&fence.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;
        let signaled = object.current().state.lock().is_signaled();

        Ok(signaled)
    }

    unsafe fn create_buffer(
        &self,
        create_info: &BufferDriverCreateInfo,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError> {
        let requirements =
            self.requirements(create_info.size, create_info.external_memory_handle_types);
        let raw = self.next_handle();
        self.objects.lock().buffers.insert(
            raw,
            SoftResource {
                requirements,
                bound: None,
            },
        );

        Ok((vk::Buffer::from_raw(raw), requirements))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.objects.lock().buffers.remove(&buffer.as_raw());
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError> {
        let mut objects = self.objects.lock();
        let SoftObjects {
            buffers, memories, ..
        } = &mut *objects;

        bind(buffers.get_mut(&buffer.as_raw()), memories, memory, offset)
    }

    unsafe fn create_image(
        &self,
        create_info: &ImageDriverCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError> {
        let [width, height] = create_info.extent;
        let size = (width as u64)
            .checked_mul(height as u64)
            .and_then(|texels| texels.checked_mul(create_info.format.block_size()))
            .ok_or(VulkanError::OutOfDeviceMemory)?;
        let requirements = self.requirements(size, create_info.external_memory_handle_types);
        let raw = self.next_handle();
        self.objects.lock().images.insert(
            raw,
            SoftResource {
                requirements,
                bound: None,
            },
        );

        Ok((vk::Image::from_raw(raw), requirements))
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.objects.lock().images.remove(&image.as_raw());
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), VulkanError> {
        let mut objects = self.objects.lock();
        let SoftObjects {
            images, memories, ..
        } = &mut *objects;

        bind(images.get_mut(&image.as_raw()), memories, memory, offset)
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

        if memory_type_index > HOST_VISIBLE_TYPE {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let size = usize::try_from(allocation_size).map_err(|_| VulkanError::OutOfDeviceMemory)?;

        if !self.config.memory_types().contains(export_handle_types) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let handle_types = export_handle_types
            | import.map_or(ExternalMemoryHandleTypes::empty(), |(handle_type, _)| {
                handle_type.into()
            });

        if dedicated.is_none()
            && self
                .config
                .dedicated_only_memory_handle_types
                .intersects(handle_types)
        {
            log::warn!(
                "soft: {:?} memory must be a dedicated allocation",
                handle_types & self.config.dedicated_only_memory_handle_types,
            );
            return Err(VulkanError::FeatureNotPresent);
        }

        let block = match import {
            Some((handle_type, raw)) => {
                if !self.config.memory_types().contains_enum(handle_type) {
                    return Err(VulkanError::InvalidExternalHandle);
                }

                let block = match lookup_export(raw)? {
                    ExportedPayload::Memory(ty, block) if ty == handle_type => block,
                    _ => return Err(VulkanError::InvalidExternalHandle),
                };

                if block.bytes.lock().len() < size {
                    log::warn!(
                        "soft: importing {} bytes from an allocation of {} bytes",
                        size,
                        block.bytes.lock().len(),
                    );
                    return Err(VulkanError::InvalidExternalHandle);
                }

                close_imported(raw);

                block
            }
            None => Arc::new(SoftBlock {
                bytes: Mutex::new(vec![0; size].into_boxed_slice()),
            }),
        };

        let raw = self.next_handle();
        self.objects.lock().memories.insert(
            raw,
            SoftMemory {
                block,
                size,
                memory_type_index,
                export_types: export_handle_types,
                staging: None,
            },
        );

        log::trace!(
            "soft: allocated memory {} of {} bytes (type {}, dedicated to {:?}, imported {:?})",
            raw,
            size,
            memory_type_index,
            dedicated.map(|target| match target {
                DedicatedTarget::Buffer(buffer) => buffer.as_raw(),
                DedicatedTarget::Image(image) => image.as_raw(),
            }),
            import,
        );

        Ok(vk::DeviceMemory::from_raw(raw))
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.objects.lock().memories.remove(&memory.as_raw());
    }

    unsafe fn export_memory(
        &self,
        memory: vk::DeviceMemory,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<isize, VulkanError> {
        let objects = self.objects.lock();
        let memory_object = objects
            .memories
            .get(&memory.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        if !memory_object.export_types.contains_enum(handle_type) {
            return Err(VulkanError::InvalidExternalHandle);
        }

        let raw = register_export(ExportedPayload::Memory(
            handle_type,
            memory_object.block.clone(),
        ))?;

        log::trace!("soft: exported memory {:?} as {} ({:?})", memory, raw, handle_type);

        Ok(raw)
    }

    unsafe fn imported_memory_properties(
        &self,
        handle_type: ExternalMemoryHandleType,
        raw: isize,
    ) -> Result<ImportedMemoryProperties, VulkanError> {
        if handle_type != ExternalMemoryHandleType::DmaBuf
            || !self.config.memory_types().contains_enum(handle_type)
        {
            return Err(VulkanError::InvalidExternalHandle);
        }

        match lookup_export(raw)? {
            ExportedPayload::Memory(ExternalMemoryHandleType::DmaBuf, _) => {
                Ok(ImportedMemoryProperties {
                    memory_type_bits: MEMORY_TYPE_BITS,
                    allocation_size: None,
                })
            }
            _ => Err(VulkanError::InvalidExternalHandle),
        }
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<*mut u8, VulkanError> {
        let mut objects = self.objects.lock();
        let memory_object = objects
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;

        if memory_object.memory_type_index != HOST_VISIBLE_TYPE || memory_object.staging.is_some()
        {
            return Err(VulkanError::MemoryMapFailed);
        }

        let staging = memory_object.block.bytes.lock()[..memory_object.size]
            .to_vec()
            .into_boxed_slice();
        let staging = memory_object.staging.insert(staging);

        Ok(staging.as_mut_ptr())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(memory_object) = self.objects.lock().memories.get_mut(&memory.as_raw()) {
            memory_object.staging = None;
        }
    }

    unsafe fn flush_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError> {
        let objects = self.objects.lock();
        let memory_object = objects
            .memories
            .get(&memory.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;
        let staging = memory_object
            .staging
            .as_ref()
            .ok_or(VulkanError::MemoryMapFailed)?;

        memory_object.block.bytes.lock()[..staging.len()].copy_from_slice(staging);

        Ok(())
    }

    unsafe fn invalidate_memory(&self, memory: vk::DeviceMemory) -> Result<(), VulkanError> {
        let mut objects = self.objects.lock();
        let memory_object = objects
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(VulkanError::InitializationFailed)?;
        let block = memory_object.block.clone();
        let staging = memory_object
            .staging
            .as_mut()
            .ok_or(VulkanError::MemoryMapFailed)?;

        let len = staging.len();
        staging.copy_from_slice(&block.bytes.lock()[..len]);

        Ok(())
    }

    unsafe fn queue_submit(&self, submit_info: &SubmitInfo<'_>) -> Result<(), VulkanError> {
        let mut queue = self.queue.lock();
        queue.pending.retain(|work| !work.is_done());

        let mut objects = self.objects.lock();
        let mut waited_on = None;

        // Nothing is consumed unless every wait can be satisfied.
        for semaphore in submit_info.wait_semaphores {
            let object = objects
                .semaphores
                .get(&semaphore.as_raw())
                .ok_or(VulkanError::InitializationFailed)?;

            match &*object.current().state.lock() {
                PayloadState::Unsignaled => {
                    log::warn!(
                        "soft: semaphore {:?} is waited on but has no signal to wait for",
                        semaphore,
                    );

                    return Err(VulkanError::DeviceLost);
                }
                PayloadState::Pending(work) if !work.is_done() => {
                    waited_on = Some(work.clone());
                }
                _ => (),
            }
        }

        for semaphore in submit_info.wait_semaphores {
            if let Some(object) = objects.semaphores.get_mut(&semaphore.as_raw()) {
                object.consume();
            }
        }

        let work = match submit_info.work {
            Some(_) => {
                let work = Arc::new(SoftWork::default());
                queue.pending.push(work.clone());
                Some(work)
            }
            None => queue.pending.last().cloned().or(waited_on),
        };
        let signal_state = Self::signal_state(work.as_ref());

        for semaphore in submit_info.signal_semaphores {
            let object = objects
                .semaphores
                .get(&semaphore.as_raw())
                .ok_or(VulkanError::InitializationFailed)?;
            *object.current().state.lock() = signal_state.clone();
        }

        if let Some(fence) = submit_info.fence {
            let object = objects
                .fences
                .get(&fence.as_raw())
                .ok_or(VulkanError::InitializationFailed)?;
            *object.current().state.lock() = signal_state.clone();
        }

        log::trace!("soft: submitted, signal operations are {:?}", signal_state);

        Ok(())
    }

    unsafe fn queue_wait_idle(&self) -> Result<(), VulkanError> {
        self.queue.lock().complete_all();

        Ok(())
    }
}

impl SoftDevice {
    fn requirements(
        &self,
        size: u64,
        external_memory_handle_types: ExternalMemoryHandleTypes,
    ) -> MemoryRequirements {
        let dedicated = self
            .config
            .dedicated_only_memory_handle_types
            .intersects(external_memory_handle_types);

        MemoryRequirements {
            size: size.max(1).next_multiple_of(RESOURCE_ALIGNMENT),
            alignment: RESOURCE_ALIGNMENT,
            memory_type_bits: MEMORY_TYPE_BITS,
            prefers_dedicated_allocation: dedicated,
            requires_dedicated_allocation: dedicated,
        }
    }
}

fn bind(
    resource: Option<&mut SoftResource>,
    memories: &HashMap<u64, SoftMemory>,
    memory: vk::DeviceMemory,
    offset: u64,
) -> Result<(), VulkanError> {
    let resource = resource.ok_or(VulkanError::InitializationFailed)?;
    let memory_object = memories
        .get(&memory.as_raw())
        .ok_or(VulkanError::InitializationFailed)?;

    if resource.bound.is_some()
        || offset + resource.requirements.size > memory_object.size as u64
    {
        return Err(VulkanError::OutOfDeviceMemory);
    }

    resource.bound = Some(memory);

    Ok(())
}

/// What an exported descriptor stands for.
#[derive(Clone, Debug)]
enum ExportedPayload {
    Semaphore(ExternalSemaphoreHandleType, Arc<SoftPayload>),
    Fence(ExternalFenceHandleType, Arc<SoftPayload>),
    Memory(ExternalMemoryHandleType, Arc<SoftBlock>),
}

#[derive(Debug)]
struct RegistryEntry {
    /// The end of the socket pair that was not exported.
    anchor: UnixStream,
    payload: ExportedPayload,
}

impl RegistryEntry {
    /// Returns whether a copy of the exported end is still open somewhere.
    fn is_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        // Equivalent of the unstable `UnixStream::peek`.
        let peeked = unsafe {
            libc::recv(
                self.anchor.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_PEEK,
            )
        };
        let peeked = if peeked < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(peeked as usize)
        };
        match peeked {
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
            // Nothing is ever written to the exported end, so this is end of stream.
            Ok(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct ExportRegistry {
    entries: HashMap<DescriptorIdentity, RegistryEntry>,
    purge_at: usize,
}

/// Exports live as long as any descriptor referring to them, possibly in another device or
/// instance, so they are tracked process-wide.
fn registry() -> &'static Mutex<ExportRegistry> {
    static REGISTRY: OnceLock<Mutex<ExportRegistry>> = OnceLock::new();

    REGISTRY.get_or_init(Default::default)
}

fn register_export(payload: ExportedPayload) -> Result<isize, VulkanError> {
    let (exported, anchor) = UnixStream::pair().map_err(|err| {
        log::error!("soft: failed to create the socket of an export: {}", err);
        VulkanError::TooManyObjects
    })?;
    anchor
        .set_nonblocking(true)
        .map_err(|_| VulkanError::TooManyObjects)?;
    let identity =
        os::descriptor_identity(exported.as_raw_fd()).map_err(|_| VulkanError::TooManyObjects)?;

    let mut registry = registry().lock();

    if registry.entries.len() >= registry.purge_at {
        registry.entries.retain(|_, entry| entry.is_alive());
        registry.purge_at = (registry.entries.len() * 2).max(64);
    }

    registry
        .entries
        .insert(identity, RegistryEntry { anchor, payload });

    Ok(OwnedFd::from(exported).into_raw_fd() as isize)
}

fn lookup_export(raw: isize) -> Result<ExportedPayload, VulkanError> {
    let fd = RawFd::try_from(raw).map_err(|_| VulkanError::InvalidExternalHandle)?;
    let identity = os::descriptor_identity(fd).map_err(|_| VulkanError::InvalidExternalHandle)?;

    registry()
        .lock()
        .entries
        .get(&identity)
        .map(|entry| entry.payload.clone())
        .ok_or(VulkanError::InvalidExternalHandle)
}

/// A successful import takes ownership of the descriptor.
fn close_imported(raw: isize) {
    if let Err(err) = os::close_fd(raw as RawFd) {
        log::warn!("soft: closing imported descriptor {} failed: {}", raw, err);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        lookup_export, register_export, registry, ExportedPayload, PayloadState, SoftPayload,
    };
    use crate::{
        device::DeviceExtensions,
        driver::soft::SoftDriverConfig,
        handle::NativeHandle,
        submit::{CommandSubmission, SyncPrimitive},
        sync::{ExternalSemaphoreHandleType, Permanence, Semaphore, SignalState},
        VulkanError,
    };

    #[test]
    fn exports_are_found_through_duplicates() {
        let raw = register_export(ExportedPayload::Semaphore(
            ExternalSemaphoreHandleType::OpaqueFd,
            SoftPayload::new(PayloadState::Signaled),
        ))
        .unwrap();
        // SAFETY: `raw` was just created and is owned by nothing else.
        let handle = unsafe { NativeHandle::from_raw(crate::handle::HandleKind::Fd, raw) }.unwrap();
        let duplicate = handle.duplicate().unwrap();

        assert!(matches!(
            lookup_export(duplicate.raw()),
            Ok(ExportedPayload::Semaphore(..)),
        ));

        let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let stranger = NativeHandle::from_fd(socket.into());
        assert!(matches!(
            lookup_export(stranger.raw()),
            Err(VulkanError::InvalidExternalHandle),
        ));
    }

    #[test]
    fn closed_exports_are_forgotten() {
        for _ in 0..4096 {
            let raw = register_export(ExportedPayload::Semaphore(
                ExternalSemaphoreHandleType::OpaqueFd,
                SoftPayload::new(PayloadState::Unsignaled),
            ))
            .unwrap();
            crate::os::close_fd(raw as i32).unwrap();
        }

        // Other tests may hold a few exports of their own.
        assert!(registry().lock().entries.len() < 1024);
    }

    #[test]
    fn signaled_sync_fd_can_be_the_sentinel() {
        let handle_type = ExternalSemaphoreHandleType::SyncFd;
        let (device, queue) = soft_device!(
            DeviceExtensions::for_semaphore(handle_type),
            SoftDriverConfig {
                sync_fd_signaled_sentinel: true,
                ..Default::default()
            }
        );
        let semaphore = Semaphore::new_exportable(device.clone(), handle_type).unwrap();

        semaphore.submit_signal(&queue).unwrap();
        let mut handle = semaphore.export(handle_type).unwrap();
        assert!(handle.is_signaled_sentinel());

        let imported =
            Semaphore::new_imported(device, handle_type, &mut handle, Permanence::Temporary)
                .unwrap();
        assert_eq!(imported.signal_state(), SignalState::Signaled);
        queue.submit_empty_wait(&imported).unwrap();
    }

    #[test]
    fn pending_signal_is_not_the_sentinel() {
        let handle_type = ExternalSemaphoreHandleType::SyncFd;
        let (device, queue) = soft_device!(
            DeviceExtensions::for_semaphore(handle_type),
            SoftDriverConfig {
                sync_fd_signaled_sentinel: true,
                ..Default::default()
            }
        );
        let semaphore = Semaphore::new_exportable(device, handle_type).unwrap();

        semaphore
            .submit_work_then_signal(&queue, &Default::default())
            .unwrap();
        let handle = semaphore.export(handle_type).unwrap();
        assert!(!handle.is_signaled_sentinel());
        assert!(handle.has_value());

        queue.wait_idle().unwrap();
    }

    #[test]
    fn waiting_without_a_signal_loses_the_device() {
        let (device, queue) = soft_device!(DeviceExtensions::empty());
        let semaphore = Semaphore::new(device, Default::default()).unwrap();

        assert!(matches!(
            queue.submit_empty_wait(&semaphore),
            Err(crate::InteropError::DeviceLost),
        ));
    }
}
