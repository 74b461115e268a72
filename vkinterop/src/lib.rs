// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Export and import of Vulkan synchronization primitives and memory through OS-native handles.
//!
//! # Brief summary
//!
//! - A [`Device`](crate::device::Device) is provisioned from an
//!   [`Instance`](crate::device::Instance) with the extension bundle implied by the external
//!   handle types it will use. Provisioning goes through a driver, either the real Vulkan
//!   implementation of the system ([`driver::vulkan`]) or the in-process reference driver
//!   ([`driver::soft`], unix only).
//!
//! - [`capabilities`] answers whether a (semaphore | fence | memory, handle type) combination
//!   can be exported and imported. A negative answer is a
//!   [`NotSupported`](InteropError::NotSupported) error, which callers treat as "skip", never as
//!   a failure.
//!
//! - [`Semaphore`](crate::sync::Semaphore), [`Fence`](crate::sync::Fence) and
//!   [`DeviceMemory`](crate::memory::DeviceMemory) are created exportable for a set of handle
//!   types. Exporting one produces a [`NativeHandle`](crate::handle::NativeHandle), a move-only
//!   owner of an fd, a Win32 handle or an `AHardwareBuffer` reference. Importing a handle into a
//!   second object consumes it or leaves it with the caller, depending on the handle type.
//!
//! - Whether an imported object aliases the exporter or received a snapshot of it is decided by
//!   the [`Transference`](crate::sync::Transference) of the handle type. Whether the import
//!   replaces the payload forever or until the next wait is decided by the
//!   [`Permanence`](crate::sync::Permanence) given at import time.
//!
//! - [`relay`] duplicates handles and passes them over Unix domain sockets, simulating
//!   several processes sharing one object.
//!
//! - [`scenario`] drives all of the above through the verification sequences that prove the
//!   semantics hold, reporting pass, fail or skip per scenario.

pub use ash::vk::Handle;
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    io,
};

#[macro_use]
mod tests;
mod cache;
pub mod capabilities;
pub mod carrier;
pub mod device;
pub mod driver;
pub mod handle;
mod macros;
pub mod memory;
mod os;
pub mod relay;
pub mod scenario;
pub mod submit;
pub mod sync;

/// Gives access to the internal identifier of an object.
pub unsafe trait VulkanObject {
    /// The type of the object.
    type Handle: Handle;

    /// Returns the raw Vulkan handle of the object.
    fn handle(&self) -> Self::Handle;
}

unsafe impl<T, U> VulkanObject for T
where
    T: std::ops::Deref<Target = U>,
    U: VulkanObject + ?Sized,
{
    type Handle = U::Handle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        (**self).handle()
    }
}

/// Error returned by a driver call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanError {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    ExtensionNotPresent,
    FeatureNotPresent,
    IncompatibleDriver,
    TooManyObjects,
    FormatNotSupported,
    InvalidExternalHandle,
    Unknown(i32),
}

impl From<ash::vk::Result> for VulkanError {
    fn from(val: ash::vk::Result) -> Self {
        match val {
            ash::vk::Result::NOT_READY => Self::NotReady,
            ash::vk::Result::TIMEOUT => Self::Timeout,
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            ash::vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            ash::vk::Result::ERROR_EXTENSION_NOT_PRESENT => Self::ExtensionNotPresent,
            ash::vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            ash::vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::IncompatibleDriver,
            ash::vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            ash::vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Self::InvalidExternalHandle,
            other => Self::Unknown(other.as_raw()),
        }
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotReady => write!(f, "A fence or query has not yet completed."),
            Self::Timeout => write!(f, "A wait operation has not completed in the specified time."),
            Self::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            Self::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            Self::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            Self::DeviceLost => write!(f, "The logical or physical device has been lost."),
            Self::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            Self::ExtensionNotPresent => {
                write!(f, "A requested extension is not supported.")
            }
            Self::FeatureNotPresent => write!(f, "A requested feature is not supported."),
            Self::IncompatibleDriver => write!(
                f,
                "The requested version of Vulkan is not supported by the driver or is otherwise \
                incompatible for implementation-specific reasons.",
            ),
            Self::TooManyObjects => {
                write!(f, "Too many objects of the type have already been created.")
            }
            Self::FormatNotSupported => {
                write!(f, "A requested format is not supported on this device.")
            }
            Self::InvalidExternalHandle => {
                write!(f, "An external handle is not a valid handle of the specified type.")
            }
            Self::Unknown(code) => write!(f, "The driver returned an unknown result ({code})."),
        }
    }
}

/// Error type of the interop layer.
///
/// [`NotSupported`](Self::NotSupported) and [`ExtensionNotPresent`](Self::ExtensionNotPresent)
/// mean the scenario cannot run on this driver or platform. Every other variant aborts the
/// current scenario only.
#[derive(Debug)]
pub enum InteropError {
    /// The driver or platform does not implement the requested combination.
    NotSupported(Cow<'static, str>),

    /// The device or instance was not provisioned with a required extension.
    ExtensionNotPresent { extension: &'static str },

    /// Extracting a native handle from an object failed.
    ExportFailed(Cow<'static, str>),

    /// Binding a native handle to an object failed.
    ImportFailed(Cow<'static, str>),

    /// The OS refused to duplicate a native handle.
    DuplicationFailed(io::Error),

    /// Passing a native handle to another endpoint failed or the received message was malformed.
    TransferFailed(io::Error),

    /// A raw value could not be accepted as a native handle of the given kind.
    InvalidHandle(Cow<'static, str>),

    DeviceLost,
    OutOfHostMemory,
    OutOfDeviceMemory,

    /// A wait did not complete in the allotted time.
    Timeout,

    /// The arguments of a call violate a rule that is checked before reaching the driver.
    ValidationFailed {
        context: &'static str,
        problem: Cow<'static, str>,
    },

    /// No Vulkan implementation could be loaded.
    LoadingFailed(libloading::Error),

    /// Any other error reported by the driver.
    Vulkan(VulkanError),
}

impl InteropError {
    /// Returns whether the error means the scenario should be skipped rather than failed.
    #[inline]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::NotSupported(_) | Self::ExtensionNotPresent { .. })
    }

    pub(crate) fn not_supported(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::NotSupported(reason.into())
    }

    pub(crate) fn validation(context: &'static str, problem: impl Into<Cow<'static, str>>) -> Self {
        Self::ValidationFailed {
            context,
            problem: problem.into(),
        }
    }

    /// Maps a driver error that happened while exporting.
    pub(crate) fn from_export(err: VulkanError) -> Self {
        match err {
            VulkanError::DeviceLost
            | VulkanError::OutOfHostMemory
            | VulkanError::OutOfDeviceMemory => err.into(),
            err => Self::ExportFailed(err.to_string().into()),
        }
    }

    /// Maps a driver error that happened while importing.
    pub(crate) fn from_import(err: VulkanError) -> Self {
        match err {
            VulkanError::DeviceLost
            | VulkanError::OutOfHostMemory
            | VulkanError::OutOfDeviceMemory => err.into(),
            err => Self::ImportFailed(err.to_string().into()),
        }
    }
}

impl Error for InteropError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::DuplicationFailed(err) | Self::TransferFailed(err) => Some(err),
            Self::LoadingFailed(err) => Some(err),
            Self::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for InteropError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotSupported(reason) => write!(f, "not supported: {}", reason),
            Self::ExtensionNotPresent { extension } => {
                write!(f, "the extension `{}` was not enabled", extension)
            }
            Self::ExportFailed(reason) => write!(f, "exporting a handle failed: {}", reason),
            Self::ImportFailed(reason) => write!(f, "importing a handle failed: {}", reason),
            Self::DuplicationFailed(_) => write!(f, "duplicating a native handle failed"),
            Self::TransferFailed(_) => write!(f, "transferring a native handle failed"),
            Self::InvalidHandle(reason) => write!(f, "invalid native handle: {}", reason),
            Self::DeviceLost => write!(f, "the device has been lost"),
            Self::OutOfHostMemory => write!(f, "no memory available on the host"),
            Self::OutOfDeviceMemory => write!(f, "no memory available on the device"),
            Self::Timeout => write!(f, "the wait timed out"),
            Self::ValidationFailed { context, problem } => write!(f, "{}: {}", context, problem),
            Self::LoadingFailed(_) => write!(f, "failed to load the Vulkan shared library"),
            Self::Vulkan(_) => write!(f, "a runtime error occurred"),
        }
    }
}

impl From<VulkanError> for InteropError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::DeviceLost => Self::DeviceLost,
            VulkanError::OutOfHostMemory => Self::OutOfHostMemory,
            VulkanError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            VulkanError::Timeout => Self::Timeout,
            VulkanError::FeatureNotPresent | VulkanError::FormatNotSupported => {
                Self::not_supported(err.to_string())
            }
            err => Self::Vulkan(err),
        }
    }
}

impl From<libloading::Error> for InteropError {
    fn from(err: libloading::Error) -> Self {
        Self::LoadingFailed(err)
    }
}

/// Used in create-info structs so that they can't be constructed with a struct literal outside
/// of this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

#[cfg(test)]
mod error_tests {
    use super::{InteropError, VulkanError};

    #[test]
    fn skip_classification() {
        assert!(InteropError::not_supported("no").is_skip());
        assert!(InteropError::ExtensionNotPresent {
            extension: "VK_KHR_external_fence_fd"
        }
        .is_skip());
        assert!(!InteropError::ImportFailed("bad".into()).is_skip());
        assert!(!InteropError::DeviceLost.is_skip());
    }

    #[test]
    fn driver_errors_keep_their_category() {
        assert!(matches!(
            InteropError::from_export(VulkanError::DeviceLost),
            InteropError::DeviceLost,
        ));
        assert!(matches!(
            InteropError::from_import(VulkanError::InvalidExternalHandle),
            InteropError::ImportFailed(_),
        ));
        assert!(matches!(
            InteropError::from(VulkanError::from(
                ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            )),
            InteropError::NotSupported(_),
        ));
    }
}
