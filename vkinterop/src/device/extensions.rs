// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    memory::ExternalMemoryHandleType,
    sync::{ExternalFenceHandleType, ExternalSemaphoreHandleType},
};
use std::ffi::CStr;

/// Vulkan 1.1, the first version with the external handle extensions promoted to core.
pub const API_VERSION_1_1: u32 = ash::vk::make_api_version(0, 1, 1, 0);

macro_rules! extensions {
    (
        $(#[doc = $doc:literal])*
        $sname:ident,
        $($ext:ident => $name:literal $(, core $core_version:ident)?;)*
    ) => (
        $(#[doc = $doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $sname {
            $(
                pub $ext: bool,
            )*
        }

        impl $sname {
            /// Returns a value with all members set to `false`.
            #[inline]
            pub const fn empty() -> Self {
                Self {
                    $($ext: false,)*
                }
            }

            /// Returns whether no member is set.
            #[inline]
            pub const fn is_empty(&self) -> bool {
                !(false $(|| self.$ext)*)
            }

            /// Returns the members set in `self` or in `other`.
            #[inline]
            pub const fn union(&self, other: &Self) -> Self {
                Self {
                    $($ext: self.$ext || other.$ext,)*
                }
            }

            /// Returns the members set in `self` but not in `other`.
            #[inline]
            pub const fn difference(&self, other: &Self) -> Self {
                Self {
                    $($ext: self.$ext && !other.$ext,)*
                }
            }

            /// Returns whether every member set in `other` is also set in `self`.
            #[inline]
            pub const fn contains(&self, other: &Self) -> bool {
                true $(&& (self.$ext || !other.$ext))*
            }

            /// Returns `self` without the members that are part of the core API of
            /// `api_version`.
            pub fn without_core(&self, #[allow(unused_variables)] api_version: u32) -> Self {
                #[allow(unused_mut)]
                let mut result = *self;

                $($(
                    if api_version >= $core_version {
                        result.$ext = false;
                    }
                )?)*

                result
            }

            /// Returns the names of the members that are set.
            pub fn names(&self) -> Vec<&'static CStr> {
                let mut names = Vec::new();
                $(
                    if self.$ext {
                        names.push($name);
                    }
                )*
                names
            }

            /// Builds a value with the members named in `names` set. Unknown names are
            /// ignored.
            pub fn from_names<'a>(names: impl IntoIterator<Item = &'a CStr>) -> Self {
                let mut result = Self::empty();

                for name in names {
                    $(
                        if name == $name {
                            result.$ext = true;
                        }
                    )*
                }

                result
            }

            /// Returns the field name of the first member that is set.
            pub fn first_set(&self) -> Option<&'static str> {
                $(
                    if self.$ext {
                        return Some(stringify!($ext));
                    }
                )*
                None
            }
        }
    );
}

extensions! {
    /// Instance extensions used to query external handle capabilities.
    InstanceExtensions,
    khr_get_physical_device_properties2 => c"VK_KHR_get_physical_device_properties2", core API_VERSION_1_1;
    khr_external_semaphore_capabilities => c"VK_KHR_external_semaphore_capabilities", core API_VERSION_1_1;
    khr_external_fence_capabilities => c"VK_KHR_external_fence_capabilities", core API_VERSION_1_1;
    khr_external_memory_capabilities => c"VK_KHR_external_memory_capabilities", core API_VERSION_1_1;
}

extensions! {
    /// Device extensions that external handle types depend on.
    DeviceExtensions,
    khr_external_semaphore => c"VK_KHR_external_semaphore", core API_VERSION_1_1;
    khr_external_semaphore_fd => c"VK_KHR_external_semaphore_fd";
    khr_external_semaphore_win32 => c"VK_KHR_external_semaphore_win32";
    khr_external_fence => c"VK_KHR_external_fence", core API_VERSION_1_1;
    khr_external_fence_fd => c"VK_KHR_external_fence_fd";
    khr_external_fence_win32 => c"VK_KHR_external_fence_win32";
    khr_external_memory => c"VK_KHR_external_memory", core API_VERSION_1_1;
    khr_external_memory_fd => c"VK_KHR_external_memory_fd";
    khr_external_memory_win32 => c"VK_KHR_external_memory_win32";
    ext_external_memory_dma_buf => c"VK_EXT_external_memory_dma_buf";
    android_external_memory_android_hardware_buffer => c"VK_ANDROID_external_memory_android_hardware_buffer";
    ext_queue_family_foreign => c"VK_EXT_queue_family_foreign";
    khr_dedicated_allocation => c"VK_KHR_dedicated_allocation", core API_VERSION_1_1;
    khr_get_memory_requirements2 => c"VK_KHR_get_memory_requirements2", core API_VERSION_1_1;
    khr_bind_memory2 => c"VK_KHR_bind_memory2", core API_VERSION_1_1;
    khr_maintenance1 => c"VK_KHR_maintenance1", core API_VERSION_1_1;
    khr_sampler_ycbcr_conversion => c"VK_KHR_sampler_ycbcr_conversion", core API_VERSION_1_1;
}

impl InstanceExtensions {
    /// The instance extensions needed to query any external handle type.
    pub const fn for_external_handles() -> Self {
        Self {
            khr_get_physical_device_properties2: true,
            khr_external_semaphore_capabilities: true,
            khr_external_fence_capabilities: true,
            khr_external_memory_capabilities: true,
        }
    }
}

impl DeviceExtensions {
    /// The extensions a device needs to export or import semaphores of `handle_type`.
    pub const fn for_semaphore(handle_type: ExternalSemaphoreHandleType) -> Self {
        let mut extensions = Self::empty();
        extensions.khr_external_semaphore = true;

        match handle_type {
            ExternalSemaphoreHandleType::OpaqueFd | ExternalSemaphoreHandleType::SyncFd => {
                extensions.khr_external_semaphore_fd = true;
            }
            ExternalSemaphoreHandleType::OpaqueWin32
            | ExternalSemaphoreHandleType::OpaqueWin32Kmt
            | ExternalSemaphoreHandleType::D3D12Fence => {
                extensions.khr_external_semaphore_win32 = true;
            }
        }

        extensions
    }

    /// The extensions a device needs to export or import fences of `handle_type`.
    pub const fn for_fence(handle_type: ExternalFenceHandleType) -> Self {
        let mut extensions = Self::empty();
        extensions.khr_external_fence = true;

        match handle_type {
            ExternalFenceHandleType::OpaqueFd | ExternalFenceHandleType::SyncFd => {
                extensions.khr_external_fence_fd = true;
            }
            ExternalFenceHandleType::OpaqueWin32 | ExternalFenceHandleType::OpaqueWin32Kmt => {
                extensions.khr_external_fence_win32 = true;
            }
        }

        extensions
    }

    /// The extensions a device needs to export or import memory of `handle_type`, including
    /// dedicated allocations.
    pub const fn for_memory(handle_type: ExternalMemoryHandleType) -> Self {
        let mut extensions = Self::empty();
        extensions.khr_external_memory = true;
        extensions.khr_dedicated_allocation = true;
        extensions.khr_get_memory_requirements2 = true;

        match handle_type {
            ExternalMemoryHandleType::OpaqueFd => {
                extensions.khr_external_memory_fd = true;
            }
            ExternalMemoryHandleType::DmaBuf => {
                extensions.khr_external_memory_fd = true;
                extensions.ext_external_memory_dma_buf = true;
            }
            ExternalMemoryHandleType::OpaqueWin32 | ExternalMemoryHandleType::OpaqueWin32Kmt => {
                extensions.khr_external_memory_win32 = true;
            }
            ExternalMemoryHandleType::AndroidHardwareBuffer => {
                extensions.android_external_memory_android_hardware_buffer = true;
                extensions.ext_queue_family_foreign = true;
                extensions.khr_sampler_ycbcr_conversion = true;
                extensions.khr_maintenance1 = true;
                extensions.khr_bind_memory2 = true;
            }
        }

        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceExtensions, InstanceExtensions, API_VERSION_1_1};
    use crate::{
        memory::ExternalMemoryHandleType,
        sync::{ExternalFenceHandleType, ExternalSemaphoreHandleType},
    };

    #[test]
    fn empty_extensions() {
        assert!(InstanceExtensions::empty().names().is_empty());
        assert!(DeviceExtensions::empty().is_empty());
    }

    #[test]
    fn names_round_trip() {
        let extensions = DeviceExtensions::for_memory(ExternalMemoryHandleType::DmaBuf);
        let names = extensions.names();

        assert!(names.contains(&c"VK_EXT_external_memory_dma_buf"));
        assert_eq!(DeviceExtensions::from_names(names), extensions);
    }

    #[test]
    fn core_extensions_are_dropped() {
        let extensions = DeviceExtensions::for_semaphore(ExternalSemaphoreHandleType::SyncFd);
        let required = extensions.without_core(API_VERSION_1_1);

        assert!(extensions.khr_external_semaphore);
        assert!(!required.khr_external_semaphore);
        assert!(required.khr_external_semaphore_fd);
        assert_eq!(
            required.first_set(),
            Some("khr_external_semaphore_fd"),
        );
    }

    #[test]
    fn missing_extension_is_named() {
        let supported = DeviceExtensions::for_fence(ExternalFenceHandleType::OpaqueFd);
        let required = DeviceExtensions::for_fence(ExternalFenceHandleType::OpaqueWin32);

        assert!(!supported.contains(&required));
        assert_eq!(
            required.difference(&supported).first_set(),
            Some("khr_external_fence_win32"),
        );
        assert!(supported.union(&required).contains(&required));
    }
}
