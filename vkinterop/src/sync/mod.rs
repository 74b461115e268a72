// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Synchronization primitives that can be shared through native handles.
//!
//! The payload of a [`Semaphore`] or [`Fence`] can be exported as a native handle and imported
//! into another object, possibly on another device or in another process. Two properties decide
//! what the importer observes afterwards:
//!
//! - The [`Transference`] of the handle type. With [`Transference::Reference`] the importer and
//!   the exporter share one payload: a signal on either is seen by a wait on the other. With
//!   [`Transference::Copy`] the importer receives the payload as it was at export time, and
//!   later signals on the exporter are not visible to it.
//!
//! - The [`Permanence`] of the import. A [`Permanence::Temporary`] import is undone by the next
//!   wait on a semaphore or reset of a fence, after which the object has its previous payload
//!   again. A [`Permanence::Permanent`] import lasts until the next import.

pub use self::{
    fence::{ExternalFenceProperties, Fence, FenceCreateInfo},
    semaphore::{ExternalSemaphoreProperties, Semaphore, SemaphoreCreateInfo},
};
use crate::{
    handle::{HandleKind, ImportOwnership},
    macros::vulkan_bitflags_enum,
};

mod fence;
mod semaphore;

/// How long an imported payload stays in effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permanence {
    /// The import replaces the payload until the object is destroyed or imported into again.
    Permanent,

    /// The import is undone by the next semaphore wait or fence reset.
    Temporary,
}

/// Whether an imported object aliases the exporter or received a snapshot of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transference {
    /// The importer gets the payload as it was when the handle was exported.
    Copy,

    /// The importer and the exporter share one payload.
    Reference,
}

/// What the layer knows about the payload of a synchronization primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SignalState {
    #[default]
    Unsignaled,

    /// Signaled, or a signal operation is pending.
    Signaled,

    /// A payload was imported or a signal was submitted whose completion has not been observed.
    Unknown,
}

/// The handle type and permanence of the payload currently imported into an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImportedPayload<T> {
    pub handle_type: T,
    pub permanence: Permanence,
}

impl<T> ImportedPayload<T> {
    /// Returns whether the next wait or reset undoes the import.
    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.permanence == Permanence::Temporary
    }
}

vulkan_bitflags_enum! {
    /// A set of [`ExternalSemaphoreHandleType`] values.
    ExternalSemaphoreHandleTypes,

    /// The handle type used to export or import semaphores to/from an external source.
    ExternalSemaphoreHandleType impl {
        /// Returns whether an import of this handle type aliases the exporter or copies its
        /// payload.
        #[inline]
        pub const fn transference(self) -> Transference {
            match self {
                Self::SyncFd => Transference::Copy,
                Self::OpaqueFd | Self::OpaqueWin32 | Self::OpaqueWin32Kmt | Self::D3D12Fence => {
                    Transference::Reference
                }
            }
        }

        /// Returns whether handles of this type can be imported with `permanence`.
        #[inline]
        pub const fn supports_permanence(self, permanence: Permanence) -> bool {
            !matches!((self, permanence), (Self::SyncFd, Permanence::Permanent))
        }

        /// Returns the permanence that the scenarios import this handle type with.
        #[inline]
        pub const fn default_permanence(self) -> Permanence {
            match self.transference() {
                Transference::Copy => Permanence::Temporary,
                Transference::Reference => Permanence::Permanent,
            }
        }

        /// Returns the kind of native handle that carries this handle type.
        #[inline]
        pub const fn handle_kind(self) -> HandleKind {
            match self {
                Self::OpaqueFd | Self::SyncFd => HandleKind::Fd,
                Self::OpaqueWin32 | Self::D3D12Fence => HandleKind::Win32,
                Self::OpaqueWin32Kmt => HandleKind::Win32Kmt,
            }
        }

        /// Returns what happens to the caller's native handle when an import succeeds.
        #[inline]
        pub const fn import_ownership(self) -> ImportOwnership {
            match self.handle_kind() {
                HandleKind::Fd => ImportOwnership::Transferred,
                _ => ImportOwnership::Retained,
            }
        }

        /// Returns a short lowercase name, used in scenario names and logs.
        #[inline]
        pub const fn name(self) -> &'static str {
            match self {
                Self::OpaqueFd => "opaque_fd",
                Self::OpaqueWin32 => "opaque_win32",
                Self::OpaqueWin32Kmt => "opaque_win32_kmt",
                Self::D3D12Fence => "d3d12_fence",
                Self::SyncFd => "sync_fd",
            }
        }
    },

    = ExternalSemaphoreHandleTypeFlags(u32);

    /// A POSIX file descriptor handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_FD, OpaqueFd = OPAQUE_FD,

    /// A Windows NT handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32, OpaqueWin32 = OPAQUE_WIN32,

    /// A Windows global share handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32_KMT, OpaqueWin32Kmt = OPAQUE_WIN32_KMT,

    /// A Windows NT handle that refers to a Direct3D 12 fence.
    D3D12_FENCE, D3D12Fence = D3D12_FENCE,

    /// A POSIX file descriptor handle to a Linux Sync File or Android Fence object.
    SYNC_FD, SyncFd = SYNC_FD,
}

vulkan_bitflags_enum! {
    /// A set of [`ExternalFenceHandleType`] values.
    ExternalFenceHandleTypes,

    /// The handle type used to export or import fences to/from an external source.
    ExternalFenceHandleType impl {
        /// Returns whether an import of this handle type aliases the exporter or copies its
        /// payload.
        #[inline]
        pub const fn transference(self) -> Transference {
            match self {
                Self::SyncFd => Transference::Copy,
                Self::OpaqueFd | Self::OpaqueWin32 | Self::OpaqueWin32Kmt => {
                    Transference::Reference
                }
            }
        }

        /// Returns whether handles of this type can be imported with `permanence`.
        #[inline]
        pub const fn supports_permanence(self, permanence: Permanence) -> bool {
            !matches!((self, permanence), (Self::SyncFd, Permanence::Permanent))
        }

        /// Returns the permanence that the scenarios import this handle type with.
        #[inline]
        pub const fn default_permanence(self) -> Permanence {
            match self.transference() {
                Transference::Copy => Permanence::Temporary,
                Transference::Reference => Permanence::Permanent,
            }
        }

        /// Returns the kind of native handle that carries this handle type.
        #[inline]
        pub const fn handle_kind(self) -> HandleKind {
            match self {
                Self::OpaqueFd | Self::SyncFd => HandleKind::Fd,
                Self::OpaqueWin32 => HandleKind::Win32,
                Self::OpaqueWin32Kmt => HandleKind::Win32Kmt,
            }
        }

        /// Returns what happens to the caller's native handle when an import succeeds.
        #[inline]
        pub const fn import_ownership(self) -> ImportOwnership {
            match self.handle_kind() {
                HandleKind::Fd => ImportOwnership::Transferred,
                _ => ImportOwnership::Retained,
            }
        }

        /// Returns a short lowercase name, used in scenario names and logs.
        #[inline]
        pub const fn name(self) -> &'static str {
            match self {
                Self::OpaqueFd => "opaque_fd",
                Self::OpaqueWin32 => "opaque_win32",
                Self::OpaqueWin32Kmt => "opaque_win32_kmt",
                Self::SyncFd => "sync_fd",
            }
        }
    },

    = ExternalFenceHandleTypeFlags(u32);

    /// A POSIX file descriptor handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_FD, OpaqueFd = OPAQUE_FD,

    /// A Windows NT handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32, OpaqueWin32 = OPAQUE_WIN32,

    /// A Windows global share handle that is only usable with Vulkan and compatible APIs.
    OPAQUE_WIN32_KMT, OpaqueWin32Kmt = OPAQUE_WIN32_KMT,

    /// A POSIX file descriptor handle to a Linux Sync File or Android Fence object.
    SYNC_FD, SyncFd = SYNC_FD,
}

#[cfg(test)]
mod tests {
    use super::{
        ExternalFenceHandleType, ExternalSemaphoreHandleType, ExternalSemaphoreHandleTypes,
        Permanence, Transference,
    };
    use crate::handle::{HandleKind, ImportOwnership};

    #[test]
    fn transference_is_total() {
        for &handle_type in ExternalSemaphoreHandleType::ALL {
            let expected = if handle_type == ExternalSemaphoreHandleType::SyncFd {
                Transference::Copy
            } else {
                Transference::Reference
            };
            assert_eq!(handle_type.transference(), expected);
        }

        for &handle_type in ExternalFenceHandleType::ALL {
            let expected = if handle_type == ExternalFenceHandleType::SyncFd {
                Transference::Copy
            } else {
                Transference::Reference
            };
            assert_eq!(handle_type.transference(), expected);
        }
    }

    #[test]
    fn sync_fd_is_temporary_only() {
        let sync_fd = ExternalSemaphoreHandleType::SyncFd;
        assert!(sync_fd.supports_permanence(Permanence::Temporary));
        assert!(!sync_fd.supports_permanence(Permanence::Permanent));
        assert_eq!(sync_fd.default_permanence(), Permanence::Temporary);

        let opaque = ExternalFenceHandleType::OpaqueFd;
        assert!(opaque.supports_permanence(Permanence::Temporary));
        assert!(opaque.supports_permanence(Permanence::Permanent));
        assert_eq!(opaque.default_permanence(), Permanence::Permanent);
    }

    #[test]
    fn ownership_follows_handle_kind() {
        assert_eq!(
            ExternalSemaphoreHandleType::OpaqueFd.import_ownership(),
            ImportOwnership::Transferred,
        );
        assert_eq!(
            ExternalSemaphoreHandleType::OpaqueWin32.import_ownership(),
            ImportOwnership::Retained,
        );
        assert_eq!(
            ExternalFenceHandleType::OpaqueWin32Kmt.handle_kind(),
            HandleKind::Win32Kmt,
        );
    }

    #[test]
    fn handle_type_sets() {
        let types: ExternalSemaphoreHandleTypes = [
            ExternalSemaphoreHandleType::SyncFd,
            ExternalSemaphoreHandleType::OpaqueFd,
        ]
        .into_iter()
        .collect();

        assert_eq!(types.count(), 2);
        assert!(types.contains_enum(ExternalSemaphoreHandleType::SyncFd));
        assert!(!types.contains_enum(ExternalSemaphoreHandleType::OpaqueWin32));
        assert_eq!(
            types.iter().collect::<Vec<_>>(),
            [
                ExternalSemaphoreHandleType::OpaqueFd,
                ExternalSemaphoreHandleType::SyncFd,
            ],
        );
        assert_eq!(
            ash::vk::ExternalSemaphoreHandleTypeFlags::from(types),
            ash::vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD
                | ash::vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD,
        );
    }
}
