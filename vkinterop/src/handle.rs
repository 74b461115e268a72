// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Exclusive ownership of OS-native handles.
//!
//! A [`NativeHandle`] owns at most one OS resource: a file descriptor, a Win32 handle or a
//! reference on an `AHardwareBuffer`. It is never cloned; a second owner is obtained with
//! [`NativeHandle::duplicate`], which asks the OS for an independent duplicate. Dropping the
//! handle closes the resource exactly once, unless ownership was moved out with
//! [`NativeHandle::release`].

use crate::{os, InteropError};
use std::fmt::{Debug, Error as FmtError, Formatter};
#[cfg(unix)]
use std::os::unix::io::{IntoRawFd, OwnedFd, RawFd};

/// The kind of OS resource a [`NativeHandle`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Owns nothing.
    None,

    /// A POSIX file descriptor.
    Fd,

    /// A Win32 NT handle, closed with `CloseHandle`.
    Win32,

    /// A Win32 global share handle. These are not reference counted and are never closed.
    Win32Kmt,

    /// A pointer to an `AHardwareBuffer` on which the handle holds one reference.
    AndroidHardwareBuffer,
}

/// What happens to a caller's [`NativeHandle`] when an import succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImportOwnership {
    /// The driver takes ownership; the handle is emptied after a successful import.
    Transferred,

    /// The driver takes its own reference; the caller still owns the handle and closes it
    /// when it is no longer needed.
    Retained,
}

/// An owned OS-native handle.
///
/// For file descriptors, the value `-1` is accepted: it is the sync-fd sentinel for a payload
/// that is already signaled, not the absence of a handle. Such a handle
/// [`has_value`](Self::has_value), reports [`is_signaled_sentinel`](Self::is_signaled_sentinel)
/// and closes nothing on drop.
pub struct NativeHandle {
    kind: HandleKind,
    raw: isize,
}

impl NativeHandle {
    /// Returns a handle that owns nothing.
    #[inline]
    pub const fn none() -> Self {
        NativeHandle {
            kind: HandleKind::None,
            raw: 0,
        }
    }

    /// Takes ownership of `raw`, interpreted as a resource of `kind`.
    ///
    /// A null Win32 or `AHardwareBuffer` value produces a handle that owns nothing. Values that
    /// cannot be a handle of `kind`, or kinds that do not exist on this platform, are rejected
    /// with [`InteropError::InvalidHandle`]. No OS call is made to check that the value is open.
    ///
    /// # Safety
    ///
    /// - `raw` must not be owned by anything else. After this call it is closed when the
    ///   returned handle is dropped.
    pub unsafe fn from_raw(kind: HandleKind, raw: isize) -> Result<Self, InteropError> {
        if !os::supports_kind(kind) {
            return Err(InteropError::InvalidHandle(
                format!("{:?} handles do not exist on this platform", kind).into(),
            ));
        }

        match kind {
            HandleKind::None if raw != 0 => Err(InteropError::InvalidHandle(
                format!("a handle without a kind cannot hold the value {}", raw).into(),
            )),
            HandleKind::None => Ok(Self::none()),
            HandleKind::Fd if raw < -1 || raw > i32::MAX as isize => Err(
                InteropError::InvalidHandle(format!("{} is not a file descriptor", raw).into()),
            ),
            HandleKind::Win32 | HandleKind::Win32Kmt if raw == -1 => Err(
                InteropError::InvalidHandle("INVALID_HANDLE_VALUE is not a handle".into()),
            ),
            HandleKind::Win32 | HandleKind::Win32Kmt | HandleKind::AndroidHardwareBuffer
                if raw == 0 =>
            {
                Ok(Self::none())
            }
            kind => Ok(NativeHandle { kind, raw }),
        }
    }

    /// Takes ownership of a file descriptor.
    #[cfg(unix)]
    #[inline]
    pub fn from_fd(fd: OwnedFd) -> Self {
        NativeHandle {
            kind: HandleKind::Fd,
            raw: fd.into_raw_fd() as isize,
        }
    }

    /// Returns the sync-fd sentinel for an already-signaled payload.
    #[inline]
    pub const fn signaled_sync_fd() -> Self {
        NativeHandle {
            kind: HandleKind::Fd,
            raw: -1,
        }
    }

    /// Returns the kind of resource owned by the handle.
    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Returns the raw value without giving up ownership.
    #[inline]
    pub fn raw(&self) -> isize {
        self.raw
    }

    /// Returns the file descriptor, if this is a file descriptor handle.
    #[cfg(unix)]
    #[inline]
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        (self.kind == HandleKind::Fd).then_some(self.raw as RawFd)
    }

    /// Returns `true` unless the handle owns nothing.
    #[inline]
    pub fn has_value(&self) -> bool {
        self.kind != HandleKind::None
    }

    /// Returns whether this is the `-1` sync-fd value of an already-signaled payload.
    #[inline]
    pub fn is_signaled_sentinel(&self) -> bool {
        self.kind == HandleKind::Fd && self.raw == -1
    }

    /// Checks that the handle can be given to an import of a handle type carried by `kind`,
    /// before anything reaches the driver.
    pub(crate) fn check_importable(
        &self,
        kind: HandleKind,
        accepts_sentinel: bool,
    ) -> Result<(), InteropError> {
        if !self.has_value() {
            return Err(InteropError::InvalidHandle(
                "the handle owns nothing to import".into(),
            ));
        }

        if self.kind != kind {
            return Err(InteropError::InvalidHandle(
                format!("expected a {:?} handle, got {:?}", kind, self).into(),
            ));
        }

        if self.is_signaled_sentinel() && !accepts_sentinel {
            return Err(InteropError::InvalidHandle(
                "the signaled sentinel is only valid for copy-transference handle types".into(),
            ));
        }

        Ok(())
    }

    /// Returns a new handle owning an OS-level duplicate of the same resource.
    ///
    /// The original stays valid and both handles can be closed independently. Global share
    /// handles and the signaled sentinel carry no reference and are copied by value.
    pub fn duplicate(&self) -> Result<Self, InteropError> {
        let raw = match self.kind {
            HandleKind::None | HandleKind::Win32Kmt => self.raw,
            HandleKind::Fd if self.raw == -1 => -1,
            HandleKind::Fd => {
                os::duplicate_fd(self.raw as i32).map_err(InteropError::DuplicationFailed)? as isize
            }
            HandleKind::Win32 => {
                os::duplicate_win32(self.raw).map_err(InteropError::DuplicationFailed)?
            }
            HandleKind::AndroidHardwareBuffer => {
                os::acquire_ahb(self.raw).map_err(InteropError::DuplicationFailed)?;
                self.raw
            }
        };

        log::debug!("duplicated {:?} handle {} as {}", self.kind, self.raw, raw);

        Ok(NativeHandle {
            kind: self.kind,
            raw,
        })
    }

    /// Gives up ownership and returns the raw value. The handle owns nothing afterwards.
    #[inline]
    pub fn release(&mut self) -> isize {
        let raw = self.raw;
        self.kind = HandleKind::None;
        self.raw = 0;

        raw
    }

    /// Closes the owned resource now. The handle owns nothing afterwards.
    pub fn reset(&mut self) {
        let kind = self.kind;
        let raw = self.release();

        let result = match kind {
            HandleKind::None | HandleKind::Win32Kmt => Ok(()),
            HandleKind::Fd if raw == -1 => Ok(()),
            HandleKind::Fd => os::close_fd(raw as i32),
            HandleKind::Win32 => os::close_win32(raw),
            HandleKind::AndroidHardwareBuffer => {
                os::release_ahb(raw);
                Ok(())
            }
        };

        if let Err(err) = result {
            log::warn!("closing {:?} handle {} failed: {}", kind, raw, err);
        }
    }
}

impl Default for NativeHandle {
    #[inline]
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for NativeHandle {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}

impl Debug for NativeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self.kind {
            HandleKind::None => write!(f, "NativeHandle::None"),
            HandleKind::Fd if self.raw == -1 => write!(f, "NativeHandle::Fd(signaled)"),
            kind => write!(f, "NativeHandle::{:?}({:#x})", kind, self.raw),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{HandleKind, NativeHandle};
    use crate::{os, InteropError};
    use std::{
        io::{Read, Write},
        os::unix::{io::AsRawFd, net::UnixStream},
    };

    fn is_open(fd: i32) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn none_owns_nothing() {
        let handle = NativeHandle::none();
        assert!(!handle.has_value());
        assert_eq!(handle.kind(), HandleKind::None);
    }

    #[test]
    fn signaled_sentinel_is_a_value() {
        let handle = unsafe { NativeHandle::from_raw(HandleKind::Fd, -1) }.unwrap();
        assert!(handle.has_value());
        assert!(handle.is_signaled_sentinel());

        let duplicate = handle.duplicate().unwrap();
        assert!(duplicate.is_signaled_sentinel());
    }

    #[test]
    fn rejects_impossible_values() {
        assert!(matches!(
            unsafe { NativeHandle::from_raw(HandleKind::Fd, -2) },
            Err(InteropError::InvalidHandle(_)),
        ));
        assert!(matches!(
            unsafe { NativeHandle::from_raw(HandleKind::Fd, i32::MAX as isize + 1) },
            Err(InteropError::InvalidHandle(_)),
        ));
        assert!(matches!(
            unsafe { NativeHandle::from_raw(HandleKind::None, 3) },
            Err(InteropError::InvalidHandle(_)),
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn win32_is_rejected_off_windows() {
        assert!(matches!(
            unsafe { NativeHandle::from_raw(HandleKind::Win32, 0x40) },
            Err(InteropError::InvalidHandle(_)),
        ));
    }

    #[test]
    fn drop_closes_once() {
        let (a, _b) = UnixStream::pair().unwrap();
        let handle = NativeHandle::from_fd(a.into());
        let fd = handle.as_raw_fd().unwrap();

        assert!(is_open(fd));
        drop(handle);
        assert!(!is_open(fd));
    }

    #[test]
    fn release_transfers_ownership() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut handle = NativeHandle::from_fd(a.into());
        let fd = handle.release() as i32;

        assert!(!handle.has_value());
        drop(handle);
        assert!(is_open(fd));
        os::close_fd(fd).unwrap();
    }

    #[test]
    fn duplicate_is_independent() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let original = NativeHandle::from_fd(a.into());
        let duplicate = original.duplicate().unwrap();

        assert_ne!(original.raw(), duplicate.raw());
        assert_eq!(
            os::descriptor_identity(original.as_raw_fd().unwrap()).unwrap(),
            os::descriptor_identity(duplicate.as_raw_fd().unwrap()).unwrap(),
        );

        // Closing the duplicate leaves the original usable.
        drop(duplicate);
        let fd = original.as_raw_fd().unwrap();
        assert!(is_open(fd));

        b.write_all(b"x").unwrap();
        let mut byte = [0u8];
        let mut stream = unsafe { <UnixStream as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");

        // The stream now owns the descriptor.
        let mut original = original;
        assert_eq!(original.release() as i32, stream.as_raw_fd());
    }
}
