// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! OS primitives behind native handles.
//!
//! Exactly one of the platform modules is compiled for a target. Each provides the same set of
//! functions; operations a platform does not have fail with `io::ErrorKind::Unsupported`.

use crate::handle::HandleKind;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::*;

#[cfg(target_os = "android")]
mod android;
#[cfg(target_os = "android")]
pub(crate) use self::android::{acquire_ahb, release_ahb};

#[cfg(not(target_os = "android"))]
pub(crate) fn acquire_ahb(_buffer: isize) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(not(target_os = "android"))]
pub(crate) fn release_ahb(_buffer: isize) {}

/// Returns whether native handles of `kind` exist on the target.
pub(crate) fn supports_kind(kind: HandleKind) -> bool {
    match kind {
        HandleKind::None => true,
        HandleKind::Fd => cfg!(unix),
        HandleKind::Win32 | HandleKind::Win32Kmt => cfg!(windows),
        HandleKind::AndroidHardwareBuffer => cfg!(target_os = "android"),
    }
}

/// The identity of the open file description behind a descriptor.
///
/// Two descriptors with equal identities refer to the same kernel object, for example after a
/// `dup`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorIdentity {
    pub device: u64,
    pub inode: u64,
}
