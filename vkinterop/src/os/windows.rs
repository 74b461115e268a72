// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![allow(non_snake_case)]

use super::DescriptorIdentity;
use std::{io, ptr};

type HANDLE = isize;
type BOOL = i32;

const DUPLICATE_SAME_ACCESS: u32 = 0x0000_0002;

#[link(name = "kernel32")]
extern "system" {
    fn CloseHandle(hObject: HANDLE) -> BOOL;
    fn GetCurrentProcess() -> HANDLE;
    fn DuplicateHandle(
        hSourceProcessHandle: HANDLE,
        hSourceHandle: HANDLE,
        hTargetProcessHandle: HANDLE,
        lpTargetHandle: *mut HANDLE,
        dwDesiredAccess: u32,
        bInheritHandle: BOOL,
        dwOptions: u32,
    ) -> BOOL;
}

pub(crate) fn close_win32(handle: isize) -> io::Result<()> {
    if unsafe { CloseHandle(handle) } == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn duplicate_win32(handle: isize) -> io::Result<isize> {
    let process = unsafe { GetCurrentProcess() };
    let mut duplicate: HANDLE = 0;

    let ok = unsafe {
        DuplicateHandle(
            process,
            handle,
            process,
            ptr::addr_of_mut!(duplicate),
            0,
            0,
            DUPLICATE_SAME_ACCESS,
        )
    };

    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(duplicate)
    }
}

// File descriptors are not native handles on Windows.

pub(crate) fn close_fd(_fd: i32) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn duplicate_fd(_fd: i32) -> io::Result<i32> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn duplicate_fd_onto(_src: i32, _dst: i32) -> io::Result<i32> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn duplicate_fd_onto_with_flags(
    _src: i32,
    _dst: i32,
    _close_on_exec: bool,
) -> io::Result<i32> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn descriptor_identity(_fd: i32) -> io::Result<DescriptorIdentity> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn open_descriptor_count() -> io::Result<usize> {
    Err(io::ErrorKind::Unsupported.into())
}
