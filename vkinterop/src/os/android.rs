// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! `AHardwareBuffer` reference counting, resolved from `libandroid.so` at first use.

#![allow(non_camel_case_types)]

use libloading::Library;
use std::{ffi::c_void, io, sync::OnceLock};

type PFN_AHardwareBuffer_acquire = unsafe extern "C" fn(buffer: *mut c_void);
type PFN_AHardwareBuffer_release = unsafe extern "C" fn(buffer: *mut c_void);

struct HardwareBufferFns {
    _lib: Library,
    acquire: PFN_AHardwareBuffer_acquire,
    release: PFN_AHardwareBuffer_release,
}

static FNS: OnceLock<Option<HardwareBufferFns>> = OnceLock::new();

fn fns() -> Option<&'static HardwareBufferFns> {
    FNS.get_or_init(|| {
        let load = || -> Result<HardwareBufferFns, libloading::Error> {
            let lib = unsafe { Library::new("libandroid.so") }?;
            let acquire =
                *unsafe { lib.get::<PFN_AHardwareBuffer_acquire>(b"AHardwareBuffer_acquire") }?;
            let release =
                *unsafe { lib.get::<PFN_AHardwareBuffer_release>(b"AHardwareBuffer_release") }?;

            Ok(HardwareBufferFns {
                _lib: lib,
                acquire,
                release,
            })
        };

        load()
            .map_err(|err| log::warn!("AHardwareBuffer functions are unavailable: {}", err))
            .ok()
    })
    .as_ref()
}

pub(crate) fn acquire_ahb(buffer: isize) -> io::Result<()> {
    let fns = fns().ok_or(io::ErrorKind::Unsupported)?;
    unsafe { (fns.acquire)(buffer as *mut c_void) };

    Ok(())
}

pub(crate) fn release_ahb(buffer: isize) {
    if let Some(fns) = fns() {
        unsafe { (fns.release)(buffer as *mut c_void) };
    }
}
