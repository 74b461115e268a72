// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Moving raw native handles between owners without touching the object they came from.
//!
//! This is how another process would obtain a handle: through a duplicate, through a
//! descriptor slot replaced with `dup2`/`dup3`, or through `SCM_RIGHTS` on a Unix domain socket.

use crate::{
    handle::{HandleKind, NativeHandle},
    os, InteropError,
};
pub use crate::os::DescriptorIdentity;
use std::io;
#[cfg(unix)]
use std::os::unix::io::{AsFd, AsRawFd};

/// Returns a new handle owning an OS duplicate of `handle`.
#[inline]
pub fn duplicate(handle: &NativeHandle) -> Result<NativeHandle, InteropError> {
    handle.duplicate()
}

fn fd_of(handle: &NativeHandle, what: &'static str) -> Result<i32, InteropError> {
    if handle.kind() != HandleKind::Fd || handle.is_signaled_sentinel() {
        return Err(InteropError::InvalidHandle(
            format!("{} is {:?}, not an open file descriptor", what, handle).into(),
        ));
    }

    Ok(handle.raw() as i32)
}

/// Makes the descriptor slot of `slot` an alias of `src`, with `dup2` semantics.
///
/// Whatever `slot` owned is closed by the OS as part of the call, exactly once; the returned
/// handle owns the same slot number, now referring to the resource of `src`. If the call fails,
/// `slot` is dropped and closed normally.
pub fn duplicate_onto(
    src: &NativeHandle,
    slot: NativeHandle,
) -> Result<NativeHandle, InteropError> {
    duplicate_onto_impl(src, slot, |src, dst| os::duplicate_fd_onto(src, dst))
}

/// Same as [`duplicate_onto`], with `dup3` semantics: `close_on_exec` sets the flag on the
/// new descriptor, and aliasing a descriptor onto itself is an error.
pub fn duplicate_onto_with_flags(
    src: &NativeHandle,
    slot: NativeHandle,
    close_on_exec: bool,
) -> Result<NativeHandle, InteropError> {
    duplicate_onto_impl(src, slot, |src, dst| {
        os::duplicate_fd_onto_with_flags(src, dst, close_on_exec)
    })
}

fn duplicate_onto_impl(
    src: &NativeHandle,
    mut slot: NativeHandle,
    dup: impl FnOnce(i32, i32) -> io::Result<i32>,
) -> Result<NativeHandle, InteropError> {
    let src_fd = fd_of(src, "the source")?;
    let dst_fd = fd_of(&slot, "the destination slot")?;

    let fd = dup(src_fd, dst_fd).map_err(InteropError::DuplicationFailed)?;

    if fd == src_fd {
        // `dup2` onto itself is a no-op, `slot` and `src` already own the same descriptor.
        return Ok(slot);
    }

    // The OS closed the previous resource of the slot.
    slot.release();
    log::debug!("descriptor {} now aliases descriptor {}", fd, src_fd);

    unsafe { NativeHandle::from_raw(HandleKind::Fd, fd as isize) }
}

/// Returns the identity of the kernel object behind a file descriptor handle.
pub fn descriptor_identity(handle: &NativeHandle) -> Result<DescriptorIdentity, InteropError> {
    let fd = fd_of(handle, "the handle")?;

    os::descriptor_identity(fd).map_err(|err| InteropError::InvalidHandle(err.to_string().into()))
}

/// Returns the number of descriptors currently open in this process.
#[inline]
pub fn open_descriptor_count() -> io::Result<usize> {
    os::open_descriptor_count()
}

/// Sends `payload` over `socket` with a duplicate of `handle` attached as `SCM_RIGHTS` data.
///
/// `handle` stays owned by the caller.
#[cfg(unix)]
pub fn send_over_socket(
    handle: &NativeHandle,
    socket: &impl AsFd,
    payload: &[u8],
) -> Result<(), InteropError> {
    let fd = fd_of(handle, "the handle")?;
    let sent = os::send_fd(socket.as_fd().as_raw_fd(), fd, payload)
        .map_err(InteropError::TransferFailed)?;

    if sent != payload.len() {
        return Err(InteropError::TransferFailed(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("sent {} of {} bytes", sent, payload.len()),
        )));
    }

    log::debug!("sent descriptor {} with {} bytes", fd, sent);

    Ok(())
}

/// Receives one message sent by [`send_over_socket`] into `payload`.
///
/// Returns the number of bytes received and the handle that was attached. A message without a
/// descriptor, or with malformed ancillary data, is a [`InteropError::TransferFailed`].
#[cfg(unix)]
pub fn receive_from_socket(
    socket: &impl AsFd,
    payload: &mut [u8],
) -> Result<(usize, NativeHandle), InteropError> {
    let (received, fd) =
        os::receive_fd(socket.as_fd().as_raw_fd(), payload).map_err(InteropError::TransferFailed)?;

    let fd = fd.ok_or_else(|| {
        InteropError::TransferFailed(io::Error::new(
            io::ErrorKind::InvalidData,
            "the message carried no descriptor",
        ))
    })?;

    log::debug!("received descriptor {} with {} bytes", fd, received);

    Ok((received, unsafe {
        NativeHandle::from_raw(HandleKind::Fd, fd as isize)
    }?))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
    };

    fn stream_handle() -> (NativeHandle, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();

        (NativeHandle::from_fd(a.into()), b)
    }

    #[test]
    fn dup2_replaces_the_slot() {
        let (a, _peer_a) = stream_handle();
        let (b, _peer_b) = stream_handle();
        let slot = b.raw();
        let identity_a = descriptor_identity(&a).unwrap();

        let b = duplicate_onto(&a, b).unwrap();

        assert_eq!(b.raw(), slot);
        assert_eq!(descriptor_identity(&b).unwrap(), identity_a);
    }

    fn assert_closed(mut peer: &UnixStream) {
        peer.set_nonblocking(true).unwrap();
        assert_eq!(peer.read(&mut [0u8; 1]).unwrap(), 0);
    }

    #[test]
    fn dup2_and_dup3_release_the_previous_resource() {
        for close_on_exec in [None, Some(false), Some(true)] {
            let (a, peer_a) = stream_handle();
            let (b, peer_b) = stream_handle();

            let b = match close_on_exec {
                None => duplicate_onto(&a, b),
                Some(close_on_exec) => duplicate_onto_with_flags(&a, b, close_on_exec),
            }
            .unwrap();

            // `b` held the only descriptor of its stream.
            assert_closed(&peer_b);

            let flags = unsafe { libc::fcntl(b.raw() as i32, libc::F_GETFD) };
            assert!(flags >= 0);
            if let Some(close_on_exec) = close_on_exec {
                assert_eq!(flags & libc::FD_CLOEXEC != 0, close_on_exec);
            }

            // The stream of `a` stays open through `b`.
            drop(a);
            peer_a.set_nonblocking(true).unwrap();
            let err = (&peer_a).read(&mut [0u8; 1]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

            drop(b);
            assert_closed(&peer_a);
        }
    }

    #[test]
    fn dup2_onto_itself_keeps_one_owner() {
        let (a, _peer) = stream_handle();
        let alias = unsafe { NativeHandle::from_raw(HandleKind::Fd, a.raw()) }.unwrap();

        let mut same = duplicate_onto(&a, alias).unwrap();
        assert_eq!(same.raw(), a.raw());

        // Only `a` may close the descriptor.
        same.release();
    }

    #[test]
    fn dup3_onto_itself_fails() {
        let (a, _peer) = stream_handle();
        let alias = unsafe { NativeHandle::from_raw(HandleKind::Fd, a.raw()) }.unwrap();

        let res = duplicate_onto_with_flags(&a, alias, true);
        assert!(matches!(res, Err(InteropError::DuplicationFailed(_))));

        // The dropped slot closed the descriptor shared with `a`.
        let mut a = a;
        a.release();
    }

    #[test]
    fn sentinel_cannot_be_relayed() {
        let (a, _peer) = stream_handle();

        assert!(matches!(
            duplicate_onto(&NativeHandle::signaled_sync_fd(), a),
            Err(InteropError::InvalidHandle(_)),
        ));
    }

    #[test]
    fn socket_transfer_keeps_payload_and_descriptor() {
        let (handle, _peer) = stream_handle();
        let (tx, rx) = UnixStream::pair().unwrap();

        send_over_socket(&handle, &tx, b"deqp").unwrap();

        let mut buf = [0u8; 16];
        let (len, received) = receive_from_socket(&rx, &mut buf).unwrap();

        assert_eq!(&buf[..len], b"deqp");
        assert_ne!(received.raw(), handle.raw());
        assert_eq!(
            descriptor_identity(&received).unwrap(),
            descriptor_identity(&handle).unwrap(),
        );
    }

    #[test]
    fn message_without_descriptor_fails() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"deqp").unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            receive_from_socket(&rx, &mut buf),
            Err(InteropError::TransferFailed(_)),
        ));
    }

    #[test]
    fn descriptor_count_is_readable() {
        let before = open_descriptor_count().unwrap();
        let (_handle, _peer) = stream_handle();

        assert!(before > 0);
    }
}
