// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::DescriptorIdentity;
use std::{
    fs, io,
    mem::{self, MaybeUninit},
    os::unix::io::RawFd,
    ptr,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
const DESCRIPTOR_DIR: &str = "/proc/self/fd";
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const DESCRIPTOR_DIR: &str = "/dev/fd";

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn close_fd(fd: RawFd) -> io::Result<()> {
    // Never retried on EINTR, the descriptor is gone either way.
    check(unsafe { libc::close(fd) }).map(drop)
}

pub(crate) fn duplicate_fd(fd: RawFd) -> io::Result<RawFd> {
    check(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })
}

pub(crate) fn duplicate_fd_onto(src: RawFd, dst: RawFd) -> io::Result<RawFd> {
    loop {
        match check(unsafe { libc::dup2(src, dst) }) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn duplicate_fd_onto_with_flags(
    src: RawFd,
    dst: RawFd,
    close_on_exec: bool,
) -> io::Result<RawFd> {
    let flags = if close_on_exec { libc::O_CLOEXEC } else { 0 };

    check(unsafe { libc::dup3(src, dst, flags) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn duplicate_fd_onto_with_flags(
    src: RawFd,
    dst: RawFd,
    close_on_exec: bool,
) -> io::Result<RawFd> {
    // `dup3` rejects equal descriptors, emulate that before falling back to `dup2`.
    if src == dst {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    let fd = duplicate_fd_onto(src, dst)?;

    if close_on_exec {
        check(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }

    Ok(fd)
}

pub(crate) fn descriptor_identity(fd: RawFd) -> io::Result<DescriptorIdentity> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstat(fd, stat.as_mut_ptr()) })?;
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    Ok(DescriptorIdentity {
        device: stat.st_dev as u64,
        inode: stat.st_ino as u64,
    })
}

pub(crate) fn open_descriptor_count() -> io::Result<usize> {
    let entries = fs::read_dir(DESCRIPTOR_DIR)?.count();

    // The directory handle used for the listing is one of the entries.
    Ok(entries.saturating_sub(1))
}

fn control_buffer(fd_count: usize) -> (Vec<u64>, usize) {
    let space = unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<RawFd>()) as u32) } as usize;

    (vec![0; space.div_ceil(mem::size_of::<u64>())], space)
}

/// Sends `payload` with `fd` attached as `SCM_RIGHTS` ancillary data.
#[inline]
pub(crate) fn send_fd(socket: RawFd, fd: RawFd, payload: &[u8]) -> io::Result<usize> {
    send_fds(socket, &[fd], payload)
}

fn send_fds(socket: RawFd, fds: &[RawFd], payload: &[u8]) -> io::Result<usize> {
    let (mut control, control_len) = control_buffer(fds.len());
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr().cast_mut().cast(),
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control_len as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };

    if cmsg.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no room for the control message",
        ));
    }

    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of_val(fds) as u32) as _;
        ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            mem::size_of_val(fds),
        );
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };

    if sent < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(sent as usize)
    }
}

/// Receives into `payload` and returns the byte count and the descriptor carried as
/// `SCM_RIGHTS` ancillary data, if there was one.
///
/// Ancillary data that is present but is not exactly one descriptor is an `InvalidData` error.
pub(crate) fn receive_fd(socket: RawFd, payload: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    let (mut control, control_len) = control_buffer(1);
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control_len as _;

    let received = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };

    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        // The descriptors that fit were installed all the same.
        unsafe { close_received(&msg) };

        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "the control message was truncated",
        ));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };

    if cmsg.is_null() {
        return Ok((received as usize, None));
    }

    let (level, ty, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
    let expected_len = unsafe { libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) };

    if level != libc::SOL_SOCKET || ty != libc::SCM_RIGHTS || len as usize != expected_len as usize
    {
        unsafe { close_received(&msg) };

        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "unexpected control message (level {}, type {}, length {})",
                level, ty, len,
            ),
        ));
    }

    let fd = unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };

    Ok((received as usize, Some(fd)))
}

/// Closes every descriptor that `SCM_RIGHTS` messages in `msg` carried.
///
/// # Safety
///
/// `msg` must have been filled by a successful `recvmsg`, and the descriptors must not be owned
/// by anything else.
unsafe fn close_received(msg: &libc::msghdr) {
    let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };

    while !cmsg.is_null() {
        let (level, ty, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };

        if level == libc::SOL_SOCKET && ty == libc::SCM_RIGHTS {
            let data = unsafe { libc::CMSG_DATA(cmsg) }.cast::<RawFd>();
            let count = (len as usize).saturating_sub(header_len) / mem::size_of::<RawFd>();

            for index in 0..count {
                let fd = unsafe { ptr::read_unaligned(data.add(index)) };
                log::debug!("closing descriptor {} of a rejected control message", fd);
                let _ = close_fd(fd);
            }
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
}

// Win32 handles do not exist on unix targets.

pub(crate) fn close_win32(_handle: isize) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn duplicate_win32(_handle: isize) -> io::Result<isize> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::{receive_fd, send_fds};
    use std::{
        io::{self, Read},
        os::unix::{io::AsRawFd, net::UnixStream},
    };

    fn assert_closed(mut peer: &UnixStream) {
        peer.set_nonblocking(true).unwrap();
        assert_eq!(peer.read(&mut [0u8; 1]).unwrap(), 0);
    }

    #[test]
    fn extra_descriptors_are_closed_on_rejection() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (a, peer_a) = UnixStream::pair().unwrap();
        let (b, peer_b) = UnixStream::pair().unwrap();

        send_fds(tx.as_raw_fd(), &[a.as_raw_fd(), b.as_raw_fd()], b"deqp").unwrap();
        drop((a, b));

        let err = receive_fd(rx.as_raw_fd(), &mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // The receiver held the last references.
        assert_closed(&peer_a);
        assert_closed(&peer_b);
    }

    #[test]
    fn one_descriptor_is_accepted() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (a, _peer_a) = UnixStream::pair().unwrap();

        send_fds(tx.as_raw_fd(), &[a.as_raw_fd()], b"deqp").unwrap();

        let mut payload = [0u8; 16];
        let (received, fd) = receive_fd(rx.as_raw_fd(), &mut payload).unwrap();
        assert_eq!(&payload[..received], b"deqp");
        super::close_fd(fd.unwrap()).unwrap();
    }
}
