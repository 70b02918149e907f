//! Unix domain socket transport.
//!
//! Descriptors are carried as `SCM_RIGHTS` ancillary data. Everything here
//! is a thin wrapper over `sendmsg`/`recvmsg`.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use super::{Transport, FDS_PER_READ, MAX_MESSAGE_FDS};
use crate::IoMode;

const fn cmsg_space(data_len: usize) -> usize {
    unsafe { libc::CMSG_SPACE(data_len as libc::c_uint) as usize }
}

impl Transport for UnixStream {
    fn pollable_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn send(&mut self, bytes: &[u8], fds: &[OwnedFd], mode: IoMode) -> io::Result<usize> {
        let mut flags = libc::MSG_NOSIGNAL;
        if mode == IoMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }

        let iov = [IoSlice::new(bytes)];
        let mut cmsg = [0u8; cmsg_space(MAX_MESSAGE_FDS * mem::size_of::<RawFd>())];

        let mut mhdr = unsafe { mem::zeroed::<libc::msghdr>() };
        mhdr.msg_iov = iov.as_ptr().cast_mut().cast();
        mhdr.msg_iovlen = iov.len() as _;

        if !fds.is_empty() {
            // OwnedFd is repr(transparent) over RawFd, so the slice can be
            // copied into the control message as-is.
            let fds_size = mem::size_of_val(fds);
            let controllen = cmsg_space(fds_size);
            assert!(controllen <= cmsg.len());

            mhdr.msg_control = cmsg.as_mut_ptr().cast();
            mhdr.msg_controllen = controllen as _;

            let hdr = unsafe { libc::CMSG_FIRSTHDR(&mhdr).as_mut().unwrap() };
            hdr.cmsg_level = libc::SOL_SOCKET;
            hdr.cmsg_type = libc::SCM_RIGHTS;
            hdr.cmsg_len = unsafe { libc::CMSG_LEN(fds_size as libc::c_uint) } as _;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr().cast::<u8>(),
                    libc::CMSG_DATA(hdr),
                    fds_size,
                );
            }
        }

        let ret = unsafe { libc::sendmsg(self.as_raw_fd(), &mhdr, flags) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn recv(
        &mut self,
        bytes: &mut [u8],
        fds: &mut VecDeque<OwnedFd>,
        mode: IoMode,
    ) -> io::Result<usize> {
        let mut flags = libc::MSG_CMSG_CLOEXEC | libc::MSG_NOSIGNAL;
        if mode == IoMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }

        let mut iov = [IoSliceMut::new(bytes)];
        let mut cmsg = [0u8; cmsg_space(FDS_PER_READ * mem::size_of::<RawFd>())];

        let mut mhdr = unsafe { mem::zeroed::<libc::msghdr>() };
        mhdr.msg_iov = iov.as_mut_ptr().cast();
        mhdr.msg_iovlen = iov.len() as _;
        mhdr.msg_control = cmsg.as_mut_ptr().cast();
        mhdr.msg_controllen = cmsg.len() as _;

        let ret = unsafe { libc::recvmsg(self.as_raw_fd(), &mut mhdr, flags) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        // The cast is not unnecessary on all platforms.
        #[allow(clippy::unnecessary_cast)]
        let mut hdr_ptr = if mhdr.msg_controllen as usize > 0 {
            unsafe { libc::CMSG_FIRSTHDR(&mhdr).as_ref() }
        } else {
            None
        };

        while let Some(hdr) = hdr_ptr {
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                let data = unsafe { libc::CMSG_DATA(hdr) };
                #[allow(clippy::unnecessary_cast)]
                let data_len =
                    hdr as *const _ as usize + hdr.cmsg_len as usize - data as usize;
                let count = data_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = unsafe { data.cast::<RawFd>().add(i).read_unaligned() };
                    assert_ne!(fd, -1);
                    fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
            hdr_ptr = unsafe { libc::CMSG_NXTHDR(&mhdr, hdr).as_ref() };
        }

        Ok(ret as usize)
    }
}
