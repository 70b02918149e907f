//! A shared-memory file coupled with its mapping.
//!
//! `wl_shm.create_pool` wants a file descriptor; the client wants to write
//! pixels through a mapping of the same memory. [`SharedMemory`] owns
//! both: dropping it (or calling [`close`](SharedMemory::close)) releases
//! the mapping and the descriptor together.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use memmap2::MmapMut;

/// An anonymous shared-memory file and a writable mapping of it.
///
/// ```no_run
/// # fn f() -> std::io::Result<()> {
/// let mut shm = wlkit_shm::SharedMemory::new(16)?;
/// shm.bytes_mut().fill(0xFF);
/// let fd = shm.dup_fd()?; // hand this to wl_shm.create_pool
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SharedMemory {
    file: File,
    mmap: MmapMut,
    len: usize,
}

impl SharedMemory {
    /// Create an anonymous shared-memory file of `len` bytes and map it.
    pub fn new(len: usize) -> io::Result<Self> {
        let file = shmemfdrs2::create_shmem(c"/wlkit-shm")?;
        file.set_len(len as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap, len })
    }

    /// Map `len` bytes of an existing descriptor, e.g. one received from
    /// the compositor. Takes ownership of the descriptor.
    pub fn from_fd(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let file = File::from(fd);
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Duplicate the descriptor for sending over the wire. The compositor
    /// keeps its copy for the pool's lifetime; this object keeps the
    /// original.
    pub fn dup_fd(&self) -> io::Result<OwnedFd> {
        self.file.as_fd().try_clone_to_owned()
    }

    /// Grow the file and remap. Shrinking is not supported, matching
    /// `wl_shm_pool.resize`.
    pub fn resize(&mut self, len: usize) -> io::Result<()> {
        if len > self.len {
            self.file.set_len(len as u64)?;
            self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
            self.len = len;
        }
        Ok(())
    }

    /// Release the mapping and the descriptor. Equivalent to dropping.
    pub fn close(self) {}
}

impl AsFd for SharedMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
