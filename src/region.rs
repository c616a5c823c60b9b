// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shareable memory regions backing buffers, and their CPU mappings.
//!
//! A [`SharedRegion`] is a fixed-size chunk of memory identified by a file descriptor that can be
//! handed to the device (V4L2 `DMABUF` memory). It is preferably allocated from the system
//! dma-heap, and falls back to a sealed `memfd` when no heap is available.
//!
//! A [`MappedRegion`] is a read-write CPU mapping of any such descriptor, including the device's
//! own `MMAP` buffers. It is unmapped when dropped.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;

const SYSTEM_HEAP: &str = "/dev/dma_heap/system";

#[repr(C)]
#[derive(Debug, Default)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

nix::ioctl_readwrite!(dma_heap_alloc, b'H', 0, DmaHeapAllocationData);

#[derive(Debug, Error)]
pub enum NewRegionError {
    #[error("region size cannot be zero")]
    ZeroSize,
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
    #[error("failed to open dma-heap {0}: {1}")]
    HeapUnavailable(PathBuf, io::Error),
    #[error("dma-heap allocation of {0} bytes failed: {1}")]
    HeapAllocation(u64, Errno),
}

#[derive(Debug, Error)]
pub enum MapRegionError {
    #[error("mapping size {0} is zero or larger than usize")]
    InvalidSize(u64),
    #[error("mmap call returned error: {0}")]
    Mmap(#[from] Errno),
}

/// A chunk of memory identified by a file descriptor, shareable with the device.
#[derive(Debug)]
pub struct SharedRegion {
    fd: OwnedFd,
    size: NonZeroU64,
}

impl SharedRegion {
    /// Allocate a sealed `memfd` region of `size` bytes.
    pub fn memfd(size: u64) -> Result<Self, NewRegionError> {
        let size = NonZeroU64::new(size).ok_or(NewRegionError::ZeroSize)?;

        let fd = memfd_create(c"codec-buffer", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();

        file.set_len(size.into())
            .map_err(NewRegionError::FailedToSetSize)?;

        // Seal so the region size cannot be changed while the device uses it.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(NewRegionError::FailedToSeal(io::Error::last_os_error()));
        }

        Ok(Self {
            fd: file.into(),
            size,
        })
    }

    /// Allocate a region of `size` bytes from the dma-heap at `heap`.
    pub fn dma_heap(heap: &Path, size: u64) -> Result<Self, NewRegionError> {
        let size = NonZeroU64::new(size).ok_or(NewRegionError::ZeroSize)?;

        let heap_file = OpenOptions::new()
            .read(true)
            .open(heap)
            .map_err(|e| NewRegionError::HeapUnavailable(heap.to_path_buf(), e))?;

        let mut data = DmaHeapAllocationData {
            len: size.get(),
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..Default::default()
        };
        // SAFETY: `heap_file` is a valid dma-heap and `data` matches the kernel's
        // `dma_heap_allocation_data` layout.
        unsafe { dma_heap_alloc(heap_file.as_raw_fd(), &mut data) }
            .map_err(|e| NewRegionError::HeapAllocation(size.get(), e))?;

        // SAFETY: on success the kernel returned a new descriptor that we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };

        Ok(Self { fd, size })
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    /// Map the whole region into the process for reading and writing.
    pub fn map(&self) -> Result<MappedRegion, MapRegionError> {
        MappedRegion::new(self.fd.as_fd(), 0, self.size.get())
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SharedRegion {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Source of [`SharedRegion`]s.
#[derive(Debug, Clone)]
pub enum RegionAllocator {
    /// Try the dma-heap at the given path, and fall back to `memfd` if it cannot be opened.
    DmaHeap(PathBuf),
    MemFd,
}

impl RegionAllocator {
    pub fn system() -> Self {
        RegionAllocator::DmaHeap(PathBuf::from(SYSTEM_HEAP))
    }

    pub fn allocate(&self, size: u64) -> Result<SharedRegion, NewRegionError> {
        match self {
            RegionAllocator::MemFd => SharedRegion::memfd(size),
            RegionAllocator::DmaHeap(heap) => match SharedRegion::dma_heap(heap, size) {
                Err(NewRegionError::HeapUnavailable(path, e)) => {
                    log::warn!(
                        "dma-heap {} unavailable ({}), using memfd instead",
                        path.display(),
                        e
                    );
                    SharedRegion::memfd(size)
                }
                res => res,
            },
        }
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::system()
    }
}

/// A CPU mapping of a region or of a device buffer.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned and only reachable through `&self`/`&mut self`.
unsafe impl Send for MappedRegion {}
// SAFETY: shared references only give out `&[u8]`.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` starting at `offset`, shared and read-write.
    pub fn new(fd: BorrowedFd, offset: u64, len: u64) -> Result<Self, MapRegionError> {
        let size = usize::try_from(len)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(MapRegionError::InvalidSize(len))?;
        let offset = libc::off_t::try_from(offset).map_err(|_| Errno::EOVERFLOW)?;

        // SAFETY: `fd` is a valid descriptor for the duration of this call, and the kernel keeps
        // its own reference to the underlying object for as long as the mapping lives.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };

        Ok(Self {
            ptr: data.cast(),
            len: size.get(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: the pointer and length were obtained from a successful `mmap` in `new`.
        unsafe { mman::munmap(self.ptr.cast(), self.len) }.unwrap_or_else(|e| {
            log::error!("error while unmapping region: {:#}", e);
        });
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` points to `len` mapped bytes that live until `self` is dropped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for MappedRegion {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` points to `len` mapped bytes that live until `self` is dropped, and
        // `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfd_region_is_shared_between_mappings() {
        let region = SharedRegion::memfd(4096).unwrap();
        assert_eq!(region.size(), 4096);

        let mut first = region.map().unwrap();
        let second = region.map().unwrap();
        first.as_mut()[..4].copy_from_slice(b"iris");
        assert_eq!(&second.as_ref()[..4], b"iris");
        assert_eq!(second.len(), 4096);
    }

    #[test]
    fn zero_sized_region() {
        assert!(matches!(
            SharedRegion::memfd(0),
            Err(NewRegionError::ZeroSize)
        ));
    }

    #[test]
    fn missing_heap_falls_back_to_memfd() {
        let allocator = RegionAllocator::DmaHeap(PathBuf::from("/nonexistent/dma_heap/system"));
        let region = allocator.allocate(1024).unwrap();
        assert_eq!(region.size(), 1024);
    }
}
