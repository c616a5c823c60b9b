// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffers exchanged with the device, and the memory backing them.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::time::Duration;

use v4l2r::ioctl::BufferFlags;

use crate::format::Port;
use crate::region::MappedRegion;
use crate::region::SharedRegion;

/// How buffer memory is provided to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryKind {
    /// Memory allocated by the device and exported to us (V4L2 `MMAP`).
    Mmap,
    /// Memory we allocate and share with the device (V4L2 `DMABUF`).
    #[default]
    DmaBuf,
}

impl MemoryKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MMAP" => Some(MemoryKind::Mmap),
            "DMA_BUF" => Some(MemoryKind::DmaBuf),
            _ => None,
        }
    }
}

/// Memory backing a [`Buffer`].
#[derive(Debug)]
pub enum BufferMemory {
    /// A region we allocated, along with its CPU mapping.
    Shared {
        region: SharedRegion,
        mapping: MappedRegion,
    },
    /// A device-allocated buffer, exported as a descriptor and mapped.
    Mapped {
        exported: OwnedFd,
        mapping: MappedRegion,
    },
}

impl BufferMemory {
    pub fn kind(&self) -> MemoryKind {
        match self {
            BufferMemory::Shared { .. } => MemoryKind::DmaBuf,
            BufferMemory::Mapped { .. } => MemoryKind::Mmap,
        }
    }

    fn mapping(&self) -> &MappedRegion {
        match self {
            BufferMemory::Shared { mapping, .. } | BufferMemory::Mapped { mapping, .. } => mapping,
        }
    }

    fn mapping_mut(&mut self) -> &mut MappedRegion {
        match self {
            BufferMemory::Shared { mapping, .. } | BufferMemory::Mapped { mapping, .. } => mapping,
        }
    }
}

/// A single-plane buffer of one port.
///
/// Buffers are owned by their port's [`crate::pool::BufferPool`]. Whoever holds a `Buffer` value
/// has it checked out of the pool and must hand it back.
#[derive(Debug)]
pub struct Buffer {
    port: Port,
    index: u32,
    pub(crate) generation: u64,
    memory: BufferMemory,
    pub bytes_used: u32,
    pub data_offset: u32,
    pub flags: BufferFlags,
    pub timestamp: Duration,
}

impl Buffer {
    pub fn new(port: Port, index: u32, memory: BufferMemory) -> Self {
        Self {
            port,
            index,
            generation: 0,
            memory,
            bytes_used: 0,
            data_offset: 0,
            flags: BufferFlags::empty(),
            timestamp: Duration::ZERO,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.memory.kind()
    }

    /// Total size of the buffer memory.
    pub fn capacity(&self) -> usize {
        self.memory.mapping().len()
    }

    /// Descriptor of the buffer memory. This is what the device receives for `DMABUF` buffers.
    pub fn fd(&self) -> BorrowedFd<'_> {
        match &self.memory {
            BufferMemory::Shared { region, .. } => region.as_fd(),
            BufferMemory::Mapped { exported, .. } => exported.as_fd(),
        }
    }

    /// Whole buffer memory, for filling.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.memory.mapping_mut().as_mut()
    }

    pub fn data(&self) -> &[u8] {
        self.memory.mapping().as_ref()
    }

    /// The valid payload: `bytes_used` bytes starting at `data_offset`, clamped to the capacity.
    pub fn payload(&self) -> &[u8] {
        let data = self.data();
        let start = (self.data_offset as usize).min(data.len());
        let end = (self.bytes_used as usize).max(start).min(data.len());
        &data[start..end]
    }

    pub fn is_last(&self) -> bool {
        self.flags.contains(BufferFlags::LAST)
    }

    /// Forget the metadata of a previous use before handing the buffer out again.
    pub(crate) fn reset(&mut self) {
        self.bytes_used = 0;
        self.data_offset = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = Duration::ZERO;
    }
}

#[cfg(test)]
pub(crate) fn memfd_buffer(port: Port, index: u32, size: u64) -> Buffer {
    let region = SharedRegion::memfd(size).unwrap();
    let mapping = region.map().unwrap();
    Buffer::new(port, index, BufferMemory::Shared { region, mapping })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_clamped() {
        let mut buffer = memfd_buffer(Port::Input, 3, 64);
        assert_eq!(buffer.index(), 3);
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.memory_kind(), MemoryKind::DmaBuf);

        buffer.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buffer.bytes_used = 4;
        buffer.data_offset = 1;
        assert_eq!(buffer.payload(), &[2, 3, 4]);

        buffer.bytes_used = 1000;
        assert_eq!(buffer.payload().len(), 63);

        buffer.flags = BufferFlags::LAST;
        assert!(buffer.is_last());
        buffer.reset();
        assert!(!buffer.is_last());
        assert!(buffer.payload().is_empty());
    }

    #[test]
    fn memory_kind_names() {
        assert_eq!(MemoryKind::from_name("MMAP"), Some(MemoryKind::Mmap));
        assert_eq!(MemoryKind::from_name("DMA_BUF"), Some(MemoryKind::DmaBuf));
        assert_eq!(MemoryKind::from_name("USERPTR"), None);
    }
}
