// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-port buffer arena.
//!
//! A [`BufferPool`] is the only owner of a port's buffers. Each buffer is in exactly one of three
//! states:
//!
//! * free: stored in the pool and waiting to be handed out,
//! * pending: stored in the pool and queued to the device,
//! * checked out: moved out of the pool to be filled, dumped or inspected.
//!
//! The number of buffers in these three states always adds up to the number of buffers granted by
//! the last allocation. Buffers are handed out by value so a checked-out buffer cannot be queued
//! twice, and are matched back to their slot by index and allocation generation: a buffer checked
//! out before [`BufferPool::free`] is silently dropped when it comes back.

use std::collections::VecDeque;

use crate::buffer::Buffer;
use crate::buffer::BufferMemory;
use crate::error::AllocationError;
use crate::error::Error;
use crate::error::Result;
use crate::format::Port;

#[derive(Debug)]
pub struct BufferPool {
    port: Port,
    /// Incremented on every `free`, stamped on every buffer allocated afterwards.
    generation: u64,
    slots: Vec<Option<Buffer>>,
    free: VecDeque<u32>,
    pending: VecDeque<u32>,
    checked_out: usize,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            generation: 0,
            slots: Vec::new(),
            free: VecDeque::new(),
            pending: VecDeque::new(),
            checked_out: 0,
            buffer_size: 0,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Number of buffers granted by the last allocation.
    pub fn granted(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Whether buffer `index` is currently in the free state.
    pub fn is_free(&self, index: u32) -> bool {
        self.free.contains(&index)
    }

    /// Create `count` buffers using `alloc` to obtain the memory of each index, and put them all
    /// in the free state.
    ///
    /// If any allocation fails, the buffers created so far are released and the pool stays empty.
    pub fn allocate<F>(&mut self, count: u32, size: usize, mut alloc: F) -> Result<()>
    where
        F: FnMut(u32) -> std::result::Result<BufferMemory, AllocationError>,
    {
        if self.is_allocated() {
            return Err(Error::InvalidState("buffers are already allocated"));
        }

        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            let memory = alloc(index).map_err(|source| {
                log::error!(
                    "allocation of {} buffer {} failed, releasing {} buffers",
                    self.port,
                    index,
                    buffers.len()
                );
                Error::AllocationFailed {
                    port: self.port,
                    index,
                    source,
                }
            })?;
            let mut buffer = Buffer::new(self.port, index, memory);
            buffer.generation = self.generation;
            buffers.push(Some(buffer));
        }

        self.slots = buffers;
        self.free = (0..count).collect();
        self.buffer_size = size;
        log::debug!("allocated {} {} buffers of {} bytes", count, self.port, size);

        Ok(())
    }

    /// Take the oldest free buffer out of the pool.
    pub fn acquire_free(&mut self) -> Result<Buffer> {
        let index = self.free.pop_front().ok_or(Error::PoolExhausted(self.port))?;
        let mut buffer = self
            .slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(Error::InvalidState("free index has no buffer"))?;
        buffer.reset();
        self.checked_out += 1;
        Ok(buffer)
    }

    /// Return a checked-out buffer to the pool as pending, i.e. owned by the device.
    pub fn mark_pending(&mut self, buffer: Buffer) -> Result<()> {
        let index = buffer.index();
        self.put_back(buffer)?;
        self.pending.push_back(index);
        Ok(())
    }

    /// Check out the pending buffer `index` because the device is done with it.
    pub fn complete(&mut self, index: u32) -> Result<Buffer> {
        self.remove_pending(index)?;
        let buffer = self
            .slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(Error::UnknownBuffer {
                port: self.port,
                index,
            })?;
        self.checked_out += 1;
        Ok(buffer)
    }

    /// Return a checked-out buffer to the free state.
    pub fn release(&mut self, buffer: Buffer) {
        let index = buffer.index();
        match self.put_back(buffer) {
            Ok(()) => self.free.push_back(index),
            Err(e) => log::debug!("dropping {} buffer {}: {}", self.port, index, e),
        }
    }

    /// Move every pending buffer to the free state. Used once the port has stopped streaming and
    /// the device has given all buffers back.
    pub fn return_pending_to_free(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.free.extend(pending);
    }

    /// Release the memory of every buffer of the pool.
    ///
    /// Must only be called once the device has been told to release its buffers. Buffers that are
    /// currently checked out become stale and are dropped when they are handed back.
    pub fn free(&mut self) {
        log::debug!(
            "freeing {} + {} {} buffers",
            self.free.len(),
            self.pending.len(),
            self.port
        );
        self.slots.clear();
        self.free.clear();
        self.pending.clear();
        self.checked_out = 0;
        self.buffer_size = 0;
        self.generation += 1;
    }

    fn remove_pending(&mut self, index: u32) -> Result<()> {
        let position = self
            .pending
            .iter()
            .position(|&i| i == index)
            .ok_or(Error::UnknownBuffer {
                port: self.port,
                index,
            })?;
        self.pending.remove(position);
        Ok(())
    }

    fn put_back(&mut self, buffer: Buffer) -> Result<()> {
        if buffer.generation != self.generation || buffer.port() != self.port {
            return Err(Error::InvalidState("buffer belongs to a previous allocation"));
        }
        let slot = self
            .slots
            .get_mut(buffer.index() as usize)
            .ok_or(Error::InvalidState("buffer index out of range"))?;
        if slot.is_some() {
            return Err(Error::InvalidState("buffer is already in the pool"));
        }
        *slot = Some(buffer);
        self.checked_out = self.checked_out.saturating_sub(1);
        Ok(())
    }
}
