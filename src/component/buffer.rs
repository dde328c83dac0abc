// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer headers exchanged with the component.

use std::ops::Deref;
use std::ops::DerefMut;

use bitflags::bitflags;

/// Identifier of a buffer, unique among the buffers allocated on a component.
pub type BufferId = u32;

bitflags! {
    /// Flags carried by a buffer header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 0x1;
        const STARTTIME = 0x2;
        const DECODEONLY = 0x4;
        const DATACORRUPT = 0x8;
        /// The buffer ends a frame.
        const ENDOFFRAME = 0x10;
        /// The buffer starts a frame that can be decoded on its own.
        const SYNCFRAME = 0x20;
        const EXTRADATA = 0x40;
        /// The buffer carries codec configuration rather than media data.
        const CODECCONFIG = 0x80;
    }
}

impl Default for BufferFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A buffer allocated by the component on one of its ports.
///
/// Whoever holds the header owns the buffer: handing it to the component is a move, and the
/// component gives it back through its buffer-done events.
#[derive(Debug)]
pub struct BufferHeader {
    pub id: BufferId,
    pub port: u32,
    /// Backing memory. Its length is the allocated size of the buffer.
    pub data: Vec<u8>,
    /// Start of the payload within `data`.
    pub offset: usize,
    pub filled_len: usize,
    /// Presentation timestamp, in ticks.
    pub timestamp: u64,
    /// Duration of the payload, in ticks.
    pub tick_count: u64,
    pub flags: BufferFlags,
}

impl BufferHeader {
    pub fn new(port: u32, id: BufferId, alloc_len: usize) -> Self {
        Self {
            id,
            port,
            data: vec![0; alloc_len],
            offset: 0,
            filled_len: 0,
            timestamp: 0,
            tick_count: 0,
            flags: BufferFlags::empty(),
        }
    }

    pub fn alloc_len(&self) -> usize {
        self.data.len()
    }

    /// Valid bytes of the buffer.
    pub fn payload(&self) -> &[u8] {
        let start = self.offset.min(self.data.len());
        let end = (start + self.filled_len).min(self.data.len());
        &self.data[start..end]
    }

    /// Number of bytes that can still be appended after the current payload.
    pub fn free_space(&self) -> usize {
        self.alloc_len().saturating_sub(self.offset + self.filled_len)
    }

    /// Appends as much of `src` as fits after the current payload and returns the number of bytes
    /// copied.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.free_space());
        let start = self.offset + self.filled_len;
        self.data[start..start + len].copy_from_slice(&src[..len]);
        self.filled_len += len;
        len
    }

    /// Clears the payload and metadata, keeping the memory.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.filled_len = 0;
        self.timestamp = 0;
        self.tick_count = 0;
        self.flags = BufferFlags::empty();
    }
}

/// A buffer currently owned by the caller.
///
/// Slots come out of `Port::acquire_buffer` and must go back through `Port::release_buffer`.
/// A slot carries the allocation generation it was acquired in, so that a slot released after
/// its port has been reallocated is recognized and dropped.
#[must_use = "slots must be released back to their port"]
#[derive(Debug)]
pub struct Slot {
    header: BufferHeader,
    generation: u64,
}

impl Slot {
    pub(crate) fn new(header: BufferHeader, generation: u64) -> Self {
        Self { header, generation }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn into_header(self) -> BufferHeader {
        self.header
    }
}

impl Deref for Slot {
    type Target = BufferHeader;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

impl DerefMut for Slot {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.header
    }
}
