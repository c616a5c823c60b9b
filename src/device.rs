// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device channel: the single point of contact with a hardware codec instance.
//!
//! [`CodecDevice`] is the request/response contract the sessions rely on. Every method takes
//! `&self` so that the poll thread can dequeue completions while the queueing loop keeps issuing
//! requests. The real implementation lives in [`v4l2`], on top of `v4l2r`.

use std::os::fd::OwnedFd;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::buffer::MemoryKind;
use crate::controls::ControlRange;
use crate::error::Result;
use crate::format::CodecKind;
use crate::format::CodedFormat;
use crate::format::Port;
use crate::format::PortFormat;
use crate::format::RawFormat;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "v4l2-device")]
pub mod v4l2;

/// Events the device can be asked to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SourceChange,
    Eos,
}

/// An event dequeued from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The output format must be renegotiated. `resolution` tells whether the resolution changed.
    SourceChange { resolution: bool },
    Eos,
    /// Any other event type, by V4L2 event number.
    Other(u32),
}

/// Codec-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecCommand {
    /// Resume after a drain or a reconfiguration.
    Start,
    /// Start draining: the device will flag the last output buffer with `LAST`.
    Stop,
}

/// Metadata of a buffer returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub port: Port,
    pub index: u32,
    pub bytes_used: u32,
    pub data_offset: u32,
    pub flags: v4l2r::ioctl::BufferFlags,
    pub timestamp: Duration,
}

impl DequeuedBuffer {
    pub fn is_last(&self) -> bool {
        self.flags.contains(v4l2r::ioctl::BufferFlags::LAST)
    }
}

/// What a call to [`CodecDevice::wait`] found ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub input: bool,
    pub output: bool,
    pub event: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.input || self.output || self.event
    }
}

/// Step-wise range of frame sizes supported for a pixel format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSizeRange {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

impl FrameSizeRange {
    pub fn contains(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Request/response contract with a stateful memory-to-memory codec.
///
/// Failures of the device are reported as [`crate::error::Error::DeviceRejected`].
pub trait CodecDevice: Send + Sync + 'static {
    /// Pixel formats the device enumerates on `port`.
    fn enum_formats(&self, port: Port) -> Result<Vec<u32>>;
    fn format(&self, port: Port) -> Result<PortFormat>;
    /// Apply `format` to `port` and return the format the device actually chose.
    fn set_format(&self, port: Port, format: &PortFormat) -> Result<PortFormat>;
    fn frame_size_range(&self, pixel_format: u32) -> Result<FrameSizeRange>;

    /// Size the device buffer bookkeeping of `port` to `count` buffers and return the granted
    /// count. `count == 0` releases all buffers.
    fn request_buffers(&self, port: Port, memory: MemoryKind, count: u32) -> Result<u32>;
    /// Export device-allocated buffer `index` of `port`, returning its descriptor and size.
    fn export_buffer(&self, port: Port, index: u32) -> Result<(OwnedFd, u64)>;
    /// Queue `buffer` to its port. The device only borrows the buffer memory.
    fn enqueue(&self, buffer: &Buffer) -> Result<()>;
    /// Dequeue one completed buffer of `port`, if any is ready.
    fn dequeue(&self, port: Port) -> Result<Option<DequeuedBuffer>>;
    /// Dequeue one pending event, if any.
    fn dequeue_event(&self) -> Result<Option<DeviceEvent>>;

    fn stream_on(&self, port: Port) -> Result<()>;
    fn stream_off(&self, port: Port) -> Result<()>;

    fn control(&self, id: u32) -> Result<i32>;
    fn set_control(&self, id: u32, value: i32) -> Result<()>;
    fn query_control(&self, id: u32) -> Result<ControlRange>;
    /// Whether `index` is a valid entry of menu control `id`.
    fn has_menu_entry(&self, id: u32, index: u32) -> bool;

    fn command(&self, kind: CodecKind, command: CodecCommand) -> Result<()>;
    /// Set the time per frame of `port` to `numerator / denominator` seconds.
    fn set_frame_interval(&self, port: Port, numerator: u32, denominator: u32) -> Result<()>;
    fn set_crop(&self, port: Port, rect: CropRect) -> Result<CropRect>;
    fn subscribe(&self, event: EventKind) -> Result<()>;
    fn unsubscribe(&self, event: EventKind) -> Result<()>;

    /// Block until a port has completed buffers, an event is pending, or `timeout` expires.
    fn wait(&self, timeout: Duration) -> Result<Readiness>;
}

/// Whether a device enumerating `input` and `output` formats can act as a `kind` codec.
///
/// The coded side must offer a known bitstream format and the raw side a probed picture format.
pub fn formats_match(kind: CodecKind, input: &[u32], output: &[u32]) -> bool {
    let (coded, raw) = match kind {
        CodecKind::Decoder => (input, output),
        CodecKind::Encoder => (output, input),
    };

    let has_coded = coded.iter().any(|&f| CodedFormat::n(f).is_some());
    let has_raw = raw
        .iter()
        .any(|&f| RawFormat::n(f).is_some_and(|r| RawFormat::PROBED.contains(&r)));

    has_coded && has_raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_matching() {
        let h264 = CodedFormat::H264.fourcc();
        let nv12 = RawFormat::Nv12.fourcc();
        let rgba = RawFormat::Rgba32.fourcc();

        assert!(formats_match(CodecKind::Decoder, &[h264], &[nv12]));
        assert!(!formats_match(CodecKind::Decoder, &[nv12], &[h264]));
        assert!(formats_match(CodecKind::Encoder, &[nv12], &[h264]));
        // RGBA output alone is not enough to select a device.
        assert!(!formats_match(CodecKind::Decoder, &[h264], &[rgba]));
        assert!(!formats_match(CodecKind::Encoder, &[], &[h264]));
    }

    #[test]
    fn frame_size_range() {
        let range = FrameSizeRange {
            min_width: 96,
            max_width: 8192,
            min_height: 96,
            max_height: 8192,
        };
        assert!(range.contains(1920, 1080));
        assert!(!range.contains(64, 64));
    }
}
