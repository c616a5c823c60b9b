// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ports, pixel formats and negotiated port formats.

use std::fmt;

use enumn::N;
use v4l2r::PixelFormat;
use v4l2r::QueueType;

/// One of the two data paths of a memory-to-memory codec.
///
/// `Input` is always the port the client feeds (V4L2 `OUTPUT_MPLANE`), and `Output` the port the
/// device produces into (V4L2 `CAPTURE_MPLANE`), regardless of whether the session decodes or
/// encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Input,
    Output,
}

impl Port {
    pub const ALL: [Port; 2] = [Port::Input, Port::Output];

    /// V4L2 queue backing this port.
    pub fn queue(self) -> QueueType {
        match self {
            Port::Input => QueueType::VideoOutputMplane,
            Port::Output => QueueType::VideoCaptureMplane,
        }
    }

    pub fn from_queue(queue: QueueType) -> Option<Self> {
        match queue {
            QueueType::VideoOutputMplane => Some(Port::Input),
            QueueType::VideoCaptureMplane => Some(Port::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Input => f.write_str("input"),
            Port::Output => f.write_str("output"),
        }
    }
}

/// Direction of a codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Decoder,
    Encoder,
}

impl CodecKind {
    /// Port carrying the compressed bitstream.
    pub fn coded_port(self) -> Port {
        match self {
            CodecKind::Decoder => Port::Input,
            CodecKind::Encoder => Port::Output,
        }
    }

    /// Port carrying raw or compressed-raw pictures.
    pub fn raw_port(self) -> Port {
        match self {
            CodecKind::Decoder => Port::Output,
            CodecKind::Encoder => Port::Input,
        }
    }
}

/// Bitstream formats recognized when probing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CodedFormat {
    H264 = PixelFormat::from_fourcc(b"H264").to_u32(),
    Hevc = PixelFormat::from_fourcc(b"HEVC").to_u32(),
    Vp9 = PixelFormat::from_fourcc(b"VP90").to_u32(),
    Vp8 = PixelFormat::from_fourcc(b"VP80").to_u32(),
    H263 = PixelFormat::from_fourcc(b"H263").to_u32(),
    Mpeg = PixelFormat::from_fourcc(b"MPEG").to_u32(),
}

impl CodedFormat {
    /// Parse a codec name as used in test-case configurations.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AVC" | "H264" => Some(CodedFormat::H264),
            "HEVC" | "H265" => Some(CodedFormat::Hevc),
            "VP9" => Some(CodedFormat::Vp9),
            "VP8" => Some(CodedFormat::Vp8),
            "H263" => Some(CodedFormat::H263),
            "MPEG" => Some(CodedFormat::Mpeg),
            _ => None,
        }
    }

    /// Prefix of codec-specific control names in the control tables.
    pub fn control_prefix(self) -> Option<&'static str> {
        match self {
            CodedFormat::H264 => Some("AVC"),
            CodedFormat::Hevc => Some("HEVC"),
            CodedFormat::Vp9 => Some("VP9"),
            _ => None,
        }
    }

    pub fn fourcc(self) -> u32 {
        self as u32
    }
}

/// Raw picture formats recognized when probing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum RawFormat {
    Nv12 = PixelFormat::from_fourcc(b"NV12").to_u32(),
    Nv21 = PixelFormat::from_fourcc(b"NV21").to_u32(),
    /// 8-bit bandwidth-compressed tiled NV12.
    Qc08c = PixelFormat::from_fourcc(b"Q08C").to_u32(),
    /// 10-bit bandwidth-compressed tiled P010.
    Qc10c = PixelFormat::from_fourcc(b"Q10C").to_u32(),
    Rgba32 = PixelFormat::from_fourcc(b"AB24").to_u32(),
}

impl RawFormat {
    /// Formats a device must offer on its raw port to be selected by probing.
    pub const PROBED: [RawFormat; 4] = [
        RawFormat::Nv12,
        RawFormat::Nv21,
        RawFormat::Qc08c,
        RawFormat::Qc10c,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NV12" => Some(RawFormat::Nv12),
            "NV21" => Some(RawFormat::Nv21),
            "QC08C" => Some(RawFormat::Qc08c),
            "QC10C" => Some(RawFormat::Qc10c),
            "RGBA32" => Some(RawFormat::Rgba32),
            _ => None,
        }
    }

    /// Whether this is a bandwidth-compressed (UBWC) layout rather than a linear one.
    pub fn is_compressed(self) -> bool {
        matches!(self, RawFormat::Qc08c | RawFormat::Qc10c)
    }

    /// Height alignment the encoder expects for input pictures of this format.
    pub fn scanline_alignment(self) -> u32 {
        match self {
            RawFormat::Nv12 | RawFormat::Qc08c => 32,
            RawFormat::Qc10c => 16,
            _ => 1,
        }
    }

    pub fn fourcc(self) -> u32 {
        self as u32
    }
}

pub fn align(value: u32, to: u32) -> u32 {
    if to <= 1 {
        value
    } else {
        value.div_ceil(to) * to
    }
}

/// Single-plane view of a multiplanar V4L2 format, as negotiated with the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFormat {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    /// Size in bytes of the first plane.
    pub size_image: u32,
    pub bytes_per_line: u32,
}

impl PortFormat {
    pub fn raw_format(&self) -> Option<RawFormat> {
        RawFormat::n(self.pixel_format)
    }
}

/// Memory layout of a raw picture inside a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub pixel_format: u32,
    /// Visible size.
    pub width: u32,
    pub height: u32,
    /// Bytes per luma row.
    pub stride: u32,
    /// Number of luma rows before the chroma plane starts.
    pub scanline: u32,
}

impl FrameLayout {
    pub fn from_format(format: &PortFormat) -> Self {
        let stride = format.bytes_per_line.max(format.width);
        let scanline = match format.raw_format() {
            Some(raw) => align(format.height, raw.scanline_alignment()),
            None => format.height,
        };
        Self {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            stride,
            scanline,
        }
    }

    /// Whether the padded layout is larger than the visible picture and needs cropping.
    pub fn needs_crop(&self) -> bool {
        self.stride > self.width || self.scanline > self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_queue_mapping() {
        assert_eq!(Port::Input.queue(), QueueType::VideoOutputMplane);
        assert_eq!(Port::Output.queue(), QueueType::VideoCaptureMplane);
        assert_eq!(Port::from_queue(QueueType::VideoCaptureMplane), Some(Port::Output));
        assert_eq!(Port::from_queue(QueueType::VideoCapture), None);
    }

    #[test]
    fn coded_and_raw_ports() {
        assert_eq!(CodecKind::Decoder.coded_port(), Port::Input);
        assert_eq!(CodecKind::Decoder.raw_port(), Port::Output);
        assert_eq!(CodecKind::Encoder.coded_port(), Port::Output);
        assert_eq!(CodecKind::Encoder.raw_port(), Port::Input);
    }

    #[test]
    fn format_lookup() {
        assert_eq!(CodedFormat::from_name("AVC"), Some(CodedFormat::H264));
        assert_eq!(
            CodedFormat::n(u32::from_le_bytes(*b"HEVC")),
            Some(CodedFormat::Hevc)
        );
        assert_eq!(RawFormat::from_name("QC10C"), Some(RawFormat::Qc10c));
        assert!(RawFormat::Qc08c.is_compressed());
        assert!(!RawFormat::Nv12.is_compressed());
        assert_eq!(RawFormat::n(0), None);
    }

    #[test]
    fn layout_alignment() {
        let format = PortFormat {
            pixel_format: RawFormat::Nv12.fourcc(),
            width: 1920,
            height: 1080,
            size_image: 0,
            bytes_per_line: 1920,
        };
        let layout = FrameLayout::from_format(&format);
        assert_eq!(layout.scanline, 1088);
        assert!(layout.needs_crop());

        let format = PortFormat {
            pixel_format: RawFormat::Qc10c.fourcc(),
            width: 64,
            height: 64,
            size_image: 0,
            bytes_per_line: 64,
        };
        assert!(!FrameLayout::from_format(&format).needs_crop());
        assert_eq!(align(5, 0), 5);
        assert_eq!(align(17, 16), 32);
    }
}
