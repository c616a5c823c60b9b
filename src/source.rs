// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame sources feeding the input port of a session.
//!
//! A [`FrameSource`] yields one coded or raw unit per call and reports the end of the stream.
//! Two file-backed sources are provided: [`YuvFileSource`] for raw pictures to encode, and
//! [`IvfFileSource`] for VP8/VP9 bitstreams to decode.

use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use rand::Rng;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::byteorder::little_endian::U64;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::error::Error;
use crate::error::Result;
use crate::format::align;
use crate::format::FrameLayout;
use crate::format::RawFormat;

/// Result of [`FrameSource::fill_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fill {
    /// Number of bytes written at the start of the destination.
    pub bytes: usize,
    /// The source has no more units. `bytes` may still be non-zero.
    pub eos: bool,
}

pub trait FrameSource: Send {
    fn init(&mut self) -> Result<()>;
    /// Write the next unit into `dst`, laid out according to `layout` for raw pictures.
    fn fill_next(&mut self, dst: &mut [u8], layout: &FrameLayout) -> Result<Fill>;
    /// Make `frame` the next unit returned by `fill_next`.
    fn seek_to_frame(&mut self, frame: u32) -> Result<()>;
    /// Seek to a frame of the source's choosing and return it.
    fn random_seek(&mut self) -> Result<u32>;
    fn deinit(&mut self);
}

/// Sealed extension trait reading plain-old-data structures from any reader.
trait ReadObj: private::Sealed {
    fn read_obj<T: FromBytes + AsBytes>(&mut self) -> io::Result<T>;
}

mod private {
    pub trait Sealed {}
    impl<R: std::io::Read> Sealed for R {}
}

impl<R: Read> ReadObj for R {
    fn read_obj<T: FromBytes + AsBytes>(&mut self) -> io::Result<T> {
        let mut obj = T::new_zeroed();
        self.read_exact(obj.as_bytes_mut())?;
        Ok(obj)
    }
}

fn source_error(path: &Path, e: io::Error) -> Error {
    Error::Source(format!("{}: {}", path.display(), e))
}

/// Stride/scanline rule of one plane of a bandwidth-compressed layout.
#[derive(Clone, Copy)]
struct Dimension {
    pixel_alignment: u32,
    bytes_per_pixel_num: u32,
    bytes_per_pixel_den: u32,
    tile: u32,
    alignment: u32,
}

impl Dimension {
    const fn new(pixel_alignment: u32, num: u32, den: u32, tile: u32, alignment: u32) -> Self {
        Self {
            pixel_alignment,
            bytes_per_pixel_num: num,
            bytes_per_pixel_den: den,
            tile,
            alignment,
        }
    }

    fn apply(&self, pixels: u32) -> u32 {
        let value = ubwc_align(pixels, self.pixel_alignment) * self.bytes_per_pixel_num;
        let value = value.div_ceil(self.bytes_per_pixel_den);
        let value = value.div_ceil(self.tile);
        ubwc_align(value, self.alignment)
    }
}

/// Like [`align`], but zero stays zero.
fn ubwc_align(value: u32, to: u32) -> u32 {
    if value == 0 {
        0
    } else {
        align(value, to)
    }
}

/// `(stride, scanlines)` rules of the metadata and data planes, luma first.
const QC08C_PLANES: [(Dimension, Dimension); 4] = [
    (Dimension::new(1, 1, 1, 32, 64), Dimension::new(1, 1, 1, 8, 16)),
    (Dimension::new(128, 1, 1, 1, 128), Dimension::new(1, 1, 1, 1, 32)),
    (Dimension::new(1, 1, 2, 16, 64), Dimension::new(1, 1, 2, 8, 16)),
    (Dimension::new(1, 1, 1, 1, 128), Dimension::new(1, 1, 2, 1, 32)),
];

const QC10C_PLANES: [(Dimension, Dimension); 4] = [
    (Dimension::new(1, 1, 1, 48, 64), Dimension::new(1, 1, 1, 4, 16)),
    (Dimension::new(192, 4, 3, 1, 256), Dimension::new(1, 1, 1, 1, 16)),
    (Dimension::new(1, 1, 2, 24, 64), Dimension::new(1, 1, 2, 4, 16)),
    (Dimension::new(192, 4, 3, 1, 256), Dimension::new(1, 1, 2, 1, 16)),
];

const PLANE_SIZE_ALIGNMENT: u32 = 4096;

/// Size of one `width`x`height` picture in a bandwidth-compressed format, or `None` for linear
/// formats.
pub fn compressed_frame_size(format: RawFormat, width: u32, height: u32) -> Option<u32> {
    let planes = match format {
        RawFormat::Qc08c => &QC08C_PLANES,
        RawFormat::Qc10c => &QC10C_PLANES,
        _ => return None,
    };

    Some(
        planes
            .iter()
            .map(|(stride, scanlines)| {
                ubwc_align(
                    stride.apply(width) * scanlines.apply(height),
                    PLANE_SIZE_ALIGNMENT,
                )
            })
            .sum(),
    )
}

/// Raw pictures read from a headerless file.
///
/// NV12 pictures are stored packed in the file and laid out with the stride and scanline of the
/// destination. Bandwidth-compressed pictures are copied verbatim.
pub struct YuvFileSource {
    path: PathBuf,
    format: RawFormat,
    width: u32,
    height: u32,
    reader: Option<BufReader<File>>,
    frame_count: u32,
}

impl YuvFileSource {
    pub fn new(path: impl Into<PathBuf>, format: RawFormat, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            format,
            width,
            height,
            reader: None,
            frame_count: 0,
        }
    }

    /// Bytes of one picture in the file.
    fn frame_size(&self) -> usize {
        match compressed_frame_size(self.format, self.width, self.height) {
            Some(size) => size as usize,
            None => {
                let luma = self.width as usize * self.height as usize;
                luma + luma / 2
            }
        }
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        self.reader
            .as_mut()
            .ok_or(Error::InvalidState("frame source is not initialized"))
    }

    /// Read up to `buf.len()` bytes, returning how many were read before the end of the file.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let reader = self.reader()?;
        let mut read = 0;
        while read < buf.len() {
            match reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(source_error(&path, e)),
            }
        }
        Ok(read)
    }
}

impl FrameSource for YuvFileSource {
    fn init(&mut self) -> Result<()> {
        if !matches!(
            self.format,
            RawFormat::Nv12 | RawFormat::Qc08c | RawFormat::Qc10c
        ) {
            return Err(Error::Source(format!(
                "{:?} input is not supported",
                self.format
            )));
        }

        let file = File::open(&self.path).map_err(|e| source_error(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| source_error(&self.path, e))?
            .len();
        self.frame_count = (len / self.frame_size() as u64) as u32;
        self.reader = Some(BufReader::new(file));
        info!(
            "{}: {} {}x{} {:?} pictures",
            self.path.display(),
            self.frame_count,
            self.width,
            self.height,
            self.format
        );
        Ok(())
    }

    fn fill_next(&mut self, dst: &mut [u8], layout: &FrameLayout) -> Result<Fill> {
        let frame_size = self.frame_size();

        if self.format.is_compressed() {
            if dst.len() < frame_size {
                return Err(Error::Source(format!(
                    "picture of {} bytes does not fit in a {} bytes buffer",
                    frame_size,
                    dst.len()
                )));
            }
            let read = self.read_full(&mut dst[..frame_size])?;
            return Ok(Fill {
                bytes: frame_size,
                eos: read != frame_size,
            });
        }

        let mut picture = vec![0u8; frame_size];
        if self.read_full(&mut picture)? != frame_size {
            debug!("{}: end of file", self.path.display());
            return Ok(Fill {
                bytes: 0,
                eos: true,
            });
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let stride = (layout.stride as usize).max(width);
        let scanline = (layout.scanline as usize).max(height);
        let chroma_scanline = align((self.height + 1) / 2, 16) as usize;
        let used = stride * scanline + stride * chroma_scanline;
        if dst.len() < used {
            return Err(Error::Source(format!(
                "{}x{} picture needs {} bytes, buffer has {}",
                width,
                height,
                used,
                dst.len()
            )));
        }

        dst[..used].fill(0);
        let (luma, chroma) = picture.split_at(width * height);
        for (row, src) in luma.chunks_exact(width).enumerate() {
            dst[row * stride..row * stride + width].copy_from_slice(src);
        }
        let chroma_offset = stride * scanline;
        for (row, src) in chroma.chunks_exact(width).enumerate() {
            let start = chroma_offset + row * stride;
            dst[start..start + width].copy_from_slice(src);
        }

        Ok(Fill {
            bytes: used,
            eos: false,
        })
    }

    fn seek_to_frame(&mut self, frame: u32) -> Result<()> {
        let offset = frame as u64 * self.frame_size() as u64;
        let path = self.path.clone();
        self.reader()?
            .seek(SeekFrom::Start(offset))
            .map_err(|e| source_error(&path, e))?;
        Ok(())
    }

    fn random_seek(&mut self) -> Result<u32> {
        if self.frame_count == 0 {
            return Err(Error::Source(format!(
                "{} has no complete picture",
                self.path.display()
            )));
        }
        let frame = rand::thread_rng().gen_range(0..self.frame_count);
        self.seek_to_frame(frame)?;
        Ok(frame)
    }

    fn deinit(&mut self) {
        self.reader = None;
    }
}

const IVF_SIGNATURE: [u8; 4] = *b"DKIF";

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
struct IvfFileHeader {
    signature: [u8; 4],
    version: U16,
    header_size: U16,
    fourcc: [u8; 4],
    width: U16,
    height: U16,
    frame_rate: U32,
    time_scale: U32,
    frame_count: U32,
    unused: U32,
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
struct IvfFrameHeader {
    frame_size: U32,
    timestamp: U64,
}

/// VP8/VP9 frames read from an IVF container.
///
/// The file is indexed at `init`, which makes seeking to any frame possible.
pub struct IvfFileSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Offset and size of every frame payload.
    frames: Vec<(u64, usize)>,
    next: usize,
}

impl IvfFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            frames: Vec::new(),
            next: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn index(reader: &mut BufReader<File>) -> io::Result<Vec<(u64, usize)>> {
        let header: IvfFileHeader = reader.read_obj()?;
        if header.signature != IVF_SIGNATURE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing IVF signature",
            ));
        }
        debug!(
            "IVF {} {}x{}, {} frames announced",
            String::from_utf8_lossy(&header.fourcc),
            header.width.get(),
            header.height.get(),
            header.frame_count.get()
        );

        let mut offset = reader.seek(SeekFrom::Start(header.header_size.get() as u64))?;
        let len = reader.get_ref().metadata()?.len();
        let mut frames = Vec::new();
        while offset + std::mem::size_of::<IvfFrameHeader>() as u64 <= len {
            let frame: IvfFrameHeader = reader.read_obj()?;
            let payload = offset + std::mem::size_of::<IvfFrameHeader>() as u64;
            let size = frame.frame_size.get() as u64;
            if payload + size > len {
                // Truncated last frame.
                break;
            }
            frames.push((payload, size as usize));
            offset = reader.seek(SeekFrom::Start(payload + size))?;
        }
        Ok(frames)
    }
}

impl FrameSource for IvfFileSource {
    fn init(&mut self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| source_error(&self.path, e))?;
        let mut reader = BufReader::new(file);
        self.frames = Self::index(&mut reader).map_err(|e| source_error(&self.path, e))?;
        self.reader = Some(reader);
        self.next = 0;
        info!("{}: {} frames", self.path.display(), self.frames.len());
        Ok(())
    }

    fn fill_next(&mut self, dst: &mut [u8], _layout: &FrameLayout) -> Result<Fill> {
        let Some(&(offset, size)) = self.frames.get(self.next) else {
            return Ok(Fill {
                bytes: 0,
                eos: true,
            });
        };
        if size > dst.len() {
            return Err(Error::Source(format!(
                "frame {} of {} bytes does not fit in a {} bytes buffer",
                self.next,
                size,
                dst.len()
            )));
        }

        let path = self.path.clone();
        let reader = self
            .reader
            .as_mut()
            .ok_or(Error::InvalidState("frame source is not initialized"))?;
        reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| reader.read_exact(&mut dst[..size]))
            .map_err(|e| source_error(&path, e))?;
        self.next += 1;

        Ok(Fill {
            bytes: size,
            eos: false,
        })
    }

    fn seek_to_frame(&mut self, frame: u32) -> Result<()> {
        if frame as usize >= self.frames.len() {
            return Err(Error::Source(format!(
                "cannot seek to frame {} of {}",
                frame,
                self.frames.len()
            )));
        }
        self.next = frame as usize;
        Ok(())
    }

    fn random_seek(&mut self) -> Result<u32> {
        if self.frames.is_empty() {
            return Err(Error::Source("cannot seek in an empty stream".into()));
        }
        let frame = rand::thread_rng().gen_range(0..self.frames.len()) as u32;
        self.seek_to_frame(frame)?;
        Ok(frame)
    }

    fn deinit(&mut self) {
        self.reader = None;
        self.frames.clear();
    }
}

/// Scripted in-memory source for session tests.
#[cfg(test)]
pub(crate) struct TestSource {
    /// Number of units available before the end of the stream.
    pub units: u32,
    pub next: u32,
    pub seeks: Vec<u32>,
}

#[cfg(test)]
impl TestSource {
    pub fn new(units: u32) -> Self {
        Self {
            units,
            next: 0,
            seeks: Vec::new(),
        }
    }
}

#[cfg(test)]
impl FrameSource for TestSource {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn fill_next(&mut self, dst: &mut [u8], _layout: &FrameLayout) -> Result<Fill> {
        if self.next >= self.units {
            return Ok(Fill {
                bytes: 0,
                eos: true,
            });
        }
        let bytes = dst.len().min(16);
        dst[..bytes].fill(self.next as u8);
        self.next += 1;
        Ok(Fill { bytes, eos: false })
    }

    fn seek_to_frame(&mut self, frame: u32) -> Result<()> {
        self.seeks.push(frame);
        self.next = frame;
        Ok(())
    }

    fn random_seek(&mut self) -> Result<u32> {
        self.seek_to_frame(1)?;
        Ok(1)
    }

    fn deinit(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn nv12_layout(width: u32, height: u32, stride: u32, scanline: u32) -> FrameLayout {
        FrameLayout {
            pixel_format: RawFormat::Nv12.fourcc(),
            width,
            height,
            stride,
            scanline,
        }
    }

    #[test]
    fn compressed_sizes() {
        assert_eq!(compressed_frame_size(RawFormat::Qc08c, 64, 64), Some(20480));
        assert_eq!(compressed_frame_size(RawFormat::Nv12, 64, 64), None);
        assert!(compressed_frame_size(RawFormat::Qc10c, 64, 64).unwrap() % 4096 == 0);
    }

    #[test]
    fn yuv_pictures_are_strided() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Two 4x2 NV12 pictures: 8 luma + 4 chroma bytes each.
        let pictures: Vec<u8> = (0..24).collect();
        file.write_all(&pictures).unwrap();

        let mut source = YuvFileSource::new(file.path(), RawFormat::Nv12, 4, 2);
        source.init().unwrap();
        let layout = nv12_layout(4, 2, 8, 4);

        let mut dst = vec![0xaau8; 256];
        let fill = source.fill_next(&mut dst, &layout).unwrap();
        assert!(!fill.eos);
        // 8 * 4 luma bytes, then 16 chroma rows of 8 bytes.
        assert_eq!(fill.bytes, 8 * 4 + 8 * 16);
        assert_eq!(&dst[0..4], &[0, 1, 2, 3]);
        assert_eq!(&dst[4..8], &[0, 0, 0, 0]);
        assert_eq!(&dst[8..12], &[4, 5, 6, 7]);
        assert_eq!(&dst[32..36], &[8, 9, 10, 11]);

        source.seek_to_frame(1).unwrap();
        source.fill_next(&mut dst, &layout).unwrap();
        assert_eq!(&dst[0..4], &[12, 13, 14, 15]);

        let fill = source.fill_next(&mut dst, &layout).unwrap();
        assert_eq!(fill, Fill { bytes: 0, eos: true });
        assert!(source.random_seek().unwrap() < 2);
    }

    fn ivf_file(frames: &[&[u8]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let header = IvfFileHeader {
            signature: IVF_SIGNATURE,
            version: U16::new(0),
            header_size: U16::new(32),
            fourcc: *b"VP90",
            width: U16::new(64),
            height: U16::new(64),
            frame_rate: U32::new(30),
            time_scale: U32::new(1),
            frame_count: U32::new(frames.len() as u32),
            unused: U32::new(0),
        };
        file.write_all(header.as_bytes()).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let frame_header = IvfFrameHeader {
                frame_size: U32::new(frame.len() as u32),
                timestamp: U64::new(i as u64),
            };
            file.write_all(frame_header.as_bytes()).unwrap();
            file.write_all(frame).unwrap();
        }
        file
    }

    #[test]
    fn ivf_frames_and_seek() {
        let file = ivf_file(&[b"abc", b"defgh", b"ij"]);
        let mut source = IvfFileSource::new(file.path());
        source.init().unwrap();
        assert_eq!(source.frame_count(), 3);

        let layout = FrameLayout::default();
        let mut dst = [0u8; 16];
        let fill = source.fill_next(&mut dst, &layout).unwrap();
        assert_eq!(fill, Fill { bytes: 3, eos: false });
        assert_eq!(&dst[..3], b"abc");

        source.seek_to_frame(2).unwrap();
        let fill = source.fill_next(&mut dst, &layout).unwrap();
        assert_eq!(&dst[..fill.bytes], b"ij");
        assert!(source.fill_next(&mut dst, &layout).unwrap().eos);

        assert!(source.seek_to_frame(3).is_err());
        source.seek_to_frame(1).unwrap();
        let fill = source.fill_next(&mut dst, &layout).unwrap();
        assert_eq!(&dst[..fill.bytes], b"defgh");

        let mut small = [0u8; 2];
        source.seek_to_frame(0).unwrap();
        assert!(matches!(
            source.fill_next(&mut small, &layout),
            Err(Error::Source(_))
        ));
    }

    #[test]
    fn ivf_signature_is_checked() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let mut source = IvfFileSource::new(file.path());
        assert!(matches!(source.init(), Err(Error::Source(_))));
    }
}
