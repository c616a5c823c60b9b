// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sinks receiving the raw content of completed buffers.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::Mutex;

use log::error;
use log::info;

use crate::format::FrameLayout;
use crate::format::RawFormat;

/// Destination of dumped buffer content, written in completion order.
pub trait DumpSink: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

impl DumpSink for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Dump file, flushed after every write so that a crash leaves complete units behind.
pub struct FileDump {
    path: PathBuf,
    file: File,
}

impl FileDump {
    /// Create a dump file at `path`, or at a decorated variant of it if `path` is already used by
    /// another sink of this process.
    pub fn create_unique(path: &Path) -> io::Result<Self> {
        let path = unique_path(path)?;
        let file = File::create(&path)?;
        info!("dumping to {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DumpSink for FileDump {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()
    }
}

/// Number of sinks opened so far for each requested path.
static DUMP_NAMES: LazyLock<Mutex<HashMap<PathBuf, u32>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns `path` for its first use, then `name_1.ext`, `name_2.ext`... for the following ones.
///
/// The count restarts when the undecorated file no longer exists.
fn unique_path(path: &Path) -> io::Result<PathBuf> {
    let mut names = DUMP_NAMES.lock().unwrap_or_else(|e| e.into_inner());
    let count = names.entry(path.to_path_buf()).or_insert(0);
    if *count != 0 && !path.exists() {
        *count = 0;
    }

    let unique = if *count == 0 {
        path.to_path_buf()
    } else {
        let (Some(stem), Some(extension)) = (path.file_stem(), path.extension()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dump path {} has no extension", path.display()),
            ));
        };
        let mut name = stem.to_os_string();
        name.push(format!("_{}.", count));
        name.push(extension);
        path.with_file_name(name)
    };
    *count += 1;

    Ok(unique)
}

/// Open a sink for `path`, logging instead of failing when it cannot be created.
pub fn open_sink(path: &Path) -> Option<Box<dyn DumpSink>> {
    match FileDump::create_unique(path) {
        Ok(dump) => Some(Box::new(dump)),
        Err(e) => {
            error!("cannot open dump file {}: {}", path.display(), e);
            None
        }
    }
}

/// Write the visible part of a raw picture stored in `data` with `layout`.
///
/// NV12 pictures are written without their padding: `width` bytes of each luma row, then of each
/// chroma row, the chroma plane starting at `stride * scanline`. Other formats are written as is.
pub fn write_picture(sink: &mut dyn DumpSink, data: &[u8], layout: &FrameLayout) -> io::Result<()> {
    if RawFormat::n(layout.pixel_format) != Some(RawFormat::Nv12) {
        return sink.write(data);
    }

    let width = layout.width as usize;
    let height = layout.height as usize;
    let stride = layout.stride as usize;
    let chroma_offset = stride * layout.scanline as usize;

    let plane = |offset: usize, rows: usize| -> io::Result<Vec<&[u8]>> {
        (0..rows)
            .map(|row| {
                let start = offset + row * stride;
                data.get(start..start + width).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("picture row at {} is outside of the buffer", start),
                    )
                })
            })
            .collect()
    };

    if stride == width {
        let luma = width * height;
        let chroma = luma / 2;
        let chroma_rows = data
            .get(chroma_offset..chroma_offset + chroma)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        sink.write(data.get(..luma).ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?)?;
        return sink.write(chroma_rows);
    }

    for row in plane(0, height)? {
        sink.write(row)?;
    }
    for row in plane(chroma_offset, height / 2)? {
        sink.write(row)?;
    }
    Ok(())
}
