// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error taxonomy shared by every layer of the codec client.
//!
//! Errors are grouped by how the queueing loop reacts to them: device rejections and integrity
//! errors are fatal, while [`Error::PoolExhausted`] and [`Error::ResourceExhausted`] are transient
//! conditions that only become fatal once a bounded wait gives up.

use std::io;

use thiserror::Error;

use crate::format::Port;
use crate::region::MapRegionError;
use crate::region::NewRegionError;

#[derive(Debug, Error)]
pub enum Error {
    /// A request sent to the device returned an error code.
    #[error("device rejected {request}: {}", io::Error::from_raw_os_error(*.errno))]
    DeviceRejected { request: &'static str, errno: i32 },
    #[error("no video device matches the requested codec configuration")]
    NoMatchingDevice,
    #[error("pixel format {0} is not supported on the {1} port")]
    UnsupportedFormat(FourCc, Port),
    #[error("no free buffer on the {0} port")]
    PoolExhausted(Port),
    #[error("device is not returning {0} buffers fast enough")]
    ResourceExhausted(Port),
    #[error("mandatory control {0} is missing")]
    MissingMandatoryControl(&'static str),
    #[error("control {name} (0x{id:x}) = {value} was rejected")]
    ControlRejected { id: u32, name: &'static str, value: i32 },
    #[error("malformed length-prefixed stream: cursor at {cursor}, expected {expected}")]
    MalformedStream { cursor: usize, expected: usize },
    #[error("failed to allocate buffer {index} on the {port} port: {source}")]
    AllocationFailed {
        port: Port,
        index: u32,
        #[source]
        source: AllocationError,
    },
    #[error("the device signalled a fatal error")]
    DeviceFault,
    #[error("buffer {index} on the {port} port is not pending")]
    UnknownBuffer { port: Port, index: u32 },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("frame source error: {0}")]
    Source(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Underlying reason for an [`Error::AllocationFailed`].
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("{0}")]
    Region(#[from] NewRegionError),
    #[error("{0}")]
    Map(#[from] MapRegionError),
    #[error("device refused to map the buffer: errno {0}")]
    Device(i32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::DeviceRejected`] from an errno-like value and log it.
    pub fn rejected(request: &'static str, errno: i32) -> Self {
        log::error!("{} failed: {}", request, io::Error::from_raw_os_error(errno));
        Error::DeviceRejected { request, errno }
    }
}

/// Helper to display a V4L2 fourcc code in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub u32);

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}
