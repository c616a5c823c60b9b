// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate drives stateful V4L2 memory-to-memory video codecs from user space, and runs
//! decode and encode test cases against them.
//!
//! A codec instance has two ports: the input port receives what must be processed (a bitstream
//! for a decoder, raw pictures for an encoder) and the output port returns the result. Buffers
//! cycle between the client and the device on both ports until the input ends, at which point the
//! device is drained: it is told to stop, and flags the last buffer it produces.
//!
//! # Anatomy of a session
//!
//! * [`device::CodecDevice`] is the contract with the device: formats, buffer requests, queueing,
//!   controls, commands and events. [`device::v4l2::V4l2Channel`] implements it on a video node.
//! * [`pool::BufferPool`] owns the buffers of one port, and tracks which are free and which are
//!   held by the device.
//! * [`poll::PollLoop`] runs a thread that dequeues completed buffers and events, and hands them to
//!   the session.
//! * [`session::CodecSession`] ties everything together. It is specialized for decoding by
//!   [`session::Decode`], which rebuilds the output port when the device reports a new format,
//!   and for encoding by [`session::Encode`].
//!
//! Input comes from a [`source::FrameSource`], and produced buffers can be written to a
//! [`dump::DumpSink`].
//!
//! # Running test cases
//!
//! [`config::TestCase`] describes a test case with the names used by test descriptions. It is
//! validated into a [`config::DecodeConfig`] or a [`config::EncodeConfig`], and run by a
//! [`runner::Harness`], which can run several cases one after the other or concurrently.

pub mod buffer;
pub mod config;
pub mod controls;
pub mod device;
pub mod dump;
pub mod error;
pub mod format;
pub mod poll;
pub mod pool;
pub mod region;
pub mod runner;
pub mod session;
pub mod source;

pub use v4l2r;

pub use error::Error;
pub use error::Result;
