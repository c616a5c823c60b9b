// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding sessions.
//!
//! The output port of a decoder cannot be configured before the device has parsed enough of the
//! bitstream: it is started on the first source change event, and rebuilt on the following ones
//! once the device has returned the last buffer of the previous format.

use std::time::Duration;

use log::debug;
use log::info;
use log::warn;

use crate::buffer::Buffer;
use crate::controls::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::device::CodecCommand;
use crate::device::CodecDevice;
use crate::device::DeviceEvent;
use crate::device::EventKind;
use crate::dump::write_picture;
use crate::dump::DumpSink;
use crate::error::Error;
use crate::error::Result;
use crate::format::CodecKind;
use crate::format::FrameLayout;
use crate::format::Port;
use crate::format::RawFormat;
use crate::session::take_due;
use crate::session::CodecSession;
use crate::session::PortEventPolicy;
use crate::session::SessionFlags;
use crate::source::FrameSource;

pub const DECODER_MIN_INPUT_BUFFERS: u32 = 4;
pub const DECODER_MIN_OUTPUT_BUFFERS: u32 = 11;

const INPUT_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const INPUT_WAIT_RETRIES: u32 = 1000;
const SEEK_WAIT_INTERVAL: Duration = Duration::from_millis(10);
const SEEK_WAIT_RETRIES: u32 = 5;
const RANDOM_SEEK_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const RANDOM_SEEK_WAIT_RETRIES: u32 = 100;
const IDLE_INTERVAL: Duration = Duration::from_millis(10);
/// Bound on the iterations spent waiting for the last buffer of a drain, or for the output port
/// to start so that a postponed drain can be sent.
const IDLE_MAX_ITERATIONS: u32 = 1000;

/// Decoding policy: tracks source changes and dumps the visible part of decoded pictures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decode;

impl PortEventPolicy for Decode {
    const KIND: CodecKind = CodecKind::Decoder;

    fn on_event(&self, event: DeviceEvent, flags: &mut SessionFlags) {
        match event {
            DeviceEvent::SourceChange { resolution: true } => {
                info!("source change");
                flags.reconfig_pending = true;
                flags.first_reconfig_seen = true;
            }
            DeviceEvent::SourceChange { resolution: false } => {
                debug!("source change without resolution change");
            }
            DeviceEvent::Eos => debug!("end of stream event"),
            DeviceEvent::Other(kind) => debug!("ignoring event {}", kind),
        }
    }

    fn dump_output(
        &self,
        buffer: &Buffer,
        layout: &FrameLayout,
        sink: &mut dyn DumpSink,
    ) -> Result<()> {
        let data = match RawFormat::n(layout.pixel_format) {
            Some(RawFormat::Nv12) => buffer.data(),
            _ => buffer.payload(),
        };
        write_picture(sink, data, layout)?;
        Ok(())
    }
}

impl<D: CodecDevice> CodecSession<D, Decode> {
    /// Select the formats of both ports, subscribe to decoder events and start the poll thread.
    pub fn init(&mut self) -> Result<()> {
        self.set_codec_pixel_format(Port::Input, self.coded.fourcc())?;
        self.set_codec_pixel_format(Port::Output, self.raw.fourcc())?;
        self.device.subscribe(EventKind::SourceChange)?;
        self.device.subscribe(EventKind::Eos)?;
        self.start_poll_loop()
    }

    /// Stop the poll thread and drop the event subscriptions, after tearing everything down.
    pub fn close(&mut self) -> Result<()> {
        let res = self.deinit();
        for event in [EventKind::Eos, EventKind::SourceChange] {
            if let Err(e) = self.device.unsubscribe(event) {
                warn!("failed to unsubscribe from {:?}: {}", event, e);
            }
        }
        res
    }

    pub fn configure_input(&mut self) -> Result<()> {
        let mut format = self.device.format(Port::Input)?;
        format.width = self.width;
        format.height = self.height;
        if let Some(size) = self.input_size_override {
            format.size_image = size;
        }
        let applied = self.device.set_format(Port::Input, &format)?;
        info!(
            "input {}x{}, {} bytes per buffer",
            applied.width, applied.height, applied.size_image
        );

        self.lock().input.format = applied;
        self.raise_to_minimum(Port::Input, DECODER_MIN_INPUT_BUFFERS);
        Ok(())
    }

    pub fn configure_output(&mut self) -> Result<()> {
        let mut format = self.device.format(Port::Output)?;
        format.pixel_format = self.raw.fourcc();
        format.width = self.width;
        format.height = self.height;
        let applied = self.device.set_format(Port::Output, &format)?;

        let range = self.device.frame_size_range(applied.pixel_format)?;
        if !range.contains(self.width, self.height) {
            warn!(
                "{}x{} is outside of the supported range {:?}",
                self.width, self.height, range
            );
        }

        let layout = FrameLayout::from_format(&applied);
        info!(
            "output {}x{}, stride {}, scanline {}, {} bytes per buffer",
            applied.width, applied.height, layout.stride, layout.scanline, applied.size_image
        );
        let min_count = {
            let mut state = self.lock();
            state.output.format = applied;
            state.output_layout = layout;
            state.output.min_count.max(DECODER_MIN_OUTPUT_BUFFERS)
        };
        self.raise_to_minimum(Port::Output, min_count);
        Ok(())
    }

    /// Adopt another raw format if the device no longer offers the requested one.
    ///
    /// The replacement is the first enumerated format of the same family (bandwidth-compressed or
    /// linear). Returns whether the requested format was missing.
    pub fn detect_bit_depth_change(&mut self) -> Result<bool> {
        let formats = self.device.enum_formats(Port::Output)?;
        if formats.contains(&self.raw.fourcc()) {
            return Ok(false);
        }

        let compressed = self.raw.is_compressed();
        match formats
            .into_iter()
            .filter_map(RawFormat::n)
            .find(|f| f.is_compressed() == compressed)
        {
            Some(format) => {
                info!("bit depth change: {:?} replaces {:?}", format, self.raw);
                self.raw = format;
            }
            None => warn!("no replacement for unsupported format {:?}", self.raw),
        }
        Ok(true)
    }

    /// Adopt the resolution the device parsed from the bitstream, if it differs from ours.
    pub fn detect_resolution_change(&mut self) -> Result<bool> {
        let format = self.device.format(Port::Input)?;
        if (format.width, format.height) == (self.width, self.height) {
            return Ok(false);
        }

        info!(
            "resolution change from {}x{} to {}x{}",
            self.width, self.height, format.width, format.height
        );
        self.width = format.width;
        self.height = format.height;
        Ok(true)
    }

    fn configure_and_start_output(&mut self) -> Result<()> {
        self.configure_output()?;
        self.allocate_port(Port::Output)?;
        self.start_port(Port::Output)
    }

    /// Handle a source change once the device returned the last buffer of the previous format.
    ///
    /// Buffers are only rebuilt if the device needs more or larger ones, or if the picture format
    /// changed. Otherwise decoding simply resumes.
    fn reconfigure_output(&mut self) -> Result<()> {
        let latest = self.device.format(Port::Output)?;
        let latest_min_count =
            u32::try_from(self.device.control(CID_MIN_BUFFERS_FOR_CAPTURE)?).unwrap_or(0);
        let bit_depth_changed = self.detect_bit_depth_change()?;
        let resolution_changed = self.detect_resolution_change()?;

        let (min_count, size) = {
            let state = self.lock();
            (state.output.min_count, state.output.format.size_image)
        };
        info!(
            "reconfiguring output: min count {} -> {}, size {} -> {}",
            min_count, latest_min_count, size, latest.size_image
        );

        if latest_min_count <= min_count
            && latest.size_image <= size
            && !bit_depth_changed
            && !resolution_changed
        {
            return self.send_command(CodecCommand::Start);
        }

        self.stop_port(Port::Output)?;
        self.free_port(Port::Output)?;
        self.raise_to_minimum(Port::Output, min_count.max(latest_min_count));
        self.configure_and_start_output()
    }

    /// Decode `source` until it ends or `max_frames` units have been queued, then drain.
    ///
    /// Returns the number of input units queued to the device.
    pub fn run_until(
        &mut self,
        source: &mut dyn FrameSource,
        max_frames: Option<u32>,
    ) -> Result<u32> {
        let mut frame = 0u32;
        let mut queued = 0u32;
        let mut idle = 0u32;

        loop {
            self.check_fatal()?;
            self.apply_dynamic_commands(frame)?;

            if take_due(&mut self.random_seeks, frame).is_some() {
                self.wait_for(
                    "first source change",
                    RANDOM_SEEK_WAIT_INTERVAL,
                    RANDOM_SEEK_WAIT_RETRIES,
                    |state| state.flags.first_reconfig_seen,
                )?;
                self.restart_input()?;
                let target = source.random_seek()?;
                info!("random seek from frame {} to {}", frame, target);
                frame = target;
            }

            if let Some(target) = take_due(&mut self.seeks, frame) {
                self.wait_for(
                    "first source change",
                    SEEK_WAIT_INTERVAL,
                    SEEK_WAIT_RETRIES,
                    |state| state.flags.first_reconfig_seen,
                )?;
                self.restart_input()?;
                source.seek_to_frame(target)?;
                info!("seek from frame {} to {}", frame, target);
                frame = target;
            }

            let flags = self.flags();
            if flags.reconfig_pending {
                if !self.is_port_started(Port::Output) {
                    info!("first source change, starting output");
                    self.lock().flags.reconfig_pending = false;
                    self.configure_and_start_output()?;
                } else if flags.reconfig_last_seen {
                    {
                        let mut state = self.lock();
                        state.flags.reconfig_pending = false;
                        state.flags.reconfig_last_seen = false;
                    }
                    self.reconfigure_output()?;
                }
            }

            if self.is_port_started(Port::Output) {
                self.enqueue_free_outputs(true)?;
                if self.flags().drain_postponed {
                    self.start_drain()?;
                }
            }

            let flags = self.flags();
            if flags.drain_sent || flags.drain_postponed {
                if flags.drain_sent && self.complete_drain()? {
                    return Ok(queued);
                }
                idle += 1;
                if idle > IDLE_MAX_ITERATIONS {
                    return Err(Error::Timeout(if flags.drain_sent {
                        "last buffer of drain"
                    } else {
                        "output port to start"
                    }));
                }
                std::thread::sleep(IDLE_INTERVAL);
                continue;
            }

            self.wait_for(
                "free input buffer",
                INPUT_WAIT_INTERVAL,
                INPUT_WAIT_RETRIES,
                |state| state.input.pool.free_count() > 0,
            )?;
            let mut buffer = self.acquire_input()?;
            let layout = self.input_layout;
            let fill = match source.fill_next(buffer.data_mut(), &layout) {
                Ok(fill) => fill,
                Err(e) => {
                    self.release_input(buffer);
                    return Err(e);
                }
            };
            buffer.bytes_used = fill.bytes as u32;
            buffer.data_offset = 0;

            if fill.eos || max_frames.is_some_and(|max| frame >= max) {
                self.release_input(buffer);
                info!("end of input at frame {}", frame);
                if self.is_port_started(Port::Output) {
                    self.start_drain()?;
                } else {
                    info!("output not started yet, postponing drain");
                    self.lock().flags.drain_postponed = true;
                }
                // The end of input still counts as a frame for dynamic commands.
                frame += 1;
                continue;
            }

            self.queue_input(buffer)?;
            queued += 1;
            debug!("queued frame {}", frame);
            frame += 1;
        }
    }
}
