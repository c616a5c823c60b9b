// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoding sessions.

use std::time::Duration;

use log::debug;
use log::info;
use log::warn;
use zerocopy::byteorder::big_endian::U32 as BeU32;
use zerocopy::FromBytes;

use crate::buffer::Buffer;
use crate::controls::Control;
use crate::controls::CID_FRAME_RC_ENABLE;
use crate::controls::CID_FRAME_SKIP_MODE;
use crate::controls::CID_H264_LEVEL;
use crate::controls::CID_HEVC_LEVEL;
use crate::controls::CID_HEVC_TIER;
use crate::controls::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::controls::CID_MIN_BUFFERS_FOR_OUTPUT;
use crate::controls::FRAME_SKIP_MODE_DISABLED;
use crate::device::CodecDevice;
use crate::device::CropRect;
use crate::dump::DumpSink;
use crate::error::Error;
use crate::error::Result;
use crate::format::CodecKind;
use crate::format::CodedFormat;
use crate::format::FrameLayout;
use crate::format::Port;
use crate::session::take_due;
use crate::session::CodecSession;
use crate::session::PortEventPolicy;
use crate::source::FrameSource;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const IDLE_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_MAX_ITERATIONS: u32 = 1000;

/// Rewrite a stream of big-endian 4-byte length-prefixed units into start-code delimited units.
///
/// The units must cover `data` exactly.
pub fn nal_to_annexb(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut cursor = 0;

    while cursor < data.len() {
        let length = BeU32::read_from_prefix(&data[cursor..]).ok_or(Error::MalformedStream {
            cursor,
            expected: data.len(),
        })?;
        cursor += std::mem::size_of::<BeU32>();

        let end = cursor + length.get() as usize;
        let unit = data.get(cursor..end).ok_or(Error::MalformedStream {
            cursor: end,
            expected: data.len(),
        })?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(unit);
        cursor = end;
    }

    Ok(out)
}

/// Encoding policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encode {
    /// Dump the produced bitstream with start codes instead of length prefixes.
    pub rewrite_nal_lengths: bool,
}

impl PortEventPolicy for Encode {
    const KIND: CodecKind = CodecKind::Encoder;

    fn dump_output(
        &self,
        buffer: &Buffer,
        _layout: &FrameLayout,
        sink: &mut dyn DumpSink,
    ) -> Result<()> {
        if self.rewrite_nal_lengths {
            sink.write(&nal_to_annexb(buffer.payload())?)?;
        } else {
            sink.write(buffer.payload())?;
        }
        Ok(())
    }

    fn companion_controls(&self, control: &Control) -> Vec<Control> {
        if control.id == CID_FRAME_RC_ENABLE && control.value != 0 {
            vec![Control::new(CID_FRAME_SKIP_MODE, FRAME_SKIP_MODE_DISABLED)]
        } else {
            Vec::new()
        }
    }
}

/// Menu controls whose value must be offered by the device, by codec.
fn validated_menu_controls(codec: CodedFormat) -> &'static [u32] {
    match codec {
        CodedFormat::H264 => &[CID_H264_LEVEL],
        CodedFormat::Hevc => &[CID_HEVC_LEVEL, CID_HEVC_TIER],
        _ => &[],
    }
}

impl<D: CodecDevice> CodecSession<D, Encode> {
    /// Select the formats of both ports and start the poll thread.
    pub fn init(&mut self) -> Result<()> {
        self.set_codec_pixel_format(Port::Output, self.coded.fourcc())?;
        self.set_codec_pixel_format(Port::Input, self.raw.fourcc())?;
        self.start_poll_loop()
    }

    pub fn configure_input(&mut self) -> Result<()> {
        let range = self.device.frame_size_range(self.raw.fourcc())?;
        if !range.contains(self.width, self.height) {
            warn!(
                "{}x{} is outside of the supported range {:?}",
                self.width, self.height, range
            );
        }

        let mut format = self.device.format(Port::Input)?;
        format.pixel_format = self.raw.fourcc();
        format.width = self.width;
        format.height = self.height;
        let applied = self.device.set_format(Port::Input, &format)?;

        let layout = FrameLayout::from_format(&applied);
        info!(
            "input {}x{}, stride {}, scanline {}",
            layout.width, layout.height, layout.stride, layout.scanline
        );
        if layout.needs_crop() {
            let crop = self.device.set_crop(
                Port::Input,
                CropRect {
                    left: 0,
                    top: 0,
                    width: self.width,
                    height: self.height,
                },
            )?;
            debug!("input crop: {:?}", crop);
        }
        self.input_layout = layout;
        self.lock().input.format = applied;

        let min_count = u32::try_from(self.device.control(CID_MIN_BUFFERS_FOR_OUTPUT)?).unwrap_or(0);
        self.raise_to_minimum(Port::Input, min_count);
        Ok(())
    }

    pub fn configure_output(&mut self) -> Result<()> {
        let mut format = self.device.format(Port::Output)?;
        format.pixel_format = self.coded.fourcc();
        format.width = self.width;
        format.height = self.height;
        let applied = self.device.set_format(Port::Output, &format)?;
        info!("output {} bytes per buffer", applied.size_image);
        self.lock().output.format = applied;

        let min_count =
            u32::try_from(self.device.control(CID_MIN_BUFFERS_FOR_CAPTURE)?).unwrap_or(0);
        self.raise_to_minimum(Port::Output, min_count);
        Ok(())
    }

    /// Set the frame rate to `numerator / denominator` frames per second.
    pub fn set_frame_rate(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        if numerator == 0 || denominator == 0 {
            return Err(Error::InvalidState("frame rate must be non-zero"));
        }
        self.device
            .set_frame_interval(Port::Output, denominator, numerator)?;
        self.frame_interval = (denominator, numerator);
        Ok(())
    }

    /// Set the rate at which the device is expected to process frames, in frames per second.
    pub fn set_operating_rate(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        if numerator == 0 || denominator == 0 {
            return Err(Error::InvalidState("operating rate must be non-zero"));
        }
        self.device
            .set_frame_interval(Port::Input, denominator, numerator)
    }

    /// Presentation time of `frame` at the configured frame rate.
    pub fn frame_timestamp(&self, frame: u32) -> Duration {
        let (numerator, denominator) = self.frame_interval;
        Duration::from_micros(frame as u64 * 1_000_000 * numerator as u64 / denominator as u64)
    }

    /// Check the pending level and tier controls against the menu entries the device offers.
    pub fn validate_static_controls(&self) -> Result<()> {
        let validated = validated_menu_controls(self.coded);
        for control in self
            .pending_static_controls()
            .filter(|c| validated.contains(&c.id))
        {
            let range = self.device.query_control(control.id)?;
            let valid = (range.minimum..=range.maximum).contains(&control.value)
                && u32::try_from(control.value)
                    .is_ok_and(|index| self.device.has_menu_entry(control.id, index));
            if !valid {
                warn!(
                    "{} = {} is not supported (range {:?})",
                    control.name(),
                    control.value,
                    range
                );
                return Err(Error::ControlRejected {
                    id: control.id,
                    name: control.name(),
                    value: control.value,
                });
            }
        }
        Ok(())
    }

    /// Encode `source` until it ends or `max_frames` frames have been queued, then drain.
    ///
    /// Returns the number of frames queued to the device.
    pub fn run_until(
        &mut self,
        source: &mut dyn FrameSource,
        max_frames: Option<u32>,
    ) -> Result<u32> {
        let mut frame = 0u32;
        let mut idle = 0u32;

        loop {
            self.check_fatal()?;

            if self.is_port_started(Port::Output) {
                self.enqueue_free_outputs(false)?;
            }

            if self.flags().drain_sent {
                if self.complete_drain()? {
                    return Ok(frame);
                }
                idle += 1;
                if idle > IDLE_MAX_ITERATIONS {
                    return Err(Error::Timeout("last buffer of drain"));
                }
                std::thread::sleep(IDLE_INTERVAL);
                continue;
            }

            self.apply_dynamic_commands(frame)?;
            if let Some(target) = take_due(&mut self.seeks, frame) {
                warn!("encoder ignores seek to frame {} at frame {}", target, frame);
            }
            if take_due(&mut self.random_seeks, frame).is_some() {
                warn!("encoder ignores random seek at frame {}", frame);
            }
            self.apply_dynamic_controls(frame)?;

            let (free, pending, min_count) = {
                let state = self.lock();
                (
                    state.input.pool.free_count(),
                    state.input.pool.pending_count(),
                    state.input.min_count as usize,
                )
            };
            if free == 0 {
                // Exhaustion is only fatal when the device holds fewer buffers than its minimum,
                // since it will not return any until it gets more. Otherwise the device is busy
                // and the loop waits for a completion, up to IDLE_MAX_ITERATIONS times.
                if pending < min_count || idle >= IDLE_MAX_ITERATIONS {
                    return Err(Error::ResourceExhausted(Port::Input));
                }
                idle += 1;
                std::thread::sleep(IDLE_INTERVAL);
                continue;
            }
            idle = 0;

            let mut buffer = self.acquire_input()?;
            let layout = self.input_layout;
            let fill = match source.fill_next(buffer.data_mut(), &layout) {
                Ok(fill) => fill,
                Err(e) => {
                    self.release_input(buffer);
                    return Err(e);
                }
            };

            if fill.eos || max_frames.is_some_and(|max| frame >= max) {
                self.release_input(buffer);
                info!("end of input at frame {}", frame);
                self.start_drain()?;
                continue;
            }

            buffer.bytes_used = fill.bytes as u32;
            buffer.data_offset = 0;
            buffer.timestamp = self.frame_timestamp(frame);
            self.queue_input(buffer)?;
            debug!("queued frame {}", frame);
            frame += 1;
        }
    }
}
