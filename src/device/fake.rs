// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scripted in-process codec used to exercise pools, the poll loop and sessions without hardware.
//!
//! Input buffers complete as soon as they are queued. Each processed input owes one output
//! buffer, produced as soon as an output buffer is queued. A decoder reports a resolution change
//! after its first input. A `Stop` command flags the next produced output with `LAST`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use v4l2r::ioctl::BufferFlags;

use crate::buffer::Buffer;
use crate::buffer::MemoryKind;
use crate::controls::ControlRange;
use crate::controls::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::controls::CID_MIN_BUFFERS_FOR_OUTPUT;
use crate::device::CodecCommand;
use crate::device::CodecDevice;
use crate::device::CropRect;
use crate::device::DequeuedBuffer;
use crate::device::DeviceEvent;
use crate::device::EventKind;
use crate::device::FrameSizeRange;
use crate::device::Readiness;
use crate::error::Error;
use crate::error::Result;
use crate::format::CodecKind;
use crate::format::CodedFormat;
use crate::format::Port;
use crate::format::PortFormat;
use crate::format::RawFormat;

/// Bytes "produced" in every output buffer.
pub(crate) const FAKE_OUTPUT_BYTES: u32 = 64;

fn slot(port: Port) -> usize {
    match port {
        Port::Input => 0,
        Port::Output => 1,
    }
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub formats: [Vec<u32>; 2],
    pub current: [PortFormat; 2],
    pub controls: HashMap<u32, i32>,
    pub ranges: HashMap<u32, ControlRange>,
    /// Menu entries the device rejects, as `(control, index)`.
    pub invalid_menu_entries: HashSet<(u32, u32)>,
    pub rejected_controls: HashSet<u32>,

    pub control_log: Vec<(u32, i32)>,
    pub commands: Vec<CodecCommand>,
    pub requests: Vec<(Port, u32)>,
    pub crops: Vec<CropRect>,
    pub frame_intervals: Vec<(Port, u32, u32)>,
    pub subscriptions: HashSet<EventKind>,
    pub queued_inputs: Vec<(u32, u32, Duration)>,

    streaming: [bool; 2],
    /// Output buffers owned by the device, by index.
    queued_outputs: VecDeque<u32>,
    done: [VecDeque<DequeuedBuffer>; 2],
    events: VecDeque<DeviceEvent>,
    owed_outputs: usize,
    last_pending: bool,
    /// Set once the decoder has raised its source change, or to suppress it.
    pub source_change_sent: bool,
}

pub(crate) struct FakeCodec {
    kind: CodecKind,
    state: Mutex<FakeState>,
    cond: Condvar,
}

impl FakeCodec {
    pub fn new(kind: CodecKind) -> Self {
        let coded = CodedFormat::H264.fourcc();
        let raw = RawFormat::Nv12.fourcc();
        let (input, output) = match kind {
            CodecKind::Decoder => (coded, raw),
            CodecKind::Encoder => (raw, coded),
        };

        let state = FakeState {
            formats: [vec![input], vec![output, RawFormat::Qc08c.fourcc()]],
            current: [
                PortFormat {
                    pixel_format: input,
                    ..Default::default()
                },
                PortFormat {
                    pixel_format: output,
                    ..Default::default()
                },
            ],
            controls: HashMap::from([
                (CID_MIN_BUFFERS_FOR_CAPTURE, 4),
                (CID_MIN_BUFFERS_FOR_OUTPUT, 4),
            ]),
            ..Default::default()
        };

        Self {
            kind,
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn is_streaming(&self, port: Port) -> bool {
        self.state().streaming[slot(port)]
    }

    /// Queue an arbitrary event, as if the device raised it.
    pub fn push_event(&self, event: DeviceEvent) {
        self.state().events.push_back(event);
        self.cond.notify_all();
    }

    fn produce_outputs(state: &mut FakeState) {
        if !state.streaming[slot(Port::Output)] {
            return;
        }

        while (state.owed_outputs > 0 || state.last_pending) && !state.queued_outputs.is_empty() {
            let Some(index) = state.queued_outputs.pop_front() else {
                break;
            };
            let mut flags = BufferFlags::empty();
            if state.owed_outputs > 0 {
                state.owed_outputs -= 1;
            }
            // The last buffer is produced once every owed output has been.
            if state.last_pending && state.owed_outputs == 0 {
                state.last_pending = false;
                flags |= BufferFlags::LAST;
            }
            state.done[slot(Port::Output)].push_back(DequeuedBuffer {
                port: Port::Output,
                index,
                bytes_used: FAKE_OUTPUT_BYTES,
                data_offset: 0,
                flags,
                timestamp: Duration::ZERO,
            });
        }
    }
}

fn einval(request: &'static str) -> Error {
    Error::DeviceRejected {
        request,
        errno: libc::EINVAL,
    }
}

impl CodecDevice for FakeCodec {
    fn enum_formats(&self, port: Port) -> Result<Vec<u32>> {
        Ok(self.state().formats[slot(port)].clone())
    }

    fn format(&self, port: Port) -> Result<PortFormat> {
        Ok(self.state().current[slot(port)])
    }

    fn set_format(&self, port: Port, format: &PortFormat) -> Result<PortFormat> {
        let mut state = self.state();
        if !state.formats[slot(port)].contains(&format.pixel_format) {
            return Err(einval("VIDIOC_S_FMT"));
        }

        let luma = format.width * format.height;
        let applied = PortFormat {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            size_image: (luma + luma / 2).max(4096),
            bytes_per_line: format.width,
        };
        state.current[slot(port)] = applied;
        Ok(applied)
    }

    fn frame_size_range(&self, _pixel_format: u32) -> Result<FrameSizeRange> {
        Ok(FrameSizeRange {
            min_width: 16,
            max_width: 8192,
            min_height: 16,
            max_height: 8192,
        })
    }

    fn request_buffers(&self, port: Port, _memory: MemoryKind, count: u32) -> Result<u32> {
        let mut state = self.state();
        state.requests.push((port, count));
        if count == 0 && port == Port::Output {
            state.queued_outputs.clear();
        }
        Ok(count)
    }

    fn export_buffer(&self, port: Port, _index: u32) -> Result<(OwnedFd, u64)> {
        let size = self.state().current[slot(port)].size_image.max(4096) as u64;
        let fd = memfd_create(c"fake-mmap", MemFdCreateFlag::empty())
            .map_err(|e| Error::rejected("memfd_create", e as i32))?;
        let file: File = fd.into();
        file.set_len(size)?;
        Ok((file.into(), size))
    }

    fn enqueue(&self, buffer: &Buffer) -> Result<()> {
        let mut state = self.state();
        let port = buffer.port();
        if !state.streaming[slot(port)] && port == Port::Input {
            return Err(einval("VIDIOC_QBUF"));
        }

        match port {
            Port::Input => {
                state
                    .queued_inputs
                    .push((buffer.index(), buffer.bytes_used, buffer.timestamp));
                state.done[slot(Port::Input)].push_back(DequeuedBuffer {
                    port,
                    index: buffer.index(),
                    bytes_used: buffer.bytes_used,
                    data_offset: 0,
                    flags: BufferFlags::empty(),
                    timestamp: buffer.timestamp,
                });
                if self.kind == CodecKind::Decoder && !state.source_change_sent {
                    state.source_change_sent = true;
                    state
                        .events
                        .push_back(DeviceEvent::SourceChange { resolution: true });
                }
                state.owed_outputs += 1;
            }
            Port::Output => state.queued_outputs.push_back(buffer.index()),
        }

        Self::produce_outputs(&mut state);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn dequeue(&self, port: Port) -> Result<Option<DequeuedBuffer>> {
        Ok(self.state().done[slot(port)].pop_front())
    }

    fn dequeue_event(&self) -> Result<Option<DeviceEvent>> {
        Ok(self.state().events.pop_front())
    }

    fn stream_on(&self, port: Port) -> Result<()> {
        let mut state = self.state();
        state.streaming[slot(port)] = true;
        Self::produce_outputs(&mut state);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn stream_off(&self, port: Port) -> Result<()> {
        let mut state = self.state();
        state.streaming[slot(port)] = false;
        state.done[slot(port)].clear();
        if port == Port::Output {
            state.queued_outputs.clear();
        }
        Ok(())
    }

    fn control(&self, id: u32) -> Result<i32> {
        self.state()
            .controls
            .get(&id)
            .copied()
            .ok_or_else(|| einval("VIDIOC_G_CTRL"))
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut state = self.state();
        if state.rejected_controls.contains(&id) {
            return Err(einval("VIDIOC_S_CTRL"));
        }
        state.control_log.push((id, value));
        state.controls.insert(id, value);
        Ok(())
    }

    fn query_control(&self, id: u32) -> Result<ControlRange> {
        Ok(self
            .state()
            .ranges
            .get(&id)
            .copied()
            .unwrap_or(ControlRange {
                minimum: 0,
                maximum: 20,
                default: 0,
            }))
    }

    fn has_menu_entry(&self, id: u32, index: u32) -> bool {
        !self.state().invalid_menu_entries.contains(&(id, index))
    }

    fn command(&self, kind: CodecKind, command: CodecCommand) -> Result<()> {
        assert_eq!(kind, self.kind);
        let mut state = self.state();
        state.commands.push(command);
        if command == CodecCommand::Stop {
            state.last_pending = true;
            Self::produce_outputs(&mut state);
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn set_frame_interval(&self, port: Port, numerator: u32, denominator: u32) -> Result<()> {
        self.state()
            .frame_intervals
            .push((port, numerator, denominator));
        Ok(())
    }

    fn set_crop(&self, _port: Port, rect: CropRect) -> Result<CropRect> {
        self.state().crops.push(rect);
        Ok(rect)
    }

    fn subscribe(&self, event: EventKind) -> Result<()> {
        self.state().subscriptions.insert(event);
        Ok(())
    }

    fn unsubscribe(&self, event: EventKind) -> Result<()> {
        self.state().subscriptions.remove(&event);
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let readiness = |state: &FakeState| Readiness {
            input: !state.done[slot(Port::Input)].is_empty(),
            output: !state.done[slot(Port::Output)].is_empty(),
            event: !state.events.is_empty(),
        };

        let state = self.state();
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |state| !readiness(state).any())
            .unwrap();
        Ok(readiness(&state))
    }
}
