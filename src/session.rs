// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec sessions.
//!
//! A [`CodecSession`] drives one codec instance through configuration, streaming, draining and
//! teardown. Behavior that differs between decoding and encoding is provided by a
//! [`PortEventPolicy`]: [`Decode`] reacts to source changes and dumps raw pictures, [`Encode`]
//! injects companion controls and may rewrite the produced bitstream.
//!
//! Two threads touch a session. The caller's thread runs the queueing loop of
//! [`decode`] or [`encode`], while the poll thread calls the session's [`CompletionListener`]
//! implementation for every completed buffer and event. Both go through the same lock, which
//! guards the buffer pools and the [`SessionFlags`].

pub mod decode;
pub mod encode;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;

pub use decode::Decode;
pub use encode::Encode;

use crate::buffer::Buffer;
use crate::buffer::BufferMemory;
use crate::buffer::MemoryKind;
use crate::controls::check_mandatory;
use crate::controls::CommandAction;
use crate::controls::Control;
use crate::controls::DynamicCommand;
use crate::controls::DynamicControl;
use crate::device::CodecCommand;
use crate::device::CodecDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceEvent;
use crate::dump::open_sink;
use crate::dump::DumpSink;
use crate::error::AllocationError;
use crate::error::Error;
use crate::error::FourCc;
use crate::error::Result;
use crate::format::CodecKind;
use crate::format::CodedFormat;
use crate::format::FrameLayout;
use crate::format::Port;
use crate::format::PortFormat;
use crate::format::RawFormat;
use crate::poll::CompletionListener;
use crate::poll::PollLoop;
use crate::pool::BufferPool;
use crate::region::MappedRegion;
use crate::region::RegionAllocator;

pub type DecodeSession<D> = CodecSession<D, Decode>;
pub type EncodeSession<D> = CodecSession<D, Encode>;

/// Default time the poll thread blocks waiting for the device.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Drain and reconfiguration progress, shared between the queueing loop and the poll thread.
///
/// A drain goes through `drain_sent` then `drain_last_seen`, and both are cleared together once
/// the queueing loop has observed the last buffer. A reconfiguration goes through
/// `reconfig_pending` then `reconfig_last_seen`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// The input ended before the output port was started.
    pub drain_postponed: bool,
    pub drain_sent: bool,
    pub drain_last_seen: bool,
    pub reconfig_pending: bool,
    pub reconfig_last_seen: bool,
    pub first_reconfig_seen: bool,
}

/// Per-port configuration and buffers.
#[derive(Debug)]
pub(crate) struct PortState {
    pub pool: BufferPool,
    pub format: PortFormat,
    /// Requested buffer count, replaced by the granted count after allocation.
    pub count: u32,
    pub min_count: u32,
    pub started: bool,
}

impl PortState {
    fn new(port: Port) -> Self {
        Self {
            pool: BufferPool::new(port),
            format: PortFormat::default(),
            count: 0,
            min_count: 0,
            started: false,
        }
    }
}

pub(crate) struct SessionState {
    pub input: PortState,
    pub output: PortState,
    pub flags: SessionFlags,
    pub input_dump: Option<Box<dyn DumpSink>>,
    pub output_dump: Option<Box<dyn DumpSink>>,
    /// Layout of the raw pictures produced on the output port.
    pub output_layout: FrameLayout,
}

impl SessionState {
    pub fn port(&self, port: Port) -> &PortState {
        match port {
            Port::Input => &self.input,
            Port::Output => &self.output,
        }
    }

    pub fn port_mut(&mut self, port: Port) -> &mut PortState {
        match port {
            Port::Input => &mut self.input,
            Port::Output => &mut self.output,
        }
    }
}

/// Behavior specific to one direction of coding.
pub trait PortEventPolicy: Send + Sync + 'static {
    const KIND: CodecKind;

    /// Update the session flags in reaction to a device event. Called on the poll thread.
    fn on_event(&self, _event: DeviceEvent, _flags: &mut SessionFlags) {}

    /// Write the content of a completed output buffer to `sink`.
    fn dump_output(
        &self,
        buffer: &Buffer,
        layout: &FrameLayout,
        sink: &mut dyn DumpSink,
    ) -> Result<()>;

    /// Controls that must be applied along with static control `control`.
    fn companion_controls(&self, _control: &Control) -> Vec<Control> {
        Vec::new()
    }
}

/// State reachable from the poll thread.
pub(crate) struct SessionCore<P> {
    state: Mutex<SessionState>,
    fatal: AtomicBool,
    policy: P,
}

impl<P> SessionCore<P> {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }
}

impl<P: PortEventPolicy> CompletionListener for SessionCore<P> {
    fn on_buffer_done(&self, done: DequeuedBuffer) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let pool = &mut state.port_mut(done.port).pool;
        let mut buffer = match pool.complete(done.index) {
            Ok(buffer) => buffer,
            // Dequeued right before the port was stopped, which already returned it.
            Err(Error::UnknownBuffer { .. }) => {
                if pool.is_free(done.index) {
                    debug!("ignoring stale {} buffer {}", done.port, done.index);
                } else {
                    warn!("ignoring {} buffer {} not owned by the device", done.port, done.index);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        buffer.bytes_used = done.bytes_used;
        buffer.data_offset = done.data_offset;
        buffer.flags = done.flags;
        buffer.timestamp = done.timestamp;

        let mut res = Ok(());
        if done.port == Port::Output {
            if buffer.bytes_used > 0 {
                if let Some(sink) = state.output_dump.as_deref_mut() {
                    res = self.policy.dump_output(&buffer, &state.output_layout, sink);
                }
            }

            if buffer.is_last() {
                let flags = &mut state.flags;
                if flags.reconfig_pending {
                    debug!("last buffer before reconfiguration");
                    flags.reconfig_last_seen = true;
                }
                if flags.drain_sent {
                    debug!("last buffer of drain");
                    flags.drain_last_seen = true;
                }
            }
        }

        state.port_mut(done.port).pool.release(buffer);
        res
    }

    fn on_event(&self, event: DeviceEvent) {
        self.policy.on_event(event, &mut self.lock().flags);
    }

    fn on_error(&self, error: &Error) {
        error!("session failed: {}", error);
        self.fatal.store(true, Ordering::Release);
    }
}

/// A codec session on device `D`, specialized by policy `P`.
pub struct CodecSession<D: CodecDevice, P: PortEventPolicy> {
    device: Arc<D>,
    core: Arc<SessionCore<P>>,
    poll: Option<PollLoop>,
    poll_timeout: Duration,

    memory: MemoryKind,
    allocator: RegionAllocator,
    coded: CodedFormat,
    raw: RawFormat,
    width: u32,
    height: u32,
    /// Size of input buffers, if it must differ from what the device asks for.
    input_size_override: Option<u32>,
    /// Layout of the raw pictures fed to the input port.
    input_layout: FrameLayout,
    /// Time per frame, in seconds, as `(numerator, denominator)`.
    frame_interval: (u32, u32),

    static_controls: VecDeque<Control>,
    dynamic_controls: Vec<DynamicControl>,
    dynamic_commands: Vec<DynamicCommand>,
    /// Scheduled seeks, from trigger frame to target frame.
    seeks: BTreeMap<u32, u32>,
    /// Scheduled random seeks, by trigger frame.
    random_seeks: BTreeMap<u32, u32>,
}

/// Remove and return the target of the first entry of `map` if it is due at `frame`.
///
/// Only the earliest trigger is ever considered.
fn take_due(map: &mut BTreeMap<u32, u32>, frame: u32) -> Option<u32> {
    match map.first_key_value() {
        Some((&trigger, _)) if trigger == frame => map.pop_first().map(|(_, target)| target),
        _ => None,
    }
}

impl<D: CodecDevice, P: PortEventPolicy> CodecSession<D, P> {
    pub fn new(device: Arc<D>, policy: P, coded: CodedFormat, raw: RawFormat) -> Self {
        let state = SessionState {
            input: PortState::new(Port::Input),
            output: PortState::new(Port::Output),
            flags: SessionFlags::default(),
            input_dump: None,
            output_dump: None,
            output_layout: FrameLayout::default(),
        };

        Self {
            device,
            core: Arc::new(SessionCore {
                state: Mutex::new(state),
                fatal: AtomicBool::new(false),
                policy,
            }),
            poll: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            memory: MemoryKind::default(),
            allocator: RegionAllocator::default(),
            coded,
            raw,
            width: 0,
            height: 0,
            input_size_override: None,
            input_layout: FrameLayout::default(),
            frame_interval: (1, 30),
            static_controls: VecDeque::new(),
            dynamic_controls: Vec::new(),
            dynamic_commands: Vec::new(),
            seeks: BTreeMap::new(),
            random_seeks: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn coded_format(&self) -> CodedFormat {
        self.coded
    }

    pub fn raw_format(&self) -> RawFormat {
        self.raw
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn set_memory_kind(&mut self, memory: MemoryKind) {
        self.memory = memory;
    }

    pub fn set_allocator(&mut self, allocator: RegionAllocator) {
        self.allocator = allocator;
    }

    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    pub fn flags(&self) -> SessionFlags {
        self.core.lock().flags
    }

    /// Whether the poll thread observed an unrecoverable error.
    pub fn is_fatal(&self) -> bool {
        self.core.is_fatal()
    }

    fn check_fatal(&self) -> Result<()> {
        if self.core.is_fatal() {
            Err(Error::DeviceFault)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.core.lock()
    }

    /// Select `fourcc` on `port`, failing if the device does not enumerate it.
    pub fn set_codec_pixel_format(&mut self, port: Port, fourcc: u32) -> Result<PortFormat> {
        if !self.device.enum_formats(port)?.contains(&fourcc) {
            error!("{} is not supported on the {} port", FourCc(fourcc), port);
            return Err(Error::UnsupportedFormat(FourCc(fourcc), port));
        }

        let mut format = self.device.format(port)?;
        format.pixel_format = fourcc;
        let applied = self.device.set_format(port, &format)?;
        debug!("{} port format: {:?}", port, applied);
        self.lock().port_mut(port).format = applied;

        Ok(applied)
    }

    pub fn port_format(&self, port: Port) -> PortFormat {
        self.lock().port(port).format
    }

    pub fn start_poll_loop(&mut self) -> Result<()> {
        if self.poll.is_some() {
            return Ok(());
        }
        let listener = Arc::clone(&self.core) as Arc<dyn CompletionListener>;
        self.poll = Some(PollLoop::start(
            Arc::clone(&self.device),
            listener,
            self.poll_timeout,
        )?);
        Ok(())
    }

    pub fn stop_poll_loop(&mut self) {
        if let Some(mut poll) = self.poll.take() {
            poll.stop();
        }
    }

    /// Suspend completion processing without tearing anything down.
    pub fn pause(&self) {
        if let Some(poll) = &self.poll {
            poll.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(poll) = &self.poll {
            poll.resume();
        }
    }

    /// Store the controls to apply before streaming, along with their companions.
    ///
    /// Encoders must be given every control of [`crate::controls::MANDATORY_CONTROLS`].
    pub fn populate_static_controls(&mut self, controls: &[Control]) -> Result<()> {
        if P::KIND == CodecKind::Encoder {
            check_mandatory(controls)?;
        }

        for control in controls {
            self.static_controls.push_back(*control);
            self.static_controls
                .extend(self.core.policy.companion_controls(control));
        }
        Ok(())
    }

    pub fn pending_static_controls(&self) -> impl Iterator<Item = &Control> {
        self.static_controls.iter()
    }

    fn apply_control(&self, control: Control) -> Result<()> {
        info!("setting {} = {}", control.name(), control.value);
        self.device
            .set_control(control.id, control.value)
            .map_err(|e| {
                error!("failed to set {}: {}", control.name(), e);
                Error::ControlRejected {
                    id: control.id,
                    name: control.name(),
                    value: control.value,
                }
            })
    }

    /// Apply the static controls in order, stopping at the first rejection.
    pub fn apply_static_controls(&mut self) -> Result<()> {
        while let Some(control) = self.static_controls.pop_front() {
            self.apply_control(control)?;
        }
        Ok(())
    }

    pub fn set_dynamic_controls(&mut self, controls: Vec<DynamicControl>) {
        self.dynamic_controls = controls;
    }

    pub fn set_dynamic_commands(&mut self, commands: Vec<DynamicCommand>) {
        self.dynamic_commands = commands;
    }

    /// Apply, then forget, the dynamic controls tagged with `frame`.
    pub fn apply_dynamic_controls(&mut self, frame: u32) -> Result<()> {
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.dynamic_controls)
            .into_iter()
            .partition(|c| c.frame == frame);
        self.dynamic_controls = rest;

        for DynamicControl { control, .. } in due {
            debug!("frame {}: dynamic control {}", frame, control.name());
            self.apply_control(control)?;
        }
        Ok(())
    }

    /// Run, then forget, the dynamic commands tagged with `frame`. Seeks are only scheduled here,
    /// and performed by the queueing loop.
    pub fn apply_dynamic_commands(&mut self, frame: u32) -> Result<()> {
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.dynamic_commands)
            .into_iter()
            .partition(|c| c.frame == frame);
        self.dynamic_commands = rest;

        for command in due {
            debug!("frame {}: dynamic command {:?}", frame, command.action);
            match command.action {
                CommandAction::PauseUsec(usec) => std::thread::sleep(Duration::from_micros(usec)),
                CommandAction::IdrSeek(target) => self.schedule_seek(frame, target),
                CommandAction::RandomSeek(value) => {
                    self.random_seeks.insert(frame, value);
                }
            }
        }
        Ok(())
    }

    /// Seek the input to frame `target` when the frame counter reaches `trigger`.
    pub fn schedule_seek(&mut self, trigger: u32, target: u32) {
        self.seeks.insert(trigger, target);
    }

    /// Seek the input to a random frame when the frame counter reaches `trigger`.
    pub fn schedule_random_seek(&mut self, trigger: u32) {
        self.random_seeks.insert(trigger, 0);
    }

    pub fn pending_seeks(&self) -> &BTreeMap<u32, u32> {
        &self.seeks
    }

    pub fn set_buffer_count(&mut self, port: Port, count: u32) {
        self.lock().port_mut(port).count = count;
    }

    /// Buffer count of `port`: the requested count until allocation, then the granted one.
    pub fn buffer_count(&self, port: Port) -> u32 {
        self.lock().port(port).count
    }

    pub fn min_buffer_count(&self, port: Port) -> u32 {
        self.lock().port(port).min_count
    }

    pub fn set_input_size_override(&mut self, size: Option<u32>) {
        self.input_size_override = size;
    }

    /// Raise the requested count of `port` to its minimum.
    fn raise_to_minimum(&self, port: Port, min_count: u32) {
        let mut state = self.lock();
        let port_state = state.port_mut(port);
        port_state.min_count = min_count;
        if port_state.count < min_count {
            info!(
                "raising {} buffer count from {} to {}",
                port, port_state.count, min_count
            );
            port_state.count = min_count;
        }
    }

    /// Request buffers from the device and allocate their memory.
    ///
    /// On failure the device is told to release whatever it granted.
    pub fn allocate_port(&mut self, port: Port) -> Result<()> {
        let (count, size) = {
            let state = self.lock();
            let port_state = state.port(port);
            let mut size = port_state.format.size_image;
            if port == Port::Input {
                if let Some(size_override) = self.input_size_override {
                    size = size.max(size_override);
                }
            }
            (port_state.count.max(port_state.min_count), size as usize)
        };

        let granted = self.device.request_buffers(port, self.memory, count)?;
        info!("{} {} buffers granted ({} requested)", granted, port, count);

        let device = &self.device;
        let allocator = &self.allocator;
        let memory = self.memory;
        let res = {
            let mut state = self.lock();
            let port_state = state.port_mut(port);
            port_state.count = granted;
            port_state
                .pool
                .allocate(granted, size, |index| match memory {
                    MemoryKind::DmaBuf => {
                        let region = allocator.allocate(size as u64)?;
                        let mapping = region.map()?;
                        Ok(BufferMemory::Shared { region, mapping })
                    }
                    MemoryKind::Mmap => {
                        let (exported, len) =
                            device.export_buffer(port, index).map_err(|e| match e {
                                Error::DeviceRejected { errno, .. } => AllocationError::Device(errno),
                                _ => AllocationError::Device(libc::EIO),
                            })?;
                        let mapping = MappedRegion::new(exported.as_fd(), 0, len)?;
                        Ok(BufferMemory::Mapped { exported, mapping })
                    }
                })
        };

        if res.is_err() {
            if let Err(e) = self.device.request_buffers(port, self.memory, 0) {
                warn!("failed to release {} buffers after error: {}", port, e);
            }
        }
        res
    }

    /// Release the buffers of `port`. The port must not be streaming.
    pub fn free_port(&mut self, port: Port) -> Result<()> {
        if self.lock().port(port).started {
            error!("cannot free the {} port while it is streaming", port);
            return Err(Error::InvalidState("port is streaming"));
        }

        self.device.request_buffers(port, self.memory, 0)?;
        self.lock().port_mut(port).pool.free();
        Ok(())
    }

    pub fn start_port(&mut self, port: Port) -> Result<()> {
        self.device.stream_on(port)?;
        self.lock().port_mut(port).started = true;
        info!("{} port started", port);
        Ok(())
    }

    /// Stop streaming on `port`. Every buffer the device held becomes free.
    pub fn stop_port(&mut self, port: Port) -> Result<()> {
        self.device.stream_off(port)?;
        let mut state = self.lock();
        let port_state = state.port_mut(port);
        port_state.pool.return_pending_to_free();
        port_state.started = false;
        info!("{} port stopped", port);
        Ok(())
    }

    pub fn is_port_started(&self, port: Port) -> bool {
        self.lock().port(port).started
    }

    /// Open dump sinks for the raw traffic of each port. Failing to open one is not fatal.
    pub fn set_dump(&mut self, input: Option<&Path>, output: Option<&Path>) {
        let input = input.and_then(open_sink);
        let output = output.and_then(open_sink);
        let mut state = self.lock();
        state.input_dump = input;
        state.output_dump = output;
    }

    /// Poll `condition` every `interval`, up to `retries` times.
    fn wait_for<F>(
        &self,
        what: &'static str,
        interval: Duration,
        retries: u32,
        mut condition: F,
    ) -> Result<()>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let log_every = retries / 10 + 1;
        for retry in 0..retries {
            self.check_fatal()?;
            if condition(&self.lock()) {
                return Ok(());
            }
            std::thread::sleep(interval);
            if retry % log_every == 0 {
                debug!("waiting for {}: {} tries", what, retry);
            }
        }

        error!("gave up waiting for {} after {} tries", what, retries);
        Err(Error::Timeout(what))
    }

    fn send_command(&self, command: CodecCommand) -> Result<()> {
        debug!("sending {:?}", command);
        self.device.command(P::KIND, command)
    }

    /// Queue every free output buffer. With `up_to_minimum`, nothing is queued once the device
    /// holds at least its minimum number of output buffers.
    fn enqueue_free_outputs(&self, up_to_minimum: bool) -> Result<()> {
        let mut state = self.lock();
        let output = &mut state.output;
        if up_to_minimum && output.pool.pending_count() >= output.min_count as usize {
            return Ok(());
        }

        while output.pool.free_count() > 0 {
            let mut buffer = output.pool.acquire_free()?;
            buffer.bytes_used = buffer.capacity() as u32;
            buffer.data_offset = 0;
            if let Err(e) = self.device.enqueue(&buffer) {
                output.pool.release(buffer);
                return Err(e);
            }
            output.pool.mark_pending(buffer)?;
        }
        Ok(())
    }

    fn acquire_input(&self) -> Result<Buffer> {
        self.lock().input.pool.acquire_free()
    }

    fn release_input(&self, buffer: Buffer) {
        self.lock().input.pool.release(buffer);
    }

    /// Queue a filled input buffer, writing its payload to the input dump first.
    fn queue_input(&self, buffer: Buffer) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(sink) = state.input_dump.as_deref_mut() {
            if buffer.bytes_used > 0 {
                if let Err(e) = sink.write(buffer.payload()) {
                    warn!("failed to dump input buffer {}: {}", buffer.index(), e);
                }
            }
        }

        match self.device.enqueue(&buffer) {
            Ok(()) => state.input.pool.mark_pending(buffer),
            Err(e) => {
                state.input.pool.release(buffer);
                Err(e)
            }
        }
    }

    /// Ask the device to flush its pending output.
    fn start_drain(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.flags.drain_postponed = false;
            state.flags.drain_sent = true;
        }
        info!("draining");
        self.send_command(CodecCommand::Stop)
    }

    /// Restart the input port, dropping whatever the device had not consumed yet.
    fn restart_input(&mut self) -> Result<()> {
        self.stop_port(Port::Input)?;
        self.start_port(Port::Input)
    }

    /// Finish a drain once its last buffer has been seen: clear the drain flags and resume the
    /// device. Returns `false` if the last buffer has not arrived yet.
    fn complete_drain(&self) -> Result<bool> {
        {
            let mut state = self.lock();
            if !state.flags.drain_last_seen {
                return Ok(false);
            }
            state.flags.drain_last_seen = false;
            state.flags.drain_sent = false;
        }
        info!("drain complete");
        self.send_command(CodecCommand::Start)?;
        Ok(true)
    }

    /// Tear down everything that was set up, in order: streaming, poll thread, buffers.
    ///
    /// Every step is attempted even if a previous one failed. The first error is returned.
    pub fn deinit(&mut self) -> Result<()> {
        let mut first_error = None;
        let mut record = |res: Result<()>| {
            if let Err(e) = res {
                error!("teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        for port in Port::ALL {
            if self.is_port_started(port) {
                record(self.stop_port(port));
            }
        }
        self.stop_poll_loop();
        for port in Port::ALL {
            let (started, allocated) = {
                let state = self.lock();
                let port_state = state.port(port);
                (port_state.started, port_state.pool.is_allocated())
            };
            // Buffers of a port that failed to stop are left to the device.
            if allocated && !started {
                record(self.free_port(port));
            }
        }
        {
            let mut state = self.lock();
            state.input_dump = None;
            state.output_dump = None;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::CID_BITRATE;
    use crate::controls::CID_BITRATE_MODE;
    use crate::controls::CID_FRAME_RC_ENABLE;
    use crate::controls::CID_FRAME_SKIP_MODE;
    use crate::controls::CID_H264_LEVEL;
    use crate::controls::CID_H264_PROFILE;
    use crate::controls::CID_HEADER_MODE;
    use crate::controls::FRAME_SKIP_MODE_DISABLED;
    use crate::device::fake::FakeCodec;

    fn encode_session() -> (Arc<FakeCodec>, EncodeSession<FakeCodec>) {
        let device = Arc::new(FakeCodec::new(CodecKind::Encoder));
        let mut session = CodecSession::new(
            Arc::clone(&device),
            Encode::default(),
            CodedFormat::H264,
            RawFormat::Nv12,
        );
        session.set_allocator(RegionAllocator::MemFd);
        session.set_poll_timeout(Duration::from_millis(10));
        (device, session)
    }

    #[test]
    fn seeks_are_consumed_in_order() {
        let mut seeks = BTreeMap::from([(5, 2), (9, 1)]);
        assert_eq!(take_due(&mut seeks, 4), None);
        assert_eq!(take_due(&mut seeks, 9), None);
        assert_eq!(take_due(&mut seeks, 5), Some(2));
        assert_eq!(seeks, BTreeMap::from([(9, 1)]));
        assert_eq!(take_due(&mut seeks, 5), None);
        assert_eq!(take_due(&mut seeks, 9), Some(1));
        assert!(seeks.is_empty());
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let (_device, mut session) = encode_session();
        assert!(matches!(
            session.set_codec_pixel_format(Port::Input, CodedFormat::Vp9.fourcc()),
            Err(Error::UnsupportedFormat(_, Port::Input))
        ));
        let format = session
            .set_codec_pixel_format(Port::Output, CodedFormat::H264.fourcc())
            .unwrap();
        assert_eq!(format.pixel_format, CodedFormat::H264.fourcc());
        assert_eq!(session.port_format(Port::Output), format);
    }

    #[test]
    fn mandatory_and_companion_controls() {
        let (device, mut session) = encode_session();
        let mut controls = vec![
            Control::new(CID_H264_PROFILE, 4),
            Control::new(CID_H264_LEVEL, 15),
            Control::new(CID_BITRATE, 1_000_000),
            Control::new(CID_FRAME_RC_ENABLE, 1),
        ];
        assert!(matches!(
            session.populate_static_controls(&controls),
            Err(Error::MissingMandatoryControl("BitRateMode"))
        ));

        controls.push(Control::new(CID_BITRATE_MODE, 1));
        controls.push(Control::new(CID_HEADER_MODE, 1));
        session.populate_static_controls(&controls).unwrap();
        assert_eq!(session.pending_static_controls().count(), controls.len() + 1);

        session.apply_static_controls().unwrap();
        assert_eq!(session.pending_static_controls().count(), 0);
        let log = device.state().control_log.clone();
        let rc = log
            .iter()
            .position(|&(id, _)| id == CID_FRAME_RC_ENABLE)
            .unwrap();
        assert_eq!(log[rc + 1], (CID_FRAME_SKIP_MODE, FRAME_SKIP_MODE_DISABLED));
    }

    #[test]
    fn rejected_static_control_aborts() {
        let (device, mut session) = encode_session();
        device.state().rejected_controls.insert(CID_BITRATE);
        let controls = [
            Control::new(CID_H264_PROFILE, 4),
            Control::new(CID_BITRATE, 1_000_000),
            Control::new(CID_H264_LEVEL, 15),
            Control::new(CID_BITRATE_MODE, 1),
            Control::new(CID_HEADER_MODE, 1),
        ];
        session.populate_static_controls(&controls).unwrap();
        assert!(matches!(
            session.apply_static_controls(),
            Err(Error::ControlRejected {
                id: CID_BITRATE,
                ..
            })
        ));
        assert_eq!(device.state().control_log, vec![(CID_H264_PROFILE, 4)]);
    }

    #[test]
    fn dynamic_controls_apply_once() {
        let (device, mut session) = encode_session();
        session.set_dynamic_controls(vec![
            DynamicControl {
                frame: 2,
                control: Control::new(CID_BITRATE, 2_000_000),
            },
            DynamicControl {
                frame: 4,
                control: Control::new(CID_BITRATE, 500_000),
            },
        ]);

        for frame in [0, 1, 2, 2, 3, 4, 4] {
            session.apply_dynamic_controls(frame).unwrap();
        }
        assert_eq!(
            device.state().control_log,
            vec![(CID_BITRATE, 2_000_000), (CID_BITRATE, 500_000)]
        );
    }

    #[test]
    fn dynamic_commands_schedule_seeks() {
        let (_device, mut session) = encode_session();
        session.set_dynamic_commands(vec![
            DynamicCommand {
                frame: 3,
                action: CommandAction::IdrSeek(1),
            },
            DynamicCommand {
                frame: 3,
                action: CommandAction::PauseUsec(10),
            },
            DynamicCommand {
                frame: 6,
                action: CommandAction::RandomSeek(0),
            },
        ]);
        session.apply_dynamic_commands(3).unwrap();
        session.apply_dynamic_commands(3).unwrap();
        assert_eq!(session.pending_seeks(), &BTreeMap::from([(3, 1)]));
        session.apply_dynamic_commands(6).unwrap();
        assert_eq!(session.random_seeks.len(), 1);
        assert!(session.dynamic_commands.is_empty());
    }

    #[test]
    fn port_lifecycle() {
        let (device, mut session) = encode_session();
        session
            .set_codec_pixel_format(Port::Input, RawFormat::Nv12.fourcc())
            .unwrap();
        let format = PortFormat {
            pixel_format: RawFormat::Nv12.fourcc(),
            width: 64,
            height: 64,
            ..Default::default()
        };
        session.lock().input.format = device.set_format(Port::Input, &format).unwrap();
        session.set_buffer_count(Port::Input, 2);
        session.raise_to_minimum(Port::Input, 3);
        assert_eq!(session.buffer_count(Port::Input), 3);

        session.allocate_port(Port::Input).unwrap();
        assert_eq!(session.lock().input.pool.free_count(), 3);
        session.start_port(Port::Input).unwrap();
        assert!(matches!(
            session.free_port(Port::Input),
            Err(Error::InvalidState(_))
        ));

        session.stop_port(Port::Input).unwrap();
        session.free_port(Port::Input).unwrap();
        assert!(!session.lock().input.pool.is_allocated());
        assert_eq!(
            device.state().requests,
            vec![(Port::Input, 3), (Port::Input, 0)]
        );
    }

    #[test]
    fn mmap_buffers_are_exported() {
        let (device, mut session) = encode_session();
        session.set_memory_kind(MemoryKind::Mmap);
        session.lock().output.format = device.format(Port::Output).unwrap();
        session.set_buffer_count(Port::Output, 2);
        session.allocate_port(Port::Output).unwrap();

        let buffer = session.lock().output.pool.acquire_free().unwrap();
        assert_eq!(buffer.memory_kind(), MemoryKind::Mmap);
        assert_eq!(buffer.capacity(), 4096);
        session.lock().output.pool.release(buffer);
        session.deinit().unwrap();
    }

    #[test]
    fn deinit_tears_everything_down() {
        let (device, mut session) = encode_session();
        session.start_poll_loop().unwrap();
        session.lock().output.format.size_image = 4096;
        session.set_buffer_count(Port::Output, 2);
        session.allocate_port(Port::Output).unwrap();
        session.start_port(Port::Output).unwrap();

        session.deinit().unwrap();
        assert!(!session.is_port_started(Port::Output));
        assert!(session.poll.is_none());
        assert!(!session.lock().output.pool.is_allocated());
        assert_eq!(
            device.state().requests,
            vec![(Port::Output, 2), (Port::Output, 0)]
        );
    }
}
