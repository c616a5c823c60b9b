// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`CodecDevice`] implementation on top of a V4L2 memory-to-memory video node, using `v4l2r`.

use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;
use v4l2r::bindings;
use v4l2r::bindings::v4l2_capability;
use v4l2r::bindings::v4l2_decoder_cmd;
use v4l2r::bindings::v4l2_encoder_cmd;
use v4l2r::bindings::v4l2_event;
use v4l2r::bindings::v4l2_fmtdesc;
use v4l2r::bindings::v4l2_format;
use v4l2r::bindings::v4l2_frmsizeenum;
use v4l2r::bindings::v4l2_querymenu;
use v4l2r::bindings::v4l2_queryctrl;
use v4l2r::bindings::v4l2_rect;
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::bindings::v4l2_streamparm;
use v4l2r::device::poller::DeviceEvent as PollerEvent;
use v4l2r::device::poller::PollEvent;
use v4l2r::device::poller::Poller;
use v4l2r::device::poller::Waker;
pub use v4l2r::device::Device as V4l2Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::DeviceOpenError;
use v4l2r::ioctl::BufferFlags;
use v4l2r::ioctl::DqBufError;
use v4l2r::ioctl::DqBufIoctlError;
use v4l2r::ioctl::DqEventError;
use v4l2r::ioctl::EventType;
use v4l2r::ioctl::ExpbufFlags;
use v4l2r::ioctl::IntoErrno;
use v4l2r::ioctl::QueryCapError;
use v4l2r::ioctl::SelectionFlags;
use v4l2r::ioctl::SelectionTarget;
use v4l2r::ioctl::SelectionType;
use v4l2r::ioctl::SubscribeEventFlags;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::ioctl::V4l2PlanesWithBackingMut;
use v4l2r::memory::MemoryType;

use crate::buffer::Buffer;
use crate::buffer::MemoryKind;
use crate::controls::ControlRange;
use crate::device::formats_match;
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
use crate::format::Port;
use crate::format::PortFormat;

/// Number of `/dev/videoN` nodes examined when probing.
const MAX_VIDEO_NODES: u32 = 64;

/// Identifier of the waker used to interrupt a wait when the polled events must change.
const RECONFIGURE_WAKER: u32 = 1;

/// Builds a closure converting a `v4l2r` ioctl error into [`Error::DeviceRejected`].
fn rejected<E: IntoErrno>(request: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::rejected(request, e.into_errno())
}

fn memory_type(kind: MemoryKind) -> MemoryType {
    match kind {
        MemoryKind::Mmap => MemoryType::Mmap,
        MemoryKind::DmaBuf => MemoryType::DmaBuf,
    }
}

/// Streaming state of one port, as needed to decide what to poll for.
#[derive(Default)]
struct PortActivity {
    streaming: AtomicBool,
    queued: AtomicUsize,
    /// Set once the buffer flagged `LAST` has been dequeued, until the port restarts.
    drained: AtomicBool,
}

impl PortActivity {
    fn should_poll(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
            && self.queued.load(Ordering::Acquire) > 0
            && !self.drained.load(Ordering::Acquire)
    }
}

/// A V4L2 video node driven as a stateful codec.
pub struct V4l2Channel {
    device: Arc<V4l2Device>,
    path: PathBuf,
    /// Only used by the thread calling `wait`.
    poller: Mutex<Poller>,
    waker: Arc<Waker>,
    input: PortActivity,
    output: PortActivity,
}

impl V4l2Channel {
    /// Probe `/dev/video0` onwards and open the first node usable as a `kind` codec.
    pub fn open(kind: CodecKind) -> Result<Self> {
        for index in 0..MAX_VIDEO_NODES {
            let path = PathBuf::from(format!("/dev/video{}", index));
            if !path.exists() {
                continue;
            }

            match Self::open_node(&path, kind) {
                Ok(Some(channel)) => {
                    info!("opened {} as {:?}", path.display(), kind);
                    return Ok(channel);
                }
                Ok(None) => debug!("{} is not a {:?}", path.display(), kind),
                Err(e) => debug!("skipping {}: {}", path.display(), e),
            }
        }

        error!("no video node can act as a {:?}", kind);
        Err(Error::NoMatchingDevice)
    }

    /// Open `path` and return it if it can act as a `kind` codec.
    pub fn open_node(path: &Path, kind: CodecKind) -> Result<Option<Self>> {
        let device = match V4l2Device::open(path, DeviceConfig::new().non_blocking_dqbuf()) {
            Ok(device) => Arc::new(device),
            Err(DeviceOpenError::OpenError(e)) => return Err(Error::rejected("open", e as i32)),
            Err(DeviceOpenError::QueryCapError(QueryCapError::IoctlError(e))) => {
                return Err(Error::rejected("VIDIOC_QUERYCAP", e as i32))
            }
        };

        let caps: v4l2_capability =
            v4l2r::ioctl::querycap(&*device).map_err(rejected("VIDIOC_QUERYCAP"))?;
        let device_caps = if caps.capabilities & bindings::V4L2_CAP_DEVICE_CAPS != 0 {
            caps.device_caps
        } else {
            caps.capabilities
        };
        let required = bindings::V4L2_CAP_STREAMING | bindings::V4L2_CAP_VIDEO_M2M_MPLANE;
        if device_caps & required != required {
            return Ok(None);
        }

        let channel = Self::new(device, path.to_path_buf())?;
        let input = channel.enum_formats(Port::Input)?;
        let output = channel.enum_formats(Port::Output)?;
        if !formats_match(kind, &input, &output) {
            return Ok(None);
        }

        Ok(Some(channel))
    }

    fn new(device: Arc<V4l2Device>, path: PathBuf) -> Result<Self> {
        let poller_error = |e: nix::Error| Error::rejected("epoll", e as i32);

        let mut poller = Poller::new(Arc::clone(&device)).map_err(poller_error)?;
        poller
            .enable_event(PollerEvent::V4L2Event)
            .map_err(poller_error)?;
        let waker = poller.add_waker(RECONFIGURE_WAKER).map_err(poller_error)?;

        Ok(Self {
            device,
            path,
            poller: Mutex::new(poller),
            waker,
            input: Default::default(),
            output: Default::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn activity(&self, port: Port) -> &PortActivity {
        match port {
            Port::Input => &self.input,
            Port::Output => &self.output,
        }
    }

    /// Interrupt a pending `wait` so it picks up changes in what needs to be polled.
    fn poke(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("cannot wake up the poll thread: {}", e);
        }
    }

    /// Make the poller listen to exactly the ports that can currently complete buffers.
    fn sync_poller(&self, poller: &mut Poller) {
        for (port, event) in [
            (Port::Input, PollerEvent::OutputReady),
            (Port::Output, PollerEvent::CaptureReady),
        ] {
            let res = if self.activity(port).should_poll() {
                poller.enable_event(event)
            } else {
                poller.disable_event(event)
            };
            if let Err(e) = res {
                error!("cannot update polling of the {} port: {}", port, e);
            }
        }
    }

    fn raw_format(&self, port: Port) -> Result<v4l2_format> {
        v4l2r::ioctl::g_fmt(&*self.device, port.queue()).map_err(rejected("VIDIOC_G_FMT"))
    }
}

fn port_format(format: &v4l2_format) -> PortFormat {
    // SAFETY: all formats we query are of a multiplanar queue type.
    let pix_mp = unsafe { format.fmt.pix_mp };
    PortFormat {
        pixel_format: pix_mp.pixelformat,
        width: pix_mp.width,
        height: pix_mp.height,
        size_image: pix_mp.plane_fmt[0].sizeimage,
        bytes_per_line: pix_mp.plane_fmt[0].bytesperline,
    }
}

impl CodecDevice for V4l2Channel {
    fn enum_formats(&self, port: Port) -> Result<Vec<u32>> {
        let mut formats = Vec::new();
        for index in 0.. {
            match v4l2r::ioctl::enum_fmt::<v4l2_fmtdesc>(&*self.device, port.queue(), index) {
                Ok(desc) => formats.push(desc.pixelformat),
                // Enumeration ends with an error at the first invalid index.
                Err(_) => break,
            }
        }
        Ok(formats)
    }

    fn format(&self, port: Port) -> Result<PortFormat> {
        self.raw_format(port).map(|f| port_format(&f))
    }

    fn set_format(&self, port: Port, format: &PortFormat) -> Result<PortFormat> {
        let mut raw = self.raw_format(port)?;
        // SAFETY: the queue type is multiplanar, so `pix_mp` is the active member.
        unsafe {
            raw.fmt.pix_mp.pixelformat = format.pixel_format;
            raw.fmt.pix_mp.width = format.width;
            raw.fmt.pix_mp.height = format.height;
        }

        let applied: v4l2_format = v4l2r::ioctl::s_fmt(&mut Arc::clone(&self.device), raw)
            .map_err(rejected("VIDIOC_S_FMT"))?;
        Ok(port_format(&applied))
    }

    fn frame_size_range(&self, pixel_format: u32) -> Result<FrameSizeRange> {
        let sizes: v4l2_frmsizeenum =
            v4l2r::ioctl::enum_frame_sizes(&*self.device, 0, pixel_format.into())
                .map_err(rejected("VIDIOC_ENUM_FRAMESIZES"))?;

        // SAFETY: the active member of the union is given by `type_`.
        let range = unsafe {
            if sizes.type_ == bindings::v4l2_frmsizetypes_V4L2_FRMSIZE_TYPE_DISCRETE {
                let discrete = sizes.__bindgen_anon_1.discrete;
                FrameSizeRange {
                    min_width: discrete.width,
                    max_width: discrete.width,
                    min_height: discrete.height,
                    max_height: discrete.height,
                }
            } else {
                let stepwise = sizes.__bindgen_anon_1.stepwise;
                FrameSizeRange {
                    min_width: stepwise.min_width,
                    max_width: stepwise.max_width,
                    min_height: stepwise.min_height,
                    max_height: stepwise.max_height,
                }
            }
        };
        Ok(range)
    }

    fn request_buffers(&self, port: Port, memory: MemoryKind, count: u32) -> Result<u32> {
        let reqbufs: v4l2_requestbuffers =
            v4l2r::ioctl::reqbufs(&*self.device, port.queue(), memory_type(memory), count)
                .map_err(rejected("VIDIOC_REQBUFS"))?;

        if count == 0 {
            self.activity(port).queued.store(0, Ordering::Release);
            self.poke();
        }
        Ok(reqbufs.count)
    }

    fn export_buffer(&self, port: Port, index: u32) -> Result<(OwnedFd, u64)> {
        let buffer: V4l2Buffer =
            v4l2r::ioctl::querybuf(&*self.device, port.queue(), index as usize)
                .map_err(rejected("VIDIOC_QUERYBUF"))?;
        let length = *buffer.get_first_plane().length;

        let fd: OwnedFd = v4l2r::ioctl::expbuf(
            &*self.device,
            port.queue(),
            index as usize,
            0,
            ExpbufFlags::RDWR,
        )
        .map_err(rejected("VIDIOC_EXPBUF"))?;

        Ok((fd, length as u64))
    }

    fn enqueue(&self, buffer: &Buffer) -> Result<()> {
        let port = buffer.port();
        let mut v4l2_buffer = V4l2Buffer::new(
            port.queue(),
            buffer.index(),
            memory_type(buffer.memory_kind()),
        );

        if let V4l2PlanesWithBackingMut::DmaBuf(mut planes) =
            v4l2_buffer.planes_with_backing_iter_mut()
        {
            if let Some(mut plane) = planes.next() {
                plane.set_fd(buffer.fd().as_raw_fd());
            }
        }

        let plane = v4l2_buffer.get_first_plane_mut();
        *plane.length = buffer.capacity() as u32;
        *plane.bytesused = buffer.bytes_used;
        if let Some(data_offset) = plane.data_offset {
            *data_offset = buffer.data_offset;
        }
        v4l2_buffer.set_timestamp(bindings::timeval {
            tv_sec: buffer.timestamp.as_secs() as _,
            tv_usec: buffer.timestamp.subsec_micros() as _,
        });
        v4l2_buffer.set_flags(buffer.flags);

        let _: V4l2Buffer =
            v4l2r::ioctl::qbuf(&*self.device, v4l2_buffer).map_err(rejected("VIDIOC_QBUF"))?;

        let activity = self.activity(port);
        if activity.queued.fetch_add(1, Ordering::AcqRel) == 0 {
            self.poke();
        }
        Ok(())
    }

    fn dequeue(&self, port: Port) -> Result<Option<DequeuedBuffer>> {
        let activity = self.activity(port);
        if !activity.streaming.load(Ordering::Acquire) {
            return Ok(None);
        }

        let v4l2_buffer = match v4l2r::ioctl::dqbuf::<V4l2Buffer>(&*self.device, port.queue()) {
            Ok(buffer) => buffer,
            Err(DqBufError::IoctlError(DqBufIoctlError::Eos))
            | Err(DqBufError::IoctlError(DqBufIoctlError::NotReady)) => return Ok(None),
            Err(e) => return Err(Error::rejected("VIDIOC_DQBUF", e.into_errno())),
        };

        // Saturate in case the queue was reset by a concurrent stream-off.
        let _ = activity
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| q.checked_sub(1));

        let flags = v4l2_buffer.flags();
        if flags.contains(BufferFlags::LAST) {
            activity.drained.store(true, Ordering::Release);
        }

        let plane = v4l2_buffer.get_first_plane();
        let timestamp = v4l2_buffer.timestamp();
        Ok(Some(DequeuedBuffer {
            port,
            index: v4l2_buffer.index(),
            bytes_used: *plane.bytesused,
            data_offset: plane.data_offset.copied().unwrap_or(0),
            flags,
            timestamp: Duration::from_secs(timestamp.tv_sec as u64)
                + Duration::from_micros(timestamp.tv_usec as u64),
        }))
    }

    fn dequeue_event(&self) -> Result<Option<DeviceEvent>> {
        let event = match v4l2r::ioctl::dqevent::<v4l2_event>(&*self.device) {
            Ok(event) => event,
            Err(DqEventError::NotReady) => return Ok(None),
            Err(e) => return Err(Error::rejected("VIDIOC_DQEVENT", e.into_errno())),
        };

        let event = match event.type_ {
            bindings::V4L2_EVENT_SOURCE_CHANGE => {
                // SAFETY: `src_change` is the active member for this event type.
                let changes = unsafe { event.u.src_change.changes };
                DeviceEvent::SourceChange {
                    resolution: changes & bindings::V4L2_EVENT_SRC_CH_RESOLUTION != 0,
                }
            }
            bindings::V4L2_EVENT_EOS => DeviceEvent::Eos,
            other => DeviceEvent::Other(other),
        };
        Ok(Some(event))
    }

    fn stream_on(&self, port: Port) -> Result<()> {
        v4l2r::ioctl::streamon(&*self.device, port.queue()).map_err(rejected("VIDIOC_STREAMON"))?;
        let activity = self.activity(port);
        activity.drained.store(false, Ordering::Release);
        activity.streaming.store(true, Ordering::Release);
        self.poke();
        Ok(())
    }

    fn stream_off(&self, port: Port) -> Result<()> {
        v4l2r::ioctl::streamoff(&*self.device, port.queue())
            .map_err(rejected("VIDIOC_STREAMOFF"))?;
        let activity = self.activity(port);
        activity.streaming.store(false, Ordering::Release);
        activity.queued.store(0, Ordering::Release);
        activity.drained.store(false, Ordering::Release);
        self.poke();
        Ok(())
    }

    fn control(&self, id: u32) -> Result<i32> {
        v4l2r::ioctl::g_ctrl(&*self.device, id).map_err(rejected("VIDIOC_G_CTRL"))
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        v4l2r::ioctl::s_ctrl(&*self.device, id, value)
            .map(|_| ())
            .map_err(rejected("VIDIOC_S_CTRL"))
    }

    fn query_control(&self, id: u32) -> Result<ControlRange> {
        let (ctrl_id, flags) = v4l2r::ioctl::parse_ctrl_id_and_flags(id);
        let query: v4l2_queryctrl = v4l2r::ioctl::queryctrl(&*self.device, ctrl_id, flags)
            .map_err(rejected("VIDIOC_QUERYCTRL"))?;
        Ok(ControlRange {
            minimum: query.minimum,
            maximum: query.maximum,
            default: query.default_value,
        })
    }

    fn has_menu_entry(&self, id: u32, index: u32) -> bool {
        let res: std::result::Result<v4l2_querymenu, _> =
            v4l2r::ioctl::querymenu(&*self.device, id, index);
        res.is_ok()
    }

    fn command(&self, kind: CodecKind, command: CodecCommand) -> Result<()> {
        match kind {
            CodecKind::Decoder => {
                let cmd = v4l2_decoder_cmd {
                    cmd: match command {
                        CodecCommand::Start => bindings::V4L2_DEC_CMD_START,
                        CodecCommand::Stop => bindings::V4L2_DEC_CMD_STOP,
                    },
                    ..Default::default()
                };
                let _: v4l2_decoder_cmd = v4l2r::ioctl::decoder_cmd(&*self.device, cmd)
                    .map_err(rejected("VIDIOC_DECODER_CMD"))?;
            }
            CodecKind::Encoder => {
                let cmd = v4l2_encoder_cmd {
                    cmd: match command {
                        CodecCommand::Start => bindings::V4L2_ENC_CMD_START,
                        CodecCommand::Stop => bindings::V4L2_ENC_CMD_STOP,
                    },
                    ..Default::default()
                };
                let _: v4l2_encoder_cmd = v4l2r::ioctl::encoder_cmd(&*self.device, cmd)
                    .map_err(rejected("VIDIOC_ENCODER_CMD"))?;
            }
        }

        if command == CodecCommand::Start {
            self.output.drained.store(false, Ordering::Release);
            self.poke();
        }
        Ok(())
    }

    fn set_frame_interval(&self, port: Port, numerator: u32, denominator: u32) -> Result<()> {
        let timeperframe = bindings::v4l2_fract {
            numerator,
            denominator,
        };
        let mut parm = v4l2_streamparm {
            type_: port.queue() as u32,
            ..Default::default()
        };
        match port {
            Port::Input => {
                parm.parm.output = bindings::v4l2_outputparm {
                    timeperframe,
                    ..Default::default()
                }
            }
            Port::Output => {
                parm.parm.capture = bindings::v4l2_captureparm {
                    timeperframe,
                    ..Default::default()
                }
            }
        }

        let _: v4l2_streamparm =
            v4l2r::ioctl::s_parm(&*self.device, parm).map_err(rejected("VIDIOC_S_PARM"))?;
        Ok(())
    }

    fn set_crop(&self, port: Port, rect: CropRect) -> Result<CropRect> {
        let selection = match port {
            Port::Input => SelectionType::Output,
            Port::Output => SelectionType::Capture,
        };
        let rect = v4l2_rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        };
        let applied = v4l2r::ioctl::s_selection(
            &*self.device,
            selection,
            SelectionTarget::Crop,
            rect,
            SelectionFlags::empty(),
        )
        .map_err(rejected("VIDIOC_S_SELECTION"))?;

        Ok(CropRect {
            left: applied.left,
            top: applied.top,
            width: applied.width,
            height: applied.height,
        })
    }

    fn subscribe(&self, event: EventKind) -> Result<()> {
        v4l2r::ioctl::subscribe_event(
            &*self.device,
            event_type(event),
            SubscribeEventFlags::empty(),
        )
        .map_err(rejected("VIDIOC_SUBSCRIBE_EVENT"))
    }

    fn unsubscribe(&self, event: EventKind) -> Result<()> {
        v4l2r::ioctl::unsubscribe_event(&*self.device, event_type(event))
            .map_err(rejected("VIDIOC_UNSUBSCRIBE_EVENT"))
    }

    fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        self.sync_poller(&mut poller);

        let events = poller
            .poll(Some(timeout))
            .map_err(|e| Error::rejected("epoll_wait", e as i32))?;

        let mut readiness = Readiness::default();
        for event in events {
            match event {
                PollEvent::Device(PollerEvent::OutputReady) => readiness.input = true,
                PollEvent::Device(PollerEvent::CaptureReady) => readiness.output = true,
                PollEvent::Device(PollerEvent::V4L2Event) => readiness.event = true,
                // Polled events are synced on the next call.
                PollEvent::Waker(_) => (),
            }
        }
        Ok(readiness)
    }
}

fn event_type(event: EventKind) -> EventType {
    match event {
        EventKind::SourceChange => EventType::SourceChange(0),
        EventKind::Eos => EventType::Eos,
    }
}
