// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test-case execution.
//!
//! Each case goes through init, configure, stream and teardown on a device of its own. Teardown
//! always runs, whatever step failed, so that a failing case does not leave buffers or streaming
//! ports behind for the next one.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use log::error;
use log::info;

use crate::config::CaseConfig;
use crate::config::DecodeConfig;
use crate::config::EncodeConfig;
use crate::config::ExecutionMode;
use crate::config::TestCase;
use crate::device::CodecDevice;
use crate::format::CodecKind;
use crate::format::Port;
use crate::region::RegionAllocator;
use crate::session::CodecSession;
use crate::session::Decode;
use crate::session::DecodeSession;
use crate::session::Encode;
use crate::session::EncodeSession;
use crate::source::FrameSource;
use crate::source::IvfFileSource;
use crate::source::YuvFileSource;

/// Result of one test case: the number of frames queued, or what went wrong.
#[derive(Debug)]
pub struct CaseOutcome {
    pub name: String,
    pub result: anyhow::Result<u32>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of a run, in the order of the test cases.
#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<CaseOutcome>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(frames) => writeln!(
                    f,
                    "Testcase[ {} ] : Passed ({} frames)",
                    outcome.name, frames
                )?,
                Err(e) => writeln!(f, "Testcase[ {} ] : Failed: {:#}", outcome.name, e)?,
            }
        }
        write!(f, "{} passed, {} failed", self.passed(), self.failed())
    }
}

/// Runs test cases on devices opened by `open_device`.
pub struct Harness<F> {
    open_device: F,
    allocator: RegionAllocator,
    mode: ExecutionMode,
}

/// Harness opening the first matching V4L2 video node for every case.
#[cfg(feature = "v4l2-device")]
pub fn v4l2_harness() -> Harness<
    impl Fn(CodecKind) -> crate::error::Result<Arc<crate::device::v4l2::V4l2Channel>> + Sync,
> {
    Harness::new(|kind| crate::device::v4l2::V4l2Channel::open(kind).map(Arc::new))
}

impl<D, F> Harness<F>
where
    D: CodecDevice,
    F: Fn(CodecKind) -> crate::error::Result<Arc<D>> + Sync,
{
    pub fn new(open_device: F) -> Self {
        Self {
            open_device,
            allocator: RegionAllocator::default(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_allocator(mut self, allocator: RegionAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Decode `source` on `device` as described by `config`.
    pub fn run_decode(
        &self,
        device: Arc<D>,
        config: &DecodeConfig,
        source: &mut dyn FrameSource,
    ) -> anyhow::Result<u32> {
        let mut session = DecodeSession::new(device, Decode, config.coded, config.raw);
        session.set_memory_kind(config.memory);
        session.set_allocator(self.allocator.clone());
        session.set_poll_timeout(config.poll_timeout);

        let res = decode(&mut session, config, source);
        source.deinit();
        let teardown = session.close().context("while tearing down the decoder");
        let frames = res?;
        teardown?;
        Ok(frames)
    }

    /// Encode `source` on `device` as described by `config`.
    pub fn run_encode(
        &self,
        device: Arc<D>,
        config: &EncodeConfig,
        source: &mut dyn FrameSource,
    ) -> anyhow::Result<u32> {
        let policy = Encode {
            rewrite_nal_lengths: config.rewrite_nal_lengths,
        };
        let mut session = EncodeSession::new(device, policy, config.coded, config.raw);
        session.set_memory_kind(config.memory);
        session.set_allocator(self.allocator.clone());
        session.set_poll_timeout(config.poll_timeout);

        let res = encode(&mut session, config, source);
        source.deinit();
        let teardown = session.deinit().context("while tearing down the encoder");
        let frames = res?;
        teardown?;
        Ok(frames)
    }

    /// Validate `case`, open its device and input, and run it.
    pub fn run_case(&self, case: &TestCase) -> anyhow::Result<u32> {
        let config = case.validate().context("invalid test case")?;
        let device = (self.open_device)(case.kind).context("while opening the device")?;

        match config {
            CaseConfig::Decode(config) => {
                let mut source = IvfFileSource::new(&config.input_path);
                self.run_decode(device, &config, &mut source)
            }
            CaseConfig::Encode(config) => {
                let mut source = YuvFileSource::new(
                    &config.input_path,
                    config.raw,
                    config.width,
                    config.height,
                );
                self.run_encode(device, &config, &mut source)
            }
        }
    }

    fn outcome(&self, case: &TestCase, result: anyhow::Result<u32>) -> CaseOutcome {
        match &result {
            Ok(frames) => info!("Testcase[ {} ] : Passed, {} frames", case.name, frames),
            Err(e) => error!("Testcase[ {} ] : Failed: {:#}", case.name, e),
        }
        CaseOutcome {
            name: case.name.clone(),
            result,
        }
    }

    /// Run every case, one after the other or all at once depending on the execution mode.
    pub fn run_all(&self, cases: &[TestCase]) -> Report {
        let outcomes = match self.mode {
            ExecutionMode::Sequential => cases
                .iter()
                .map(|case| self.outcome(case, self.run_case(case)))
                .collect(),
            ExecutionMode::Concurrent => std::thread::scope(|scope| {
                let handles = cases
                    .iter()
                    .map(|case| (case, scope.spawn(move || self.run_case(case))))
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|(case, handle)| {
                        let result = handle
                            .join()
                            .unwrap_or_else(|_| Err(anyhow!("test case thread panicked")));
                        self.outcome(case, result)
                    })
                    .collect()
            }),
        };

        let report = Report { outcomes };
        info!("{} passed, {} failed", report.passed(), report.failed());
        report
    }
}

fn decode<D: CodecDevice>(
    session: &mut CodecSession<D, Decode>,
    config: &DecodeConfig,
    source: &mut dyn FrameSource,
) -> anyhow::Result<u32> {
    session.init().context("while initializing the decoder")?;
    source.init().context("while opening the input")?;
    session.set_dynamic_commands(config.dynamic_commands.clone());
    session.set_dump(config.input_dump.as_deref(), config.output_dump.as_deref());

    session.set_input_size_override(config.input_size_override);
    session.set_buffer_count(Port::Input, config.input_buffer_count);
    session.set_buffer_count(Port::Output, config.output_buffer_count);
    session.set_resolution(config.width, config.height);
    session
        .configure_input()
        .context("while configuring the input")?;
    session
        .allocate_port(Port::Input)
        .context("while allocating input buffers")?;
    session.start_port(Port::Input)?;

    session
        .run_until(source, config.max_frames)
        .context("while decoding")
}

fn encode<D: CodecDevice>(
    session: &mut CodecSession<D, Encode>,
    config: &EncodeConfig,
    source: &mut dyn FrameSource,
) -> anyhow::Result<u32> {
    session.init().context("while initializing the encoder")?;
    source.init().context("while opening the input")?;
    session.populate_static_controls(&config.static_controls)?;
    session.set_dynamic_controls(config.dynamic_controls.clone());
    session.set_dynamic_commands(config.dynamic_commands.clone());

    session.set_buffer_count(Port::Input, config.input_buffer_count);
    session.set_buffer_count(Port::Output, config.output_buffer_count);
    session.set_resolution(config.width, config.height);
    session.set_dump(config.input_dump.as_deref(), config.output_dump.as_deref());

    session
        .set_operating_rate(config.operating_rate, 1)
        .context("while setting the operating rate")?;
    session
        .set_frame_rate(config.frame_rate, 1)
        .context("while setting the frame rate")?;
    session.validate_static_controls()?;
    session.apply_static_controls()?;
    session
        .configure_input()
        .context("while configuring the input")?;
    session
        .configure_output()
        .context("while configuring the output")?;
    session
        .allocate_port(Port::Output)
        .context("while allocating output buffers")?;
    session
        .allocate_port(Port::Input)
        .context("while allocating input buffers")?;
    session.start_port(Port::Output)?;
    session.start_port(Port::Input)?;

    session
        .run_until(source, config.max_frames)
        .context("while encoding")
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::config::ControlEntry;
    use crate::config::EntryValue;
    use crate::config::ENCODER_DEFAULT_BUFFER_COUNT;
    use crate::controls::CID_MIN_BUFFERS_FOR_OUTPUT;
    use crate::device::fake::FakeCodec;
    use crate::error::Error;
    use crate::source::TestSource;

    fn fake_harness() -> Harness<impl Fn(CodecKind) -> crate::error::Result<Arc<FakeCodec>> + Sync>
    {
        Harness::new(|kind| -> crate::error::Result<Arc<FakeCodec>> {
            Ok(Arc::new(FakeCodec::new(kind)))
        })
        .with_allocator(RegionAllocator::MemFd)
    }

    fn ivf_file(frames: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut header = [0u8; 32];
        header[..4].copy_from_slice(b"DKIF");
        header[6..8].copy_from_slice(&32u16.to_le_bytes());
        header[8..12].copy_from_slice(b"VP90");
        file.write_all(&header).unwrap();
        for i in 0..frames {
            let mut frame_header = [0u8; 12];
            frame_header[..4].copy_from_slice(&8u32.to_le_bytes());
            file.write_all(&frame_header).unwrap();
            file.write_all(&[i as u8; 8]).unwrap();
        }
        file
    }

    fn decoder_case(name: &str, input: &std::path::Path) -> TestCase {
        TestCase {
            name: name.into(),
            kind: CodecKind::Decoder,
            codec: "H264".into(),
            pixel_format: "NV12".into(),
            width: 64,
            height: 64,
            num_frames: 0,
            input_path: input.to_path_buf(),
            poll_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn encoder_case(name: &str, input: &std::path::Path) -> TestCase {
        TestCase {
            name: name.into(),
            kind: CodecKind::Encoder,
            codec: "AVC".into(),
            pixel_format: "NV12".into(),
            width: 64,
            height: 64,
            input_path: input.to_path_buf(),
            poll_timeout: Duration::from_millis(10),
            input_buffer_count: Some(4),
            output_buffer_count: Some(4),
            static_controls: vec![
                ControlEntry::new("Profile", EntryValue::Name("HIGH".into())),
                ControlEntry::new("Level", EntryValue::Int(13)),
                ControlEntry::new("BitRate", EntryValue::Int(1_000_000)),
                ControlEntry::new("BitRateMode", EntryValue::Int(1)),
                ControlEntry::new("PrefixHeaderMode", EntryValue::Int(1)),
                ControlEntry::new("FrameRC", EntryValue::Int(1)),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn decode_tears_down_on_success() {
        let harness = fake_harness();
        let device = Arc::new(FakeCodec::new(CodecKind::Decoder));
        let config = DecodeConfig {
            width: 64,
            height: 64,
            max_frames: Some(10),
            input_buffer_count: 4,
            output_buffer_count: 4,
            input_size_override: Some(4096),
            poll_timeout: Duration::from_millis(10),
            ..Default::default()
        };

        let mut source = TestSource::new(7);
        let frames = harness
            .run_decode(Arc::clone(&device), &config, &mut source)
            .unwrap();
        assert_eq!(frames, 7);

        let state = device.state();
        assert_eq!(state.queued_inputs.len(), 7);
        // Every allocation was released.
        assert!(state.requests.contains(&(Port::Input, 0)));
        assert!(state.requests.contains(&(Port::Output, 0)));
        assert!(state.subscriptions.is_empty());
    }

    #[test]
    fn encode_tears_down_on_failure() {
        let harness = fake_harness();
        let device = Arc::new(FakeCodec::new(CodecKind::Encoder));
        let config = EncodeConfig {
            width: 64,
            height: 64,
            input_buffer_count: 4,
            output_buffer_count: 4,
            poll_timeout: Duration::from_millis(10),
            ..Default::default()
        };

        // No static control at all: the mandatory ones are missing.
        let mut source = TestSource::new(3);
        let err = harness
            .run_encode(Arc::clone(&device), &config, &mut source)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingMandatoryControl(_))
        ));
        assert!(device.state().requests.is_empty());
    }

    #[test]
    fn encoder_input_count_defaults_and_follows_device_minimum() {
        let case = TestCase {
            input_buffer_count: None,
            ..encoder_case("default-count", std::path::Path::new("unused.yuv"))
        };
        let CaseConfig::Encode(config) = case.validate().unwrap() else {
            panic!("encoder case validated as a decoder");
        };
        assert_eq!(config.input_buffer_count, ENCODER_DEFAULT_BUFFER_COUNT);

        for (device_minimum, granted) in [(4, ENCODER_DEFAULT_BUFFER_COUNT), (40, 40)] {
            let device = Arc::new(FakeCodec::new(CodecKind::Encoder));
            device
                .state()
                .controls
                .insert(CID_MIN_BUFFERS_FOR_OUTPUT, device_minimum);

            let mut source = TestSource::new(3);
            let frames = fake_harness()
                .run_encode(Arc::clone(&device), &config, &mut source)
                .unwrap();
            assert_eq!(frames, 3);
            assert_eq!(
                device
                    .state()
                    .requests
                    .iter()
                    .find(|(port, _)| *port == Port::Input),
                Some(&(Port::Input, granted))
            );
        }
    }

    #[test]
    fn cases_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ivf = ivf_file(5);
        let yuv = dir.path().join("input.yuv");
        std::fs::write(&yuv, vec![0x80u8; 3 * 64 * 64 * 3 / 2]).unwrap();
        let dump = dir.path().join("out.h264");

        let mut encoder = encoder_case("encode", &yuv);
        encoder.output_path = Some(dump.clone());
        let cases = vec![
            decoder_case("decode", ivf.path()),
            encoder,
            TestCase {
                codec: "MJPG".into(),
                ..decoder_case("bad-codec", ivf.path())
            },
            decoder_case("missing-input", &dir.path().join("missing.ivf")),
        ];

        for mode in [ExecutionMode::Sequential, ExecutionMode::Concurrent] {
            let report = fake_harness().with_mode(mode).run_all(&cases);
            let names: Vec<_> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
            assert_eq!(names, ["decode", "encode", "bad-codec", "missing-input"]);
            assert_eq!(report.outcomes[0].result.as_ref().unwrap(), &5);
            assert_eq!(report.outcomes[1].result.as_ref().unwrap(), &3);
            assert_eq!(report.passed(), 2);
            assert_eq!(report.failed(), 2);
            assert!(!report.all_passed());
            assert!(report.to_string().ends_with("2 passed, 2 failed"));
        }
        assert!(std::fs::metadata(&dump).unwrap().len() > 0);
    }
}
