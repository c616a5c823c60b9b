// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test-case configuration.
//!
//! A [`TestCase`] holds what a test-case description provides, with names instead of numeric
//! identifiers. [`TestCase::validate`] checks it and resolves it into a [`DecodeConfig`] or an
//! [`EncodeConfig`], which sessions trust without further checks.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::MemoryKind;
use crate::controls::check_mandatory;
use crate::controls::resolve;
use crate::controls::CommandAction;
use crate::controls::Control;
use crate::controls::ControlValue;
use crate::controls::DynamicCommand;
use crate::controls::DynamicControl;
use crate::format::CodecKind;
use crate::format::CodedFormat;
use crate::format::RawFormat;
use crate::session::DEFAULT_POLL_TIMEOUT;

pub const DECODER_DEFAULT_BUFFER_COUNT: u32 = 16;
pub const ENCODER_DEFAULT_BUFFER_COUNT: u32 = 32;
/// Size of decoder input buffers, large enough for any compressed frame we expect.
pub const DECODER_INPUT_SIZE: u32 = 2 * 1024 * 1024;
pub const DEFAULT_FRAME_RATE: u32 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown codec {0}")]
    UnknownCodec(String),
    #[error("unknown pixel format {0}")]
    UnknownPixelFormat(String),
    #[error("unknown control {0}")]
    UnknownControl(String),
    #[error("unknown value {value} for control {name}")]
    UnknownControlValue { name: String, value: String },
    #[error("unknown or invalid command {0}")]
    UnknownCommand(String),
    #[error("mandatory control {0} is missing")]
    MissingMandatoryControl(&'static str),
    #[error("invalid resolution {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("{0} must be non-zero")]
    ZeroRate(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// One thread per test case.
    Concurrent,
}

impl ExecutionMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Sequential" => Some(ExecutionMode::Sequential),
            "Concurrent" => Some(ExecutionMode::Concurrent),
            _ => None,
        }
    }
}

/// Value of a control in a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    Int(i32),
    Name(String),
}

/// A control as written in a test case. `frame` is only meaningful for dynamic controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEntry {
    pub name: String,
    pub value: EntryValue,
    pub frame: u32,
}

impl ControlEntry {
    pub fn new(name: &str, value: EntryValue) -> Self {
        Self {
            name: name.to_owned(),
            value,
            frame: 0,
        }
    }

    pub fn at_frame(mut self, frame: u32) -> Self {
        self.frame = frame;
        self
    }

    fn resolve(&self, codec: CodedFormat) -> Result<Control, ConfigError> {
        let value = match &self.value {
            EntryValue::Int(value) => ControlValue::Int(*value),
            EntryValue::Name(name) => ControlValue::Name(name),
        };
        resolve(codec, &self.name, value).ok_or_else(|| match &self.value {
            EntryValue::Name(value)
                if resolve(codec, &self.name, ControlValue::Int(0)).is_some() =>
            {
                ConfigError::UnknownControlValue {
                    name: self.name.clone(),
                    value: value.clone(),
                }
            }
            _ => ConfigError::UnknownControl(self.name.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub name: String,
    pub value: i64,
    pub frame: u32,
}

/// One test case, as described by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub kind: CodecKind,
    pub codec: String,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    /// Number of frames to process. Zero or less means the whole input.
    pub num_frames: i32,
    pub frame_rate: u32,
    pub operating_rate: u32,
    /// Encoders only: dump the bitstream with start codes rather than length prefixes.
    pub rewrite_nal_lengths: bool,
    /// Buffer counts, defaulting to a per-direction value.
    pub input_buffer_count: Option<u32>,
    pub output_buffer_count: Option<u32>,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub dump_input_path: Option<PathBuf>,
    pub memory: MemoryKind,
    pub poll_timeout: Duration,
    pub static_controls: Vec<ControlEntry>,
    pub dynamic_controls: Vec<ControlEntry>,
    pub dynamic_commands: Vec<CommandEntry>,
}

impl Default for TestCase {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: CodecKind::Decoder,
            codec: String::new(),
            pixel_format: String::new(),
            width: 0,
            height: 0,
            num_frames: 0,
            frame_rate: DEFAULT_FRAME_RATE,
            operating_rate: DEFAULT_FRAME_RATE,
            rewrite_nal_lengths: false,
            input_buffer_count: None,
            output_buffer_count: None,
            input_path: PathBuf::new(),
            output_path: None,
            dump_input_path: None,
            memory: MemoryKind::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            static_controls: Vec::new(),
            dynamic_controls: Vec::new(),
            dynamic_commands: Vec::new(),
        }
    }
}

/// Everything a decoding session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeConfig {
    pub coded: CodedFormat,
    pub raw: RawFormat,
    pub width: u32,
    pub height: u32,
    pub max_frames: Option<u32>,
    pub input_buffer_count: u32,
    pub output_buffer_count: u32,
    pub input_size_override: Option<u32>,
    pub input_path: PathBuf,
    pub output_dump: Option<PathBuf>,
    pub input_dump: Option<PathBuf>,
    pub memory: MemoryKind,
    pub poll_timeout: Duration,
    pub dynamic_commands: Vec<DynamicCommand>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            coded: CodedFormat::H264,
            raw: RawFormat::Nv12,
            width: 0,
            height: 0,
            max_frames: None,
            input_buffer_count: DECODER_DEFAULT_BUFFER_COUNT,
            output_buffer_count: DECODER_DEFAULT_BUFFER_COUNT,
            input_size_override: Some(DECODER_INPUT_SIZE),
            input_path: PathBuf::new(),
            output_dump: None,
            input_dump: None,
            memory: MemoryKind::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            dynamic_commands: Vec::new(),
        }
    }
}

/// Everything an encoding session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeConfig {
    pub coded: CodedFormat,
    pub raw: RawFormat,
    pub width: u32,
    pub height: u32,
    pub max_frames: Option<u32>,
    pub input_buffer_count: u32,
    pub output_buffer_count: u32,
    pub frame_rate: u32,
    pub operating_rate: u32,
    /// Dump the bitstream with start codes rather than length prefixes.
    pub rewrite_nal_lengths: bool,
    pub input_path: PathBuf,
    pub output_dump: Option<PathBuf>,
    pub input_dump: Option<PathBuf>,
    pub memory: MemoryKind,
    pub poll_timeout: Duration,
    pub static_controls: Vec<Control>,
    pub dynamic_controls: Vec<DynamicControl>,
    pub dynamic_commands: Vec<DynamicCommand>,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            coded: CodedFormat::H264,
            raw: RawFormat::Nv12,
            width: 0,
            height: 0,
            max_frames: None,
            input_buffer_count: ENCODER_DEFAULT_BUFFER_COUNT,
            output_buffer_count: ENCODER_DEFAULT_BUFFER_COUNT,
            frame_rate: DEFAULT_FRAME_RATE,
            operating_rate: DEFAULT_FRAME_RATE,
            rewrite_nal_lengths: false,
            input_path: PathBuf::new(),
            output_dump: None,
            input_dump: None,
            memory: MemoryKind::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            static_controls: Vec::new(),
            dynamic_controls: Vec::new(),
            dynamic_commands: Vec::new(),
        }
    }
}

/// A validated test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseConfig {
    Decode(DecodeConfig),
    Encode(EncodeConfig),
}

impl TestCase {
    /// Frame limit, if any.
    pub fn max_frames(&self) -> Option<u32> {
        u32::try_from(self.num_frames).ok().filter(|&n| n > 0)
    }

    fn commands(&self) -> Result<Vec<DynamicCommand>, ConfigError> {
        self.dynamic_commands
            .iter()
            .map(|c| {
                CommandAction::from_name(&c.name, c.value)
                    .map(|action| DynamicCommand {
                        frame: c.frame,
                        action,
                    })
                    .ok_or_else(|| ConfigError::UnknownCommand(c.name.clone()))
            })
            .collect()
    }

    /// Check every name and mandatory field, and resolve the case for its direction.
    pub fn validate(&self) -> Result<CaseConfig, ConfigError> {
        let coded = CodedFormat::from_name(&self.codec)
            .ok_or_else(|| ConfigError::UnknownCodec(self.codec.clone()))?;
        let raw = RawFormat::from_name(&self.pixel_format)
            .ok_or_else(|| ConfigError::UnknownPixelFormat(self.pixel_format.clone()))?;
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidResolution(self.width, self.height));
        }
        let dynamic_commands = self.commands()?;

        match self.kind {
            CodecKind::Decoder => {
                let defaults = DecodeConfig::default();
                Ok(CaseConfig::Decode(DecodeConfig {
                    coded,
                    raw,
                    width: self.width,
                    height: self.height,
                    max_frames: self.max_frames(),
                    input_buffer_count: self
                        .input_buffer_count
                        .unwrap_or(defaults.input_buffer_count),
                    output_buffer_count: self
                        .output_buffer_count
                        .unwrap_or(defaults.output_buffer_count),
                    input_path: self.input_path.clone(),
                    output_dump: self.output_path.clone(),
                    input_dump: self.dump_input_path.clone(),
                    memory: self.memory,
                    poll_timeout: self.poll_timeout,
                    dynamic_commands,
                    ..defaults
                }))
            }
            CodecKind::Encoder => {
                if self.frame_rate == 0 {
                    return Err(ConfigError::ZeroRate("FrameRate"));
                }
                if self.operating_rate == 0 {
                    return Err(ConfigError::ZeroRate("OperatingRate"));
                }

                let static_controls = self
                    .static_controls
                    .iter()
                    .map(|c| c.resolve(coded))
                    .collect::<Result<Vec<_>, _>>()?;
                check_mandatory(&static_controls).map_err(|e| match e {
                    crate::error::Error::MissingMandatoryControl(name) => {
                        ConfigError::MissingMandatoryControl(name)
                    }
                    _ => ConfigError::UnknownControl(e.to_string()),
                })?;
                let dynamic_controls = self
                    .dynamic_controls
                    .iter()
                    .map(|c| {
                        c.resolve(coded).map(|control| DynamicControl {
                            frame: c.frame,
                            control,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let defaults = EncodeConfig::default();
                Ok(CaseConfig::Encode(EncodeConfig {
                    coded,
                    raw,
                    width: self.width,
                    height: self.height,
                    max_frames: self.max_frames(),
                    input_buffer_count: self
                        .input_buffer_count
                        .filter(|&n| n > 0)
                        .unwrap_or(defaults.input_buffer_count),
                    output_buffer_count: self
                        .output_buffer_count
                        .filter(|&n| n > 0)
                        .unwrap_or(defaults.output_buffer_count),
                    frame_rate: self.frame_rate,
                    operating_rate: self.operating_rate,
                    rewrite_nal_lengths: self.rewrite_nal_lengths,
                    input_path: self.input_path.clone(),
                    output_dump: self.output_path.clone(),
                    input_dump: self.dump_input_path.clone(),
                    memory: self.memory,
                    poll_timeout: self.poll_timeout,
                    static_controls,
                    dynamic_controls,
                    dynamic_commands,
                    ..defaults
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::CID_BITRATE;
    use crate::controls::CID_H264_LEVEL;
    use crate::controls::CID_HEVC_TIER;

    fn encoder_case() -> TestCase {
        TestCase {
            name: "enc".into(),
            kind: CodecKind::Encoder,
            codec: "AVC".into(),
            pixel_format: "NV12".into(),
            width: 1280,
            height: 720,
            static_controls: vec![
                ControlEntry::new("Profile", EntryValue::Int(4)),
                ControlEntry::new("Level", EntryValue::Int(13)),
                ControlEntry::new("BitRate", EntryValue::Int(2_000_000)),
                ControlEntry::new("BitRateMode", EntryValue::Int(1)),
                ControlEntry::new("PrefixHeaderMode", EntryValue::Int(1)),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn decoder_defaults() {
        let case = TestCase {
            codec: "HEVC".into(),
            pixel_format: "QC08C".into(),
            width: 64,
            height: 64,
            num_frames: -1,
            ..Default::default()
        };
        let CaseConfig::Decode(config) = case.validate().unwrap() else {
            panic!("decoder case resolved to an encoder");
        };
        assert_eq!(config.coded, CodedFormat::Hevc);
        assert_eq!(config.raw, RawFormat::Qc08c);
        assert_eq!(config.max_frames, None);
        assert_eq!(config.input_buffer_count, 16);
        assert_eq!(config.output_buffer_count, 16);
        assert_eq!(config.input_size_override, Some(2 * 1024 * 1024));
        assert_eq!(config.poll_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn encoder_controls_are_resolved() {
        let mut case = encoder_case();
        case.num_frames = 10;
        case.input_buffer_count = Some(0);
        case.dynamic_controls = vec![ControlEntry::new("BitRate", EntryValue::Int(500_000)).at_frame(5)];
        case.dynamic_commands = vec![CommandEntry {
            name: "PauseUSec".into(),
            value: 100,
            frame: 3,
        }];

        let CaseConfig::Encode(config) = case.validate().unwrap() else {
            panic!("encoder case resolved to a decoder");
        };
        assert_eq!(config.max_frames, Some(10));
        assert_eq!(config.input_buffer_count, 32);
        assert_eq!(config.output_buffer_count, 32);
        assert_eq!(config.frame_rate, 30);
        assert!(config
            .static_controls
            .contains(&Control::new(CID_H264_LEVEL, 13)));
        assert_eq!(
            config.dynamic_controls,
            vec![DynamicControl {
                frame: 5,
                control: Control::new(CID_BITRATE, 500_000),
            }]
        );
        assert_eq!(
            config.dynamic_commands,
            vec![DynamicCommand {
                frame: 3,
                action: CommandAction::PauseUsec(100),
            }]
        );
    }

    #[test]
    fn nal_length_rewrite_reaches_encoder() {
        let CaseConfig::Encode(config) = encoder_case().validate().unwrap() else {
            panic!("encoder case resolved to a decoder");
        };
        assert!(!config.rewrite_nal_lengths);

        let case = TestCase {
            rewrite_nal_lengths: true,
            ..encoder_case()
        };
        let CaseConfig::Encode(config) = case.validate().unwrap() else {
            panic!("encoder case resolved to a decoder");
        };
        assert!(config.rewrite_nal_lengths);
    }

    #[test]
    fn symbolic_values() {
        let entry = ControlEntry::new("Tier", EntryValue::Name("HIGH".into()));
        assert_eq!(
            entry.resolve(CodedFormat::Hevc).unwrap(),
            Control::new(CID_HEVC_TIER, 1)
        );
        let entry = ControlEntry::new("Tier", EntryValue::Name("HUGE".into()));
        assert!(matches!(
            entry.resolve(CodedFormat::Hevc),
            Err(ConfigError::UnknownControlValue { .. })
        ));
        let entry = ControlEntry::new("NoSuchControl", EntryValue::Int(1));
        assert_eq!(
            entry.resolve(CodedFormat::H264),
            Err(ConfigError::UnknownControl("NoSuchControl".into()))
        );
    }

    #[test]
    fn invalid_cases() {
        let mut case = encoder_case();
        case.static_controls.pop();
        assert_eq!(
            case.validate(),
            Err(ConfigError::MissingMandatoryControl("PrefixHeaderMode"))
        );

        let case = TestCase {
            codec: "MJPG".into(),
            ..encoder_case()
        };
        assert_eq!(
            case.validate(),
            Err(ConfigError::UnknownCodec("MJPG".into()))
        );

        let case = TestCase {
            pixel_format: "YUYV".into(),
            ..encoder_case()
        };
        assert!(matches!(
            case.validate(),
            Err(ConfigError::UnknownPixelFormat(_))
        ));

        let case = TestCase {
            frame_rate: 0,
            ..encoder_case()
        };
        assert_eq!(case.validate(), Err(ConfigError::ZeroRate("FrameRate")));

        let case = TestCase {
            width: 0,
            ..encoder_case()
        };
        assert_eq!(case.validate(), Err(ConfigError::InvalidResolution(0, 720)));

        let mut case = encoder_case();
        case.dynamic_commands.push(CommandEntry {
            name: "Reboot".into(),
            value: 0,
            frame: 0,
        });
        assert!(matches!(
            case.validate(),
            Err(ConfigError::UnknownCommand(_))
        ));
    }

    #[test]
    fn execution_modes() {
        assert_eq!(
            ExecutionMode::from_name("Concurrent"),
            Some(ExecutionMode::Concurrent)
        );
        assert_eq!(ExecutionMode::default(), ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::from_name("Parallel"), None);
    }
}
