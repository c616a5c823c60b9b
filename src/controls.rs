// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec control identifiers and the name tables used to build them.
//!
//! The tables map the names used by test-case configurations (`AVC_Level`, `BitRateMode`, ...)
//! to V4L2 control IDs, and symbolic menu values (`AVC_HIGH`, `CBR`, ...) to their integer
//! values. They are built once on first use and never mutated afterwards.
//!
//! Codec-specific entries are keyed with the codec prefix returned by
//! [`CodedFormat::control_prefix`], e.g. `HEVC_Tier`, while codec-independent ones are not.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::Error;
use crate::error::Result;
use crate::format::CodedFormat;

const CID_BASE: u32 = 0x0098_0900;
const CID_CODEC_BASE: u32 = 0x0099_0900;

pub const CID_HFLIP: u32 = CID_BASE + 20;
pub const CID_VFLIP: u32 = CID_BASE + 21;
pub const CID_ROTATE: u32 = CID_BASE + 34;
pub const CID_MIN_BUFFERS_FOR_CAPTURE: u32 = CID_BASE + 39;
pub const CID_MIN_BUFFERS_FOR_OUTPUT: u32 = CID_BASE + 40;

pub const CID_B_FRAMES: u32 = CID_CODEC_BASE + 202;
pub const CID_GOP_SIZE: u32 = CID_CODEC_BASE + 203;
pub const CID_BITRATE_MODE: u32 = CID_CODEC_BASE + 206;
pub const CID_BITRATE: u32 = CID_CODEC_BASE + 207;
pub const CID_BITRATE_PEAK: u32 = CID_CODEC_BASE + 208;
pub const CID_FRAME_RC_ENABLE: u32 = CID_CODEC_BASE + 215;
pub const CID_HEADER_MODE: u32 = CID_CODEC_BASE + 216;
pub const CID_MULTI_SLICE_MAX_BYTES: u32 = CID_CODEC_BASE + 219;
pub const CID_MULTI_SLICE_MAX_MB: u32 = CID_CODEC_BASE + 220;
pub const CID_MULTI_SLICE_MODE: u32 = CID_CODEC_BASE + 221;
pub const CID_VBV_DELAY: u32 = CID_CODEC_BASE + 225;
pub const CID_FORCE_KEY_FRAME: u32 = CID_CODEC_BASE + 229;
pub const CID_BASELAYER_PRIORITY_ID: u32 = CID_CODEC_BASE + 230;
pub const CID_LTR_COUNT: u32 = CID_CODEC_BASE + 232;
pub const CID_FRAME_LTR_INDEX: u32 = CID_CODEC_BASE + 233;
pub const CID_USE_LTR_FRAMES: u32 = CID_CODEC_BASE + 234;
pub const CID_INTRA_REFRESH_PERIOD: u32 = CID_CODEC_BASE + 236;
pub const CID_INTRA_REFRESH_PERIOD_TYPE: u32 = CID_CODEC_BASE + 237;

pub const CID_H264_I_FRAME_QP: u32 = CID_CODEC_BASE + 350;
pub const CID_H264_P_FRAME_QP: u32 = CID_CODEC_BASE + 351;
pub const CID_H264_B_FRAME_QP: u32 = CID_CODEC_BASE + 352;
pub const CID_H264_MIN_QP: u32 = CID_CODEC_BASE + 353;
pub const CID_H264_MAX_QP: u32 = CID_CODEC_BASE + 354;
pub const CID_H264_8X8_TRANSFORM: u32 = CID_CODEC_BASE + 355;
pub const CID_H264_ENTROPY_MODE: u32 = CID_CODEC_BASE + 357;
pub const CID_H264_LEVEL: u32 = CID_CODEC_BASE + 359;
pub const CID_H264_LOOP_FILTER_ALPHA: u32 = CID_CODEC_BASE + 360;
pub const CID_H264_LOOP_FILTER_BETA: u32 = CID_CODEC_BASE + 361;
pub const CID_H264_LOOP_FILTER_MODE: u32 = CID_CODEC_BASE + 362;
pub const CID_H264_PROFILE: u32 = CID_CODEC_BASE + 363;
pub const CID_H264_HIERARCHICAL_CODING: u32 = CID_CODEC_BASE + 379;
pub const CID_H264_HIERARCHICAL_CODING_TYPE: u32 = CID_CODEC_BASE + 380;
pub const CID_H264_HIERARCHICAL_CODING_LAYER: u32 = CID_CODEC_BASE + 381;
pub const CID_H264_I_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 385;
pub const CID_H264_I_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 386;
pub const CID_H264_P_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 387;
pub const CID_H264_P_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 388;
pub const CID_H264_B_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 389;
pub const CID_H264_B_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 390;
/// First of seven consecutive per-layer bitrate controls.
pub const CID_H264_HIER_CODING_L0_BR: u32 = CID_CODEC_BASE + 391;

pub const CID_VP9_PROFILE: u32 = CID_CODEC_BASE + 512;
pub const CID_VP9_LEVEL: u32 = CID_CODEC_BASE + 513;

pub const CID_HEVC_MIN_QP: u32 = CID_CODEC_BASE + 600;
pub const CID_HEVC_MAX_QP: u32 = CID_CODEC_BASE + 601;
pub const CID_HEVC_I_FRAME_QP: u32 = CID_CODEC_BASE + 602;
pub const CID_HEVC_P_FRAME_QP: u32 = CID_CODEC_BASE + 603;
pub const CID_HEVC_B_FRAME_QP: u32 = CID_CODEC_BASE + 604;
pub const CID_HEVC_HIER_CODING_TYPE: u32 = CID_CODEC_BASE + 606;
pub const CID_HEVC_HIER_CODING_LAYER: u32 = CID_CODEC_BASE + 607;
pub const CID_HEVC_PROFILE: u32 = CID_CODEC_BASE + 615;
pub const CID_HEVC_LEVEL: u32 = CID_CODEC_BASE + 616;
pub const CID_HEVC_TIER: u32 = CID_CODEC_BASE + 618;
pub const CID_HEVC_LOOP_FILTER_MODE: u32 = CID_CODEC_BASE + 620;
pub const CID_HEVC_LF_TC_OFFSET_DIV2: u32 = CID_CODEC_BASE + 622;
/// First of seven consecutive per-layer bitrate controls.
pub const CID_HEVC_HIER_CODING_L0_BR: u32 = CID_CODEC_BASE + 636;
pub const CID_PREPEND_SPSPPS_TO_IDR: u32 = CID_CODEC_BASE + 644;
pub const CID_CONSTANT_QUALITY: u32 = CID_CODEC_BASE + 645;
pub const CID_FRAME_SKIP_MODE: u32 = CID_CODEC_BASE + 646;
pub const CID_HEVC_I_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 647;
pub const CID_HEVC_I_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 648;
pub const CID_HEVC_P_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 649;
pub const CID_HEVC_P_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 650;
pub const CID_HEVC_B_FRAME_MIN_QP: u32 = CID_CODEC_BASE + 651;
pub const CID_HEVC_B_FRAME_MAX_QP: u32 = CID_CODEC_BASE + 652;

pub const FRAME_SKIP_MODE_DISABLED: i32 = 0;

/// A control value to apply to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub id: u32,
    pub value: i32,
}

impl Control {
    pub fn new(id: u32, value: i32) -> Self {
        Self { id, value }
    }

    pub fn name(&self) -> &'static str {
        ctrl_name(self.id)
    }
}

/// A control to apply when the frame counter reaches `frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicControl {
    pub frame: u32,
    pub control: Control,
}

/// Actions that can be scheduled at a given frame, as opposed to device controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Block the queueing loop for this many microseconds.
    PauseUsec(u64),
    /// Seek the input to this frame.
    IdrSeek(u32),
    /// Seek the input to a frame chosen by the frame source. The value is informative only.
    RandomSeek(u32),
}

impl CommandAction {
    /// Parse a command as named in test-case configurations.
    pub fn from_name(name: &str, value: i64) -> Option<Self> {
        let value = u64::try_from(value).ok()?;
        match name {
            "PauseUSec" => Some(CommandAction::PauseUsec(value)),
            "IDRSeek" => Some(CommandAction::IdrSeek(u32::try_from(value).ok()?)),
            "RandomSeek" => Some(CommandAction::RandomSeek(u32::try_from(value).ok()?)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicCommand {
    pub frame: u32,
    pub action: CommandAction,
}

/// Range reported by the device for a control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRange {
    pub minimum: i32,
    pub maximum: i32,
    pub default: i32,
}

/// Value of a control as written in a configuration: either a plain integer, or a symbolic name
/// looked up in the value tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue<'a> {
    Int(i32),
    Name(&'a str),
}

static CONTROL_IDS: LazyLock<HashMap<&'static str, u32>> = LazyLock::new(|| {
    let mut ids: HashMap<&'static str, u32> = HashMap::from([
        ("AVC_Level", CID_H264_LEVEL),
        ("AVC_Profile", CID_H264_PROFILE),
        ("AVC_MinQP", CID_H264_MIN_QP),
        ("AVC_MaxQP", CID_H264_MAX_QP),
        ("AVC_IQP", CID_H264_I_FRAME_QP),
        ("AVC_PQP", CID_H264_P_FRAME_QP),
        ("AVC_BQP", CID_H264_B_FRAME_QP),
        ("AVC_MaxIQP", CID_H264_I_FRAME_MAX_QP),
        ("AVC_MaxPQP", CID_H264_P_FRAME_MAX_QP),
        ("AVC_MaxBQP", CID_H264_B_FRAME_MAX_QP),
        ("AVC_MinIQP", CID_H264_I_FRAME_MIN_QP),
        ("AVC_MinPQP", CID_H264_P_FRAME_MIN_QP),
        ("AVC_MinBQP", CID_H264_B_FRAME_MIN_QP),
        ("AVC_EntropyCoding", CID_H264_ENTROPY_MODE),
        ("AVC_Transform8x8", CID_H264_8X8_TRANSFORM),
        ("AVC_LoopFilterMode", CID_H264_LOOP_FILTER_MODE),
        ("AVC_LFBetaOffset", CID_H264_LOOP_FILTER_BETA),
        ("AVC_LFAlphaOffset", CID_H264_LOOP_FILTER_ALPHA),
        ("AVC_HierarchicalCoding", CID_H264_HIERARCHICAL_CODING),
        ("AVC_HierarchicalCodingType", CID_H264_HIERARCHICAL_CODING_TYPE),
        ("AVC_HierarchicalLayerCount", CID_H264_HIERARCHICAL_CODING_LAYER),
        ("HEVC_Tier", CID_HEVC_TIER),
        ("HEVC_Level", CID_HEVC_LEVEL),
        ("HEVC_Profile", CID_HEVC_PROFILE),
        ("HEVC_MinQP", CID_HEVC_MIN_QP),
        ("HEVC_MaxQP", CID_HEVC_MAX_QP),
        ("HEVC_IQP", CID_HEVC_I_FRAME_QP),
        ("HEVC_PQP", CID_HEVC_P_FRAME_QP),
        ("HEVC_BQP", CID_HEVC_B_FRAME_QP),
        ("HEVC_MaxIQP", CID_HEVC_I_FRAME_MAX_QP),
        ("HEVC_MaxPQP", CID_HEVC_P_FRAME_MAX_QP),
        ("HEVC_MaxBQP", CID_HEVC_B_FRAME_MAX_QP),
        ("HEVC_MinIQP", CID_HEVC_I_FRAME_MIN_QP),
        ("HEVC_MinPQP", CID_HEVC_P_FRAME_MIN_QP),
        ("HEVC_MinBQP", CID_HEVC_B_FRAME_MIN_QP),
        ("HEVC_LoopFilterMode", CID_HEVC_LOOP_FILTER_MODE),
        ("HEVC_LFTCOffset", CID_HEVC_LF_TC_OFFSET_DIV2),
        ("HEVC_HierarchicalCodingType", CID_HEVC_HIER_CODING_TYPE),
        ("HEVC_HierarchicalLayerCount", CID_HEVC_HIER_CODING_LAYER),
        ("VP9_Profile", CID_VP9_PROFILE),
        ("VP9_Level", CID_VP9_LEVEL),
        ("VFlip", CID_VFLIP),
        ("HFlip", CID_HFLIP),
        ("Rotate", CID_ROTATE),
        ("BitRate", CID_BITRATE),
        ("BFrames", CID_B_FRAMES),
        ("GOPSize", CID_GOP_SIZE),
        ("LTRCount", CID_LTR_COUNT),
        ("VBVDelay", CID_VBV_DELAY),
        ("PrefixHeaderMode", CID_HEADER_MODE),
        ("PeakBitrate", CID_BITRATE_PEAK),
        ("BitRateMode", CID_BITRATE_MODE),
        ("UseLTR", CID_USE_LTR_FRAMES),
        ("FrameRC", CID_FRAME_RC_ENABLE),
        ("LTRIndex", CID_FRAME_LTR_INDEX),
        ("InjectKeyFrame", CID_FORCE_KEY_FRAME),
        ("CQ", CID_CONSTANT_QUALITY),
        ("MultiSliceMode", CID_MULTI_SLICE_MODE),
        ("MaxMacroBlocksPerSlice", CID_MULTI_SLICE_MAX_MB),
        ("IntraRefreshPeriod", CID_INTRA_REFRESH_PERIOD),
        ("MaxBytesPerSlice", CID_MULTI_SLICE_MAX_BYTES),
        ("PrependPsToIDR", CID_PREPEND_SPSPPS_TO_IDR),
        ("BasePriorityID", CID_BASELAYER_PRIORITY_ID),
        ("IntraRefreshType", CID_INTRA_REFRESH_PERIOD_TYPE),
        ("FrameSkipMode", CID_FRAME_SKIP_MODE),
    ]);

    const LAYER_NAMES: [(&str, &str); 7] = [
        ("AVC_HierCodingL0BR", "HEVC_HierCodingL0BR"),
        ("AVC_HierCodingL1BR", "HEVC_HierCodingL1BR"),
        ("AVC_HierCodingL2BR", "HEVC_HierCodingL2BR"),
        ("AVC_HierCodingL3BR", "HEVC_HierCodingL3BR"),
        ("AVC_HierCodingL4BR", "HEVC_HierCodingL4BR"),
        ("AVC_HierCodingL5BR", "HEVC_HierCodingL5BR"),
        ("AVC_HierCodingL6BR", "HEVC_HierCodingL6BR"),
    ];
    for (layer, (avc, hevc)) in (0u32..).zip(LAYER_NAMES) {
        ids.insert(avc, CID_H264_HIER_CODING_L0_BR + layer);
        ids.insert(hevc, CID_HEVC_HIER_CODING_L0_BR + layer);
    }

    ids
});

static CONTROL_NAMES: LazyLock<HashMap<u32, &'static str>> = LazyLock::new(|| {
    let mut names: HashMap<u32, &'static str> =
        CONTROL_IDS.iter().map(|(name, id)| (*id, *name)).collect();
    names.insert(CID_MIN_BUFFERS_FOR_CAPTURE, "MinBuffersForCapture");
    names.insert(CID_MIN_BUFFERS_FOR_OUTPUT, "MinBuffersForOutput");
    names
});

/// Symbolic values accepted for menu controls, keyed by the unprefixed control name.
static CONTROL_VALUES: LazyLock<HashMap<&'static str, HashMap<&'static str, i32>>> =
    LazyLock::new(|| {
        HashMap::from([
            (
                "Profile",
                HashMap::from([
                    ("AVC_BASELINE", 0),
                    ("AVC_CONSTRAINED_BASELINE", 1),
                    ("AVC_MAIN", 2),
                    ("AVC_HIGH", 4),
                    ("HEVC_MAIN", 0),
                    ("HEVC_MAIN_SP", 1),
                    ("HEVC_MAIN10", 2),
                    ("VP9_0", 0),
                    ("VP9_2", 2),
                ]),
            ),
            (
                "Level",
                HashMap::from([
                    ("AVC_1.0", 0),
                    ("AVC_1B", 1),
                    ("AVC_1.1", 2),
                    ("AVC_1.2", 3),
                    ("AVC_1.3", 4),
                    ("AVC_2.0", 5),
                    ("AVC_2.1", 6),
                    ("AVC_2.2", 7),
                    ("AVC_3.0", 8),
                    ("AVC_3.1", 9),
                    ("AVC_3.2", 10),
                    ("AVC_4.0", 11),
                    ("AVC_4.1", 12),
                    ("AVC_4.2", 13),
                    ("AVC_5.0", 14),
                    ("AVC_5.1", 15),
                    ("AVC_5.2", 16),
                    ("AVC_6.0", 17),
                    ("AVC_6.1", 18),
                    ("AVC_6.2", 19),
                    ("HEVC_1.0", 0),
                    ("HEVC_2.0", 1),
                    ("HEVC_2.1", 2),
                    ("HEVC_3.0", 3),
                    ("HEVC_3.1", 4),
                    ("HEVC_4.0", 5),
                    ("HEVC_4.1", 6),
                    ("HEVC_5.0", 7),
                    ("HEVC_5.1", 8),
                    ("HEVC_5.2", 9),
                    ("HEVC_6.0", 10),
                    ("HEVC_6.1", 11),
                    ("HEVC_6.2", 12),
                ]),
            ),
            ("Tier", HashMap::from([("HEVC_MAIN", 0), ("HEVC_HIGH", 1)])),
            (
                "LoopFilterMode",
                HashMap::from([
                    ("AVC_ENABLED", 0),
                    ("AVC_DISABLED", 1),
                    ("AVC_DISABLED_AT_SLICE_BOUNDARY", 2),
                    ("HEVC_DISABLED", 0),
                    ("HEVC_ENABLED", 1),
                    ("HEVC_DISABLED_AT_SLICE_BOUNDARY", 2),
                ]),
            ),
            (
                "BitRateMode",
                HashMap::from([("VBR", 0), ("CBR", 1), ("CQ", 2), ("MBR", 3)]),
            ),
            (
                "PrefixHeaderMode",
                HashMap::from([("SEPARATE", 0), ("JOINED", 1)]),
            ),
            (
                "HierarchicalCodingType",
                HashMap::from([
                    ("AVC_HierB", 0),
                    ("AVC_HierP", 1),
                    ("HEVC_HierB", 0),
                    ("HEVC_HierP", 1),
                ]),
            ),
            (
                "MultiSliceMode",
                HashMap::from([("SINGLE", 0), ("MAX_MB", 1), ("MAX_BYTES", 2)]),
            ),
            (
                "IntraRefreshType",
                HashMap::from([("RANDOM", 0), ("CYCLIC", 1)]),
            ),
            (
                "EntropyCoding",
                HashMap::from([("AVC_CAVLC", 0), ("AVC_CABAC", 1)]),
            ),
        ])
    });

/// Controls every encoder configuration must provide, by unprefixed name.
pub const MANDATORY_CONTROLS: [&str; 5] =
    ["Profile", "Level", "BitRate", "BitRateMode", "PrefixHeaderMode"];

/// Returns the name of control `id` for logging, or `"Unknown"`.
pub fn ctrl_name(id: u32) -> &'static str {
    CONTROL_NAMES.get(&id).copied().unwrap_or("Unknown")
}

/// Strip the codec prefix from a control name: `AVC_Level` becomes `Level`.
pub fn unprefixed(name: &str) -> &str {
    match name.split_once('_') {
        Some((_, rest)) => rest,
        None => name,
    }
}

pub fn control_id(name: &str) -> Option<u32> {
    CONTROL_IDS.get(name).copied()
}

/// Resolve a control given by name for `codec` into its numeric form.
///
/// Codec-specific names are tried with the codec prefix first (`Level` becomes `AVC_Level` for
/// H.264), then as given. Symbolic values get the same treatment.
pub fn resolve(codec: CodedFormat, name: &str, value: ControlValue) -> Option<Control> {
    let prefixed = |s: &str| codec.control_prefix().map(|prefix| format!("{}_{}", prefix, s));

    let id = prefixed(name)
        .and_then(|n| control_id(&n))
        .or_else(|| control_id(name))?;

    let value = match value {
        ControlValue::Int(value) => value,
        ControlValue::Name(symbol) => {
            let table = CONTROL_VALUES.get(unprefixed(ctrl_name(id)))?;
            prefixed(symbol)
                .and_then(|s| table.get(s.as_str()).copied())
                .or_else(|| table.get(symbol).copied())?
        }
    };

    Some(Control::new(id, value))
}

/// Check that `controls` contains every control of [`MANDATORY_CONTROLS`].
pub fn check_mandatory(controls: &[Control]) -> Result<()> {
    for mandatory in MANDATORY_CONTROLS {
        if !controls
            .iter()
            .any(|c| unprefixed(c.name()) == mandatory)
        {
            return Err(Error::MissingMandatoryControl(mandatory));
        }
    }
    Ok(())
}
