// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod hrd;
pub mod param_sets;
pub mod qp;
pub mod ring;
pub mod rps;
pub mod scheduler;
pub mod session;
pub mod stack;

use std::collections::VecDeque;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::h265::params::Level;
use crate::codec::h265::params::Profile;
use crate::codec::h265::params::Sps;
use crate::codec::h265::params::Tier;
use crate::codec::h265::params::VuiParams;
use crate::codec::h265::params::MAX_TLAYER;
use crate::codec::h265::slice::Slice;
use crate::codec::h265::slice::SliceType;
use crate::encoder::scheduler::GopContext;
use crate::ChromaFormat;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum CompressorError {
    #[error("the picture referenced by the GOP is no longer in the ring")]
    MissingPicture,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CompressorResult<T> = Result<T, CompressorError>;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no parameter set with id {pps_id} could be resolved")]
    UnresolvedParameterSet { pps_id: u8 },
    #[error("invalid tile columns: {0}")]
    TileColumns(String),
    #[error("invalid tile rows: {0}")]
    TileRows(String),
    #[error("unsupported scaling list mode")]
    UnsupportedScalingList,
    #[error("invalid GOP entry: {0}")]
    InvalidGopEntry(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid input picture: {0}")]
    InvalidInput(String),
    #[error("all {capacity} pictures of the ring are still referenced")]
    RingExhausted { capacity: usize },
    #[error("picture with POC {poc} is still referenced")]
    PictureReferenced { poc: i32 },
    #[error("stale or unknown picture handle")]
    InvalidPictureHandle,
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error(transparent)]
    Compressor(#[from] CompressorError),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// How the reference picture set of a GOP entry is predicted from the set of the previous entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InterRpsPrediction {
    /// The set is coded explicitly.
    #[default]
    None,
    /// The set is rebuilt from the previous set using the given POC delta and one idc per entry
    /// of the previous set, plus one for the previous picture itself.
    Explicit { delta_rps: i32, ref_idc: Vec<u8> },
    /// The idc values are derived by matching the entries of both sets.
    Auto,
}

/// Static description of one position in the GOP.
#[derive(Clone, Debug, PartialEq)]
pub struct GopEntry {
    /// POC of the entry relative to the start of the GOP.
    pub poc: i32,
    pub slice_type: SliceType,
    pub temporal_id: u32,
    pub qp_offset: i32,
    pub qp_offset_model_offset: f64,
    pub qp_offset_model_scale: f64,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub tc_offset_div2: i32,
    pub beta_offset_div2: i32,
    pub num_ref_pics_active: i32,
    /// (delta POC, used by current picture) of each reference.
    pub references: Vec<(i32, bool)>,
    pub inter_rps_prediction: InterRpsPrediction,
}

impl Default for GopEntry {
    fn default() -> Self {
        Self {
            poc: -1,
            slice_type: SliceType::P,
            temporal_id: 0,
            qp_offset: 0,
            qp_offset_model_offset: 0.0,
            qp_offset_model_scale: 0.0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            tc_offset_div2: 0,
            beta_offset_div2: 0,
            num_ref_pics_active: 0,
            references: Vec::new(),
            inter_rps_prediction: InterRpsPrediction::None,
        }
    }
}

impl GopEntry {
    /// An entry referencing `references`, all of them used by the current picture.
    pub fn new(poc: i32, slice_type: SliceType, qp_offset: i32, references: &[i32]) -> Self {
        Self {
            poc,
            slice_type,
            qp_offset,
            num_ref_pics_active: references.len() as i32,
            references: references.iter().map(|d| (*d, true)).collect(),
            ..Default::default()
        }
    }

    pub fn with_inter_rps_prediction(mut self, prediction: InterRpsPrediction) -> Self {
        self.inter_rps_prediction = prediction;
        self
    }
}

/// Cost model used by the rate-distortion evaluator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CostMode {
    #[default]
    StandardLossy,
    SequenceLevelLossless,
    Lossless,
    MixedLosslessLossy,
}

impl CostMode {
    pub fn is_lossless(&self) -> bool {
        matches!(self, CostMode::SequenceLevelLossless | CostMode::Lossless)
    }
}

/// Optional coding features. Resolved once when a session is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub scaling_lists: bool,
    pub tiles_wpp: bool,
    pub hrd_sub_pictures: bool,
    /// Allows a second PPS carrying WCG adjusted chroma QP offsets.
    pub wcg_chroma_qp_pps: bool,
    /// Derive init_qp_minus26 from the base QP instead of signalling 26.
    pub adapt_pps_qp: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            scaling_lists: true,
            tiles_wpp: true,
            hrd_sub_pictures: true,
            wcg_chroma_qp_pps: true,
            adapt_pps_qp: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileConfig {
    pub uniform_spacing: bool,
    pub num_columns_minus1: u32,
    pub num_rows_minus1: u32,
    /// Column widths in CTUs, all but the last column. Only used without uniform spacing.
    pub column_widths: Vec<u32>,
    /// Row heights in CTUs, all but the last row. Only used without uniform spacing.
    pub row_heights: Vec<u32>,
    pub loop_filter_across_tiles: bool,
    pub entropy_coding_sync: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ScalingListMode {
    #[default]
    Off,
    Default,
    FileRead(PathBuf),
}

/// Chroma QP control for wide colour gamut content.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WcgChromaQpControl {
    pub chroma_cb_qp_scale: f64,
    pub chroma_cr_qp_scale: f64,
    pub chroma_qp_scale: f64,
    pub chroma_qp_offset: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldOrder {
    #[default]
    TopFieldFirst,
    BottomFieldFirst,
}

impl FieldOrder {
    pub fn is_top_field_first(&self) -> bool {
        matches!(self, FieldOrder::TopFieldFirst)
    }
}

/// Rate parameters that may change during a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunings {
    /// Target bitrate in bits per second.
    pub target_bitrate: u32,
    /// CPB size in bits.
    pub cpb_size: u32,
    /// Nominal frame rate in frames per second.
    pub frame_rate: u32,
}

/// Flat encoder configuration, consumed once when a session is created.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    pub profile: Profile,
    pub tier: Tier,
    pub level: Level,
    pub progressive_source: bool,
    pub interlaced_source: bool,
    pub frame_only_constraint: bool,

    pub max_cu_width: u32,
    pub max_cu_height: u32,
    pub max_total_cu_depth: u32,
    pub log2_diff_max_min_coding_block_size: u32,
    pub quadtree_tu_log2_max_size: u32,
    pub quadtree_tu_log2_min_size: u32,

    pub gop_size: usize,
    /// GOP entries followed by `extra_rps` additional entries.
    pub gop_list: Vec<GopEntry>,
    pub extra_rps: usize,
    /// Intra period in pictures, or a negative value for a single intra picture.
    pub intra_period: i32,
    pub decoding_refresh_type: u32,
    pub max_temporal_layers: u32,
    pub max_dec_pic_buffering: [u32; MAX_TLAYER],
    pub num_reorder_pics: [u32; MAX_TLAYER],

    pub base_qp: i32,
    pub intra_qp_offset: i32,
    /// POC from which `switch_dqp` is added to the QP of every picture.
    pub switch_poc: Option<i32>,
    pub switch_dqp: i32,
    /// Per-POC QP deltas.
    pub dqps: Option<Vec<i32>>,
    pub max_delta_qp: i32,
    pub max_cu_dqp_depth: u32,
    pub adaptive_qp: bool,
    pub luma_level_to_delta_qp: bool,
    pub rate_control: bool,
    pub transquant_bypass: bool,
    pub cost_mode: CostMode,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub wcg_chroma_qp: Option<WcgChromaQpControl>,

    pub target_bitrate: u32,
    pub cpb_size: u32,
    pub frame_rate: u32,
    pub temporal_subsample_ratio: u32,
    pub vui_parameters_present: bool,
    /// Template for the VUI. Timing and HRD fields are derived.
    pub vui: VuiParams,
    pub buffering_period_sei: bool,
    pub picture_timing_sei: bool,
    pub decoding_unit_info_sei: bool,
    pub cpb_saturation: bool,
    /// Slice and slice segment modes, 0 meaning a single slice per picture.
    pub slice_mode: u32,
    pub slice_segment_mode: u32,

    pub loop_filter_disable: bool,
    pub loop_filter_offset_in_pps: bool,
    pub loop_filter_beta_offset_div2: i32,
    pub loop_filter_tc_offset_div2: i32,
    pub deblocking_filter_metric: bool,
    pub lf_cross_slice_boundary: bool,
    pub constrained_intra_pred: bool,
    pub sao: bool,
    pub tmvp: bool,
    pub weighted_pred: bool,
    pub weighted_bipred: bool,
    pub sign_data_hiding: bool,
    pub transform_skip: bool,
    pub log2_max_transform_skip_block_size: u32,
    pub log2_parallel_merge_level_minus2: u32,

    pub tiles: TileConfig,
    pub scaling_list: ScalingListMode,
    pub capabilities: Capabilities,

    pub field_coding: bool,
    /// Parallelism the GOP compressor fans out to. Every lane gets its own encode stack.
    pub split_jobs: u32,
    pub wpp_threads: u32,
    pub wpp_extra_lines: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        // Low delay configuration with a hierarchy of 4 pictures.
        let gop_list = vec![
            GopEntry::new(1, SliceType::B, 5, &[-1, -5, -9, -13]),
            GopEntry::new(2, SliceType::B, 4, &[-1, -2, -6, -10])
                .with_inter_rps_prediction(InterRpsPrediction::Auto),
            GopEntry::new(3, SliceType::B, 5, &[-1, -3, -7, -11])
                .with_inter_rps_prediction(InterRpsPrediction::Auto),
            GopEntry::new(4, SliceType::B, 1, &[-1, -4, -8, -12])
                .with_inter_rps_prediction(InterRpsPrediction::Auto),
        ];

        Self {
            resolution: Resolution {
                width: 416,
                height: 240,
            },
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            profile: Profile::Main,
            tier: Tier::Main,
            level: Level::L4,
            progressive_source: true,
            interlaced_source: false,
            frame_only_constraint: true,

            max_cu_width: 64,
            max_cu_height: 64,
            max_total_cu_depth: 4,
            log2_diff_max_min_coding_block_size: 3,
            quadtree_tu_log2_max_size: 5,
            quadtree_tu_log2_min_size: 2,

            gop_size: gop_list.len(),
            gop_list,
            extra_rps: 0,
            intra_period: -1,
            decoding_refresh_type: 0,
            max_temporal_layers: 1,
            max_dec_pic_buffering: [5; MAX_TLAYER],
            num_reorder_pics: [0; MAX_TLAYER],

            base_qp: 32,
            intra_qp_offset: 0,
            switch_poc: None,
            switch_dqp: 0,
            dqps: None,
            max_delta_qp: 0,
            max_cu_dqp_depth: 0,
            adaptive_qp: false,
            luma_level_to_delta_qp: false,
            rate_control: false,
            transquant_bypass: false,
            cost_mode: CostMode::StandardLossy,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            wcg_chroma_qp: None,

            target_bitrate: 0,
            cpb_size: 0,
            frame_rate: 30,
            temporal_subsample_ratio: 1,
            vui_parameters_present: false,
            vui: Default::default(),
            buffering_period_sei: false,
            picture_timing_sei: false,
            decoding_unit_info_sei: false,
            cpb_saturation: false,
            slice_mode: 0,
            slice_segment_mode: 0,

            loop_filter_disable: false,
            loop_filter_offset_in_pps: true,
            loop_filter_beta_offset_div2: 0,
            loop_filter_tc_offset_div2: 0,
            deblocking_filter_metric: false,
            lf_cross_slice_boundary: true,
            constrained_intra_pred: false,
            sao: true,
            tmvp: true,
            weighted_pred: false,
            weighted_bipred: false,
            sign_data_hiding: true,
            transform_skip: true,
            log2_max_transform_skip_block_size: 2,
            log2_parallel_merge_level_minus2: 0,

            tiles: Default::default(),
            scaling_list: ScalingListMode::Off,
            capabilities: Default::default(),

            field_coding: false,
            split_jobs: 1,
            wpp_threads: 1,
            wpp_extra_lines: 0,
        }
    }
}

impl EncoderConfig {
    /// Whether the configured SEI messages require HRD parameters.
    pub fn needs_hrd(&self) -> bool {
        self.picture_timing_sei || self.decoding_unit_info_sei || self.cpb_saturation
    }

    /// Whether the second PPS with WCG chroma QP offsets is in use.
    pub fn wcg_enabled(&self) -> bool {
        self.capabilities.wcg_chroma_qp_pps && self.wcg_chroma_qp.is_some()
    }

    pub fn tunings(&self) -> Tunings {
        Tunings {
            target_bitrate: self.target_bitrate,
            cpb_size: self.cpb_size,
            frame_rate: self.frame_rate,
        }
    }
}

/// Rate-distortion cost evaluation. Each encode stack owns one instance.
pub trait CostEvaluator: Send {
    fn set_cost_mode(&mut self, mode: CostMode);

    /// Sets the Lagrange multiplier used by [`CostEvaluator::cost`].
    fn set_lambda(&mut self, lambda: f64);

    fn cost(&self, distortion: u64, bits: u64) -> f64;
}

/// Entropy coder used to estimate the rate of coding decisions. Each encode stack owns one
/// instance.
pub trait EntropyEstimator: Send {
    /// Resets the coder state for the start of `slice`.
    fn reset(&mut self, slice: &Slice);

    /// Fractional bits spent since the last reset.
    fn estimated_bits(&self) -> u64;
}

/// Builds the private coding state of every encode stack.
pub trait StackFactory {
    fn cost_evaluator(&self, stack: usize) -> Box<dyn CostEvaluator>;

    fn entropy_estimator(&self, stack: usize, sps: &Sps) -> Box<dyn EntropyEstimator>;
}

/// Codes a batch of buffered pictures. The batch is complete: either a whole GOP or the tail of
/// the sequence when flushing.
pub trait GopCompressor {
    /// Element of the reconstruction output list.
    type Recon;

    fn compress_gop(
        &mut self,
        ctx: GopContext<'_>,
        rec_out: &mut VecDeque<Self::Recon>,
    ) -> CompressorResult<()>;
}
