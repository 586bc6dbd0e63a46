// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use enumn::N;

use crate::codec::h265::rps::RpsList;
use crate::ChromaFormat;
use crate::Resolution;

/// The number of temporal sub-layers representable in the parameter sets.
pub const MAX_TLAYER: usize = 7;

/// The number of alternative CPB specifications per sub-layer.
pub const MAX_CPB_CNT: usize = 32;

/// The highest luma QP for 8-bit video.
pub const MAX_QP: i32 = 51;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    None = 0,
    #[default]
    Main = 1,
    Main10 = 2,
    MainStillPicture = 3,
    MainRext = 4,
    HighThroughputRext = 5,
    Next = 6,
}

/// Levels as defined by table A.8. general_level_idc is 30 times the level number.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 30,
    L2 = 60,
    L2_1 = 63,
    L3 = 90,
    L3_1 = 93,
    #[default]
    L4 = 120,
    L4_1 = 123,
    L5 = 150,
    L5_1 = 153,
    L5_2 = 156,
    L6 = 180,
    L6_1 = 183,
    L6_2 = 186,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tier {
    #[default]
    Main = 0,
    High = 1,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub profile_idc: Profile,
    pub tier_flag: Tier,
    pub level_idc: Level,
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    /// Maximum bit depth the stream is constrained to.
    pub bit_depth_constraint: u32,
    pub chroma_format_constraint: ChromaFormat,
}

impl ProfileTierLevel {
    /// Marks the stream as decodable by decoders conforming to `profile`.
    pub fn set_compatible(&mut self, profile: Profile) {
        self.profile_compatibility_flag[profile as usize] = true;
    }

    pub fn is_compatible(&self, profile: Profile) -> bool {
        self.profile_compatibility_flag[profile as usize]
    }
}

/// Timing information of the VUI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub timing_info_present_flag: bool,
    /// Number of time units of a clock operating at `time_scale` Hz that corresponds to one
    /// increment of a clock tick counter.
    pub num_units_in_tick: u32,
    /// Number of time units that pass in one second.
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    /// bit_rate_value_minus1[ i ] (together with bit_rate_scale) specifies the
    /// maximum input bit rate for the i-th CPB when the CPB operates at the
    /// access unit level
    pub bit_rate_value_minus1: [u32; MAX_CPB_CNT],
    /// cpb_size_value_minus1[ i ] is used together with cpb_size_scale to
    /// specify the i-th CPB size when the CPB operates at the access unit
    /// level.
    pub cpb_size_value_minus1: [u32; MAX_CPB_CNT],
    /// cpb_size_du_value_minus1[ i ] is used together with cpb_size_du_scale to
    /// specify the i-th CPB size when the CPB operates at sub-picture level.
    pub cpb_size_du_value_minus1: [u32; MAX_CPB_CNT],
    /// bit_rate_du_value_minus1[ i ] (together with bit_rate_scale) specifies
    /// the maximum input bit rate for the i-th CPB when the CPB operates at the
    /// sub-picture level.
    pub bit_rate_du_value_minus1: [u32; MAX_CPB_CNT],
    pub cbr_flag: [bool; MAX_CPB_CNT],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HrdParams {
    /// When set, NAL HRD parameters (Type II conformance point) are present.
    pub nal_hrd_parameters_present_flag: bool,
    /// When set, VCL HRD parameters (Type I conformance point) are present.
    pub vcl_hrd_parameters_present_flag: bool,
    /// When set, the HRD may operate at access unit or sub-picture level.
    pub sub_pic_hrd_params_present_flag: bool,
    /// Used to specify the clock sub-tick when `sub_pic_hrd_params_present_flag` is set.
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    /// Together with bit_rate_value_minus1[ i ], specifies the maximum input
    /// bit rate of the i-th CPB.
    pub bit_rate_scale: u8,
    /// Together with cpb_size_value_minus1[ i ], specifies the CPB size of
    /// the i-th CPB.
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; MAX_TLAYER],
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_TLAYER],
    pub elemental_duration_in_tc_minus1: [u32; MAX_TLAYER],
    pub low_delay_hrd_flag: [bool; MAX_TLAYER],
    pub cpb_cnt_minus1: [u32; MAX_TLAYER],
    /// The NAL HRD data.
    pub nal_hrd: [SublayerHrdParameters; MAX_TLAYER],
    /// The VCL HRD data.
    pub vcl_hrd: [SublayerHrdParameters; MAX_TLAYER],
}

impl Default for HrdParams {
    fn default() -> Self {
        Self {
            initial_cpb_removal_delay_length_minus1: 23,
            au_cpb_removal_delay_length_minus1: 23,
            dpb_output_delay_length_minus1: 23,
            nal_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            sub_pic_hrd_params_present_flag: Default::default(),
            tick_divisor_minus2: Default::default(),
            du_cpb_removal_delay_increment_length_minus1: Default::default(),
            sub_pic_cpb_params_in_pic_timing_sei_flag: Default::default(),
            bit_rate_scale: Default::default(),
            cpb_size_scale: Default::default(),
            cpb_size_du_scale: Default::default(),
            dpb_output_delay_du_length_minus1: Default::default(),
            fixed_pic_rate_general_flag: Default::default(),
            fixed_pic_rate_within_cvs_flag: Default::default(),
            elemental_duration_in_tc_minus1: Default::default(),
            low_delay_hrd_flag: Default::default(),
            cpb_cnt_minus1: Default::default(),
            nal_hrd: Default::default(),
            vcl_hrd: Default::default(),
        }
    }
}

impl HrdParams {
    /// BitRate[ i ] for the first CPB of sub-layer `tid`, in bits per second.
    pub fn bit_rate(&self, tid: usize) -> u64 {
        (u64::from(self.nal_hrd[tid].bit_rate_value_minus1[0]) + 1)
            << (6 + u32::from(self.bit_rate_scale))
    }

    /// CpbSize[ i ] for the first CPB of sub-layer `tid`, in bits.
    pub fn cpb_size(&self, tid: usize) -> u64 {
        (u64::from(self.nal_hrd[tid].cpb_size_value_minus1[0]) + 1)
            << (4 + u32::from(self.cpb_size_scale))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub timing_info: TimingInfo,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

/// A Sequence Parameter Set as produced by the encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub sps_id: u8,
    pub profile_tier_level: ProfileTierLevel,
    pub chroma_format: ChromaFormat,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub max_cu_width: u32,
    pub max_cu_height: u32,
    pub max_coding_depth: u32,
    pub log2_diff_max_min_coding_block_size: u32,
    pub log2_min_coding_block_size: u32,
    pub quadtree_tu_log2_max_size: u32,
    pub quadtree_tu_log2_min_size: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    /// 6 * (bit_depth_luma - 8)
    pub qp_bd_offset_luma: i32,
    /// 6 * (bit_depth_chroma - 8)
    pub qp_bd_offset_chroma: i32,
    pub max_tlayers: u32,
    pub temporal_id_nesting_flag: bool,
    pub max_dec_pic_buffering: [u32; MAX_TLAYER],
    pub num_reorder_pics: [u32; MAX_TLAYER],
    pub temporal_mvp_enabled_flag: bool,
    pub sao_enabled_flag: bool,
    pub scaling_list_enabled_flag: bool,
    pub num_long_term_ref_pic_sps: u32,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    /// Candidate short-term reference picture sets.
    pub rps_list: RpsList,
}

impl Sps {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.pic_width_in_luma_samples,
            height: self.pic_height_in_luma_samples,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sps_id(mut self, value: u8) -> Self {
        self.0.sps_id = value;
        self
    }

    pub fn profile_tier_level(mut self, value: ProfileTierLevel) -> Self {
        self.0.profile_tier_level = value;
        self
    }

    pub fn chroma_format(mut self, value: ChromaFormat) -> Self {
        self.0.chroma_format = value;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.0.pic_width_in_luma_samples = width;
        self.0.pic_height_in_luma_samples = height;
        self
    }

    /// Sets the CTU size and the coding block size range, deriving the log2 of the minimum
    /// coding block size as `ctu >> log2_diff_max_min`.
    pub fn coding_block_sizes(
        mut self,
        max_cu_width: u32,
        max_cu_height: u32,
        max_coding_depth: u32,
        log2_diff_max_min: u32,
    ) -> Self {
        self.0.max_cu_width = max_cu_width;
        self.0.max_cu_height = max_cu_height;
        self.0.max_coding_depth = max_coding_depth;
        self.0.log2_diff_max_min_coding_block_size = log2_diff_max_min;

        let min_cu_size = max_cu_width.checked_shr(log2_diff_max_min).unwrap_or(0);
        self.0.log2_min_coding_block_size = if min_cu_size > 1 {
            min_cu_size.ilog2()
        } else {
            0
        };
        self
    }

    pub fn transform_block_sizes(mut self, log2_max: u32, log2_min: u32) -> Self {
        self.0.quadtree_tu_log2_max_size = log2_max;
        self.0.quadtree_tu_log2_min_size = log2_min;
        self
    }

    pub fn bit_depth(mut self, luma: u32, chroma: u32) -> Self {
        self.0.bit_depth_luma = luma;
        self.0.bit_depth_chroma = chroma;
        self.0.qp_bd_offset_luma = 6 * (luma as i32 - 8);
        self.0.qp_bd_offset_chroma = 6 * (chroma as i32 - 8);
        self
    }

    /// Sets the number of temporal layers and their buffering requirements. Only the first
    /// `max_tlayers` entries are copied.
    pub fn temporal_layers(
        mut self,
        max_tlayers: u32,
        max_dec_pic_buffering: &[u32; MAX_TLAYER],
        num_reorder_pics: &[u32; MAX_TLAYER],
    ) -> Self {
        self.0.max_tlayers = max_tlayers;
        self.0.temporal_id_nesting_flag = max_tlayers == 1;

        let count = (max_tlayers as usize).min(MAX_TLAYER);
        self.0.max_dec_pic_buffering[..count].copy_from_slice(&max_dec_pic_buffering[..count]);
        self.0.num_reorder_pics[..count].copy_from_slice(&num_reorder_pics[..count]);
        self
    }

    pub fn temporal_mvp_enabled_flag(mut self, value: bool) -> Self {
        self.0.temporal_mvp_enabled_flag = value;
        self
    }

    pub fn sao_enabled_flag(mut self, value: bool) -> Self {
        self.0.sao_enabled_flag = value;
        self
    }

    pub fn scaling_list_enabled_flag(mut self, value: bool) -> Self {
        self.0.scaling_list_enabled_flag = value;
        self
    }

    /// The VUI record is kept even when it is not signalled, rate control reads its HRD.
    pub fn vui_parameters(mut self, present: bool, value: VuiParams) -> Self {
        self.0.vui_parameters_present_flag = present;
        self.0.vui_parameters = value;
        self
    }

    pub fn rps_list(mut self, value: RpsList) -> Self {
        self.0.rps_list = value;
        self
    }

    pub fn build(self) -> Arc<Sps> {
        Arc::new(self.0)
    }
}

/// A Picture Parameter Set as produced by the encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub constrained_intra_pred_flag: bool,
    pub use_dqp: bool,
    pub max_cu_dqp_depth: u32,
    pub init_qp_minus26: i32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub uniform_spacing_flag: bool,
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    pub column_widths: Vec<u32>,
    pub row_heights: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub output_flag_present_flag: bool,
    pub sign_data_hiding_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub log2_parallel_merge_level_minus2: u32,
    pub cabac_init_present_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
    pub transquant_bypass_enabled_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub log2_max_transform_skip_block_size: u32,
}

#[derive(Clone, Debug)]
pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: &Sps) -> Self {
        Self(Pps {
            sps_id: sps.sps_id,
            ..Default::default()
        })
    }

    pub fn pps_id(mut self, value: u8) -> Self {
        self.0.pps_id = value;
        self
    }

    pub fn constrained_intra_pred_flag(mut self, value: bool) -> Self {
        self.0.constrained_intra_pred_flag = value;
        self
    }

    /// Enables CU level delta QP signalling down to `max_cu_dqp_depth`. The depth is ignored
    /// when delta QP is disabled.
    pub fn dqp(mut self, use_dqp: bool, max_cu_dqp_depth: u32) -> Self {
        self.0.use_dqp = use_dqp;
        self.0.max_cu_dqp_depth = if use_dqp { max_cu_dqp_depth } else { 0 };
        self
    }

    pub fn init_qp_minus26(mut self, value: i32) -> Self {
        self.0.init_qp_minus26 = value;
        self
    }

    pub fn chroma_qp_offsets(mut self, cb: i32, cr: i32) -> Self {
        self.0.cb_qp_offset = cb;
        self.0.cr_qp_offset = cr;
        self
    }

    pub fn slice_chroma_qp_offsets_present_flag(mut self, value: bool) -> Self {
        self.0.slice_chroma_qp_offsets_present_flag = value;
        self
    }

    pub fn entropy_coding_sync_enabled_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_sync_enabled_flag = value;
        self
    }

    pub fn tiles(
        mut self,
        uniform_spacing: bool,
        num_columns_minus1: u32,
        num_rows_minus1: u32,
        column_widths: &[u32],
        row_heights: &[u32],
        loop_filter_across_tiles: bool,
    ) -> Self {
        self.0.tiles_enabled_flag = num_columns_minus1 > 0 || num_rows_minus1 > 0;
        self.0.uniform_spacing_flag = uniform_spacing;
        self.0.num_tile_columns_minus1 = num_columns_minus1;
        self.0.num_tile_rows_minus1 = num_rows_minus1;
        if !uniform_spacing {
            self.0.column_widths = column_widths.to_vec();
            self.0.row_heights = row_heights.to_vec();
        }
        self.0.loop_filter_across_tiles_enabled_flag = loop_filter_across_tiles;
        self
    }

    pub fn weighted_prediction(mut self, pred: bool, bipred: bool) -> Self {
        self.0.weighted_pred_flag = pred;
        self.0.weighted_bipred_flag = bipred;
        self
    }

    pub fn sign_data_hiding_enabled_flag(mut self, value: bool) -> Self {
        self.0.sign_data_hiding_enabled_flag = value;
        self
    }

    /// Sets the deblocking controls. `deblocking_filter_control_present_flag` is derived: it is
    /// set whenever any of the settings differ from the inferred values.
    pub fn deblocking(
        mut self,
        override_enabled: bool,
        disabled: bool,
        beta_offset_div2: i32,
        tc_offset_div2: i32,
    ) -> Self {
        self.0.deblocking_filter_override_enabled_flag = override_enabled;
        self.0.pps_deblocking_filter_disabled_flag = disabled;
        let (beta, tc) = if disabled {
            (0, 0)
        } else {
            (beta_offset_div2, tc_offset_div2)
        };
        self.0.beta_offset_div2 = beta;
        self.0.tc_offset_div2 = tc;
        self.0.deblocking_filter_control_present_flag =
            override_enabled || disabled || beta != 0 || tc != 0;
        self
    }

    pub fn log2_parallel_merge_level_minus2(mut self, value: u32) -> Self {
        self.0.log2_parallel_merge_level_minus2 = value;
        self
    }

    pub fn cabac_init_present_flag(mut self, value: bool) -> Self {
        self.0.cabac_init_present_flag = value;
        self
    }

    pub fn loop_filter_across_slices_enabled_flag(mut self, value: bool) -> Self {
        self.0.loop_filter_across_slices_enabled_flag = value;
        self
    }

    pub fn num_ref_idx_default_active(mut self, l0: u32, l1: u32) -> Self {
        self.0.num_ref_idx_l0_default_active = l0;
        self.0.num_ref_idx_l1_default_active = l1;
        self
    }

    pub fn transquant_bypass_enabled_flag(mut self, value: bool) -> Self {
        self.0.transquant_bypass_enabled_flag = value;
        self
    }

    pub fn transform_skip(mut self, enabled: bool, log2_max_block_size: u32) -> Self {
        self.0.transform_skip_enabled_flag = enabled;
        self.0.log2_max_transform_skip_block_size = log2_max_block_size;
        self
    }

    pub fn build(self) -> Arc<Pps> {
        Arc::new(self.0)
    }
}
