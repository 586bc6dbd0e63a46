// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of the encoder configuration into sequence and picture parameter sets.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::PpsBuilder;
use crate::codec::h265::params::Profile;
use crate::codec::h265::params::ProfileTierLevel;
use crate::codec::h265::params::Sps;
use crate::codec::h265::params::SpsBuilder;
use crate::codec::h265::rps::RpsList;
use crate::codec::h265::rps::MAX_NUM_REF_PICS;
use crate::encoder::hrd;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::ScalingListMode;

/// log2 of the maximum number of tile columns and rows.
const LOG2_MAX_NUM_COLUMNS_MINUS1: u32 = 7;
const LOG2_MAX_NUM_ROWS_MINUS1: u32 = 7;

/// Parameter sets indexed by their id, each with a flag telling whether it changed since it was
/// last written.
#[derive(Debug)]
pub struct ParameterSetMap<T> {
    sets: BTreeMap<u8, (Arc<T>, bool)>,
}

impl<T> Default for ParameterSetMap<T> {
    fn default() -> Self {
        Self {
            sets: BTreeMap::new(),
        }
    }
}

impl<T> ParameterSetMap<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores `set` under `id`, replacing any previous set and marking it as changed.
    pub fn insert(&mut self, id: u8, set: Arc<T>) {
        self.sets.insert(id, (set, true));
    }

    pub fn get(&self, id: u8) -> Option<&Arc<T>> {
        self.sets.get(&id).map(|(set, _)| set)
    }

    /// The set with the lowest id.
    pub fn first(&self) -> Option<&Arc<T>> {
        self.sets.values().next().map(|(set, _)| set)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.sets.keys().copied()
    }

    /// Returns whether the set `id` changed since the last call and clears the flag.
    pub fn needs_writing(&mut self, id: u8) -> bool {
        match self.sets.get_mut(&id) {
            Some((_, changed)) => std::mem::replace(changed, false),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

/// Checks the tile layout against the picture size in CTUs.
pub fn check_tiles(config: &EncoderConfig) -> EncodeResult<()> {
    let tiles = &config.tiles;
    let width_in_ctus = config.resolution.in_blocks(config.max_cu_width).width;
    let height_in_ctus = config.resolution.in_blocks(config.max_cu_height).height;

    if tiles.num_columns_minus1 >= 1 << (LOG2_MAX_NUM_COLUMNS_MINUS1 + 1) {
        return Err(EncodeError::TileColumns(format!(
            "{} columns exceed the maximum allowed number of columns",
            tiles.num_columns_minus1 + 1
        )));
    }

    if tiles.num_columns_minus1 >= width_in_ctus {
        return Err(EncodeError::TileColumns(format!(
            "a picture {} CTUs wide cannot have {} columns",
            width_in_ctus,
            tiles.num_columns_minus1 + 1
        )));
    }

    if tiles.num_columns_minus1 > 0 && !tiles.uniform_spacing {
        let count = tiles.num_columns_minus1 as usize;
        if tiles.column_widths.len() < count {
            return Err(EncodeError::TileColumns(format!(
                "{} column widths given for {} columns",
                tiles.column_widths.len(),
                count + 1
            )));
        }

        let total: u64 = tiles.column_widths[..count].iter().map(|&w| u64::from(w)).sum();
        if total >= u64::from(width_in_ctus) {
            return Err(EncodeError::TileColumns(format!(
                "columns of {} CTUs do not fit a picture {} CTUs wide",
                total, width_in_ctus
            )));
        }
    }

    if tiles.num_rows_minus1 >= 1 << (LOG2_MAX_NUM_ROWS_MINUS1 + 1) {
        return Err(EncodeError::TileRows(format!(
            "{} rows exceed the maximum allowed number of rows",
            tiles.num_rows_minus1 + 1
        )));
    }

    if tiles.num_rows_minus1 >= height_in_ctus {
        return Err(EncodeError::TileRows(format!(
            "a picture {} CTUs high cannot have {} rows",
            height_in_ctus,
            tiles.num_rows_minus1 + 1
        )));
    }

    if tiles.num_rows_minus1 > 0 && !tiles.uniform_spacing {
        let count = tiles.num_rows_minus1 as usize;
        if tiles.row_heights.len() < count {
            return Err(EncodeError::TileRows(format!(
                "{} row heights given for {} rows",
                tiles.row_heights.len(),
                count + 1
            )));
        }

        let total: u64 = tiles.row_heights[..count].iter().map(|&w| u64::from(w)).sum();
        if total >= u64::from(height_in_ctus) {
            return Err(EncodeError::TileRows(format!(
                "rows of {} CTUs do not fit a picture {} CTUs high",
                total, height_in_ctus
            )));
        }
    }

    Ok(())
}

/// Whether the SPS enables scaling lists. Loading lists from a file is left to the block coder
/// and is rejected.
pub fn scaling_list_enabled(config: &EncoderConfig) -> EncodeResult<bool> {
    if !config.capabilities.scaling_lists {
        return Ok(false);
    }

    match &config.scaling_list {
        ScalingListMode::Off => Ok(false),
        ScalingListMode::Default => Ok(true),
        ScalingListMode::FileRead(path) => {
            log::error!("scaling list file {} cannot be loaded", path.display());
            Err(EncodeError::UnsupportedScalingList)
        }
    }
}

/// The most frequent number of active references among the GOP entries. Ties resolve to the
/// smallest number.
pub fn num_ref_idx_default_active(config: &EncoderConfig) -> EncodeResult<u32> {
    let mut histogram = [0usize; MAX_NUM_REF_PICS + 1];

    for (i, entry) in config.gop_list.iter().take(config.gop_size).enumerate() {
        let active = usize::try_from(entry.num_ref_pics_active)
            .ok()
            .filter(|n| *n <= MAX_NUM_REF_PICS)
            .ok_or_else(|| {
                EncodeError::InvalidGopEntry(format!(
                    "entry {} has {} active references",
                    i, entry.num_ref_pics_active
                ))
            })?;
        histogram[active] += 1;
    }

    let mut best = 0;
    for (active, count) in histogram.iter().enumerate() {
        if *count > histogram[best] {
            best = active;
        }
    }

    if best >= MAX_NUM_REF_PICS {
        return Err(EncodeError::InvalidGopEntry(format!(
            "{} default active references cannot be signalled",
            best
        )));
    }

    Ok(best as u32)
}

/// The profile compatibility of the stream.
fn profile_tier_level(config: &EncoderConfig) -> ProfileTierLevel {
    let mut ptl = ProfileTierLevel {
        profile_idc: config.profile,
        tier_flag: config.tier,
        level_idc: config.level,
        progressive_source_flag: config.progressive_source,
        interlaced_source_flag: config.interlaced_source,
        non_packed_constraint_flag: false,
        frame_only_constraint_flag: config.frame_only_constraint,
        bit_depth_constraint: config.bit_depth_luma.max(config.bit_depth_chroma),
        chroma_format_constraint: config.chroma_format,
        ..Default::default()
    };

    ptl.set_compatible(config.profile);
    // Main10 restricted to 8 bits is Main.
    if config.profile == Profile::Main10
        && config.bit_depth_luma == 8
        && config.bit_depth_chroma == 8
    {
        ptl.set_compatible(Profile::Main);
    }
    // Main10 decoders always decode Main.
    if config.profile == Profile::Main {
        ptl.set_compatible(Profile::Main10);
    }

    ptl
}

/// Builds the SPS, including the VUI timing and HRD parameters when they are needed.
pub fn build_sps(
    config: &EncoderConfig,
    sps_id: u8,
    rps_list: RpsList,
) -> EncodeResult<Arc<Sps>> {
    let scaling_list = scaling_list_enabled(config)?;

    let mut vui = config.vui.clone();
    vui.field_seq_flag = false;
    vui.hrd_parameters_present_flag = false;

    if config.needs_hrd() {
        if let Some(derived) = hrd::derive(config)? {
            vui.timing_info = derived.timing_info;
            vui.hrd = derived.hrd;
        }
    }

    if config.buffering_period_sei || config.picture_timing_sei || config.decoding_unit_info_sei {
        vui.hrd_parameters_present_flag = true;
    }

    let sps = SpsBuilder::new()
        .sps_id(sps_id)
        .profile_tier_level(profile_tier_level(config))
        .chroma_format(config.chroma_format)
        .resolution(config.resolution.width, config.resolution.height)
        .coding_block_sizes(
            config.max_cu_width,
            config.max_cu_height,
            config.max_total_cu_depth,
            config.log2_diff_max_min_coding_block_size,
        )
        .transform_block_sizes(
            config.quadtree_tu_log2_max_size,
            config.quadtree_tu_log2_min_size,
        )
        .bit_depth(config.bit_depth_luma, config.bit_depth_chroma)
        .temporal_layers(
            config.max_temporal_layers,
            &config.max_dec_pic_buffering,
            &config.num_reorder_pics,
        )
        .temporal_mvp_enabled_flag(config.tmvp)
        .sao_enabled_flag(config.sao)
        .scaling_list_enabled_flag(scaling_list)
        .vui_parameters(config.vui_parameters_present, vui)
        .rps_list(rps_list)
        .build();

    log::debug!(
        "built SPS {}: {}x{} ctu {} rps {}",
        sps.sps_id,
        sps.pic_width_in_luma_samples,
        sps.pic_height_in_luma_samples,
        sps.max_cu_width,
        sps.rps_list.len()
    );

    Ok(sps)
}

/// Whether CU level delta QP has to be signalled.
fn use_dqp(config: &EncoderConfig) -> bool {
    if config.cost_mode.is_lossless() {
        return false;
    }

    config.max_cu_dqp_depth > 0
        || config.max_delta_qp != 0
        || config.adaptive_qp
        || config.luma_level_to_delta_qp
}

/// init_qp_minus26 for the configured base QP.
fn init_qp_minus26(config: &EncoderConfig, sps: &Sps) -> i32 {
    if !config.capabilities.adapt_pps_qp {
        return 0;
    }

    let base_qp = if config.gop_size == 16 {
        config.base_qp - 24
    } else {
        config.base_qp - 26
    };

    base_qp.clamp(-26 + sps.qp_bd_offset_luma, 25)
}

fn round_half_away(value: f64) -> i32 {
    if value < 0.0 {
        (value - 0.5) as i32
    } else {
        (value + 0.5) as i32
    }
}

/// Chroma QP offsets of the PPS `pps_id`. With WCG control each PPS id stands for one QP step
/// above the base QP.
fn chroma_qp_offsets(config: &EncoderConfig, pps_id: u8) -> (i32, i32) {
    match config.wcg_chroma_qp.filter(|_| config.wcg_enabled()) {
        Some(wcg) => {
            let base_qp = f64::from(config.base_qp + i32::from(pps_id));
            let chroma_qp = wcg.chroma_qp_scale * base_qp + wcg.chroma_qp_offset;
            let cb = round_half_away(wcg.chroma_cb_qp_scale * chroma_qp);
            let cr = round_half_away(wcg.chroma_cr_qp_scale * chroma_qp);
            (
                (cb.min(0) + config.cb_qp_offset).clamp(-12, 12),
                (cr.min(0) + config.cr_qp_offset).clamp(-12, 12),
            )
        }
        None => (config.cb_qp_offset, config.cr_qp_offset),
    }
}

/// Builds the PPS `pps_id` referring to `sps`.
pub fn build_pps(config: &EncoderConfig, sps: &Sps, pps_id: u8) -> EncodeResult<Arc<Pps>> {
    let (use_dqp, max_cu_dqp_depth) = if config.rate_control {
        (true, 0)
    } else {
        (use_dqp(config), config.max_cu_dqp_depth)
    };

    let (cb_qp_offset, cr_qp_offset) = chroma_qp_offsets(config, pps_id);
    let slice_chroma_qp_offsets = config
        .gop_list
        .iter()
        .take(config.gop_size)
        .any(|e| e.cb_qp_offset != 0 || e.cr_qp_offset != 0);

    let (override_enabled, disabled) = if config.deblocking_filter_metric {
        (true, false)
    } else {
        (!config.loop_filter_offset_in_pps, config.loop_filter_disable)
    };

    let num_ref_idx = num_ref_idx_default_active(config)?;

    let mut builder = PpsBuilder::new(sps)
        .pps_id(pps_id)
        .constrained_intra_pred_flag(config.constrained_intra_pred)
        .dqp(use_dqp, max_cu_dqp_depth)
        .init_qp_minus26(init_qp_minus26(config, sps))
        .chroma_qp_offsets(cb_qp_offset, cr_qp_offset)
        .slice_chroma_qp_offsets_present_flag(slice_chroma_qp_offsets)
        .weighted_prediction(config.weighted_pred, config.weighted_bipred)
        .sign_data_hiding_enabled_flag(config.sign_data_hiding)
        .deblocking(
            override_enabled,
            disabled,
            config.loop_filter_beta_offset_div2,
            config.loop_filter_tc_offset_div2,
        )
        .log2_parallel_merge_level_minus2(config.log2_parallel_merge_level_minus2)
        .cabac_init_present_flag(true)
        .loop_filter_across_slices_enabled_flag(config.lf_cross_slice_boundary)
        .num_ref_idx_default_active(num_ref_idx, num_ref_idx)
        .transquant_bypass_enabled_flag(config.transquant_bypass)
        .transform_skip(
            config.transform_skip,
            config.log2_max_transform_skip_block_size,
        );

    if config.capabilities.tiles_wpp {
        check_tiles(config)?;

        let tiles = &config.tiles;
        builder = builder
            .entropy_coding_sync_enabled_flag(tiles.entropy_coding_sync)
            .tiles(
                tiles.uniform_spacing,
                tiles.num_columns_minus1,
                tiles.num_rows_minus1,
                &tiles.column_widths,
                &tiles.row_heights,
                tiles.loop_filter_across_tiles,
            );
    }

    let pps = builder.build();

    log::debug!(
        "built PPS {}: dqp {} depth {} init_qp_minus26 {} chroma offsets {}/{}",
        pps.pps_id,
        pps.use_dqp,
        pps.max_cu_dqp_depth,
        pps.init_qp_minus26,
        pps.cb_qp_offset,
        pps.cr_qp_offset
    );

    Ok(pps)
}

/// The id of the PPS a picture with `poc` is coded with, or `None` for the default PPS.
pub fn pps_id_for_poc(config: &EncoderConfig, poc: i32) -> Option<u8> {
    if !config.wcg_enabled() {
        return None;
    }

    let dqp = config
        .dqps
        .as_ref()
        .and_then(|dqps| usize::try_from(poc).ok().and_then(|p| dqps.get(p)))
        .copied()
        .unwrap_or(0);
    let switched = config.switch_poc.is_some_and(|switch_poc| poc >= switch_poc);

    u8::try_from(dqp + i32::from(switched)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::slice::SliceType;
    use crate::encoder::GopEntry;
    use crate::encoder::TileConfig;
    use crate::encoder::WcgChromaQpControl;

    #[test]
    fn change_flags_are_cleared_on_write() {
        let mut map = ParameterSetMap::new();
        map.insert(0, Arc::new(0u32));
        map.insert(1, Arc::new(1u32));

        assert!(map.needs_writing(1));
        assert!(!map.needs_writing(1));
        assert!(map.needs_writing(0));
        assert!(!map.needs_writing(7));

        map.insert(1, Arc::new(2u32));
        assert!(map.needs_writing(1));
        assert_eq!(**map.first().unwrap(), 0);
    }

    #[test]
    fn sps_follows_config() {
        let config = EncoderConfig {
            bit_depth_luma: 10,
            bit_depth_chroma: 10,
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();

        assert_eq!(sps.pic_width_in_luma_samples, 416);
        assert_eq!(sps.log2_min_coding_block_size, 3);
        assert_eq!(sps.qp_bd_offset_luma, 12);
        assert!(sps.temporal_id_nesting_flag);
        assert!(sps.profile_tier_level.is_compatible(Profile::Main));
        assert!(sps.profile_tier_level.is_compatible(Profile::Main10));
        assert!(!sps.vui_parameters_present_flag);
    }

    #[test]
    fn main10_with_8_bits_is_main_compatible() {
        let config = EncoderConfig {
            profile: Profile::Main10,
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();
        assert!(sps.profile_tier_level.is_compatible(Profile::Main));
    }

    #[test]
    fn sps_carries_hrd_when_timing_sei_is_on() {
        let config = EncoderConfig {
            vui_parameters_present: true,
            picture_timing_sei: true,
            target_bitrate: 2_000_000,
            cpb_size: 2_000_000,
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();

        let vui = &sps.vui_parameters;
        assert!(sps.vui_parameters_present_flag);
        assert!(vui.hrd_parameters_present_flag);
        assert_eq!(vui.timing_info.num_units_in_tick, 900_900);
        assert_eq!(vui.hrd.bit_rate_scale, 1);
    }

    #[test]
    fn cpb_saturation_keeps_hrd_without_vui() {
        let config = EncoderConfig {
            vui_parameters_present: false,
            cpb_saturation: true,
            target_bitrate: 2_000_000,
            cpb_size: 2_000_000,
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();

        // Not signalled, but rate control still reads the derived record.
        assert!(!sps.vui_parameters_present_flag);
        let vui = &sps.vui_parameters;
        assert_eq!(vui.timing_info.num_units_in_tick, 900_900);
        assert_eq!(vui.timing_info.time_scale, 27_000_000);
        assert_eq!(vui.hrd.bit_rate_scale, 1);
        assert_eq!(vui.hrd.nal_hrd[0].bit_rate_value_minus1[0], 15624);
    }

    #[test]
    fn scaling_list_file_is_rejected() {
        let config = EncoderConfig {
            scaling_list: ScalingListMode::FileRead("lists.txt".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_sps(&config, 0, RpsList::default()),
            Err(EncodeError::UnsupportedScalingList)
        ));

        let config = EncoderConfig {
            scaling_list: ScalingListMode::Default,
            ..Default::default()
        };
        assert!(scaling_list_enabled(&config).unwrap());
    }

    #[test]
    fn pps_dqp_and_init_qp() {
        let config = EncoderConfig {
            max_cu_dqp_depth: 2,
            base_qp: 37,
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();
        let pps = build_pps(&config, &sps, 0).unwrap();
        assert!(pps.use_dqp);
        assert_eq!(pps.max_cu_dqp_depth, 2);
        assert_eq!(pps.init_qp_minus26, 11);
        assert_eq!(pps.num_ref_idx_l0_default_active, 4);

        let config = EncoderConfig {
            max_cu_dqp_depth: 2,
            cost_mode: crate::encoder::CostMode::Lossless,
            base_qp: 0,
            ..Default::default()
        };
        let pps = build_pps(&config, &sps, 0).unwrap();
        assert!(!pps.use_dqp);
        assert_eq!(pps.max_cu_dqp_depth, 0);
        assert_eq!(pps.init_qp_minus26, -26);

        let config = EncoderConfig {
            rate_control: true,
            max_cu_dqp_depth: 2,
            ..Default::default()
        };
        let pps = build_pps(&config, &sps, 0).unwrap();
        assert!(pps.use_dqp);
        assert_eq!(pps.max_cu_dqp_depth, 0);
    }

    #[test]
    fn ref_idx_histogram_prefers_smaller_on_ties() {
        let config = EncoderConfig {
            gop_size: 4,
            gop_list: vec![
                GopEntry::new(1, SliceType::B, 0, &[-1, -2]),
                GopEntry::new(2, SliceType::B, 0, &[-1]),
                GopEntry::new(3, SliceType::B, 0, &[-1, -2]),
                GopEntry::new(4, SliceType::B, 0, &[-1]),
            ],
            ..Default::default()
        };
        assert_eq!(num_ref_idx_default_active(&config).unwrap(), 1);

        let mut config = config;
        config.gop_list[0].num_ref_pics_active = -1;
        assert!(matches!(
            num_ref_idx_default_active(&config),
            Err(EncodeError::InvalidGopEntry(_))
        ));
    }

    #[test]
    fn tiles_must_fit_the_picture() {
        // 416x240 is 7x4 CTUs of 64.
        let mut config = EncoderConfig {
            tiles: TileConfig {
                num_columns_minus1: 6,
                num_rows_minus1: 3,
                uniform_spacing: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(check_tiles(&config).is_ok());

        config.tiles.num_columns_minus1 = 7;
        assert!(matches!(check_tiles(&config), Err(EncodeError::TileColumns(_))));

        config.tiles.num_columns_minus1 = 1;
        config.tiles.num_rows_minus1 = 4;
        assert!(matches!(check_tiles(&config), Err(EncodeError::TileRows(_))));

        config.tiles.num_rows_minus1 = 1;
        config.tiles.uniform_spacing = false;
        config.tiles.column_widths = vec![7];
        config.tiles.row_heights = vec![2];
        assert!(matches!(check_tiles(&config), Err(EncodeError::TileColumns(_))));

        config.tiles.column_widths = vec![3];
        assert!(check_tiles(&config).is_ok());

        let sps = build_sps(&config, 0, RpsList::default()).unwrap();
        let pps = build_pps(&config, &sps, 0).unwrap();
        assert!(pps.tiles_enabled_flag);
        assert_eq!(pps.column_widths, vec![3]);
    }

    #[test]
    fn huge_tile_sizes_are_rejected() {
        let mut config = EncoderConfig {
            tiles: TileConfig {
                num_columns_minus1: 2,
                num_rows_minus1: 0,
                uniform_spacing: false,
                column_widths: vec![u32::MAX, 2],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(check_tiles(&config), Err(EncodeError::TileColumns(_))));

        config.tiles.num_columns_minus1 = 0;
        config.tiles.num_rows_minus1 = 2;
        config.tiles.row_heights = vec![1, u32::MAX];
        assert!(matches!(check_tiles(&config), Err(EncodeError::TileRows(_))));
    }

    #[test]
    fn wcg_offsets_per_pps() {
        let config = EncoderConfig {
            base_qp: 30,
            wcg_chroma_qp: Some(WcgChromaQpControl {
                chroma_cb_qp_scale: 1.0,
                chroma_cr_qp_scale: 1.0,
                chroma_qp_scale: -0.5,
                chroma_qp_offset: 10.0,
            }),
            dqps: Some(vec![0, 1, 0, 1]),
            switch_poc: Some(2),
            ..Default::default()
        };
        let sps = build_sps(&config, 0, RpsList::default()).unwrap();

        // -0.5 * 30 + 10 = -5, -0.5 * 31 + 10 = -5.5 rounds to -6.
        let pps0 = build_pps(&config, &sps, 0).unwrap();
        let pps1 = build_pps(&config, &sps, 1).unwrap();
        assert_eq!((pps0.cb_qp_offset, pps0.cr_qp_offset), (-5, -5));
        assert_eq!((pps1.cb_qp_offset, pps1.cr_qp_offset), (-6, -6));

        assert_eq!(pps_id_for_poc(&config, 0), Some(0));
        assert_eq!(pps_id_for_poc(&config, 1), Some(1));
        assert_eq!(pps_id_for_poc(&config, 2), Some(1));
        assert_eq!(pps_id_for_poc(&config, 3), Some(2));

        let config = EncoderConfig {
            capabilities: crate::encoder::Capabilities {
                wcg_chroma_qp_pps: false,
                ..Default::default()
            },
            ..config
        };
        assert_eq!(pps_id_for_poc(&config, 3), None);
    }
}
