// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derivation of the VUI timing information and of the HRD parameters from the rate settings.
//!
//! Every sub-layer gets the same values. The scale and value fields follow the scaled
//! representation of E.3.3: `BitRate = (bit_rate_value_minus1 + 1) << (6 + bit_rate_scale)` and
//! `CpbSize = (cpb_size_value_minus1 + 1) << (4 + cpb_size_scale)`. Values are obtained by a
//! floor division of the configured rate by the scale, so the signalled rate never exceeds the
//! configured one.

use crate::codec::h265::params::HrdParams;
use crate::codec::h265::params::TimingInfo;
use crate::codec::h265::params::MAX_TLAYER;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;

/// Clock of the timing information for the well known frame rates.
const CLOCK_27MHZ: u32 = 27_000_000;

const BIT_RATE_SCALE_OFFSET: u32 = 6;
const CPB_SIZE_SCALE_OFFSET: u32 = 4;

/// The timing and HRD parameters of the VUI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DerivedTiming {
    pub timing_info: TimingInfo,
    pub hrd: HrdParams,
}

/// Number of low order zero bits of `x`, i.e. the largest power of two `x` is a multiple of.
/// Returns 0 for 0.
pub fn calc_scale(x: u32) -> u32 {
    if x == 0 {
        return 0;
    }

    x.trailing_zeros()
}

/// Timing information for `frame_rate`, with the tick lengthened by `temporal_subsample_ratio`.
pub fn timing_info(frame_rate: u32, temporal_subsample_ratio: u32) -> TimingInfo {
    let (mut num_units_in_tick, mut time_scale): (u32, u32) = match frame_rate {
        24 => (1_125_000, CLOCK_27MHZ),
        25 => (1_080_000, CLOCK_27MHZ),
        30 => (900_900, CLOCK_27MHZ),
        50 => (540_000, CLOCK_27MHZ),
        60 => (450_450, CLOCK_27MHZ),
        _ => (1001, 60000),
    };

    if temporal_subsample_ratio > 1 {
        match num_units_in_tick.checked_mul(temporal_subsample_ratio) {
            Some(scaled) => num_units_in_tick = scaled,
            None => time_scale /= temporal_subsample_ratio,
        }
    }

    TimingInfo {
        timing_info_present_flag: true,
        num_units_in_tick,
        time_scale,
        ..Default::default()
    }
}

fn scale_with_offset(value: u32, offset: u32) -> u8 {
    calc_scale(value).saturating_sub(offset) as u8
}

/// Derives the VUI timing and HRD parameters from `config`.
///
/// Returns `None` when neither the VUI nor CPB saturation asks for them. A zero CPB size is
/// rejected whenever the derivation runs.
pub fn derive(config: &EncoderConfig) -> EncodeResult<Option<DerivedTiming>> {
    if config.cpb_size == 0 {
        log::error!("HRD parameters requested with a zero CPB size");
        return Err(EncodeError::InvalidConfig(
            "CPB size may not be zero when HRD parameters are required".into(),
        ));
    }

    if !config.vui_parameters_present && !config.cpb_saturation {
        return Ok(None);
    }

    let timing_info = timing_info(config.frame_rate, config.temporal_subsample_ratio);

    let bit_rate = config.target_bitrate;
    let cpb_size = config.cpb_size;
    let is_random_access = config.intra_period > 0;
    let use_sub_cpb_params = config.capabilities.hrd_sub_pictures
        && (config.slice_mode > 0 || config.slice_segment_mode > 0);

    let mut hrd = HrdParams {
        nal_hrd_parameters_present_flag: bit_rate > 0,
        vcl_hrd_parameters_present_flag: bit_rate > 0,
        sub_pic_hrd_params_present_flag: use_sub_cpb_params,
        bit_rate_scale: scale_with_offset(bit_rate, BIT_RATE_SCALE_OFFSET),
        cpb_size_scale: scale_with_offset(cpb_size, CPB_SIZE_SCALE_OFFSET),
        cpb_size_du_scale: 6,
        // 0.5s at 90kHz fits in 16 bits.
        initial_cpb_removal_delay_length_minus1: 15,
        ..Default::default()
    };

    if use_sub_cpb_params {
        hrd.tick_divisor_minus2 = 100 - 2;
        // 8 bits, plus one for the last DU of the AU.
        hrd.du_cpb_removal_delay_increment_length_minus1 = 7;
        hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = true;
        // A sub-tick of 1/100 needs 7 more bits than the AU delay.
        hrd.dpb_output_delay_du_length_minus1 = 5 + 7;
    }

    let delay_length_minus1 = if is_random_access { 5 } else { 9 };
    hrd.au_cpb_removal_delay_length_minus1 = delay_length_minus1;
    hrd.dpb_output_delay_length_minus1 = delay_length_minus1;

    let bit_rate_value = bit_rate >> (BIT_RATE_SCALE_OFFSET + u32::from(hrd.bit_rate_scale));
    let cpb_size_value = cpb_size >> (CPB_SIZE_SCALE_OFFSET + u32::from(hrd.cpb_size_scale));
    // The number of DUs per AU is unknown here. The DU CPB size takes the AU bit rate value and
    // the DU bit rate takes the AU CPB size value.
    let du_cpb_size_value = bit_rate_value;
    let du_bit_rate_value = cpb_size_value;

    for i in 0..MAX_TLAYER {
        hrd.fixed_pic_rate_general_flag[i] = true;
        hrd.fixed_pic_rate_within_cvs_flag[i] = true;
        hrd.elemental_duration_in_tc_minus1[i] = 0;
        hrd.low_delay_hrd_flag[i] = false;
        hrd.cpb_cnt_minus1[i] = 0;

        let cpb_cnt = hrd.cpb_cnt_minus1[i] as usize + 1;
        for sublayer in [&mut hrd.nal_hrd[i], &mut hrd.vcl_hrd[i]] {
            for j in 0..cpb_cnt {
                sublayer.bit_rate_value_minus1[j] = bit_rate_value.saturating_sub(1);
                sublayer.cpb_size_value_minus1[j] = cpb_size_value.saturating_sub(1);
                sublayer.cpb_size_du_value_minus1[j] = du_cpb_size_value.saturating_sub(1);
                sublayer.bit_rate_du_value_minus1[j] = du_bit_rate_value.saturating_sub(1);
                sublayer.cbr_flag[j] = false;
            }
        }
    }

    log::debug!(
        "derived HRD: tick {}/{} bit_rate_scale {} cpb_size_scale {}",
        timing_info.num_units_in_tick,
        timing_info.time_scale,
        hrd.bit_rate_scale,
        hrd.cpb_size_scale
    );

    Ok(Some(DerivedTiming { timing_info, hrd }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hrd_config(bit_rate: u32, cpb_size: u32, frame_rate: u32) -> EncoderConfig {
        EncoderConfig {
            target_bitrate: bit_rate,
            cpb_size,
            frame_rate,
            vui_parameters_present: true,
            picture_timing_sei: true,
            ..Default::default()
        }
    }

    #[test]
    fn scale_is_power_of_two_factor() {
        assert_eq!(calc_scale(0), 0);
        assert_eq!(calc_scale(1), 0);
        assert_eq!(calc_scale(2_000_000), 7);
        assert_eq!(calc_scale(1 << 20), 20);
    }

    #[test]
    fn timing_for_known_rates() {
        let expected = [
            (24, 1_125_000, 27_000_000),
            (25, 1_080_000, 27_000_000),
            (30, 900_900, 27_000_000),
            (50, 540_000, 27_000_000),
            (60, 450_450, 27_000_000),
            (29, 1001, 60000),
        ];

        for (rate, tick, scale) in expected {
            let info = timing_info(rate, 1);
            assert!(info.timing_info_present_flag);
            assert_eq!((info.num_units_in_tick, info.time_scale), (tick, scale));
        }
    }

    #[test]
    fn temporal_subsampling_avoids_overflow() {
        let info = timing_info(30, 2);
        assert_eq!(info.num_units_in_tick, 1_801_800);
        assert_eq!(info.time_scale, 27_000_000);

        // 900900 * 10000 does not fit in 32 bits, the clock is slowed down instead.
        let info = timing_info(30, 10000);
        assert_eq!(info.num_units_in_tick, 900_900);
        assert_eq!(info.time_scale, 2700);
    }

    #[test]
    fn two_megabit_at_30_fps() {
        let _ = env_logger::try_init();

        let derived = derive(&hrd_config(2_000_000, 2_000_000, 30))
            .unwrap()
            .unwrap();

        assert_eq!(derived.timing_info.num_units_in_tick, 900_900);
        assert_eq!(derived.timing_info.time_scale, 27_000_000);

        let hrd = &derived.hrd;
        assert!(hrd.nal_hrd_parameters_present_flag);
        assert!(hrd.vcl_hrd_parameters_present_flag);
        assert_eq!(hrd.bit_rate_scale, 1);
        assert_eq!(hrd.cpb_size_scale, 3);

        for i in 0..MAX_TLAYER {
            assert_eq!(hrd.nal_hrd[i].bit_rate_value_minus1[0], 15624);
            assert_eq!(hrd.vcl_hrd[i].cpb_size_value_minus1[0], 15624);
            assert_eq!(hrd.bit_rate(i), 2_000_000);
            assert_eq!(hrd.cpb_size(i), 2_000_000);
            assert!(hrd.fixed_pic_rate_general_flag[i]);
        }
    }

    #[test]
    fn small_scales_floor_to_zero() {
        // 1000 = 8 * 125, below both offsets.
        let derived = derive(&hrd_config(1000, 1000, 25)).unwrap().unwrap();
        assert_eq!(derived.hrd.bit_rate_scale, 0);
        assert_eq!(derived.hrd.cpb_size_scale, 0);
        assert_eq!(derived.hrd.nal_hrd[0].bit_rate_value_minus1[0], 1000 / 64 - 1);
        assert_eq!(derived.hrd.nal_hrd[0].cpb_size_value_minus1[0], 1000 / 16 - 1);
    }

    #[test]
    fn delay_lengths_follow_random_access() {
        let mut config = hrd_config(2_000_000, 2_000_000, 30);
        config.intra_period = 32;
        let hrd = derive(&config).unwrap().unwrap().hrd;
        assert_eq!(hrd.au_cpb_removal_delay_length_minus1, 5);
        assert_eq!(hrd.dpb_output_delay_length_minus1, 5);

        config.intra_period = -1;
        let hrd = derive(&config).unwrap().unwrap().hrd;
        assert_eq!(hrd.au_cpb_removal_delay_length_minus1, 9);
        assert_eq!(hrd.initial_cpb_removal_delay_length_minus1, 15);
    }

    #[test]
    fn sub_picture_parameters_with_slices() {
        let mut config = hrd_config(2_000_000, 2_000_000, 30);
        config.slice_mode = 1;
        let hrd = derive(&config).unwrap().unwrap().hrd;
        assert!(hrd.sub_pic_hrd_params_present_flag);
        assert_eq!(hrd.tick_divisor_minus2, 98);
        assert_eq!(hrd.dpb_output_delay_du_length_minus1, 12);

        config.capabilities.hrd_sub_pictures = false;
        let hrd = derive(&config).unwrap().unwrap().hrd;
        assert!(!hrd.sub_pic_hrd_params_present_flag);
    }

    #[test]
    fn zero_cpb_size_is_fatal() {
        let config = hrd_config(2_000_000, 0, 30);
        assert!(matches!(derive(&config), Err(EncodeError::InvalidConfig(_))));
    }

    #[test]
    fn skipped_without_vui() {
        let mut config = hrd_config(2_000_000, 2_000_000, 30);
        config.vui_parameters_present = false;
        assert_eq!(derive(&config).unwrap(), None);

        config.cpb_saturation = true;
        assert!(derive(&config).unwrap().is_some());
    }
}
