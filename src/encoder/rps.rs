// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Construction of the reference picture sets from the GOP table, and selection of the set a
//! picture is coded with.

use crate::codec::h265::rps::ReferencePictureSet;
use crate::codec::h265::rps::RpsList;
use crate::codec::h265::slice::Slice;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::GopEntry;
use crate::encoder::InterRpsPrediction;

/// A disagreement between a GOP entry and the reference picture set that inter RPS prediction
/// derives for it. The derived values are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpsInconsistency {
    /// Not every entry could be predicted from the previous set. Inter prediction was turned off
    /// for the set.
    PartialInterPrediction { rps_idx: usize },
    NegativeCount {
        rps_idx: usize,
        configured: usize,
        derived: usize,
    },
    PositiveCount {
        rps_idx: usize,
        configured: usize,
        derived: usize,
    },
    DeltaPoc {
        rps_idx: usize,
        entry: usize,
        configured: i32,
        derived: i32,
    },
    UsedFlag {
        rps_idx: usize,
        entry: usize,
        configured: bool,
        derived: bool,
    },
}

/// The outcome of [`build_rps_list`].
#[derive(Clone, Debug, Default)]
pub struct BuiltRps {
    pub list: RpsList,
    pub inconsistencies: Vec<RpsInconsistency>,
}

fn report(inconsistencies: &mut Vec<RpsInconsistency>, inconsistency: RpsInconsistency) {
    log::warn!("reference picture set overridden: {:?}", inconsistency);
    inconsistencies.push(inconsistency);
}

/// Derives the idc values predicting `rps` from `ref_rps`. Returns `None` when some entry of
/// `rps` has no counterpart.
fn derive_ref_idc(
    rps: &ReferencePictureSet,
    ref_rps: &ReferencePictureSet,
    delta_rps: i32,
) -> Option<Vec<u8>> {
    // The extra slot stands for the reference picture itself.
    let ref_deltas = ref_rps.delta_poc().iter().copied().chain(std::iter::once(0));

    let mut matched = 0;
    let ref_idc = ref_deltas
        .map(|ref_delta| {
            let found = rps
                .entries()
                .find(|(delta_poc, _)| *delta_poc == ref_delta + delta_rps);

            match found {
                Some((_, used)) => {
                    matched += 1;
                    if used {
                        1
                    } else {
                        2
                    }
                }
                None => 0,
            }
        })
        .collect();

    (matched == rps.num_pictures()).then_some(ref_idc)
}

/// Rebuilds the entries described by `ref_idc` relative to `ref_rps`.
fn entries_from_ref_idc(
    ref_rps: &ReferencePictureSet,
    delta_rps: i32,
    ref_idc: &[u8],
) -> ReferencePictureSet {
    let entries = ref_idc
        .iter()
        .enumerate()
        .filter(|(_, idc)| **idc != 0)
        .map(|(j, idc)| {
            let ref_delta = ref_rps.delta_poc().get(j).copied().unwrap_or(0);
            (ref_delta + delta_rps, *idc == 1)
        });

    let mut rps = ReferencePictureSet::from_entries(entries);
    rps.sort_delta_poc();
    rps
}

/// Builds the reference picture sets of the first `gop_size + extra_rps` entries of `gop_list`.
///
/// When `field_coding` is set, one more set is appended for the first bottom field of the
/// sequence, referencing the top field right before it.
pub fn build_rps_list(
    gop_list: &[GopEntry],
    gop_size: usize,
    extra_rps: usize,
    field_coding: bool,
) -> EncodeResult<BuiltRps> {
    let num_entries = gop_size + extra_rps;
    if gop_list.len() < num_entries {
        return Err(EncodeError::InvalidGopEntry(format!(
            "{} entries configured, {} needed",
            gop_list.len(),
            num_entries
        )));
    }

    let mut sets: Vec<ReferencePictureSet> = Vec::with_capacity(num_entries + 1);
    let mut inconsistencies = Vec::new();

    for (i, entry) in gop_list[..num_entries].iter().enumerate() {
        let mut rps = ReferencePictureSet::from_entries(entry.references.iter().copied());

        let prediction = &entry.inter_rps_prediction;
        if *prediction != InterRpsPrediction::None {
            let ref_rps = match i.checked_sub(1).and_then(|r| sets.get(r)) {
                Some(ref_rps) => ref_rps,
                None => {
                    log::error!("GOP entry {} cannot be predicted, it has no predecessor", i);
                    return Err(EncodeError::InvalidGopEntry(format!(
                        "entry {} uses inter RPS prediction without a reference set",
                        i
                    )));
                }
            };

            rps.set_inter_rps_prediction(true);
            // The reference set is always the previous one.
            rps.set_delta_ridx_minus1(0);

            match prediction {
                InterRpsPrediction::Auto => {
                    let delta_rps = gop_list[i - 1].poc - entry.poc;
                    rps.set_delta_rps(delta_rps);

                    match derive_ref_idc(&rps, ref_rps, delta_rps) {
                        Some(ref_idc) => {
                            rps.set_ref_idc(ref_idc);
                            rps.sort_delta_poc();
                        }
                        None => {
                            report(
                                &mut inconsistencies,
                                RpsInconsistency::PartialInterPrediction { rps_idx: i },
                            );
                            rps.set_inter_rps_prediction(false);
                        }
                    }
                }
                InterRpsPrediction::Explicit { delta_rps, ref_idc } => {
                    rps.set_delta_rps(*delta_rps);
                    rps.set_ref_idc(ref_idc.clone());

                    let derived = entries_from_ref_idc(ref_rps, *delta_rps, ref_idc);
                    let mut configured = rps.clone();
                    configured.sort_delta_poc();

                    let (neg, pos) = (
                        derived.num_negative_pictures(),
                        derived.num_positive_pictures(),
                    );
                    if neg != configured.num_negative_pictures() {
                        report(
                            &mut inconsistencies,
                            RpsInconsistency::NegativeCount {
                                rps_idx: i,
                                configured: configured.num_negative_pictures(),
                                derived: neg,
                            },
                        );
                    }
                    if pos != configured.num_positive_pictures() {
                        report(
                            &mut inconsistencies,
                            RpsInconsistency::PositiveCount {
                                rps_idx: i,
                                configured: configured.num_positive_pictures(),
                                derived: pos,
                            },
                        );
                    }

                    // Entries can only be paired up when both sets have the same shape.
                    if derived.num_pictures() == configured.num_pictures() {
                        let pairs = derived.entries().zip(configured.entries()).enumerate();
                        for (j, ((derived_delta, derived_used), (delta, used))) in pairs {
                            if derived_delta != delta {
                                report(
                                    &mut inconsistencies,
                                    RpsInconsistency::DeltaPoc {
                                        rps_idx: i,
                                        entry: j,
                                        configured: delta,
                                        derived: derived_delta,
                                    },
                                );
                            }
                            if derived_used != used {
                                report(
                                    &mut inconsistencies,
                                    RpsInconsistency::UsedFlag {
                                        rps_idx: i,
                                        entry: j,
                                        configured: used,
                                        derived: derived_used,
                                    },
                                );
                            }
                        }
                    }

                    rps.set_entries(derived.entries());
                }
                InterRpsPrediction::None => (),
            }
        }

        sets.push(rps);
    }

    if field_coding {
        let mut rps = ReferencePictureSet::from_entries([(-1, true)]);
        rps.set_poc(0, 0);
        sets.push(rps);
    }

    log::debug!(
        "built {} reference picture sets, {} inconsistencies",
        sets.len(),
        inconsistencies.len()
    );

    Ok(BuiltRps {
        list: RpsList::new(sets),
        inconsistencies,
    })
}

/// Picks the reference picture set of each picture.
#[derive(Clone, Debug)]
pub struct RpsSelector {
    gop_size: usize,
    /// POCs of the extra entries following the GOP entries.
    extra_pocs: Vec<i32>,
    /// Intra period used to match extra entries, when intra refresh is on.
    refresh_period: Option<i32>,
    /// Index of the set of the first bottom field, with field coding.
    field_rps_idx: Option<usize>,
}

impl RpsSelector {
    pub fn new(config: &EncoderConfig) -> Self {
        let extra_pocs = config
            .gop_list
            .iter()
            .skip(config.gop_size)
            .take(config.extra_rps)
            .map(|e| e.poc)
            .collect();

        let refresh_period = (config.intra_period > 0 && config.decoding_refresh_type > 0)
            .then_some(config.intra_period);

        Self {
            gop_size: config.gop_size,
            extra_pocs,
            refresh_period,
            field_rps_idx: config
                .field_coding
                .then_some(config.gop_size + config.extra_rps),
        }
    }

    /// The index of the set of the picture at `poc`, which is the `gop_id`-th picture of its GOP
    /// in coding order. Does not account for the first bottom field.
    pub fn resolve_for_sop(&self, poc: i32, gop_id: usize) -> usize {
        let poc_index = match self.refresh_period {
            Some(period) => match poc.rem_euclid(period) {
                0 => period,
                index => index,
            },
            None => poc,
        };

        self.extra_pocs
            .iter()
            .enumerate()
            .filter(|(_, extra_poc)| **extra_poc == poc_index)
            .last()
            .map(|(i, _)| self.gop_size + i)
            .unwrap_or(gop_id)
    }

    /// Like [`RpsSelector::resolve_for_sop`], redirecting the field with POC 1 of a field coded
    /// sequence to its dedicated set.
    pub fn select(&self, poc: i32, gop_id: usize, field_pic: bool) -> usize {
        match self.field_rps_idx {
            Some(idx) if field_pic && poc == 1 => idx,
            _ => self.resolve_for_sop(poc, gop_id),
        }
    }

    /// Selects the set of `slice`, records its index in the slice and returns it.
    pub fn select_for_slice<'a>(
        &self,
        slice: &'a mut Slice,
        gop_id: usize,
    ) -> EncodeResult<&'a ReferencePictureSet> {
        slice.rps_idx = self.select(slice.poc, gop_id, slice.field_pic);

        slice.sps.rps_list.get(slice.rps_idx).ok_or_else(|| {
            log::error!("slice at POC {} selected missing RPS {}", slice.poc, slice.rps_idx);
            EncodeError::InvalidInternalState
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::params::PpsBuilder;
    use crate::codec::h265::params::SpsBuilder;
    use crate::codec::h265::slice::SliceType;

    fn entry(poc: i32, references: &[(i32, bool)]) -> GopEntry {
        GopEntry {
            poc,
            references: references.to_vec(),
            ..Default::default()
        }
    }

    fn assert_counts_consistent(list: &RpsList) {
        for rps in list.iter() {
            assert_eq!(
                rps.num_negative_pictures() + rps.num_positive_pictures(),
                rps.num_pictures()
            );
        }
    }

    #[test]
    fn default_gop_predicts_automatically() {
        let _ = env_logger::try_init();

        let config = EncoderConfig::default();
        let built = build_rps_list(&config.gop_list, config.gop_size, 0, false).unwrap();

        assert_eq!(built.list.len(), 4);
        assert!(built.inconsistencies.is_empty());
        assert_counts_consistent(&built.list);

        let first = built.list.get(0).unwrap();
        assert!(!first.inter_rps_prediction());
        assert_eq!(first.delta_poc(), &[-1, -5, -9, -13]);

        let second = built.list.get(1).unwrap();
        assert!(second.inter_rps_prediction());
        assert_eq!(second.delta_rps(), -1);
        assert_eq!(second.ref_idc(), &[1, 1, 1, 0, 1]);
        assert_eq!(second.delta_poc(), &[-10, -6, -2, -1]);

        for rps in built.list.iter().skip(1) {
            assert!(rps.is_sorted());
            assert_eq!(rps.num_ref_idc(), 5);
        }
    }

    #[test]
    fn auto_prediction_falls_back_when_incomplete() {
        let _ = env_logger::try_init();

        let gop = [
            entry(2, &[(-2, true)]),
            entry(1, &[(-1, true), (-7, false)])
                .with_inter_rps_prediction(InterRpsPrediction::Auto),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();

        assert_eq!(
            built.inconsistencies,
            vec![RpsInconsistency::PartialInterPrediction { rps_idx: 1 }]
        );
        let rps = built.list.get(1).unwrap();
        assert!(!rps.inter_rps_prediction());
        assert_eq!(rps.num_pictures(), 2);
    }

    #[test]
    fn auto_prediction_marks_unused_entries() {
        let gop = [
            entry(4, &[(-4, true)]),
            entry(2, &[(-2, true), (2, false)])
                .with_inter_rps_prediction(InterRpsPrediction::Auto),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();

        let rps = built.list.get(1).unwrap();
        assert!(rps.inter_rps_prediction());
        assert_eq!(rps.delta_rps(), 2);
        // -4 + 2 = -2 is used, the reference picture itself at +2 is not.
        assert_eq!(rps.ref_idc(), &[1, 2]);
        assert_eq!(rps.used(), &[true, false]);
    }

    #[test]
    fn explicit_prediction_adopts_derived_negative_count() {
        let _ = env_logger::try_init();

        // The idc keeps only the reference picture itself, at -1.
        let gop = [
            entry(1, &[(-1, true), (-5, true)]),
            entry(2, &[(-1, true), (-3, true)]).with_inter_rps_prediction(
                InterRpsPrediction::Explicit {
                    delta_rps: -1,
                    ref_idc: vec![0, 0, 1],
                },
            ),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();

        assert_eq!(
            built.inconsistencies,
            vec![RpsInconsistency::NegativeCount {
                rps_idx: 1,
                configured: 2,
                derived: 1,
            }]
        );

        let rps = built.list.get(1).unwrap();
        assert_eq!(rps.num_negative_pictures(), 1);
        assert_eq!(rps.num_pictures(), 1);
        assert_eq!(rps.delta_poc(), &[-1]);
        assert!(rps.inter_rps_prediction());
    }

    #[test]
    fn explicit_prediction_compares_sorted_entries() {
        // Configured in a different order than the derived one: no inconsistency.
        let gop = [
            entry(1, &[(-1, true), (-5, true)]),
            entry(2, &[(-1, true), (-2, true), (-6, false)]).with_inter_rps_prediction(
                InterRpsPrediction::Explicit {
                    delta_rps: -1,
                    ref_idc: vec![1, 2, 1],
                },
            ),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();
        assert!(built.inconsistencies.is_empty());

        let rps = built.list.get(1).unwrap();
        assert_eq!(rps.delta_poc(), &[-6, -2, -1]);
        assert_eq!(rps.used(), &[false, true, true]);

        // Same shape, different used flag.
        let gop = [
            gop[0].clone(),
            entry(2, &[(-1, true), (-2, true), (-6, true)]).with_inter_rps_prediction(
                InterRpsPrediction::Explicit {
                    delta_rps: -1,
                    ref_idc: vec![1, 2, 1],
                },
            ),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();
        assert_eq!(
            built.inconsistencies,
            vec![RpsInconsistency::UsedFlag {
                rps_idx: 1,
                entry: 0,
                configured: true,
                derived: false,
            }]
        );
        assert_eq!(built.list.get(1).unwrap().used(), &[false, true, true]);
    }

    #[test]
    fn explicit_prediction_adopts_derived_positive_count() {
        let _ = env_logger::try_init();

        // -4 + 2 and the reference picture itself at +2. The entry at 4 + 2 is dropped.
        let gop = [
            entry(4, &[(-4, true), (4, true)]),
            entry(2, &[(-2, true), (2, true), (6, true)]).with_inter_rps_prediction(
                InterRpsPrediction::Explicit {
                    delta_rps: 2,
                    ref_idc: vec![1, 0, 1],
                },
            ),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();

        assert_eq!(
            built.inconsistencies,
            vec![RpsInconsistency::PositiveCount {
                rps_idx: 1,
                configured: 2,
                derived: 1,
            }]
        );

        let rps = built.list.get(1).unwrap();
        assert_eq!(rps.num_negative_pictures(), 1);
        assert_eq!(rps.num_positive_pictures(), 1);
        assert_eq!(rps.num_pictures(), 2);
        assert_counts_consistent(&built.list);
    }

    #[test]
    fn explicit_prediction_adopts_derived_delta_poc() {
        let _ = env_logger::try_init();

        // Derived: -1 - 1 and -5 - 1. Same shape as the configured set, one delta differs.
        let gop = [
            entry(1, &[(-1, true), (-5, true)]),
            entry(2, &[(-2, true), (-7, true)]).with_inter_rps_prediction(
                InterRpsPrediction::Explicit {
                    delta_rps: -1,
                    ref_idc: vec![1, 1, 0],
                },
            ),
        ];
        let built = build_rps_list(&gop, 2, 0, false).unwrap();

        assert_eq!(
            built.inconsistencies,
            vec![RpsInconsistency::DeltaPoc {
                rps_idx: 1,
                entry: 0,
                configured: -7,
                derived: -6,
            }]
        );

        let rps = built.list.get(1).unwrap();
        assert_eq!(rps.delta_poc(), &[-6, -2]);
        assert_eq!(rps.used(), &[true, true]);
    }

    #[test]
    fn prediction_of_first_entry_is_fatal() {
        let gop = [entry(1, &[(-1, true)]).with_inter_rps_prediction(InterRpsPrediction::Auto)];
        assert!(matches!(
            build_rps_list(&gop, 1, 0, false),
            Err(EncodeError::InvalidGopEntry(_))
        ));
    }

    #[test]
    fn short_gop_list_is_fatal() {
        let gop = [entry(1, &[(-1, true)])];
        assert!(matches!(
            build_rps_list(&gop, 1, 1, false),
            Err(EncodeError::InvalidGopEntry(_))
        ));
    }

    #[test]
    fn field_coding_appends_bottom_field_set() {
        let config = EncoderConfig::default();
        let built = build_rps_list(&config.gop_list, config.gop_size, 0, true).unwrap();

        assert_eq!(built.list.len(), 5);
        let rps = built.list.get(4).unwrap();
        assert_eq!(rps.delta_poc(), &[-1]);
        assert_eq!(rps.used(), &[true]);
        assert_eq!(rps.poc(), &[0]);
        assert_eq!(rps.num_negative_pictures(), 1);
        assert!(!rps.inter_rps_prediction());
        assert_eq!(rps.num_ref_idc(), 0);
    }

    fn refresh_config() -> EncoderConfig {
        let mut config = EncoderConfig {
            intra_period: 8,
            decoding_refresh_type: 1,
            extra_rps: 2,
            field_coding: true,
            ..Default::default()
        };
        config.gop_list.push(entry(8, &[(-8, true)]));
        config.gop_list.push(entry(4, &[(-4, true)]));
        config
    }

    #[test]
    fn selector_wraps_poc_into_intra_period() {
        let selector = RpsSelector::new(&refresh_config());

        // 16 mod 8 is 0, which stands for the period itself.
        assert_eq!(selector.resolve_for_sop(16, 2), 4);
        assert_eq!(selector.resolve_for_sop(12, 2), 5);
        assert_eq!(selector.resolve_for_sop(13, 2), 2);
        assert_eq!(
            selector.resolve_for_sop(16, 2),
            selector.resolve_for_sop(16, 2)
        );
    }

    #[test]
    fn selector_matches_poc_without_refresh() {
        let mut config = refresh_config();
        config.decoding_refresh_type = 0;
        let selector = RpsSelector::new(&config);

        assert_eq!(selector.resolve_for_sop(16, 1), 1);
        assert_eq!(selector.resolve_for_sop(8, 1), 4);
    }

    #[test]
    fn selector_last_duplicate_wins() {
        let mut config = refresh_config();
        config.gop_list[5].poc = 8;
        let selector = RpsSelector::new(&config);

        assert_eq!(selector.resolve_for_sop(8, 0), 5);
    }

    #[test]
    fn selector_first_bottom_field() {
        let config = refresh_config();
        let selector = RpsSelector::new(&config);

        assert_eq!(selector.select(1, 0, true), 6);
        assert_eq!(selector.select(1, 0, false), 0);
        assert_eq!(selector.select(3, 0, true), 0);

        let config = EncoderConfig {
            field_coding: false,
            ..refresh_config()
        };
        assert_eq!(RpsSelector::new(&config).select(1, 0, true), 0);
    }

    #[test]
    fn slice_receives_selected_set() {
        let config = refresh_config();
        let built =
            build_rps_list(&config.gop_list, config.gop_size, config.extra_rps, true).unwrap();
        let sps = SpsBuilder::new().rps_list(built.list).build();
        let pps = PpsBuilder::new(&sps).build();
        let selector = RpsSelector::new(&config);

        let mut slice = Slice::new(SliceType::B, 16, sps, pps);
        let rps = selector.select_for_slice(&mut slice, 3).unwrap();
        assert_eq!(rps.delta_poc(), &[-8]);
        assert_eq!(slice.rps_idx, 4);
    }
}
