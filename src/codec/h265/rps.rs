// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// The maximum number of entries in one reference picture set.
pub const MAX_NUM_REF_PICS: usize = 16;

/// A short-term reference picture set, as signalled in the SPS.
///
/// Entries are kept as a list of signed POC deltas relative to the current picture together
/// with a parallel `used` flag telling whether the current picture may actually predict from the
/// entry, or merely keeps it alive for later pictures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePictureSet {
    /// POC deltas of the pictures in the set.
    delta_poc: Vec<i32>,
    /// Same as used_by_curr_pic_flag for each entry of `delta_poc`.
    used: Vec<bool>,
    /// Absolute POCs, only meaningful for the synthetic first bottom field set.
    poc: Vec<i32>,
    /// Number of entries with a negative delta.
    num_negative_pictures: usize,
    /// Number of entries with a positive delta.
    num_positive_pictures: usize,
    num_longterm_pictures: usize,

    /// When set, the set is predicted from the set at index `idx - (delta_ridx_minus1 + 1)`.
    inter_rps_prediction: bool,
    delta_ridx_minus1: usize,
    /// POC of the reference set's picture minus POC of the current one.
    delta_rps: i32,
    /// One idc per entry of the reference set plus one for the reference picture itself:
    /// 0 means not present, 1 present and used, 2 present but not used.
    ref_idc: Vec<u8>,
}

impl ReferencePictureSet {
    /// Creates a set from `(delta_poc, used)` pairs, counting negative and positive entries.
    ///
    /// A zero delta is counted as negative.
    pub fn from_entries(entries: impl IntoIterator<Item = (i32, bool)>) -> Self {
        let mut rps = Self::default();
        rps.set_entries(entries);
        rps
    }

    /// Replaces the entries of the set, recomputing the negative and positive counts.
    pub fn set_entries(&mut self, entries: impl IntoIterator<Item = (i32, bool)>) {
        self.delta_poc.clear();
        self.used.clear();
        self.poc.clear();

        for (delta_poc, used) in entries {
            self.delta_poc.push(delta_poc);
            self.used.push(used);
            self.poc.push(0);
        }

        self.num_positive_pictures = self.delta_poc.iter().filter(|d| **d > 0).count();
        self.num_negative_pictures = self.delta_poc.len() - self.num_positive_pictures;
    }

    pub fn num_pictures(&self) -> usize {
        self.delta_poc.len()
    }

    pub fn num_negative_pictures(&self) -> usize {
        self.num_negative_pictures
    }

    pub fn num_positive_pictures(&self) -> usize {
        self.num_positive_pictures
    }

    pub fn num_longterm_pictures(&self) -> usize {
        self.num_longterm_pictures
    }

    pub fn delta_poc(&self) -> &[i32] {
        &self.delta_poc
    }

    pub fn used(&self) -> &[bool] {
        &self.used
    }

    pub fn poc(&self) -> &[i32] {
        &self.poc
    }

    /// Iterates over `(delta_poc, used)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        self.delta_poc.iter().copied().zip(self.used.iter().copied())
    }

    pub fn set_poc(&mut self, idx: usize, poc: i32) {
        if let Some(p) = self.poc.get_mut(idx) {
            *p = poc;
        }
    }

    pub fn inter_rps_prediction(&self) -> bool {
        self.inter_rps_prediction
    }

    pub fn set_inter_rps_prediction(&mut self, value: bool) {
        self.inter_rps_prediction = value;
    }

    pub fn delta_ridx_minus1(&self) -> usize {
        self.delta_ridx_minus1
    }

    pub fn set_delta_ridx_minus1(&mut self, value: usize) {
        self.delta_ridx_minus1 = value;
    }

    pub fn delta_rps(&self) -> i32 {
        self.delta_rps
    }

    pub fn set_delta_rps(&mut self, value: i32) {
        self.delta_rps = value;
    }

    pub fn num_ref_idc(&self) -> usize {
        self.ref_idc.len()
    }

    pub fn ref_idc(&self) -> &[u8] {
        &self.ref_idc
    }

    pub fn set_ref_idc(&mut self, ref_idc: Vec<u8>) {
        self.ref_idc = ref_idc;
    }

    /// Sorts the entries by ascending delta POC, keeping each `used` flag with its delta.
    pub fn sort_delta_poc(&mut self) {
        let mut entries: Vec<_> = self.entries().collect();
        entries.sort_by_key(|(delta_poc, _)| *delta_poc);
        self.set_entries(entries);
    }

    /// Whether the delta POCs are in ascending order.
    pub fn is_sorted(&self) -> bool {
        self.delta_poc.windows(2).all(|w| w[0] <= w[1])
    }
}

/// The list of candidate reference picture sets of a sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpsList {
    sets: Vec<ReferencePictureSet>,
}

impl RpsList {
    pub fn new(sets: Vec<ReferencePictureSet>) -> Self {
        Self { sets }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ReferencePictureSet> {
        self.sets.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferencePictureSet> {
        self.sets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_entries() {
        let rps = ReferencePictureSet::from_entries([(-1, true), (-3, false), (2, true)]);

        assert_eq!(rps.num_pictures(), 3);
        assert_eq!(rps.num_negative_pictures(), 2);
        assert_eq!(rps.num_positive_pictures(), 1);
    }

    #[test]
    fn sort_keeps_used_flags_paired() {
        let mut rps = ReferencePictureSet::from_entries([(4, true), (-1, false), (-8, true)]);
        rps.sort_delta_poc();

        assert!(rps.is_sorted());
        assert_eq!(rps.delta_poc(), &[-8, -1, 4]);
        assert_eq!(rps.used(), &[true, false, true]);
        assert_eq!(
            rps.num_negative_pictures() + rps.num_positive_pictures(),
            rps.num_pictures()
        );
    }
}
