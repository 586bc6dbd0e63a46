// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use enumn::N;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::Sps;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    B = 0,
    P = 1,
    I = 2,
}

impl SliceType {
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// The per-slice state the orchestration layer hands to the slice coder. The parameter sets are
/// the ones activated for the slice's picture.
#[derive(Clone, Debug)]
pub struct Slice {
    pub slice_type: SliceType,
    pub poc: i32,
    pub field_pic: bool,
    /// Index of the reference picture set in the SPS list.
    pub rps_idx: usize,
    pub qp: i32,
    pub sps: Arc<Sps>,
    pub pps: Arc<Pps>,
}

impl Slice {
    pub fn new(slice_type: SliceType, poc: i32, sps: Arc<Sps>, pps: Arc<Pps>) -> Self {
        Self {
            slice_type,
            poc,
            field_pic: false,
            rps_idx: 0,
            qp: 0,
            sps,
            pps,
        }
    }
}
