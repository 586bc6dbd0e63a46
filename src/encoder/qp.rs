// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::params::MAX_QP;
use crate::codec::h265::slice::Slice;
use crate::encoder::CostMode;
use crate::encoder::EncoderConfig;

/// QP used for lossless coding, where the cost evaluator still needs a lambda.
pub const LOSSLESS_TEST_QP: i32 = 4;

/// QP offset switch. Once the switch POC is coded, the offset applies to every later picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SwitchQpLatch {
    #[default]
    Inactive,
    Active(i32),
}

impl SwitchQpLatch {
    pub fn offset(&self) -> i32 {
        match self {
            SwitchQpLatch::Inactive => 0,
            SwitchQpLatch::Active(offset) => *offset,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct GopQpOffsets {
    qp_offset: i32,
    model_offset: f64,
    model_scale: f64,
}

/// Decides the QP of each picture from the GOP hierarchy.
#[derive(Clone, Debug)]
pub struct QpDecision {
    base_qp: i32,
    intra_qp_offset: i32,
    switch_poc: Option<i32>,
    switch_dqp: i32,
    dqps: Option<Vec<i32>>,
    max_delta_qp: i32,
    luma_level_to_delta_qp: bool,
    cost_mode: CostMode,
    gop: Vec<GopQpOffsets>,
    latch: SwitchQpLatch,
}

impl QpDecision {
    pub fn new(config: &EncoderConfig) -> Self {
        let gop = config
            .gop_list
            .iter()
            .map(|e| GopQpOffsets {
                qp_offset: e.qp_offset,
                model_offset: e.qp_offset_model_offset,
                model_scale: e.qp_offset_model_scale,
            })
            .collect();

        Self {
            base_qp: config.base_qp,
            intra_qp_offset: config.intra_qp_offset,
            switch_poc: config.switch_poc,
            switch_dqp: config.switch_dqp,
            dqps: config.dqps.clone(),
            max_delta_qp: config.max_delta_qp,
            luma_level_to_delta_qp: config.luma_level_to_delta_qp,
            cost_mode: config.cost_mode,
            gop,
            latch: SwitchQpLatch::Inactive,
        }
    }

    pub fn latch(&self) -> SwitchQpLatch {
        self.latch
    }

    fn dqp(&self, poc: i32) -> i32 {
        let Some(dqps) = &self.dqps else {
            return 0;
        };

        usize::try_from(poc)
            .ok()
            .and_then(|poc| dqps.get(poc))
            .copied()
            .unwrap_or(0)
    }

    /// QP of the `gop_index`-th picture of the GOP, coded in `slice`. The slice's parameter sets
    /// must be the ones of its picture.
    ///
    /// The result is always within `[-QpBdOffsetY, 51]`.
    pub fn decide(&mut self, gop_index: usize, slice: &Slice) -> i32 {
        let qp_bd_offset = slice.sps.qp_bd_offset_luma;

        let qp = if self.cost_mode == CostMode::Lossless {
            LOSSLESS_TEST_QP
        } else {
            let mut qp = self.base_qp;

            if self.switch_poc == Some(slice.poc) {
                self.latch = SwitchQpLatch::Active(self.switch_dqp);
            }
            qp += self.latch.offset();
            qp += self.dqp(slice.poc);

            if slice.slice_type.is_intra() {
                qp += self.intra_qp_offset;
            } else {
                // Lossless pictures keep the lowest QP.
                let keep_lossless = self.max_delta_qp == 0
                    && !self.luma_level_to_delta_qp
                    && qp == -qp_bd_offset
                    && slice.pps.transquant_bypass_enabled_flag;

                if let Some(offsets) = self.gop.get(gop_index).filter(|_| !keep_lossless) {
                    qp += offsets.qp_offset;

                    let model = f64::from(qp) * offsets.model_scale + offsets.model_offset + 0.5;
                    qp += model.clamp(0.0, 3.0).floor() as i32;
                }
            }

            qp
        };

        let qp = qp.clamp(-qp_bd_offset, MAX_QP);
        log::trace!(
            "QP {} for POC {} ({:?}, GOP index {})",
            qp,
            slice.poc,
            slice.slice_type,
            gop_index
        );

        qp
    }
}
