// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::params::Sps;
use crate::encoder::CostEvaluator;
use crate::encoder::EncoderConfig;
use crate::encoder::EntropyEstimator;
use crate::encoder::StackFactory;

type BoxCostEvaluator = Box<dyn CostEvaluator>;
type BoxEntropyEstimator = Box<dyn EntropyEstimator>;

/// Private coding state of one parallel lane of the GOP compressor.
pub struct EncodeStack {
    id: usize,
    cost: BoxCostEvaluator,
    entropy: BoxEntropyEstimator,
}

impl EncodeStack {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cost(&self) -> &dyn CostEvaluator {
        self.cost.as_ref()
    }

    pub fn cost_mut(&mut self) -> &mut dyn CostEvaluator {
        self.cost.as_mut()
    }

    pub fn entropy(&self) -> &dyn EntropyEstimator {
        self.entropy.as_ref()
    }

    pub fn entropy_mut(&mut self) -> &mut dyn EntropyEstimator {
        self.entropy.as_mut()
    }
}

impl std::fmt::Debug for EncodeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeStack").field("id", &self.id).finish()
    }
}

/// Number of lanes: one per split job times one per wavefront row in flight.
pub fn num_stacks(split_jobs: u32, wpp_threads: u32, wpp_extra_lines: u32) -> usize {
    let split = split_jobs.max(1) as usize;
    let rows = wpp_threads.saturating_add(wpp_extra_lines).max(1) as usize;

    split * rows
}

/// Builds every stack up front so that no lane ever shares cost or entropy state with another.
pub fn create_stacks(
    config: &EncoderConfig,
    sps: &Sps,
    factory: &dyn StackFactory,
) -> Vec<EncodeStack> {
    let count = num_stacks(config.split_jobs, config.wpp_threads, config.wpp_extra_lines);
    log::debug!("creating {} encode stacks", count);

    (0..count)
        .map(|id| {
            let mut cost = factory.cost_evaluator(id);
            cost.set_cost_mode(config.cost_mode);

            EncodeStack {
                id,
                cost,
                entropy: factory.entropy_estimator(id, sps),
            }
        })
        .collect()
}
