// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::codec::h265::params::Sps;
use crate::encoder::qp::QpDecision;
use crate::encoder::ring::PictureRing;
use crate::encoder::rps::RpsSelector;
use crate::encoder::stack::EncodeStack;
use crate::encoder::EncodeResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodingMode {
    Frame,
    Field { top_field_first: bool },
}

/// Everything the GOP compressor works with while coding one batch.
pub struct GopContext<'a> {
    /// POC of the last picture of the batch.
    pub poc_last: i32,
    /// Number of pictures in the batch.
    pub num_pics: usize,
    pub mode: CodingMode,
    pub sps: &'a Arc<Sps>,
    pub ring: &'a mut PictureRing,
    pub rps: &'a RpsSelector,
    pub qp: &'a mut QpDecision,
    /// One stack per parallel lane.
    pub stacks: &'a mut [EncodeStack],
}

/// Accumulates admitted pictures and decides when a batch is handed to the GOP compressor.
#[derive(Clone, Debug)]
pub struct GopScheduler {
    gop_size: usize,
    /// Pictures admitted since the last dispatch.
    pending: usize,
    num_all_pic_coded: u64,
}

impl GopScheduler {
    pub fn new(gop_size: usize) -> Self {
        Self {
            gop_size,
            pending: 0,
            num_all_pic_coded: 0,
        }
    }

    pub fn gop_size(&self) -> usize {
        self.gop_size
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn num_all_pic_coded(&self) -> u64 {
        self.num_all_pic_coded
    }

    /// Records one admitted picture.
    pub fn admit(&mut self) {
        self.pending += 1;
    }

    fn dispatch<F>(&mut self, dispatch: F) -> EncodeResult<usize>
    where
        F: FnOnce(usize) -> EncodeResult<()>,
    {
        let num_pics = self.pending;
        log::trace!("dispatching {} pictures", num_pics);

        dispatch(num_pics)?;

        self.pending = 0;
        self.num_all_pic_coded += num_pics as u64;
        Ok(num_pics)
    }

    /// Frame coding: hands the pending pictures to `dispatch` when a GOP is complete or when
    /// flushing. Returns the number of pictures dispatched.
    pub fn submit_frame<F>(&mut self, flush: bool, dispatch: F) -> EncodeResult<usize>
    where
        F: FnOnce(usize) -> EncodeResult<()>,
    {
        if self.pending == 0 {
            return Ok(0);
        }

        if flush || self.gop_size == 0 || self.pending == self.gop_size {
            self.dispatch(dispatch)
        } else {
            Ok(0)
        }
    }

    /// Field coding: called once per field of a frame, `field_num` being 0 or 1. Besides GOP
    /// completion, the pending fields are dispatched after the field with POC 1 so the first
    /// frame is coded on its own. Flushing takes effect on the second field.
    pub fn submit_field<F>(
        &mut self,
        flush: bool,
        field_num: usize,
        poc_last: i32,
        dispatch: F,
    ) -> EncodeResult<usize>
    where
        F: FnOnce(usize) -> EncodeResult<()>,
    {
        if self.pending == 0 {
            return Ok(0);
        }

        if (flush && field_num == 1) || poc_last == 1 || self.pending == self.gop_size {
            self.dispatch(dispatch)
        } else {
            Ok(0)
        }
    }
}
