// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The encoding session tying the picture ring, the parameter sets, the reference picture sets,
//! the QP decision and the GOP scheduler together.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::Sps;
use crate::codec::h265::params::MAX_TLAYER;
use crate::encoder::param_sets::build_pps;
use crate::encoder::param_sets::build_sps;
use crate::encoder::param_sets::pps_id_for_poc;
use crate::encoder::param_sets::ParameterSetMap;
use crate::encoder::qp::QpDecision;
use crate::encoder::ring::PictureRing;
use crate::encoder::rps::build_rps_list;
use crate::encoder::rps::RpsInconsistency;
use crate::encoder::rps::RpsSelector;
use crate::encoder::scheduler::CodingMode;
use crate::encoder::scheduler::GopContext;
use crate::encoder::scheduler::GopScheduler;
use crate::encoder::stack::create_stacks;
use crate::encoder::stack::EncodeStack;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::FieldOrder;
use crate::encoder::GopCompressor;
use crate::encoder::StackFactory;
use crate::encoder::Tunings;
use crate::extract_field;
use crate::YuvBuffer;

const SPS_ID: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Active,
    /// A fatal error occurred. No further picture is accepted.
    Failed,
    Destroyed,
}

/// One encoding session. Pictures are admitted in output order through [`EncoderSession::encode`]
/// (or [`EncoderSession::encode_fields`] for interlaced sources) and handed to the
/// [`GopCompressor`] one GOP at a time.
pub struct EncoderSession<C: GopCompressor> {
    config: EncoderConfig,
    sps_map: ParameterSetMap<Sps>,
    pps_map: ParameterSetMap<Pps>,
    ring: PictureRing,
    scheduler: GopScheduler,
    rps: RpsSelector,
    qp: QpDecision,
    stacks: Vec<EncodeStack>,
    rps_inconsistencies: Vec<RpsInconsistency>,
    compressor: C,
    state: SessionState,
}

impl<C: GopCompressor> EncoderSession<C> {
    /// Creates a session for `config`: builds the reference picture sets and the parameter sets,
    /// sizes the picture ring and sets up one encode stack per parallel lane using `factory`.
    pub fn create(
        config: EncoderConfig,
        compressor: C,
        factory: &dyn StackFactory,
    ) -> EncodeResult<Self> {
        if config.field_coding && config.gop_size == 0 {
            return Err(EncodeError::InvalidConfig(
                "field coding needs a GOP size of at least 1".into(),
            ));
        }

        let built = build_rps_list(
            &config.gop_list,
            config.gop_size,
            config.extra_rps,
            config.field_coding,
        )?;

        let sps = build_sps(&config, SPS_ID, built.list)?;
        let mut sps_map = ParameterSetMap::new();
        sps_map.insert(SPS_ID, Arc::clone(&sps));

        let mut pps_map = ParameterSetMap::new();
        pps_map.insert(0, build_pps(&config, &sps, 0)?);
        if config.wcg_enabled() {
            pps_map.insert(1, build_pps(&config, &sps, 1)?);
        }

        let capacity = config.gop_size + config.max_dec_pic_buffering[MAX_TLAYER - 1] as usize + 2;
        let stacks = create_stacks(&config, &sps, factory);

        log::debug!(
            "created session: {}x{} gop {} ring capacity {} pps count {}",
            config.resolution.width,
            config.resolution.height,
            config.gop_size,
            capacity,
            pps_map.len()
        );

        Ok(Self {
            ring: PictureRing::new(capacity, config.adaptive_qp),
            scheduler: GopScheduler::new(config.gop_size),
            rps: RpsSelector::new(&config),
            qp: QpDecision::new(&config),
            stacks,
            rps_inconsistencies: built.inconsistencies,
            sps_map,
            pps_map,
            compressor,
            config,
            state: SessionState::Active,
        })
    }

    /// Frees every picture of the ring and the parameter sets. The session accepts no picture
    /// afterwards.
    pub fn destroy(&mut self) {
        log::debug!(
            "destroying session after {} pictures",
            self.scheduler.num_all_pic_coded()
        );

        self.ring.clear();
        self.sps_map.clear();
        self.pps_map.clear();
        self.state = SessionState::Destroyed;
    }

    fn check_active(&self) -> EncodeResult<()> {
        match self.state {
            SessionState::Active => Ok(()),
            state => {
                log::error!("session is no longer usable ({:?})", state);
                Err(EncodeError::InvalidInternalState)
            }
        }
    }

    /// Marks the session failed on any error the caller cannot fix by retrying with another
    /// input.
    fn check_fatal<T>(&mut self, result: EncodeResult<T>) -> EncodeResult<T> {
        if let Err(e) = &result {
            if !matches!(e, EncodeError::InvalidInput(_)) {
                log::error!("encoding failed: {}", e);
                self.state = SessionState::Failed;
            }
        }

        result
    }

    fn active_sps(&self) -> EncodeResult<Arc<Sps>> {
        self.sps_map.get(SPS_ID).cloned().ok_or_else(|| {
            log::error!("SPS {} is missing", SPS_ID);
            EncodeError::UnresolvedParameterSet { pps_id: SPS_ID }
        })
    }

    /// The PPS the picture with `poc` is coded with.
    fn resolve_pps(&self, poc: i32) -> EncodeResult<Arc<Pps>> {
        let pps = match pps_id_for_poc(&self.config, poc) {
            Some(pps_id) => self
                .pps_map
                .get(pps_id)
                .ok_or(EncodeError::UnresolvedParameterSet { pps_id }),
            None => self
                .pps_map
                .first()
                .ok_or(EncodeError::UnresolvedParameterSet { pps_id: 0 }),
        };

        pps.cloned().map_err(|e| {
            log::error!("no PPS for POC {}: {}", poc, e);
            e
        })
    }

    /// Admits one picture or field into the ring, moving `input` into its source buffer.
    fn admit(
        &mut self,
        input: YuvBuffer,
        field: Option<bool>,
        rec_out: &mut VecDeque<C::Recon>,
    ) -> EncodeResult<()> {
        let sps = self.active_sps()?;
        let pps = self.resolve_pps(self.ring.poc_last() + 1)?;

        let resolution = sps.resolution();
        if input.resolution != resolution || input.chroma_format != sps.chroma_format {
            return Err(EncodeError::InvalidInput(format!(
                "{:?} {}x{} does not match {:?} {}x{}",
                input.chroma_format,
                input.resolution.width,
                input.resolution.height,
                sps.chroma_format,
                resolution.width,
                resolution.height
            )));
        }

        let handle = self.ring.acquire(&sps, &pps, rec_out)?;
        let picture = self
            .ring
            .get_mut(handle)
            .ok_or(EncodeError::InvalidInternalState)?;
        picture.orig = input;
        if let Some(top_field) = field {
            picture.field_pic = true;
            picture.top_field = top_field;
        }

        self.scheduler.admit();
        Ok(())
    }

    /// Hands the pending pictures to the compressor if the scheduler asks for it.
    fn submit(
        &mut self,
        flush: bool,
        mode: CodingMode,
        field_num: usize,
        rec_out: &mut VecDeque<C::Recon>,
    ) -> EncodeResult<usize> {
        let sps = self.active_sps()?;
        let poc_last = self.ring.poc_last();

        let Self {
            ring,
            scheduler,
            rps,
            qp,
            stacks,
            compressor,
            ..
        } = self;

        let dispatch = |num_pics: usize| -> EncodeResult<()> {
            let ctx = GopContext {
                poc_last,
                num_pics,
                mode,
                sps: &sps,
                ring,
                rps,
                qp,
                stacks: stacks.as_mut_slice(),
            };
            compressor.compress_gop(ctx, rec_out)?;
            Ok(())
        };

        match mode {
            CodingMode::Frame => scheduler.submit_frame(flush, dispatch),
            CodingMode::Field { .. } => {
                scheduler.submit_field(flush, field_num, poc_last, dispatch)
            }
        }
    }

    /// Admits `input`, if any, and codes the pending pictures once a GOP is complete or when
    /// `flush` is set. Returns the number of pictures handed to the compressor.
    ///
    /// `rec_out` is the caller's list of reconstruction outputs. It is rotated by one entry per
    /// admitted picture and filled by the compressor.
    pub fn encode(
        &mut self,
        input: Option<YuvBuffer>,
        flush: bool,
        rec_out: &mut VecDeque<C::Recon>,
    ) -> EncodeResult<usize> {
        self.check_active()?;

        let result = match input {
            Some(input) => self.admit(input, None, rec_out),
            None => Ok(()),
        }
        .and_then(|()| self.submit(flush, CodingMode::Frame, 0, rec_out));

        self.check_fatal(result)
    }

    /// Interlaced variant of [`EncoderSession::encode`]: `input` is a frame of twice the
    /// configured height, split into two fields admitted in `field_order`. Returns the number of
    /// fields handed to the compressor.
    pub fn encode_fields(
        &mut self,
        input: Option<&YuvBuffer>,
        flush: bool,
        field_order: FieldOrder,
        rec_out: &mut VecDeque<C::Recon>,
    ) -> EncodeResult<usize> {
        self.check_active()?;

        if !self.config.field_coding {
            return Err(EncodeError::InvalidConfig(
                "field input on a session set up for frames".into(),
            ));
        }

        let top_field_first = field_order.is_top_field_first();
        let mode = CodingMode::Field { top_field_first };

        let mut encoded = 0;
        for field_num in 0..2 {
            // The first field is the top one for top field first sources.
            let is_top = top_field_first == (field_num == 0);

            let result = match input {
                Some(frame) => self.admit(extract_field(frame, is_top), Some(is_top), rec_out),
                None => Ok(()),
            }
            .and_then(|()| self.submit(flush, mode, field_num, rec_out));

            encoded += self.check_fatal(result)?;
        }

        Ok(encoded)
    }

    /// Applies new rate parameters. The HRD is derived again and the SPS is flagged for writing.
    pub fn tune(&mut self, tunings: Tunings) -> EncodeResult<()> {
        self.check_active()?;

        if tunings == self.config.tunings() {
            return Ok(());
        }

        log::debug!("tuning: {:?}", tunings);

        let mut config = self.config.clone();
        config.target_bitrate = tunings.target_bitrate;
        config.cpb_size = tunings.cpb_size;
        config.frame_rate = tunings.frame_rate;

        let rps_list = self.active_sps()?.rps_list.clone();
        let sps = build_sps(&config, SPS_ID, rps_list)?;

        self.sps_map.insert(SPS_ID, sps);
        self.config = config;
        Ok(())
    }

    /// Whether the SPS `id` changed since the last call. Clears the flag.
    pub fn sps_needs_writing(&mut self, id: u8) -> bool {
        self.sps_map.needs_writing(id)
    }

    /// Whether the PPS `id` changed since the last call. Clears the flag.
    pub fn pps_needs_writing(&mut self, id: u8) -> bool {
        self.pps_map.needs_writing(id)
    }

    pub fn sps(&self) -> Option<&Arc<Sps>> {
        self.sps_map.get(SPS_ID)
    }

    pub fn pps(&self, id: u8) -> Option<&Arc<Pps>> {
        self.pps_map.get(id)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn num_all_pic_coded(&self) -> u64 {
        self.scheduler.num_all_pic_coded()
    }

    pub fn poc_last(&self) -> i32 {
        self.ring.poc_last()
    }

    /// Pictures admitted but not yet handed to the compressor.
    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    /// Disagreements between the GOP table and the derived reference picture sets.
    pub fn rps_inconsistencies(&self) -> &[RpsInconsistency] {
        &self.rps_inconsistencies
    }

    pub fn ring(&self) -> &PictureRing {
        &self.ring
    }

    pub fn rps_selector(&self) -> &RpsSelector {
        &self.rps
    }

    pub fn qp_decision(&self) -> &QpDecision {
        &self.qp
    }

    pub fn stacks(&self) -> &[EncodeStack] {
        &self.stacks
    }

    pub fn compressor(&self) -> &C {
        &self.compressor
    }
}
