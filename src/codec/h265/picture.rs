// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::Sps;
use crate::Resolution;
use crate::YuvBuffer;

/// Per-partition activity used for adaptive QP at one CU depth.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AqLayer {
    /// Width and height in luma samples of one partition.
    pub partition_size: Resolution,
    /// Number of partitions horizontally and vertically.
    pub num_partitions: Resolution,
    pub activity: Vec<f64>,
    pub avg_activity: f64,
}

impl AqLayer {
    pub fn new(picture: Resolution, partition_size: Resolution) -> Self {
        let num_partitions = Resolution {
            width: (picture.width + partition_size.width - 1) / partition_size.width,
            height: (picture.height + partition_size.height - 1) / partition_size.height,
        };

        Self {
            partition_size,
            num_partitions,
            activity: vec![0.0; (num_partitions.width * num_partitions.height) as usize],
            avg_activity: 0.0,
        }
    }
}

/// One slot of the picture ring: sample storage of an admitted picture plus the metadata the
/// encoder tracks for it.
#[derive(Clone, Debug)]
pub struct PictureData {
    /// Picture order count assigned at admission.
    pub poc: i32,
    /// Set while a later picture may still predict from this one.
    pub referenced: bool,
    /// Set once the picture has been fully coded.
    pub reconstructed: bool,
    pub field_pic: bool,
    pub top_field: bool,
    /// The parameter sets this picture's buffers were sized against.
    pub sps: Arc<Sps>,
    pub pps: Arc<Pps>,
    /// Adaptive QP layers, one per delta QP depth. Empty when adaptive QP is off.
    pub aq_layers: Vec<AqLayer>,
    /// Source samples.
    pub orig: YuvBuffer,
    /// Reconstructed samples.
    pub reco: YuvBuffer,
}

impl PictureData {
    /// Allocates a picture whose storage matches `sps`. When `adaptive_qp` is set,
    /// `pps.max_cu_dqp_depth + 1` AQ layers are created, the partition size halving at each
    /// depth.
    pub fn new(sps: Arc<Sps>, pps: Arc<Pps>, adaptive_qp: bool) -> Self {
        let resolution = sps.resolution();
        let orig = YuvBuffer::new(resolution, sps.chroma_format);
        let reco = YuvBuffer::new(resolution, sps.chroma_format);

        let aq_layers = if adaptive_qp {
            (0..=pps.max_cu_dqp_depth)
                .map(|depth| {
                    let partition_size = Resolution {
                        width: (sps.max_cu_width >> depth).max(1),
                        height: (sps.max_cu_height >> depth).max(1),
                    };
                    AqLayer::new(resolution, partition_size)
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            poc: 0,
            referenced: true,
            reconstructed: false,
            field_pic: false,
            top_field: false,
            sps,
            pps,
            aq_layers,
            orig,
            reco,
        }
    }

    pub fn pps_id(&self) -> u8 {
        self.pps.pps_id
    }

    /// Releases the adaptive QP layers.
    pub fn destroy_aq_layers(&mut self) {
        self.aq_layers.clear();
        self.aq_layers.shrink_to_fit();
    }
}
