// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestration core of a hierarchical-GOP block based video encoder.
//!
//! This crate owns the parts of an encoder that decide *what* gets coded and *when*: the
//! lifecycle of the in-flight picture buffers, the reference picture sets every picture predicts
//! from, the per-picture quantization parameter and the HRD/VUI timing parameters. Sample level
//! coding, motion search and bitstream serialization are delegated to collaborators described by
//! the traits in [`encoder`].

pub mod codec;
pub mod encoder;

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Number of `block`x`block` units needed to cover the resolution.
    pub fn in_blocks(&self, block: u32) -> Resolution {
        Resolution {
            width: (self.width + block - 1) / block,
            height: (self.height + block - 1) / block,
        }
    }
}

/// Chroma subsampling of a picture, with the values of `chroma_format_idc`.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl ChromaFormat {
    /// Horizontal and vertical chroma subsampling shifts.
    pub fn subsampling(&self) -> (u32, u32) {
        match self {
            ChromaFormat::Monochrome | ChromaFormat::Yuv420 => (1, 1),
            ChromaFormat::Yuv422 => (1, 0),
            ChromaFormat::Yuv444 => (0, 0),
        }
    }

    pub fn num_planes(&self) -> usize {
        match self {
            ChromaFormat::Monochrome => 1,
            _ => 3,
        }
    }
}

/// A planar picture with up to 3 planes of 16-bit samples and no padding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YuvBuffer {
    pub resolution: Resolution,
    pub chroma_format: ChromaFormat,
    pub planes: Vec<Vec<u16>>,
}

impl YuvBuffer {
    pub fn new(resolution: Resolution, chroma_format: ChromaFormat) -> Self {
        let planes = (0..chroma_format.num_planes())
            .map(|plane| {
                let (w, h) = Self::plane_size(resolution, chroma_format, plane);
                vec![0u16; w * h]
            })
            .collect();

        Self {
            resolution,
            chroma_format,
            planes,
        }
    }

    /// Width and height in samples of `plane`.
    pub fn plane_size(
        resolution: Resolution,
        chroma_format: ChromaFormat,
        plane: usize,
    ) -> (usize, usize) {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        if plane == 0 {
            return (w, h);
        }

        let (sx, sy) = chroma_format.subsampling();
        ((w + (1 << sx) - 1) >> sx, (h + (1 << sy) - 1) >> sy)
    }

    /// Stride of `plane`. Buffers are tightly packed so this is the plane width.
    pub fn stride(&self, plane: usize) -> usize {
        Self::plane_size(self.resolution, self.chroma_format, plane).0
    }
}

/// Copies the lines of one field of the interlaced `src` plane into `dst`.
///
/// `height` is the height of the frame, `dst` receives `height / 2` lines of `width` samples
/// laid out with `stride`.
pub fn separate_fields(
    src: &[u16],
    dst: &mut [u16],
    stride: usize,
    width: usize,
    height: usize,
    is_top: bool,
) {
    let mut src = if is_top { src } else { &src[stride.min(src.len())..] };
    let mut dst = dst;

    for _ in 0..height / 2 {
        if src.len() < width || dst.len() < width {
            break;
        }

        dst[..width].copy_from_slice(&src[..width]);
        let step = stride.min(dst.len());
        dst = &mut dst[step..];
        src = &src[(2 * stride).min(src.len())..];
    }
}

/// Splits the interlaced `frame` into the field selected by `is_top`.
pub fn extract_field(frame: &YuvBuffer, is_top: bool) -> YuvBuffer {
    let field_resolution = Resolution {
        width: frame.resolution.width,
        height: frame.resolution.height / 2,
    };
    let mut field = YuvBuffer::new(field_resolution, frame.chroma_format);

    for (plane, src) in frame.planes.iter().enumerate() {
        let (width, height) = YuvBuffer::plane_size(frame.resolution, frame.chroma_format, plane);
        separate_fields(src, &mut field.planes[plane], width, width, height, is_top);
    }

    field
}
