// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adapter driving IL-style hardware media codec components.
//!
//! A [`component::Component`] wraps a codec exposed through a request/confirm state machine with
//! an input and an output port. Each port owns a fixed set of buffers that travel between the
//! caller and the component. The [`decoder::Decoder`] builds on top of that to provide a
//! frame-in, frame-out decoder with drain, flush and in-band reconfiguration support.

#[cfg(test)]
mod backend;
pub mod buffer_pool;
pub mod codecs;
pub mod component;
pub mod decoder;
pub mod image_processing;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Raw video formats the adapter is able to hand out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl DecodedFormat {
    /// Number of planes of the format.
    pub fn num_planes(&self) -> usize {
        match self {
            DecodedFormat::NV12 => 2,
            DecodedFormat::I420 => 3,
        }
    }
}

/// Position and stride of one plane within a frame buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
}

/// Memory layout of a decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: DecodedFormat,
    pub size: Resolution,
    pub planes: Vec<PlaneLayout>,
}

impl FrameLayout {
    /// Layout of a frame of `format` whose luma rows are `stride` bytes apart and whose chroma
    /// planes start after `slice_height` luma rows.
    pub fn with_stride(
        format: DecodedFormat,
        size: Resolution,
        stride: usize,
        slice_height: usize,
    ) -> Self {
        let luma_size = stride * slice_height;
        let planes = match format {
            // Interleaved chroma rows hold two samples per pair of pixels.
            DecodedFormat::NV12 => vec![
                PlaneLayout { offset: 0, stride },
                PlaneLayout { offset: luma_size, stride: ((stride + 1) / 2) * 2 },
            ],
            DecodedFormat::I420 => {
                let chroma_stride = (stride + 1) / 2;
                let chroma_size = chroma_stride * ((slice_height + 1) / 2);
                vec![
                    PlaneLayout { offset: 0, stride },
                    PlaneLayout { offset: luma_size, stride: chroma_stride },
                    PlaneLayout { offset: luma_size + chroma_size, stride: chroma_stride },
                ]
            }
        };

        Self { format, size, planes }
    }

    /// Layout of a frame of `format` without any padding.
    pub fn packed(format: DecodedFormat, size: Resolution) -> Self {
        Self::with_stride(format, size, size.width as usize, size.height as usize)
    }

    /// Number of rows and number of meaningful bytes per row of plane `plane`.
    pub fn plane_extent(&self, plane: usize) -> (usize, usize) {
        let width = self.size.width as usize;
        let height = self.size.height as usize;

        match (self.format, plane) {
            (_, 0) => (height, width),
            (DecodedFormat::NV12, _) => ((height + 1) / 2, ((width + 1) / 2) * 2),
            (DecodedFormat::I420, _) => ((height + 1) / 2, (width + 1) / 2),
        }
    }

    /// Minimum number of bytes a buffer must hold to contain a frame with this layout.
    pub fn min_buffer_size(&self) -> usize {
        self.planes
            .iter()
            .enumerate()
            .map(|(i, plane)| match self.plane_extent(i) {
                (0, _) => plane.offset,
                (rows, row_bytes) => plane.offset + (rows - 1) * plane.stride + row_bytes,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Returns the size required to store a frame of `format` with size `width`x`height`, without any
/// padding. This is the size of the buffers produced by the copying output path.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let u_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            u_size + uv_size
        }
    }
}
