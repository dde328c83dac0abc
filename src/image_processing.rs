// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plane copies between frame buffers with different layouts.
//!
//! Components usually pad decoded pictures to their own alignment requirements. These helpers
//! move the meaningful part of each plane into a buffer laid out the way downstream expects.

use crate::FrameLayout;

/// Copies `rows` lines of `row_bytes` bytes from `src` into `dst`, each buffer advancing by its
/// own stride.
///
/// Both buffers must be large enough, which `copy_frame` checks before calling this.
fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    let src_lines = src.chunks(src_stride).map(|line| &line[..row_bytes]);
    let dst_lines = dst.chunks_mut(dst_stride).map(|line| &mut line[..row_bytes]);

    for (src_line, dst_line) in src_lines.zip(dst_lines).take(rows) {
        dst_line.copy_from_slice(src_line);
    }
}

/// Copies the frame in `src`, laid out as `src_layout`, into `dst` using `dst_layout`.
///
/// Source and destination strides are independent, so this can both remove and add padding. The
/// two layouts must describe the same format and visible size.
pub fn copy_frame(
    src: &[u8],
    src_layout: &FrameLayout,
    dst: &mut [u8],
    dst_layout: &FrameLayout,
) -> Result<(), String> {
    if src_layout.format != dst_layout.format || src_layout.size != dst_layout.size {
        return Err(format!(
            "cannot copy a {:?} {}x{} frame into a {:?} {}x{} one",
            src_layout.format,
            src_layout.size.width,
            src_layout.size.height,
            dst_layout.format,
            dst_layout.size.width,
            dst_layout.size.height
        ));
    }

    let num_planes = src_layout.format.num_planes();
    if src_layout.planes.len() < num_planes || dst_layout.planes.len() < num_planes {
        return Err(format!("{:?} needs {} planes", src_layout.format, num_planes));
    }

    let buffers = [(src_layout, src.len(), "source"), (dst_layout, dst.len(), "destination")];
    for (layout, len, what) in buffers {
        let needed = layout.min_buffer_size();
        if len < needed {
            return Err(format!("{what} buffer too small: {len} < {needed}"));
        }
    }

    for plane in 0..num_planes {
        let (rows, row_bytes) = src_layout.plane_extent(plane);
        let src_plane = src_layout.planes[plane];
        let dst_plane = dst_layout.planes[plane];

        if rows == 0 || row_bytes == 0 {
            continue;
        }
        if src_plane.stride < row_bytes || dst_plane.stride < row_bytes {
            return Err(format!("stride of plane {plane} is smaller than its width"));
        }

        copy_plane(
            &src[src_plane.offset..],
            src_plane.stride,
            &mut dst[dst_plane.offset..],
            dst_plane.stride,
            row_bytes,
            rows,
        );
    }

    Ok(())
}
