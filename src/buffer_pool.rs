// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns filled output slots into buffers that can be handed downstream.
//!
//! Two strategies are available behind [`BufferBacking`]: [`CopyBacking`] copies the payload into
//! tightly packed system memory and gives the slot back right away, while [`ZeroCopyBacking`]
//! lends the slot itself to downstream and only returns it to the port once every reference to
//! the output buffer is gone.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use log::error;
use thiserror::Error;

use crate::component::buffer::Slot;
use crate::component::params::PortDefinition;
use crate::component::port::Port;
use crate::component::port::WeakPort;
use crate::decoder::OutputInfo;
use crate::image_processing::copy_frame;
use crate::DecodedFormat;
use crate::FrameLayout;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum BackingError {
    #[error("negotiated size {negotiated:?} does not match the port size {port:?}")]
    ResolutionMismatch { negotiated: Resolution, port: Resolution },
    #[error("output buffer holds {actual} bytes, at least {expected} expected")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("cannot copy frame: {0}")]
    Layout(String),
    #[error("output port has no video definition")]
    NotNegotiated,
}

/// A slot lent to downstream. The slot goes back to its port when the lease is dropped.
pub struct SlotLease {
    slot: Option<Slot>,
    port: WeakPort,
}

impl SlotLease {
    pub fn data(&self) -> &[u8] {
        self.slot.as_ref().map(|slot| slot.payload()).unwrap_or(&[])
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let id = slot.id;

        match self.port.upgrade() {
            Some(port) => {
                debug!("Returning lent buffer {} to port {}", id, port.index());
                if let Err(e) = port.release_buffer(slot) {
                    error!("Failed to return lent buffer {}: {}", id, e);
                }
            }
            None => debug!("Port of lent buffer {} is gone", id),
        }
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease").field("slot", &self.slot.as_ref().map(|s| s.id)).finish()
    }
}

/// Memory of a decoded buffer.
#[derive(Clone, Debug)]
pub enum OutputMemory {
    System(Bytes),
    Leased(Arc<SlotLease>),
}

impl OutputMemory {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            OutputMemory::System(bytes) => bytes,
            OutputMemory::Leased(lease) => lease.data(),
        }
    }
}

/// Output of `BufferBacking::take`.
#[derive(Debug)]
pub struct Backed {
    pub memory: OutputMemory,
    /// Layout of `memory` for video buffers.
    pub layout: Option<FrameLayout>,
    /// The slot, if it was not lent and must be released by the caller.
    pub slot: Option<Slot>,
}

/// Strategy wrapping filled output slots into downstream buffers.
pub trait BufferBacking: Send + Sync {
    /// Wraps the payload of `slot`, acquired from `port`, into a buffer of the negotiated format
    /// `info`. On failure the slot is handed back so the caller can release it.
    fn take(
        &self,
        slot: Slot,
        port: &Port,
        info: &OutputInfo,
    ) -> Result<Backed, (BackingError, Slot)>;
}

/// Layout of the pictures of `format` stored in the buffers of an output port with `definition`.
/// A zero stride or slice height stands for the frame width or height.
pub fn port_frame_layout(
    definition: &PortDefinition,
    format: DecodedFormat,
) -> Result<FrameLayout, BackingError> {
    let video = definition.video().ok_or(BackingError::NotNegotiated)?;
    let size = Resolution::from((video.frame_width, video.frame_height));
    let stride = match video.stride {
        0 => video.frame_width as usize,
        stride => stride as usize,
    };
    let slice_height = match video.slice_height {
        0 => video.frame_height as usize,
        slice_height => slice_height as usize,
    };

    Ok(FrameLayout::with_stride(format, size, stride, slice_height))
}

/// Checks that the picture in an output slot of `port` matches the negotiated format, and returns
/// the layout it is stored with.
fn slot_layout(
    port: &Port,
    format: DecodedFormat,
    size: Resolution,
) -> Result<FrameLayout, BackingError> {
    let definition = port.definition().ok_or(BackingError::NotNegotiated)?;
    let layout = port_frame_layout(&definition, format)?;
    if layout.size != size {
        return Err(BackingError::ResolutionMismatch { negotiated: size, port: layout.size });
    }

    Ok(layout)
}

/// Copies every payload into newly allocated, tightly packed memory.
#[derive(Debug, Default)]
pub struct CopyBacking;

impl CopyBacking {
    fn copy(slot: &Slot, port: &Port, info: &OutputInfo) -> Result<Backed, BackingError> {
        let payload = slot.payload();

        let video = match info {
            OutputInfo::Audio(_) => {
                return Ok(Backed {
                    memory: OutputMemory::System(Bytes::copy_from_slice(payload)),
                    layout: None,
                    slot: None,
                })
            }
            OutputInfo::Video(video) => video,
        };

        let src_layout = slot_layout(port, video.format, video.size)?;
        let dst_layout = FrameLayout::packed(video.format, video.size);
        let dst_size = dst_layout.min_buffer_size();

        // Some components already output packed pictures.
        if payload.len() == dst_size {
            return Ok(Backed {
                memory: OutputMemory::System(Bytes::copy_from_slice(payload)),
                layout: Some(dst_layout),
                slot: None,
            });
        }

        let expected = src_layout.min_buffer_size();
        if payload.len() < expected {
            return Err(BackingError::SizeMismatch { expected, actual: payload.len() });
        }

        let mut dst = vec![0u8; dst_size];
        copy_frame(payload, &src_layout, &mut dst, &dst_layout).map_err(BackingError::Layout)?;

        Ok(Backed {
            memory: OutputMemory::System(Bytes::from(dst)),
            layout: Some(dst_layout),
            slot: None,
        })
    }
}

impl BufferBacking for CopyBacking {
    fn take(
        &self,
        slot: Slot,
        port: &Port,
        info: &OutputInfo,
    ) -> Result<Backed, (BackingError, Slot)> {
        match Self::copy(&slot, port, info) {
            Ok(backed) => Ok(Backed { slot: Some(slot), ..backed }),
            Err(e) => Err((e, slot)),
        }
    }
}

/// Lends the output slots to downstream without copying.
#[derive(Debug, Default)]
pub struct ZeroCopyBacking;

impl BufferBacking for ZeroCopyBacking {
    fn take(
        &self,
        slot: Slot,
        port: &Port,
        info: &OutputInfo,
    ) -> Result<Backed, (BackingError, Slot)> {
        let layout = match info {
            OutputInfo::Audio(_) => None,
            OutputInfo::Video(video) => match slot_layout(port, video.format, video.size) {
                Ok(layout) => Some(layout),
                Err(e) => return Err((e, slot)),
            },
        };

        if let Some(layout) = &layout {
            let expected = layout.min_buffer_size();
            if slot.payload().len() < expected {
                let actual = slot.payload().len();
                return Err((BackingError::SizeMismatch { expected, actual }, slot));
            }
        }

        debug!("Lending buffer {} of port {}", slot.id, port.index());
        let lease = SlotLease { slot: Some(slot), port: port.downgrade() };

        Ok(Backed { memory: OutputMemory::Leased(Arc::new(lease)), layout, slot: None })
    }
}

/// Returns the backing strategy to use.
pub fn backing_for(no_copy: bool) -> Box<dyn BufferBacking> {
    if no_copy {
        Box::new(ZeroCopyBacking)
    } else {
        Box::new(CopyBacking)
    }
}
