// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec specific hooks, see [`CodecHooks`].

pub mod aac;
pub mod h264;

use crate::codecs::aac::Aac;
use crate::codecs::h264::H264;
use crate::decoder::CodecHooks;
use crate::decoder::MediaKind;

/// Hooks for codecs that need no specific handling.
#[derive(Debug)]
pub struct Generic {
    kind: MediaKind,
}

impl Generic {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind }
    }
}

impl CodecHooks for Generic {
    fn media_kind(&self) -> MediaKind {
        self.kind
    }
}

/// Returns the hooks to use for a component implementing `role`, e.g. "video_decoder.avc".
/// Returns `None` if the role is not a decoder role.
pub fn for_role(role: &str) -> Option<Box<dyn CodecHooks>> {
    let (kind, codec) = role.split_once('.')?;

    let hooks: Box<dyn CodecHooks> = match (kind, codec) {
        ("video_decoder", "avc") => Box::new(H264),
        ("audio_decoder", "aac") => Box::new(Aac),
        ("video_decoder", _) => Box::new(Generic::new(MediaKind::Video)),
        ("audio_decoder", _) => Box::new(Generic::new(MediaKind::Audio)),
        _ => return None,
    };

    Some(hooks)
}
