// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::component::params::VideoCoding;
use crate::component::port::Port;
use crate::component::Component;
use crate::decoder::CodecHooks;
use crate::decoder::DecoderError;
use crate::decoder::InputFormat;
use crate::decoder::MediaKind;

/// H.264 hooks. The stream is expected in the framing the component was set up for.
#[derive(Debug, Default)]
pub struct H264;

impl CodecHooks for H264 {
    fn media_kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn set_format(
        &mut self,
        _component: &Component,
        in_port: &Port,
        _format: &InputFormat,
    ) -> Result<(), DecoderError> {
        let Some(mut definition) = in_port.definition() else {
            return Ok(());
        };

        if let Some(video) = definition.video_mut() {
            video.compression = VideoCoding::Avc;
        }
        in_port.update_port_definition(Some(&definition))?;

        Ok(())
    }
}
