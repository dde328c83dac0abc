// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::component::params::AacStreamFormat;
use crate::component::params::Param;
use crate::component::params::ParamIndex;
use crate::component::port::Port;
use crate::component::Component;
use crate::component::ComponentError;
use crate::decoder::CodecHooks;
use crate::decoder::DecoderError;
use crate::decoder::InputFormat;
use crate::decoder::InputMedia;
use crate::decoder::MediaKind;

/// Maps the framing announced by upstream to the component's stream format.
fn stream_format(name: Option<&str>, mpeg_version: u32) -> Option<AacStreamFormat> {
    match (name?, mpeg_version) {
        ("adif", _) => Some(AacStreamFormat::Adif),
        ("raw", _) => Some(AacStreamFormat::Raw),
        ("adts", 2) => Some(AacStreamFormat::Mp2Adts),
        ("adts", 4) => Some(AacStreamFormat::Mp4Adts),
        _ => None,
    }
}

/// AAC hooks: pushes the stream parameters into the AAC parameter block of the input port.
#[derive(Debug, Default)]
pub struct Aac;

impl CodecHooks for Aac {
    fn media_kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn set_format(
        &mut self,
        component: &Component,
        in_port: &Port,
        format: &InputFormat,
    ) -> Result<(), DecoderError> {
        let mut params = match component.get_parameter(ParamIndex::AudioAac, in_port.index())? {
            Param::AudioAac(params) => params,
            _ => return Err(ComponentError::UnexpectedParam(ParamIndex::AudioAac).into()),
        };

        let InputMedia::Audio { rate, channels, mpeg_version } = format.media else {
            return Ok(());
        };
        if channels > 0 {
            params.channels = channels;
        }
        if rate > 0 {
            params.sample_rate = rate;
        }
        match stream_format(format.stream_format.as_deref(), mpeg_version) {
            Some(stream_format) => params.stream_format = stream_format,
            None => debug!("Keeping AAC stream format {:?}", params.stream_format),
        }

        component.set_parameter(&Param::AudioAac(params))?;

        Ok(())
    }
}
