// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter blocks exchanged through `get_parameter` and `set_parameter`.

/// Index of a parameter block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ParamIndex {
    /// Port range of the audio domain, as a `PortInit`.
    AudioInit = 0x0100_0002,
    /// Port range of the video domain, as a `PortInit`.
    VideoInit = 0x0100_0004,
    PortDefinition = 0x0200_0001,
    AudioPcm = 0x0400_0002,
    AudioAac = 0x0400_0003,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Compression format of a video port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoCoding {
    Unused,
    AutoDetect,
    Mpeg2,
    H263,
    Mpeg4,
    Wmv,
    Avc,
    Mjpeg,
    Vp8,
}

/// Raw picture format of a video port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ColorFormat {
    Unused = 0,
    YUV420Planar = 19,
    YUV420PackedPlanar = 20,
    YUV420SemiPlanar = 21,
    YUV420PackedSemiPlanar = 39,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AudioCoding {
    Unused,
    AutoDetect,
    Pcm,
    Aac,
    Mp3,
    Vorbis,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoPortFormat {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Bytes between two luma rows. Zero means the frame width.
    pub stride: u32,
    /// Luma rows before the chroma planes start. Zero means the frame height.
    pub slice_height: u32,
    /// Q16 fixed point framerate, zero if unknown.
    pub framerate_q16: u32,
    pub compression: VideoCoding,
    pub color_format: ColorFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioPortFormat {
    pub encoding: AudioCoding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortFormat {
    Video(VideoPortFormat),
    Audio(AudioPortFormat),
}

/// Definition of a port: buffer requirements and media format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: u32,
    pub direction: Direction,
    /// Number of buffers that will be allocated on the port.
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    /// Size of each buffer, in bytes.
    pub buffer_size: usize,
    pub enabled: bool,
    pub populated: bool,
    pub format: PortFormat,
}

impl PortDefinition {
    pub fn video(&self) -> Option<&VideoPortFormat> {
        match &self.format {
            PortFormat::Video(video) => Some(video),
            PortFormat::Audio(_) => None,
        }
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoPortFormat> {
        match &mut self.format {
            PortFormat::Video(video) => Some(video),
            PortFormat::Audio(_) => None,
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioPortFormat> {
        match &mut self.format {
            PortFormat::Audio(audio) => Some(audio),
            PortFormat::Video(_) => None,
        }
    }
}

/// Range of ports of one domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortInit {
    pub start_port: u32,
    pub num_ports: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelPosition {
    None = 0,
    LeftFront = 1,
    RightFront = 2,
    CenterFront = 3,
    LeftSurround = 4,
    RightSurround = 5,
    LowFrequency = 6,
    CenterSurround = 7,
    LeftRear = 8,
    RightRear = 9,
}

/// Raw PCM parameters of an audio port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmParams {
    pub port: u32,
    pub channels: u32,
    pub sampling_rate: u32,
    pub bits_per_sample: u32,
    pub signed: bool,
    pub little_endian: bool,
    pub interleaved: bool,
    pub channel_mapping: Vec<ChannelPosition>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AacStreamFormat {
    Mp2Adts,
    Mp4Adts,
    Mp4Loas,
    Mp4Latm,
    Adif,
    Mp4Ff,
    Raw,
}

/// AAC parameters of an audio port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AacParams {
    pub port: u32,
    pub channels: u32,
    pub sample_rate: u32,
    pub stream_format: AacStreamFormat,
}

/// A parameter block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Param {
    PortInit(PortInit),
    PortDefinition(PortDefinition),
    AudioPcm(PcmParams),
    AudioAac(AacParams),
}
