// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy component whose only purpose is to let the adapter run so we can
//! test it in isolation.
//!
//! The component decodes on a worker thread and completes every command asynchronously, like
//! hardware would. Video frames start with an 8 bytes header holding their width and height as
//! little endian `u32`s; a frame with a different size triggers an in-band port settings change.
//! Decoded pictures are filled with a pattern derived from the frame number, see `pattern`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use bytes::Bytes;

use crate::component::buffer::BufferFlags;
use crate::component::buffer::BufferHeader;
use crate::component::buffer::BufferId;
use crate::component::params::AacParams;
use crate::component::params::AacStreamFormat;
use crate::component::params::AudioCoding;
use crate::component::params::AudioPortFormat;
use crate::component::params::ChannelPosition;
use crate::component::params::ColorFormat;
use crate::component::params::Direction;
use crate::component::params::Param;
use crate::component::params::ParamIndex;
use crate::component::params::PcmParams;
use crate::component::params::PortDefinition;
use crate::component::params::PortFormat;
use crate::component::params::PortInit;
use crate::component::params::VideoCoding;
use crate::component::params::VideoPortFormat;
use crate::component::port::Port;
use crate::component::Command;
use crate::component::Component;
use crate::component::ComponentBackend;
use crate::component::ComponentConfig;
use crate::component::ComponentError;
use crate::component::ComponentEvent;
use crate::component::ComponentLoader;
use crate::component::ComponentState;
use crate::component::ErrorCode;
use crate::component::EventSink;
use crate::component::ALL_PORTS;
use crate::utils::align_up;

pub(crate) const COMPONENT_NAME: &str = "dummy";
pub(crate) const VIDEO_ROLE: &str = "video_decoder.avc";
pub(crate) const AUDIO_ROLE: &str = "audio_decoder.aac";

const IN_PORT: u32 = 0;
const OUT_PORT: u32 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Samples per channel of each decoded audio frame.
pub(crate) const AUDIO_FRAME_SAMPLES: usize = 1024;

#[derive(Clone, Debug)]
pub(crate) struct DummyOptions {
    /// Delay before buffers are returned on flush and port disable.
    pub release_delay: Duration,
    /// Swallow the EOS buffer instead of signalling the end of the stream on the output.
    pub drain_never_returns: bool,
    /// Raise an error when given an empty EOS buffer.
    pub reject_empty_eos: bool,
    pub input_buffer_size: usize,
    pub buffer_count: u32,
    pub size: (u32, u32),
    pub color_format: ColorFormat,
    /// Color formats the output port can be set to.
    pub color_formats: Vec<ColorFormat>,
    /// Codec data output before the first picture.
    pub codec_config: Option<Vec<u8>>,
    /// Input frames, by arrival order, consumed without producing a picture.
    pub skip_frames: Vec<u32>,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            release_delay: Duration::ZERO,
            drain_never_returns: false,
            reject_empty_eos: false,
            input_buffer_size: 4096,
            buffer_count: 4,
            size: (64, 48),
            color_format: ColorFormat::YUV420Planar,
            color_formats: vec![ColorFormat::YUV420Planar, ColorFormat::YUV420SemiPlanar],
            codec_config: None,
            skip_frames: Vec::new(),
        }
    }
}

/// Calls made to the component, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Command(Command),
    SetParameter(ParamIndex),
    Allocate(u32),
    Free(u32, BufferId),
    Empty(BufferId, BufferFlags),
    Fill(BufferId),
    /// The buffer protocol was broken.
    Violation(String),
}

/// Builds a video frame as understood by the dummy component.
pub(crate) fn encode_video_frame(width: u32, height: u32, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.write_u32::<LittleEndian>(width).unwrap();
    frame.write_u32::<LittleEndian>(height).unwrap();
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// Content of the `len` first bytes of the output buffer holding frame number `seed`.
pub(crate) fn pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize * 31 + i) as u8).collect()
}

/// Size of the padded output buffers of a `width`x`height` stream.
fn output_buffer_size(width: u32, height: u32) -> usize {
    let stride = align_up(width as usize, 16);
    let slice_height = align_up(height as usize, 16);
    stride * slice_height * 3 / 2
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Video,
    Audio,
}

struct DummyPort {
    def: PortDefinition,
    enabled: bool,
    allocated: Vec<BufferId>,
    /// Buffers currently owned by the component.
    held: VecDeque<BufferHeader>,
    flush_pending: bool,
    disable_pending: bool,
    enable_pending: bool,
    /// When buffers can be returned for the pending flush or disable.
    release_at: Instant,
}

impl DummyPort {
    fn new(def: PortDefinition) -> Self {
        Self {
            enabled: def.enabled,
            def,
            allocated: Vec::new(),
            held: VecDeque::new(),
            flush_pending: false,
            disable_pending: false,
            enable_pending: false,
            release_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.allocated.len() >= self.def.buffer_count_actual as usize
    }

    fn accepts_buffers(&self) -> bool {
        (self.enabled && !self.disable_pending) || self.enable_pending
    }
}

struct FrameInProgress {
    timestamp: u64,
    tick_count: u64,
}

struct Job {
    len: usize,
    timestamp: u64,
    tick_count: u64,
    eos: bool,
    codec_config: bool,
    seed: u32,
}

struct State {
    options: DummyOptions,
    role: Role,
    state: ComponentState,
    pending_state: Option<ComponentState>,
    ports: [DummyPort; 2],
    pcm: PcmParams,
    aac: AacParams,
    frame: Option<FrameInProgress>,
    decoded: VecDeque<Job>,
    frames_decoded: u32,
    frames_received: u32,
    codec_config_sent: bool,
    waiting_reconfigure: bool,
    input_paused: bool,
    next_id: BufferId,
    outbox: Vec<ComponentEvent>,
    quit: bool,
}

impl State {
    fn new(options: DummyOptions, role: Role) -> Self {
        let (width, height) = options.size;
        let in_format = match role {
            Role::Video => PortFormat::Video(VideoPortFormat {
                frame_width: width,
                frame_height: height,
                stride: 0,
                slice_height: 0,
                framerate_q16: 0,
                compression: VideoCoding::Avc,
                color_format: ColorFormat::Unused,
            }),
            Role::Audio => PortFormat::Audio(AudioPortFormat { encoding: AudioCoding::Aac }),
        };
        let (out_format, out_size) = match role {
            Role::Video => (
                PortFormat::Video(VideoPortFormat {
                    frame_width: width,
                    frame_height: height,
                    stride: align_up(width as usize, 16) as u32,
                    slice_height: align_up(height as usize, 16) as u32,
                    framerate_q16: 0,
                    compression: VideoCoding::Unused,
                    color_format: options.color_format,
                }),
                output_buffer_size(width, height),
            ),
            Role::Audio => (
                PortFormat::Audio(AudioPortFormat { encoding: AudioCoding::Pcm }),
                AUDIO_FRAME_SAMPLES * 2 * 2 * 2,
            ),
        };

        let port = |index, direction, buffer_size, format| {
            DummyPort::new(PortDefinition {
                index,
                direction,
                buffer_count_actual: options.buffer_count,
                buffer_count_min: 1,
                buffer_size,
                enabled: true,
                populated: false,
                format,
            })
        };
        let ports = [
            port(IN_PORT, Direction::Input, options.input_buffer_size, in_format),
            port(OUT_PORT, Direction::Output, out_size, out_format),
        ];

        Self {
            role,
            state: ComponentState::Loaded,
            pending_state: None,
            ports,
            pcm: PcmParams {
                port: OUT_PORT,
                channels: 2,
                sampling_rate: 48000,
                bits_per_sample: 16,
                signed: true,
                little_endian: true,
                interleaved: true,
                channel_mapping: vec![ChannelPosition::LeftFront, ChannelPosition::RightFront],
            },
            aac: AacParams {
                port: IN_PORT,
                channels: 2,
                sample_rate: 48000,
                stream_format: AacStreamFormat::Mp4Adts,
            },
            frame: None,
            decoded: VecDeque::new(),
            frames_decoded: 0,
            frames_received: 0,
            codec_config_sent: false,
            waiting_reconfigure: false,
            input_paused: false,
            next_id: 1,
            outbox: Vec::new(),
            quit: false,
            options,
        }
    }

    fn port(&mut self, index: u32) -> Result<&mut DummyPort, ErrorCode> {
        self.ports.get_mut(index as usize).ok_or(ErrorCode::BadPortIndex)
    }

    fn output_size(&self) -> (u32, u32) {
        match &self.ports[OUT_PORT as usize].def.format {
            PortFormat::Video(video) => (video.frame_width, video.frame_height),
            PortFormat::Audio(_) => (0, 0),
        }
    }

    fn resize_output(&mut self, width: u32, height: u32) {
        let out = &mut self.ports[OUT_PORT as usize].def;
        if let Some(video) = out.video_mut() {
            video.frame_width = width;
            video.frame_height = height;
            video.stride = align_up(width as usize, 16) as u32;
            video.slice_height = align_up(height as usize, 16) as u32;
            out.buffer_size = output_buffer_size(width, height);
        }
    }

    /// Gives back every buffer the component holds on port `index`.
    fn return_held(&mut self, index: u32) {
        let port = &mut self.ports[index as usize];
        for mut header in port.held.drain(..) {
            if index == OUT_PORT {
                header.filled_len = 0;
                self.outbox.push(ComponentEvent::FillBufferDone(header));
            } else {
                self.outbox.push(ComponentEvent::EmptyBufferDone(header));
            }
        }
        if index == IN_PORT {
            self.frame = None;
        }
    }

    fn step(&mut self) {
        let now = Instant::now();

        for index in [IN_PORT, OUT_PORT] {
            let port = &self.ports[index as usize];
            if port.flush_pending && now >= port.release_at {
                self.return_held(index);
                if index == OUT_PORT {
                    self.decoded.clear();
                }
                self.ports[index as usize].flush_pending = false;
                self.outbox.push(ComponentEvent::CommandComplete(Command::Flush(index)));
            }

            let port = &self.ports[index as usize];
            if port.disable_pending && now >= port.release_at {
                self.return_held(index);
                let port = &mut self.ports[index as usize];
                if port.allocated.is_empty() {
                    port.enabled = false;
                    port.disable_pending = false;
                    self.outbox.push(ComponentEvent::CommandComplete(Command::PortDisable(index)));
                }
            }

            let loaded = self.state == ComponentState::Loaded;
            let port = &mut self.ports[index as usize];
            if port.enable_pending && (loaded || port.is_complete()) {
                port.enabled = true;
                port.enable_pending = false;
                if index == OUT_PORT {
                    self.waiting_reconfigure = false;
                }
                self.outbox.push(ComponentEvent::CommandComplete(Command::PortEnable(index)));
            }
        }

        if let Some(target) = self.pending_state {
            let done = match (self.state, target) {
                (ComponentState::Loaded, ComponentState::Idle) => {
                    self.ports.iter().all(|port| !port.enabled || port.is_complete())
                }
                (_, ComponentState::Loaded) => {
                    self.ports.iter().all(|port| port.allocated.is_empty())
                }
                (ComponentState::Executing | ComponentState::Pause, ComponentState::Idle) => {
                    self.return_held(IN_PORT);
                    self.return_held(OUT_PORT);
                    self.decoded.clear();
                    true
                }
                _ => true,
            };
            if done {
                self.state = target;
                self.pending_state = None;
                self.outbox.push(ComponentEvent::CommandComplete(Command::StateSet(target)));
            }
        }

        if self.state == ComponentState::Executing {
            self.decode();
            self.fill();
        }
    }

    fn decode(&mut self) {
        while !self.waiting_reconfigure
            && !self.input_paused
            && !self.ports[IN_PORT as usize].flush_pending
        {
            let Some(header) = self.ports[IN_PORT as usize].held.front() else {
                break;
            };

            if header.flags.contains(BufferFlags::CODECCONFIG) {
                self.consume_input();
                continue;
            }

            if header.flags.contains(BufferFlags::EOS) {
                if header.filled_len == 0 && self.options.reject_empty_eos {
                    self.outbox.push(ComponentEvent::Error(ErrorCode::StreamCorrupt as u32));
                } else if !self.options.drain_never_returns {
                    let timestamp = header.timestamp;
                    self.decoded.push_back(Job {
                        len: 0,
                        timestamp,
                        tick_count: 0,
                        eos: true,
                        codec_config: false,
                        seed: 0,
                    });
                }
                self.consume_input();
                continue;
            }

            if self.frame.is_none() {
                let payload = header.payload();
                if self.role == Role::Video && payload.len() >= 8 {
                    let size = (
                        LittleEndian::read_u32(&payload[0..4]),
                        LittleEndian::read_u32(&payload[4..8]),
                    );
                    if size != self.output_size() {
                        // Pictures of the previous size go out first.
                        if !self.decoded.is_empty() {
                            break;
                        }
                        self.resize_output(size.0, size.1);
                        self.waiting_reconfigure = true;
                        self.outbox.push(ComponentEvent::PortSettingsChanged(OUT_PORT));
                        break;
                    }
                }
                self.frame = Some(FrameInProgress { timestamp: header.timestamp, tick_count: 0 });
            }

            let tick_count = header.tick_count;
            let end_of_frame = header.flags.contains(BufferFlags::ENDOFFRAME);
            if let Some(frame) = self.frame.as_mut() {
                frame.tick_count += tick_count;
            }
            if end_of_frame {
                if let Some(frame) = self.frame.take() {
                    let number = self.frames_received;
                    self.frames_received += 1;
                    if self.options.skip_frames.contains(&number) {
                        self.consume_input();
                        continue;
                    }
                    if let Some(config) = &self.options.codec_config {
                        if !self.codec_config_sent {
                            self.codec_config_sent = true;
                            self.decoded.push_back(Job {
                                len: config.len(),
                                timestamp: frame.timestamp,
                                tick_count: 0,
                                eos: false,
                                codec_config: true,
                                seed: 0,
                            });
                        }
                    }
                    let len = match self.role {
                        Role::Video => self.ports[OUT_PORT as usize].def.buffer_size,
                        Role::Audio => AUDIO_FRAME_SAMPLES * self.pcm.channels as usize * 2,
                    };
                    self.decoded.push_back(Job {
                        len,
                        timestamp: frame.timestamp,
                        tick_count: frame.tick_count,
                        eos: false,
                        codec_config: false,
                        seed: self.frames_decoded,
                    });
                    self.frames_decoded += 1;
                }
            }
            self.consume_input();
        }
    }

    fn consume_input(&mut self) {
        if let Some(header) = self.ports[IN_PORT as usize].held.pop_front() {
            self.outbox.push(ComponentEvent::EmptyBufferDone(header));
        }
    }

    fn fill(&mut self) {
        let out = &self.ports[OUT_PORT as usize];
        if !out.enabled || out.disable_pending || out.flush_pending {
            return;
        }

        while !self.decoded.is_empty() {
            let Some(mut header) = self.ports[OUT_PORT as usize].held.pop_front() else {
                break;
            };
            let Some(job) = self.decoded.pop_front() else {
                break;
            };

            header.offset = 0;
            header.timestamp = job.timestamp;
            header.tick_count = job.tick_count;
            if job.eos {
                header.filled_len = 0;
                header.flags = BufferFlags::EOS;
                self.outbox.push(ComponentEvent::FillBufferDone(header));
                self.outbox.push(ComponentEvent::BufferFlag {
                    port: OUT_PORT,
                    flags: BufferFlags::EOS,
                });
            } else if job.codec_config {
                let config = self.options.codec_config.as_deref().unwrap_or_default();
                let len = config.len().min(header.alloc_len());
                header.data[..len].copy_from_slice(&config[..len]);
                header.filled_len = len;
                header.flags = BufferFlags::CODECCONFIG | BufferFlags::ENDOFFRAME;
                self.outbox.push(ComponentEvent::FillBufferDone(header));
            } else {
                let len = job.len.min(header.alloc_len());
                header.data[..len].copy_from_slice(&pattern(job.seed, len));
                header.filled_len = len;
                header.flags = BufferFlags::ENDOFFRAME;
                self.outbox.push(ComponentEvent::FillBufferDone(header));
            }
        }
    }
}

pub(crate) struct DummyShared {
    state: Mutex<State>,
    cond: Condvar,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl DummyShared {
    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn violation(&self, what: String) -> ErrorCode {
        log::error!("{}", what);
        self.log(Call::Violation(what));
        ErrorCode::IncorrectStateOperation
    }

    /// Runs `f` on the component state and wakes the worker up.
    fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let res = f(&mut self.state.lock().unwrap());
        self.cond.notify_all();
        res
    }
}

fn run_worker(shared: Arc<DummyShared>, events: EventSink) {
    loop {
        let outbox = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.quit {
                    return;
                }
                state.step();
                if !state.outbox.is_empty() {
                    break std::mem::take(&mut state.outbox);
                }
                state = shared.cond.wait_timeout(state, POLL_INTERVAL).unwrap().0;
            }
        };

        for event in outbox {
            events(event);
        }
    }
}

pub(crate) struct DummyComponent {
    shared: Arc<DummyShared>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for DummyComponent {
    fn drop(&mut self) {
        self.shared.update(|state| state.quit = true);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ComponentBackend for DummyComponent {
    fn get_parameter(&mut self, index: ParamIndex, port: u32) -> Result<Param, ErrorCode> {
        let mut state = self.shared.state.lock().unwrap();
        match index {
            ParamIndex::PortDefinition => {
                let port = state.port(port)?;
                let mut def = port.def.clone();
                def.enabled = port.enabled;
                def.populated = port.is_complete();
                Ok(Param::PortDefinition(def))
            }
            ParamIndex::VideoInit | ParamIndex::AudioInit => {
                let matches = (index == ParamIndex::VideoInit) == (state.role == Role::Video);
                Ok(Param::PortInit(PortInit {
                    start_port: IN_PORT,
                    num_ports: if matches { 2 } else { 0 },
                }))
            }
            ParamIndex::AudioPcm if state.role == Role::Audio => {
                Ok(Param::AudioPcm(state.pcm.clone()))
            }
            ParamIndex::AudioAac if state.role == Role::Audio => {
                Ok(Param::AudioAac(state.aac.clone()))
            }
            _ => Err(ErrorCode::UnsupportedIndex),
        }
    }

    fn set_parameter(&mut self, param: &Param) -> Result<(), ErrorCode> {
        let mut state = self.shared.state.lock().unwrap();
        match param {
            Param::PortDefinition(def) => {
                self.shared.log(Call::SetParameter(ParamIndex::PortDefinition));
                let loaded = state.state == ComponentState::Loaded;
                let color_formats = state.options.color_formats.clone();
                let port = state.port(def.index)?;
                if !loaded && port.enabled && !port.allocated.is_empty() {
                    return Err(self.shared.violation(format!(
                        "port {} definition set while populated",
                        def.index
                    )));
                }
                if def.buffer_count_actual < port.def.buffer_count_min {
                    return Err(ErrorCode::BadParameter);
                }
                port.def.buffer_count_actual = def.buffer_count_actual;
                if def.index == IN_PORT {
                    port.def.buffer_size = port.def.buffer_size.max(def.buffer_size);
                }

                match (&def.format, &mut port.def.format) {
                    (PortFormat::Video(new), PortFormat::Video(current))
                        if def.index == IN_PORT =>
                    {
                        current.frame_width = new.frame_width;
                        current.frame_height = new.frame_height;
                        current.framerate_q16 = new.framerate_q16;
                        current.compression = new.compression;
                        let (width, height) = (new.frame_width, new.frame_height);
                        if width != 0 && height != 0 && !state.waiting_reconfigure {
                            state.resize_output(width, height);
                        }
                    }
                    (PortFormat::Video(new), PortFormat::Video(current)) => {
                        if !color_formats.contains(&new.color_format) {
                            return Err(ErrorCode::UnsupportedSetting);
                        }
                        current.color_format = new.color_format;
                    }
                    (PortFormat::Audio(new), PortFormat::Audio(current)) => {
                        if def.index == OUT_PORT && new.encoding != AudioCoding::Pcm {
                            return Err(ErrorCode::UnsupportedSetting);
                        }
                        current.encoding = new.encoding;
                    }
                    _ => return Err(ErrorCode::BadParameter),
                }
                Ok(())
            }
            Param::AudioAac(aac) if state.role == Role::Audio => {
                self.shared.log(Call::SetParameter(ParamIndex::AudioAac));
                state.aac = aac.clone();
                state.pcm.channels = aac.channels;
                state.pcm.sampling_rate = aac.sample_rate;
                Ok(())
            }
            Param::AudioPcm(pcm) if state.role == Role::Audio => {
                self.shared.log(Call::SetParameter(ParamIndex::AudioPcm));
                state.pcm = pcm.clone();
                Ok(())
            }
            _ => Err(ErrorCode::UnsupportedIndex),
        }
    }

    fn send_command(&mut self, command: Command) -> Result<(), ErrorCode> {
        self.shared.log(Call::Command(command));
        let release_delay = self.shared.state.lock().unwrap().options.release_delay;
        let release_at = Instant::now() + release_delay;

        self.shared.update(|state| {
            let ports = |index: u32| -> Result<Vec<usize>, ErrorCode> {
                match index {
                    ALL_PORTS => Ok(vec![0, 1]),
                    IN_PORT | OUT_PORT => Ok(vec![index as usize]),
                    _ => Err(ErrorCode::BadPortIndex),
                }
            };

            match command {
                Command::StateSet(target) => {
                    if !state.state.can_transition_to(target) {
                        return Err(ErrorCode::IncorrectStateTransition);
                    }
                    state.pending_state = Some(target);
                }
                Command::Flush(index) => {
                    for i in ports(index)? {
                        state.ports[i].flush_pending = true;
                        state.ports[i].release_at = release_at;
                    }
                }
                Command::PortDisable(index) => {
                    for i in ports(index)? {
                        state.ports[i].disable_pending = true;
                        state.ports[i].release_at = release_at;
                    }
                }
                Command::PortEnable(index) => {
                    for i in ports(index)? {
                        state.ports[i].enable_pending = true;
                    }
                }
            }
            Ok(())
        })
    }

    fn allocate_buffer(&mut self, port: u32, size: usize) -> Result<BufferHeader, ErrorCode> {
        self.shared.update(|state| {
            let going_idle = state.state == ComponentState::Loaded
                && state.pending_state == Some(ComponentState::Idle);
            let id = state.next_id;
            let p = state.port(port)?;

            if !going_idle && p.enabled && !p.enable_pending {
                return Err(self.shared.violation(format!("allocation on enabled port {port}")));
            }
            if size < p.def.buffer_size {
                return Err(ErrorCode::BadParameter);
            }
            if p.is_complete() {
                return Err(ErrorCode::InsufficientResources);
            }

            p.allocated.push(id);
            state.next_id += 1;
            self.shared.log(Call::Allocate(port));
            Ok(BufferHeader::new(port, id, size))
        })
    }

    fn free_buffer(&mut self, port: u32, id: BufferId) -> Result<(), ErrorCode> {
        self.shared.update(|state| {
            let going_loaded = state.pending_state == Some(ComponentState::Loaded)
                || state.state == ComponentState::Loaded;
            let p = state.port(port)?;

            if !going_loaded && p.enabled && !p.disable_pending {
                return Err(self.shared.violation(format!("free on enabled port {port}")));
            }
            if let Some(pos) = p.held.iter().position(|header| header.id == id) {
                p.held.remove(pos);
                let _ = self.shared.violation(format!("freed buffer {id} owned by the component"));
            }
            let Some(pos) = p.allocated.iter().position(|allocated| *allocated == id) else {
                return Err(ErrorCode::BadParameter);
            };

            p.allocated.remove(pos);
            self.shared.log(Call::Free(port, id));
            Ok(())
        })
    }

    fn empty_this_buffer(&mut self, buffer: BufferHeader) -> Result<(), ErrorCode> {
        self.queue_buffer(IN_PORT, buffer)
    }

    fn fill_this_buffer(&mut self, buffer: BufferHeader) -> Result<(), ErrorCode> {
        self.queue_buffer(OUT_PORT, buffer)
    }
}

impl DummyComponent {
    fn queue_buffer(&self, port: u32, buffer: BufferHeader) -> Result<(), ErrorCode> {
        self.shared.update(|state| {
            let running = matches!(
                state.state,
                ComponentState::Idle | ComponentState::Executing | ComponentState::Pause
            );
            let id = buffer.id;
            let flags = buffer.flags;
            let p = state.port(port)?;

            if buffer.port != port || !p.allocated.contains(&id) {
                return Err(self.shared.violation(format!("unknown buffer {id} on port {port}")));
            }
            if !running || !p.accepts_buffers() {
                return Err(self.shared.violation(format!("buffer {id} queued on idle port")));
            }

            p.held.push_back(buffer);
            let call = if port == IN_PORT { Call::Empty(id, flags) } else { Call::Fill(id) };
            self.shared.log(call);
            Ok(())
        })
    }
}

/// Loader of dummy components. Every component it creates records its calls in the same log.
pub(crate) struct DummyLoader {
    options: DummyOptions,
    calls: Arc<Mutex<Vec<Call>>>,
    instances: Mutex<Vec<Weak<DummyShared>>>,
}

impl DummyLoader {
    pub(crate) fn new(options: DummyOptions) -> Self {
        Self { options, calls: Default::default(), instances: Default::default() }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of components loaded so far.
    pub(crate) fn num_loaded(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Stops or resumes the consumption of input buffers by the last loaded component.
    pub(crate) fn pause_input(&self, paused: bool) {
        let instances = self.instances.lock().unwrap();
        if let Some(shared) = instances.last().and_then(Weak::upgrade) {
            shared.update(|state| state.input_paused = paused);
        }
    }

    /// Makes the last loaded component report `error`.
    pub(crate) fn inject_error(&self, error: ErrorCode) {
        let instances = self.instances.lock().unwrap();
        if let Some(shared) = instances.last().and_then(Weak::upgrade) {
            shared.update(|state| state.outbox.push(ComponentEvent::Error(error as u32)));
        }
    }
}

impl ComponentLoader for DummyLoader {
    fn load(
        &self,
        config: &ComponentConfig,
        events: EventSink,
    ) -> Result<Box<dyn ComponentBackend>, ComponentError> {
        if config.component_name != COMPONENT_NAME {
            return Err(ComponentError::NotFound(config.component_name.clone()));
        }
        let role = match config.role.as_str() {
            VIDEO_ROLE => Role::Video,
            AUDIO_ROLE => Role::Audio,
            role => return Err(ComponentError::UnsupportedRole(role.into())),
        };

        let shared = Arc::new(DummyShared {
            state: Mutex::new(State::new(self.options.clone(), role)),
            cond: Condvar::new(),
            calls: self.calls.clone(),
        });
        self.instances.lock().unwrap().push(Arc::downgrade(&shared));

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("dummy-component".into())
            .spawn(move || run_worker(worker_shared, events))
            .map_err(anyhow::Error::from)?;

        Ok(Box::new(DummyComponent { shared, worker: Some(worker) }))
    }
}

pub(crate) fn video_config() -> ComponentConfig {
    ComponentConfig {
        core_name: "libdummy.so".into(),
        component_name: COMPONENT_NAME.into(),
        role: VIDEO_ROLE.into(),
        ..Default::default()
    }
}

pub(crate) fn audio_config() -> ComponentConfig {
    ComponentConfig { role: AUDIO_ROLE.into(), ..video_config() }
}

/// Opens a dummy video component and brings it to the executing state, with all the output
/// buffers handed to it.
pub(crate) fn executing_component(options: DummyOptions) -> (Component, Port, Port, DummyLoader) {
    const TIMEOUT: Duration = Duration::from_secs(5);

    let loader = DummyLoader::new(options);
    let component = Component::open(&loader, &video_config()).unwrap();
    let in_port = component.add_port(IN_PORT).unwrap();
    let out_port = component.add_port(OUT_PORT).unwrap();

    component.request_state(ComponentState::Idle).unwrap();
    in_port.allocate_buffers().unwrap();
    out_port.allocate_buffers().unwrap();
    component.await_state(ComponentState::Idle, TIMEOUT).unwrap();
    component.request_state(ComponentState::Executing).unwrap();
    component.await_state(ComponentState::Executing, TIMEOUT).unwrap();
    out_port.populate().unwrap();

    (component, in_port, out_port, loader)
}
