// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame-in, frame-out decoder driving a component.
//!
//! Two threads cooperate on a [`Decoder`]: the caller's thread feeds encoded frames through
//! [`Decoder::handle_frame`], and a decode loop owned by the decoder pulls decoded buffers from the
//! output port and pushes them to the [`Downstream`] collaborator. The state they share lives
//! behind a single stream lock, which is never held while blocking on the component.

mod drain;
mod feed;
mod output;
pub mod pending;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::buffer_pool::backing_for;
use crate::buffer_pool::BackingError;
use crate::buffer_pool::BufferBacking;
use crate::buffer_pool::OutputMemory;
use crate::component::buffer::BufferId;
use crate::component::buffer::Slot;
use crate::component::params::AudioCoding;
use crate::component::params::ChannelPosition;
use crate::component::params::ColorFormat;
use crate::component::params::Param;
use crate::component::params::ParamIndex;
use crate::component::port::Port;
use crate::component::port::PortError;
use crate::component::Component;
use crate::component::ComponentConfig;
use crate::component::ComponentError;
use crate::component::ComponentLoader;
use crate::component::ComponentState;
use crate::component::ErrorCode;
use crate::decoder::drain::DrainState;
use crate::decoder::pending::PendingFrames;
use crate::utils::framerate_to_q16;
use crate::utils::ClockTime;
use crate::DecodedFormat;
use crate::FrameLayout;
use crate::Resolution;

/// Timeout of the component state changes.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout of port flushes.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the buffers of a port being disabled to come back.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a port to be enabled.
pub const ENABLE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a port to be disabled.
pub const DISABLE_TIMEOUT: Duration = Duration::from_secs(1);
/// Drain wait for components that may never return the end of stream.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of pushing data through the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    Flushing,
    Eos,
    NotLinked,
    NotNegotiated,
    Error,
}

impl FlowStatus {
    /// Whether the status reports a failure that stops the stream for good.
    pub fn is_fatal(self) -> bool {
        matches!(self, FlowStatus::NotLinked | FlowStatus::NotNegotiated | FlowStatus::Error)
    }
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("component in error state: {0}")]
    ComponentFailed(ErrorCode),
    #[error("decoder is not open")]
    NotOpen,
    #[error("unable to reconfigure port {port}: {source}")]
    Reconfigure { port: u32, source: PortError },
    #[error("output format not negotiated: {0}")]
    NotNegotiated(String),
    #[error("codec data larger than supported by the input port ({size} > {max})")]
    CodecDataTooLarge { size: usize, max: usize },
    #[error("input buffer {0} has no free space")]
    NoFreeSpace(BufferId),
    #[error("invalid output buffer: {0}")]
    InvalidBuffer(#[from] BackingError),
    #[error("failed to release buffer to the component: {0}")]
    Release(#[source] PortError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// An encoded frame coming from upstream.
#[derive(Clone, Debug, Default)]
pub struct EncodedFrame {
    pub data: Bytes,
    /// Presentation timestamp, in nanoseconds.
    pub pts: Option<ClockTime>,
    /// Decoding timestamp, in nanoseconds.
    pub dts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub sync_point: bool,
    /// The frame only carries stream headers.
    pub header: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputMedia {
    Video {
        width: u32,
        height: u32,
        /// Frame rate as a fraction. A null numerator means variable.
        framerate: (u32, u32),
        /// Pixel aspect ratio as a fraction.
        par: (u32, u32),
    },
    Audio {
        /// Sample rate, 0 if unknown.
        rate: u32,
        /// Channel count, 0 if unknown.
        channels: u32,
        /// MPEG version of the stream, 0 if unknown.
        mpeg_version: u32,
    },
}

/// Format of the encoded stream, as announced by upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFormat {
    pub media: InputMedia,
    /// Out-of-band codec configuration, sent to the component before the first frame.
    pub codec_data: Option<Bytes>,
    /// Framing of the stream, e.g. "adts" or "raw".
    pub stream_format: Option<String>,
}

impl InputFormat {
    pub fn video(width: u32, height: u32) -> Self {
        Self {
            media: InputMedia::Video { width, height, framerate: (0, 1), par: (1, 1) },
            codec_data: None,
            stream_format: None,
        }
    }

    pub fn audio(rate: u32, channels: u32) -> Self {
        Self {
            media: InputMedia::Audio { rate, channels, mpeg_version: 0 },
            codec_data: None,
            stream_format: None,
        }
    }
}

/// Negotiated video output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: DecodedFormat,
    pub size: Resolution,
    pub framerate: (u32, u32),
    pub par: (u32, u32),
}

/// Negotiated audio output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioInfo {
    pub channels: u32,
    pub rate: u32,
    pub bits_per_sample: u32,
    pub signed: bool,
    pub little_endian: bool,
    pub interleaved: bool,
    pub positions: Vec<ChannelPosition>,
}

impl AudioInfo {
    /// Size of one sample for all channels, in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputInfo {
    Video(VideoInfo),
    Audio(AudioInfo),
}

/// Output format handed to downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub info: OutputInfo,
    /// Codec configuration produced by the component, if any.
    pub codec_data: Option<Bytes>,
}

/// A decoded buffer.
#[derive(Clone, Debug)]
pub struct DecodedBuffer {
    pub memory: OutputMemory,
    /// Layout of the picture in `memory`, for video.
    pub layout: Option<FrameLayout>,
    pub pts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    /// Number of the input frame this buffer was decoded from, if it could be matched.
    pub frame: Option<u64>,
}

/// Consumer of the decoded data.
///
/// Calls are made from the decode loop and from the caller's thread, with the stream lock held:
/// implementations must not call back into the decoder.
pub trait Downstream: Send + Sync {
    /// Raw formats accepted, by order of preference.
    fn accepted_formats(&self) -> Vec<DecodedFormat> {
        vec![DecodedFormat::I420, DecodedFormat::NV12]
    }

    /// Sets the format of the following buffers. Returns `false` if the format is refused.
    fn set_output_format(&self, format: &OutputFormat) -> bool;

    fn push(&self, buffer: DecodedBuffer) -> FlowStatus;

    fn end_of_stream(&self);

    /// Reports a failure that stopped the stream.
    fn error(&self, error: &DecoderError);

    /// Reports that the frame with timestamp `pts` will not be output.
    fn frame_dropped(&self, _pts: Option<ClockTime>) {}

    /// Time left before the frame with timestamp `pts` is late, in nanoseconds. Negative values
    /// mean the frame is already late and should be dropped.
    fn max_decode_time(&self, _pts: Option<ClockTime>) -> i64 {
        i64::MAX
    }

    fn playback_rate(&self) -> f64 {
        1.0
    }
}

/// Codec specific hooks run by the decoder.
pub trait CodecHooks: Send {
    fn media_kind(&self) -> MediaKind;

    /// Whether switching from `old` to `new` requires reconfiguring the component, on top of the
    /// generic checks.
    fn is_format_change(&self, _old: &InputFormat, _new: &InputFormat) -> bool {
        false
    }

    /// Configures the component for `format`. The input port is not populated when this is
    /// called.
    fn set_format(
        &mut self,
        _component: &Component,
        _in_port: &Port,
        _format: &InputFormat,
    ) -> Result<(), DecoderError> {
        Ok(())
    }

    /// Adapts `frame` before it is submitted.
    fn prepare_frame(&mut self, _frame: &mut EncodedFrame) -> FlowStatus {
        FlowStatus::Ok
    }

    /// Copies as much of `frame` after `offset` as fits into `slot`, and returns the number of
    /// bytes consumed.
    fn copy_frame(&mut self, frame: &EncodedFrame, offset: usize, slot: &mut Slot) -> usize {
        slot.append(&frame.data[offset..])
    }
}

#[derive(Clone, Debug, Default)]
pub struct DecoderConfig {
    pub component: ComponentConfig,
    /// Lend the output buffers of the component to downstream instead of copying them.
    pub no_copy: bool,
    /// The component does not output pictures in presentation order, so never drop frames that
    /// seem to have been skipped.
    pub no_reorder: bool,
}

/// State of the decode loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Reconfiguring,
    Draining,
}

/// A loaded component and its ports.
#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) component: Component,
    pub(crate) in_port: Port,
    pub(crate) out_port: Port,
}

/// State shared by the feeding thread and the decode loop, protected by the stream lock.
pub(crate) struct StreamState {
    pub(crate) hooks: Box<dyn CodecHooks>,
    pub(crate) session: Option<Session>,
    pub(crate) input_format: Option<InputFormat>,
    /// Format last accepted by downstream.
    pub(crate) output_format: Option<OutputFormat>,
    /// Codec data still to be sent to the component.
    pub(crate) codec_data: Option<Bytes>,
    /// Whether data has been submitted since the last drain.
    pub(crate) started: bool,
    pub(crate) eos: bool,
    pub(crate) flow: FlowStatus,
    pub(crate) last_upstream_ts: ClockTime,
    pub(crate) pending: PendingFrames,
    pub(crate) loop_state: LoopState,
}

pub(crate) struct DecoderShared {
    pub(crate) config: DecoderConfig,
    pub(crate) media: MediaKind,
    pub(crate) downstream: Arc<dyn Downstream>,
    pub(crate) backing: Box<dyn BufferBacking>,
    pub(crate) drain: DrainState,
    stream: Mutex<StreamState>,
}

impl DecoderShared {
    /// Takes the stream lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.stream.lock().unwrap()
    }

    /// Reports a fatal error: downstream is told about it and gets the end of the stream, and
    /// `flow` is latched so that the following calls fail right away.
    pub(crate) fn post_error(&self, state: &mut StreamState, err: DecoderError, flow: FlowStatus) {
        state.started = false;
        if state.flow.is_fatal() {
            debug!("Already failed, dropping error: {}", err);
            return;
        }

        error!("{}", err);
        state.flow = flow;
        self.downstream.error(&err);
        self.downstream.end_of_stream();
        self.drain.cancel();
    }
}

/// Disables `port` and frees its buffers. Does nothing if the port is already disabled.
pub(crate) fn disable_port(port: &Port) -> Result<(), PortError> {
    if !port.is_enabled() {
        return Ok(());
    }

    port.set_enabled(false)?;
    port.wait_buffers_released(RELEASE_TIMEOUT)?;
    port.deallocate_buffers()?;
    wait_enabled(port, DISABLE_TIMEOUT)
}

/// Enables `port` with freshly allocated buffers and acknowledges any pending settings change.
/// Output buffers are handed to the component, unless the port is flushing.
pub(crate) fn enable_port(port: &Port) -> Result<(), PortError> {
    port.set_enabled(true)?;
    port.allocate_buffers()?;
    wait_enabled(port, ENABLE_TIMEOUT)?;
    port.populate()?;
    port.mark_reconfigured();

    Ok(())
}

/// Waits for an enable or disable command. A component slow to confirm is not an error.
fn wait_enabled(port: &Port, timeout: Duration) -> Result<(), PortError> {
    match port.wait_enabled(timeout) {
        Err(PortError::Timeout(_)) => {
            warn!("Port {} did not confirm its new state in {:?}", port.index(), timeout);
            Ok(())
        }
        res => res,
    }
}

/// Loads the component described by `config` and sets up its ports.
fn open_session(
    loader: &dyn ComponentLoader,
    config: &ComponentConfig,
    media: MediaKind,
) -> Result<Session, DecoderError> {
    let component = Component::open(loader, config)?;

    let (in_index, out_index) = match (config.in_port_index, config.out_port_index) {
        (Some(in_index), Some(out_index)) => (in_index, out_index),
        (in_index, out_index) => {
            let init = match media {
                MediaKind::Video => ParamIndex::VideoInit,
                MediaKind::Audio => ParamIndex::AudioInit,
            };
            match component.get_parameter(init, 0) {
                Ok(Param::PortInit(init)) if init.num_ports >= 2 => (
                    in_index.unwrap_or(init.start_port),
                    out_index.unwrap_or(init.start_port + 1),
                ),
                res => {
                    warn!("Couldn't get port information ({:?}), using ports 0 and 1", res.err());
                    (in_index.unwrap_or(0), out_index.unwrap_or(1))
                }
            }
        }
    };

    let in_port = component.add_port(in_index)?;
    let out_port = component.add_port(out_index)?;
    debug!("Opened {} with ports {} and {}", component.name(), in_index, out_index);

    Ok(Session { component, in_port, out_port })
}

/// Whether going from `old` to `new` requires reconfiguring the component.
fn is_format_change(hooks: &dyn CodecHooks, old: Option<&InputFormat>, new: &InputFormat) -> bool {
    let Some(old) = old else {
        return true;
    };

    let media_changed = match (&old.media, &new.media) {
        (
            InputMedia::Video { width, height, framerate, .. },
            InputMedia::Video { width: new_width, height: new_height, framerate: new_rate, .. },
        ) => {
            width != new_width
                || height != new_height
                || framerate_to_q16(framerate.0, framerate.1)
                    != framerate_to_q16(new_rate.0, new_rate.1)
        }
        (
            InputMedia::Audio { rate, channels, .. },
            InputMedia::Audio { rate: new_rate, channels: new_channels, .. },
        ) => rate != new_rate || channels != new_channels,
        _ => true,
    };

    media_changed || old.codec_data != new.codec_data || hooks.is_format_change(old, new)
}

/// Handle allowing to interrupt the decoder from another thread.
#[derive(Clone)]
pub struct FlushHandle {
    shared: Arc<DecoderShared>,
}

impl FlushHandle {
    /// Starts flushing: any call blocked on the component returns with `FlowStatus::Flushing`.
    /// `Decoder::flush` completes the flush.
    pub fn flush_start(&self) {
        let session = self.shared.lock().session.clone();
        let Some(session) = session else {
            return;
        };

        debug!("Flush start");
        for port in [&session.in_port, &session.out_port] {
            if let Err(e) = port.set_flushing(FLUSH_TIMEOUT, true) {
                warn!("Failed to flush port {}: {}", port.index(), e);
            }
        }
        self.shared.drain.cancel();
    }
}

/// A decoder backed by a component.
pub struct Decoder {
    shared: Arc<DecoderShared>,
    loader: Arc<dyn ComponentLoader>,
    task: Option<JoinHandle<()>>,
}

impl Decoder {
    /// Loads the component described by `config` and prepares it for decoding with `hooks`.
    /// Decoding starts once the input format is given with `set_format`.
    pub fn open(
        loader: Arc<dyn ComponentLoader>,
        config: DecoderConfig,
        hooks: Box<dyn CodecHooks>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, DecoderError> {
        let media = hooks.media_kind();
        let session = open_session(loader.as_ref(), &config.component, media)?;

        let state = StreamState {
            hooks,
            session: Some(session),
            input_format: None,
            output_format: None,
            codec_data: None,
            started: false,
            eos: false,
            flow: FlowStatus::Ok,
            last_upstream_ts: 0,
            pending: Default::default(),
            loop_state: LoopState::Stopped,
        };

        Ok(Self {
            shared: Arc::new(DecoderShared {
                backing: backing_for(config.no_copy),
                config,
                media,
                downstream,
                drain: DrainState::default(),
                stream: Mutex::new(state),
            }),
            loader,
            task: None,
        })
    }

    pub fn media_kind(&self) -> MediaKind {
        self.shared.media
    }

    /// Current flow status, as returned by the next `handle_frame`.
    pub fn flow_status(&self) -> FlowStatus {
        self.shared.lock().flow
    }

    pub fn loop_state(&self) -> LoopState {
        self.shared.lock().loop_state
    }

    pub fn is_eos(&self) -> bool {
        self.shared.lock().eos
    }

    /// Number of submitted frames not output yet.
    pub fn num_pending_frames(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn flush_handle(&self) -> FlushHandle {
        FlushHandle { shared: self.shared.clone() }
    }

    /// Resets the stream state before a new stream.
    pub fn start(&mut self) {
        let mut state = self.shared.lock();
        state.last_upstream_ts = 0;
        state.eos = false;
        state.started = false;
        state.flow = FlowStatus::Ok;
    }

    /// Sets the format of the input stream, reconfiguring the component if needed, and starts
    /// the decode loop.
    pub fn set_format(&mut self, format: InputFormat) -> Result<(), DecoderError> {
        let res = self.configure(format);
        if let Err(e) = &res {
            error!("Failed to set format: {}", e);
            self.shared.lock().flow = FlowStatus::NotNegotiated;
        }
        res
    }

    fn configure(&mut self, format: InputFormat) -> Result<(), DecoderError> {
        debug!("Setting new input format {:?}", format);

        let shared = self.shared.clone();
        let mut state = shared.lock();
        let session = state.session.clone().ok_or(DecoderError::NotOpen)?;
        let changed = is_format_change(state.hooks.as_ref(), state.input_format.as_ref(), &format);
        let needs_disable =
            session.component.get_state(Some(STATE_TIMEOUT)) != ComponentState::Loaded;

        if needs_disable && !changed {
            debug!("Already running and format unchanged");
            state.input_format = Some(format);
            return Ok(());
        }

        let mut reopened = false;
        if needs_disable {
            debug!("Need to disable and drain the component");
            let (guard, _) = drain::drain(&shared, state, false);
            drop(guard);

            session.out_port.set_flushing(FLUSH_TIMEOUT, true)?;
            self.stop_task();

            if shared.config.component.hacks.no_component_reconfigure {
                debug!("Reopening {} for the new format", session.component.name());
                let old = shared.lock().session.take();
                if let Some(old) = old {
                    old.component.close();
                }
                let session =
                    open_session(self.loader.as_ref(), &shared.config.component, shared.media)?;
                shared.lock().session = Some(session);
                reopened = true;
            } else {
                for port in [&session.in_port, &session.out_port] {
                    port.set_enabled(false)?;
                }
                for port in [&session.in_port, &session.out_port] {
                    port.wait_buffers_released(RELEASE_TIMEOUT)?;
                    port.deallocate_buffers()?;
                }
                for port in [&session.in_port, &session.out_port] {
                    wait_enabled(port, DISABLE_TIMEOUT)?;
                }
            }

            state = shared.lock();
        }

        let session = state.session.clone().ok_or(DecoderError::NotOpen)?;
        state.codec_data = format.codec_data.clone();
        state.input_format = Some(format.clone());
        state.output_format = None;

        self.configure_ports(&mut state, &session, &format)?;

        if needs_disable && !reopened {
            enable_port(&session.in_port)?;
            enable_port(&session.out_port)?;
            // A stopped decoder leaves the component idle.
            if session.component.get_state(Some(STATE_TIMEOUT)) == ComponentState::Idle {
                session.component.request_state(ComponentState::Executing)?;
                session.component.await_state(ComponentState::Executing, STATE_TIMEOUT)?;
            }
        } else {
            if shared.media == MediaKind::Video {
                self.hint_output_format(&session.out_port);
            }

            debug!("Enabling component");
            session.component.request_state(ComponentState::Idle)?;
            session.in_port.allocate_buffers()?;
            session.out_port.allocate_buffers()?;
            session.component.await_state(ComponentState::Idle, STATE_TIMEOUT)?;
            session.component.request_state(ComponentState::Executing)?;
            session.component.await_state(ComponentState::Executing, STATE_TIMEOUT)?;
        }

        session.in_port.set_flushing(FLUSH_TIMEOUT, false)?;
        session.out_port.set_flushing(FLUSH_TIMEOUT, false)?;
        session.out_port.populate()?;

        if let Some(code) = session.component.last_error() {
            return Err(DecoderError::ComponentFailed(code));
        }

        state.flow = FlowStatus::Ok;
        drop(state);

        self.start_task()
    }

    /// Pushes `format` into the port definitions and runs the codec hooks.
    fn configure_ports(
        &self,
        state: &mut StreamState,
        session: &Session,
        format: &InputFormat,
    ) -> Result<(), DecoderError> {
        let mut definition = session
            .in_port
            .definition()
            .ok_or(DecoderError::Port(PortError::Component(ErrorCode::BadPortIndex)))?;
        if let (InputMedia::Video { width, height, framerate, .. }, Some(video)) =
            (&format.media, definition.video_mut())
        {
            video.frame_width = *width;
            video.frame_height = *height;
            video.framerate_q16 = framerate_to_q16(framerate.0, framerate.1);
        }
        session.in_port.update_port_definition(Some(&definition))?;

        state.hooks.set_format(&session.component, &session.in_port, format)?;

        if self.shared.media == MediaKind::Audio {
            if let Some(mut definition) = session.out_port.definition() {
                if let Some(audio) = definition.audio_mut() {
                    audio.encoding = AudioCoding::Pcm;
                }
                session.out_port.update_port_definition(Some(&definition))?;
            }
        }
        session.out_port.update_port_definition(None)?;

        Ok(())
    }

    /// Picks the first raw format accepted by downstream that the component can output.
    fn hint_output_format(&self, out_port: &Port) {
        let Some(mut definition) = out_port.definition() else {
            return;
        };

        for format in self.shared.downstream.accepted_formats() {
            let Some(video) = definition.video_mut() else {
                return;
            };
            video.color_format = match format {
                DecodedFormat::I420 => ColorFormat::YUV420Planar,
                DecodedFormat::NV12 => ColorFormat::YUV420SemiPlanar,
            };

            match out_port.update_port_definition(Some(&definition)) {
                Ok(()) => {
                    debug!("Component will output {:?}", format);
                    return;
                }
                Err(e) => debug!("Component refused {:?}: {}", format, e),
            }
        }

        warn!("No raw format accepted by downstream is supported by the component");
    }

    /// Submits `frame` to the component, blocking while no input buffer is available.
    pub fn handle_frame(&self, frame: EncodedFrame) -> FlowStatus {
        let state = self.shared.lock();
        let (_state, flow) = feed::handle_frame(&self.shared, state, frame);
        flow
    }

    /// Signals the end of the stream. Returns once every decoded buffer has been pushed
    /// downstream, followed by the end of stream.
    pub fn finish(&self) -> FlowStatus {
        let state = self.shared.lock();
        let was_eos = state.eos;
        let (mut state, flow) = drain::drain(&self.shared, state, true);

        if !was_eos {
            state.eos = true;
            if !state.flow.is_fatal() {
                self.shared.downstream.end_of_stream();
            }
        }
        flow
    }

    /// Discards all the data in flight and gets ready for new data.
    pub fn flush(&mut self) -> Result<(), DecoderError> {
        let session = self.shared.lock().session.clone().ok_or(DecoderError::NotOpen)?;
        debug!("Flushing decoder");

        if session.component.get_state(Some(Duration::ZERO)) == ComponentState::Loaded {
            self.reset_stream();
            return Ok(());
        }

        session.in_port.set_flushing(FLUSH_TIMEOUT, true)?;
        session.out_port.set_flushing(FLUSH_TIMEOUT, true)?;
        self.shared.drain.cancel();

        // The loop takes the stream lock, so it must not be held here.
        self.stop_task();

        session.in_port.set_flushing(FLUSH_TIMEOUT, false)?;
        session.out_port.set_flushing(FLUSH_TIMEOUT, false)?;
        session.out_port.populate()?;

        self.reset_stream();
        if self.shared.lock().input_format.is_some() {
            self.start_task()?;
        }

        debug!("Flush finished");
        Ok(())
    }

    fn reset_stream(&self) {
        let mut state = self.shared.lock();
        state.last_upstream_ts = 0;
        state.eos = false;
        state.started = false;
        state.flow = FlowStatus::Ok;
        state.pending.clear();
    }

    /// Stops decoding, leaving the component idle.
    pub fn stop(&mut self) {
        debug!("Stopping decoder");
        let session = self.shared.lock().session.clone();

        if let Some(session) = &session {
            for port in [&session.in_port, &session.out_port] {
                if let Err(e) = port.set_flushing(FLUSH_TIMEOUT, true) {
                    warn!("Failed to flush port {}: {}", port.index(), e);
                }
            }
        }

        self.stop_task();

        if let Some(session) = &session {
            if session.component.get_state(Some(Duration::ZERO)) > ComponentState::Idle {
                if let Err(e) = session.component.request_state(ComponentState::Idle) {
                    warn!("Failed to request idle state: {}", e);
                }
            }
        }

        {
            let mut state = self.shared.lock();
            state.flow = FlowStatus::Flushing;
            state.started = false;
            state.eos = false;
            state.pending.clear();
            state.codec_data = None;
            state.input_format = None;
            state.output_format = None;
        }
        self.shared.drain.cancel();

        if let Some(session) = &session {
            session.component.get_state(Some(STATE_TIMEOUT));
        }
    }

    /// Stops decoding and unloads the component.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(session) = self.shared.lock().session.clone() else {
            return;
        };

        self.stop();
        self.shared.lock().session = None;
        session.component.close();
    }

    fn start_task(&mut self) -> Result<(), DecoderError> {
        self.stop_task();

        let session = {
            let mut state = self.shared.lock();
            let session = state.session.clone().ok_or(DecoderError::NotOpen)?;
            state.loop_state = LoopState::Running;
            session
        };

        let shared = self.shared.clone();
        let task = thread::Builder::new()
            .name("decode-loop".into())
            .spawn(move || output::run(shared, session))
            .map_err(anyhow::Error::from)?;
        self.task = Some(task);

        Ok(())
    }

    /// Waits for the decode loop to stop. The output port must be flushing, or the loop must have
    /// exited on its own.
    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                error!("Decode loop panicked");
            }
            self.shared.lock().loop_state = LoopState::Stopped;
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Derives the audio output format from the PCM parameters of the output port.
pub(crate) fn audio_info(
    component: &Component,
    out_port: &Port,
) -> Result<AudioInfo, DecoderError> {
    let pcm = match component.get_parameter(ParamIndex::AudioPcm, out_port.index())? {
        Param::AudioPcm(pcm) => pcm,
        _ => return Err(ComponentError::UnexpectedParam(ParamIndex::AudioPcm).into()),
    };

    Ok(AudioInfo {
        channels: pcm.channels,
        rate: pcm.sampling_rate,
        bits_per_sample: pcm.bits_per_sample,
        signed: pcm.signed,
        little_endian: pcm.little_endian,
        interleaved: pcm.interleaved,
        positions: pcm.channel_mapping.iter().take(pcm.channels as usize).copied().collect(),
    })
}
