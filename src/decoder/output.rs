// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode loop: pulls decoded buffers from the output port and pushes them downstream.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use log::error;
use log::warn;

use crate::component::buffer::BufferFlags;
use crate::component::buffer::Slot;
use crate::component::params::ColorFormat;
use crate::component::port::AcquireOutcome;
use crate::decoder::audio_info;
use crate::decoder::disable_port;
use crate::decoder::enable_port;
use crate::decoder::pending::PendingFrame;
use crate::decoder::DecodedBuffer;
use crate::decoder::DecoderError;
use crate::decoder::DecoderShared;
use crate::decoder::FlowStatus;
use crate::decoder::InputMedia;
use crate::decoder::LoopState;
use crate::decoder::MediaKind;
use crate::decoder::OutputFormat;
use crate::decoder::OutputInfo;
use crate::decoder::Session;
use crate::decoder::StreamState;
use crate::decoder::VideoInfo;
use crate::utils::scale;
use crate::utils::ticks_to_clock_time;
use crate::utils::SECOND;
use crate::DecodedFormat;
use crate::Resolution;

/// Body of the decode loop thread. Returns when the output port is flushed, at the end of the
/// stream, or on error.
pub(crate) fn run(shared: Arc<DecoderShared>, session: Session) {
    debug!("Decode loop started");
    while iterate(&shared, &session).is_continue() {}

    shared.lock().loop_state = LoopState::Stopped;
    debug!("Decode loop stopped");
}

/// Reads the output format from the output port.
fn output_info(
    shared: &DecoderShared,
    state: &StreamState,
    session: &Session,
) -> Result<OutputInfo, DecoderError> {
    match shared.media {
        MediaKind::Audio => {
            Ok(OutputInfo::Audio(audio_info(&session.component, &session.out_port)?))
        }
        MediaKind::Video => {
            let definition = session
                .out_port
                .definition()
                .ok_or_else(|| DecoderError::NotNegotiated("no output port definition".into()))?;
            let video = definition
                .video()
                .ok_or_else(|| DecoderError::NotNegotiated("output port is not video".into()))?;

            let format = match video.color_format {
                ColorFormat::YUV420Planar | ColorFormat::YUV420PackedPlanar => DecodedFormat::I420,
                ColorFormat::YUV420SemiPlanar | ColorFormat::YUV420PackedSemiPlanar => {
                    DecodedFormat::NV12
                }
                format => {
                    return Err(DecoderError::NotNegotiated(format!(
                        "unsupported color format {:?}",
                        format
                    )))
                }
            };

            let (framerate, par) = match state.input_format.as_ref().map(|format| &format.media) {
                Some(InputMedia::Video { framerate, par, .. }) => (*framerate, *par),
                _ => ((0, 1), (1, 1)),
            };
            let par =
                if session.component.hacks().default_pixel_aspect_ratio { (1, 1) } else { par };

            Ok(OutputInfo::Video(VideoInfo {
                format,
                size: Resolution::from((video.frame_width, video.frame_height)),
                framerate,
                par,
            }))
        }
    }
}

/// Negotiates the output format with downstream, keeping any codec data seen so far.
fn negotiate(
    shared: &DecoderShared,
    state: &mut StreamState,
    session: &Session,
) -> Result<(), DecoderError> {
    let info = output_info(shared, state, session)?;
    let codec_data = state.output_format.take().and_then(|format| format.codec_data);
    let format = OutputFormat { info, codec_data };
    debug!("Negotiating output format {:?}", format);

    if !shared.downstream.set_output_format(&format) {
        return Err(DecoderError::NotNegotiated("output format refused by downstream".into()));
    }
    state.output_format = Some(format);

    Ok(())
}

/// Reallocates the output port with its new settings and renegotiates.
fn reconfigure_output(shared: &DecoderShared, session: &Session) -> Result<(), DecoderError> {
    let out_port = &session.out_port;
    let reconfigure_error = |source| DecoderError::Reconfigure { port: out_port.index(), source };

    debug!("Output port settings changed, reconfiguring");
    shared.lock().loop_state = LoopState::Reconfiguring;

    disable_port(out_port).map_err(reconfigure_error)?;
    out_port.update_port_definition(None).map_err(reconfigure_error)?;
    {
        let mut state = shared.lock();
        negotiate(shared, &mut state, session)?;
    }
    enable_port(out_port).map_err(reconfigure_error)?;

    let mut state = shared.lock();
    if state.loop_state == LoopState::Reconfiguring {
        state.loop_state = LoopState::Running;
    }

    Ok(())
}

fn release(session: &Session, slot: Slot) -> Result<(), DecoderError> {
    session.out_port.release_buffer(slot).map_err(DecoderError::Release)
}

fn drop_frames(shared: &DecoderShared, frames: Vec<PendingFrame>, why: &str) {
    for frame in frames {
        debug!("Dropping {} frame {} ({:?})", why, frame.number, frame.pts);
        shared.downstream.frame_dropped(frame.pts);
    }
}

/// Turns `slot` into a buffer for downstream and pushes it. The slot is consumed in all cases.
fn push_video(
    shared: &DecoderShared,
    state: &mut StreamState,
    session: &Session,
    slot: Slot,
) -> Result<FlowStatus, DecoderError> {
    let ticks = slot.timestamp;
    let frame = state.pending.take_nearest(ticks);

    if let Some(frame) = &frame {
        if !shared.config.no_reorder {
            if let Some(pts) = frame.pts {
                let older = state.pending.take_older_than(pts);
                drop_frames(shared, older, "skipped");
            }
            let lost = state.pending.take_lost(frame);
            drop_frames(shared, lost, "lost");
        }
    }

    let pts = frame.as_ref().and_then(|frame| frame.pts).or(Some(ticks_to_clock_time(ticks)));
    let duration = match frame.as_ref().and_then(|frame| frame.duration) {
        Some(duration) => Some(duration),
        None if slot.tick_count != 0 => Some(ticks_to_clock_time(slot.tick_count)),
        None => None,
    };

    if slot.filled_len == 0 {
        // The component consumed the frame without outputting it.
        if frame.is_some() {
            debug!("Dropping empty output buffer for {:?}", pts);
            shared.downstream.frame_dropped(pts);
        }
        release(session, slot)?;
        return Ok(FlowStatus::Ok);
    }

    let Some(frame) = frame else {
        error!("No input frame matches output buffer with timestamp {}", ticks);
        return push(shared, state, session, slot, pts, duration, None);
    };

    if shared.downstream.max_decode_time(pts) < 0 {
        debug!("Frame {} is too late, dropping", frame.number);
        shared.downstream.frame_dropped(pts);
        release(session, slot)?;
        return Ok(FlowStatus::Ok);
    }
    if shared.downstream.playback_rate() < 0.0 && !frame.sync_point {
        debug!("Dropping non sync frame {} during reverse playback", frame.number);
        shared.downstream.frame_dropped(pts);
        release(session, slot)?;
        return Ok(FlowStatus::Ok);
    }

    push(shared, state, session, slot, pts, duration, Some(frame.number))
}

fn push_audio(
    shared: &DecoderShared,
    state: &mut StreamState,
    session: &Session,
    slot: Slot,
) -> Result<FlowStatus, DecoderError> {
    if slot.filled_len == 0 {
        release(session, slot)?;
        return Ok(FlowStatus::Ok);
    }

    let pts = Some(ticks_to_clock_time(slot.timestamp));
    let duration = match state.output_format.as_ref().map(|format| &format.info) {
        Some(OutputInfo::Audio(info)) if info.rate > 0 && info.bytes_per_frame() > 0 => {
            let samples = (slot.filled_len / info.bytes_per_frame()) as u64;
            Some(scale(samples, SECOND, info.rate as u64))
        }
        _ => None,
    };

    push(shared, state, session, slot, pts, duration, None)
}

fn push(
    shared: &DecoderShared,
    state: &mut StreamState,
    session: &Session,
    slot: Slot,
    pts: Option<u64>,
    duration: Option<u64>,
    frame: Option<u64>,
) -> Result<FlowStatus, DecoderError> {
    let Some(format) = state.output_format.as_ref() else {
        release(session, slot)?;
        return Err(DecoderError::NotNegotiated("no output format".into()));
    };

    let backed = match shared.backing.take(slot, &session.out_port, &format.info) {
        Ok(backed) => backed,
        Err((e, slot)) => {
            if let Err(release_err) = release(session, slot) {
                warn!("{}", release_err);
            }
            return Err(e.into());
        }
    };
    if let Some(slot) = backed.slot {
        release(session, slot)?;
    }

    Ok(shared.downstream.push(DecodedBuffer {
        memory: backed.memory,
        layout: backed.layout,
        pts,
        duration,
        frame,
    }))
}

/// Processes one output buffer, or one port event.
fn iterate(shared: &DecoderShared, session: &Session) -> ControlFlow<()> {
    let mut slot = match session.out_port.acquire_buffer() {
        AcquireOutcome::Buffer(slot) => slot,
        AcquireOutcome::ComponentError(code) => {
            let mut state = shared.lock();
            shared.post_error(&mut state, DecoderError::ComponentFailed(code), FlowStatus::Error);
            return ControlFlow::Break(());
        }
        AcquireOutcome::Flushing => {
            debug!("Flushing");
            let mut state = shared.lock();
            state.flow = FlowStatus::Flushing;
            state.started = false;
            shared.drain.cancel();
            return ControlFlow::Break(());
        }
        AcquireOutcome::EndOfStream => {
            let mut state = shared.lock();
            // Nothing left in the component.
            state.started = false;
            if shared.drain.complete() {
                debug!("Drained");
                state.flow = FlowStatus::Ok;
            } else {
                debug!("Component signalled EOS");
                state.flow = FlowStatus::Eos;
                state.eos = true;
                shared.downstream.end_of_stream();
            }
            return ControlFlow::Break(());
        }
        AcquireOutcome::Reconfigure => {
            return match reconfigure_output(shared, session) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    let flow = match e {
                        DecoderError::NotNegotiated(_) => FlowStatus::NotNegotiated,
                        _ => FlowStatus::Error,
                    };
                    let mut state = shared.lock();
                    shared.post_error(&mut state, e, flow);
                    ControlFlow::Break(())
                }
            };
        }
    };

    let mut state = shared.lock();

    if state.output_format.is_none() && !slot.flags.contains(BufferFlags::EOS) {
        if let Err(e) = negotiate(shared, &mut state, session) {
            if let Err(release_err) = release(session, slot) {
                debug!("{}", release_err);
            }
            shared.post_error(&mut state, e, FlowStatus::NotNegotiated);
            return ControlFlow::Break(());
        }
    }

    if session.out_port.is_flushing() {
        debug!("Flushing");
        if let Err(e) = release(session, slot) {
            debug!("{}", e);
        }
        state.flow = FlowStatus::Flushing;
        state.started = false;
        shared.drain.cancel();
        return ControlFlow::Break(());
    }

    let res = if slot.flags.contains(BufferFlags::EOS) && slot.filled_len == 0 {
        // The end of stream itself is reported by the next acquire.
        release(session, slot).map(|()| FlowStatus::Ok)
    } else if slot.flags.contains(BufferFlags::CODECCONFIG) && slot.filled_len > 0 {
        debug!("Component produced codec data");
        let codec_data = Bytes::copy_from_slice(slot.payload());
        slot.filled_len = 0;
        let res = release(session, slot);
        if let Some(format) = state.output_format.as_mut() {
            format.codec_data = Some(codec_data);
            let format = format.clone();
            if !shared.downstream.set_output_format(&format) {
                warn!("Downstream refused output codec data");
            }
        }
        res.map(|()| FlowStatus::Ok)
    } else {
        match shared.media {
            MediaKind::Video => push_video(shared, &mut state, session, slot),
            MediaKind::Audio => push_audio(shared, &mut state, session, slot),
        }
    };

    let flow = match res {
        Ok(flow) => flow,
        Err(e) => {
            let flow = match e {
                DecoderError::InvalidBuffer(_) | DecoderError::NotNegotiated(_) => {
                    FlowStatus::NotNegotiated
                }
                _ => FlowStatus::Error,
            };
            shared.post_error(&mut state, e, flow);
            return ControlFlow::Break(());
        }
    };

    if state.flow.is_fatal() {
        return ControlFlow::Break(());
    }
    state.flow = flow;

    match flow {
        FlowStatus::Ok => ControlFlow::Continue(()),
        FlowStatus::Eos => {
            debug!("Downstream is EOS");
            state.started = false;
            state.eos = true;
            shared.downstream.end_of_stream();
            ControlFlow::Break(())
        }
        FlowStatus::Flushing => {
            debug!("Downstream is flushing");
            state.started = false;
            ControlFlow::Break(())
        }
        flow => {
            let err = DecoderError::Other(anyhow::anyhow!("downstream returned {:?}", flow));
            shared.post_error(&mut state, err, flow);
            ControlFlow::Break(())
        }
    }
}
