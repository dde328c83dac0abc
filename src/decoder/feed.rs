// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::MutexGuard;

use log::debug;
use log::error;
use log::warn;

use crate::component::buffer::BufferFlags;
use crate::component::port::AcquireOutcome;
use crate::component::port::Port;
use crate::decoder::disable_port;
use crate::decoder::enable_port;
use crate::decoder::DecoderError;
use crate::decoder::DecoderShared;
use crate::decoder::EncodedFrame;
use crate::decoder::FlowStatus;
use crate::decoder::MediaKind;
use crate::decoder::StreamState;
use crate::utils::clock_time_to_ticks;
use crate::utils::default_frame_duration;
use crate::utils::scale;

/// Reallocates the input port after the component changed its settings.
fn reconfigure_input(port: &Port) -> Result<(), DecoderError> {
    debug!("Reconfiguring input port {}", port.index());
    disable_port(port)
        .and_then(|()| enable_port(port))
        .map_err(|source| DecoderError::Reconfigure { port: port.index(), source })
}

/// Forgets frame `number` if none of it reached the component, as no output can match it.
fn forget_unsubmitted(state: &mut StreamState, number: Option<u64>) {
    let Some(number) = number else {
        return;
    };
    if state.pending.get_mut(number).is_some_and(|frame| frame.ticks.is_none()) {
        state.pending.remove(number);
    }
}

/// Splits `frame` into input buffers and submits them to the component.
///
/// Blocks while no input buffer is available, with the stream lock released. The returned guard
/// is re-acquired.
pub(crate) fn handle_frame<'a>(
    shared: &'a DecoderShared,
    mut state: MutexGuard<'a, StreamState>,
    mut frame: EncodedFrame,
) -> (MutexGuard<'a, StreamState>, FlowStatus) {
    if state.eos {
        warn!("Got frame after EOS");
        return (state, FlowStatus::Eos);
    }
    if state.flow != FlowStatus::Ok {
        let flow = state.flow;
        return (state, flow);
    }

    let Some(session) = state.session.clone() else {
        return (state, FlowStatus::NotNegotiated);
    };
    if state.input_format.is_none() {
        error!("Input format not set");
        return (state, FlowStatus::NotNegotiated);
    }

    if !state.started && !frame.sync_point && !frame.header {
        debug!("Skipping frame until the next sync point");
        shared.downstream.frame_dropped(frame.pts);
        return (state, FlowStatus::Ok);
    }

    if frame.pts.is_none() {
        frame.pts = frame.dts;
    }

    match state.hooks.prepare_frame(&mut frame) {
        FlowStatus::Ok => (),
        flow => return (state, flow),
    }

    let size = frame.data.len();
    if size == 0 {
        debug!("Ignoring empty frame");
        return (state, FlowStatus::Ok);
    }

    let media = shared.media;
    let pending = match media {
        MediaKind::Video if !frame.header => {
            Some(state.pending.push(frame.pts, frame.duration, frame.sync_point))
        }
        _ => None,
    };

    let mut offset = 0;
    while offset < size {
        // Acquiring may block until the component returns a buffer.
        drop(state);
        let outcome = session.in_port.acquire_buffer();

        let mut slot = match outcome {
            AcquireOutcome::Buffer(slot) => {
                state = shared.lock();
                slot
            }
            AcquireOutcome::Reconfigure => {
                let res = reconfigure_input(&session.in_port);
                state = shared.lock();
                if let Err(e) = res {
                    forget_unsubmitted(&mut state, pending);
                    shared.post_error(&mut state, e, FlowStatus::Error);
                    return (state, FlowStatus::Error);
                }
                continue;
            }
            AcquireOutcome::Flushing => {
                debug!("Flushing");
                state = shared.lock();
                if let Some(number) = pending {
                    state.pending.remove(number);
                }
                return (state, FlowStatus::Flushing);
            }
            AcquireOutcome::ComponentError(code) => {
                state = shared.lock();
                forget_unsubmitted(&mut state, pending);
                let err = DecoderError::ComponentFailed(code);
                shared.post_error(&mut state, err, FlowStatus::Error);
                return (state, FlowStatus::Error);
            }
            AcquireOutcome::EndOfStream => {
                state = shared.lock();
                forget_unsubmitted(&mut state, pending);
                error!("Input port reported an end of stream");
                shared.post_error(
                    &mut state,
                    DecoderError::Other(anyhow::anyhow!("unexpected end of stream on input port")),
                    FlowStatus::Error,
                );
                return (state, FlowStatus::Error);
            }
        };

        // Input buffers come back as the component left them.
        slot.reset();

        if slot.free_space() == 0 {
            let id = slot.id;
            if let Err(e) = session.in_port.release_buffer(slot) {
                warn!("Failed to return input buffer {}: {}", id, e);
            }
            forget_unsubmitted(&mut state, pending);
            shared.post_error(&mut state, DecoderError::NoFreeSpace(id), FlowStatus::Error);
            return (state, FlowStatus::Error);
        }

        if state.flow != FlowStatus::Ok {
            let flow = state.flow;
            if let Err(e) = session.in_port.release_buffer(slot) {
                debug!("Failed to return input buffer: {}", e);
            }
            forget_unsubmitted(&mut state, pending);
            return (state, flow);
        }

        if let Some(codec_data) = state.codec_data.clone() {
            let max = slot.free_space();
            if codec_data.len() > max {
                let id = slot.id;
                if let Err(e) = session.in_port.release_buffer(slot) {
                    warn!("Failed to return input buffer {}: {}", id, e);
                }
                forget_unsubmitted(&mut state, pending);
                shared.post_error(
                    &mut state,
                    DecoderError::CodecDataTooLarge { size: codec_data.len(), max },
                    FlowStatus::Error,
                );
                return (state, FlowStatus::Error);
            }

            debug!("Passing codec data to the component");
            slot.append(&codec_data);
            slot.flags.insert(BufferFlags::CODECCONFIG | BufferFlags::ENDOFFRAME);
            slot.timestamp = frame.pts.map(clock_time_to_ticks).unwrap_or(0);
            state.codec_data = None;
            state.started = true;

            if let Err(e) = session.in_port.release_buffer(slot) {
                shared.post_error(&mut state, DecoderError::Release(e), FlowStatus::Error);
                return (state, FlowStatus::Error);
            }
            continue;
        }

        let consumed = state.hooks.copy_frame(&frame, offset, &mut slot);
        if consumed == 0 {
            let id = slot.id;
            if let Err(e) = session.in_port.release_buffer(slot) {
                warn!("Failed to return input buffer {}: {}", id, e);
            }
            forget_unsubmitted(&mut state, pending);
            shared.post_error(&mut state, DecoderError::NoFreeSpace(id), FlowStatus::Error);
            return (state, FlowStatus::Error);
        }

        let timestamp = match media {
            MediaKind::Video => {
                if let Some(pts) = frame.pts {
                    state.last_upstream_ts = pts;
                } else if offset == 0 {
                    let duration = frame.duration.unwrap_or_else(default_frame_duration);
                    state.last_upstream_ts += duration;
                    if let Some(number) = pending {
                        let last = state.last_upstream_ts;
                        if let Some(pending) = state.pending.get_mut(number) {
                            pending.pts = Some(last);
                        }
                    }
                }
                state.last_upstream_ts
            }
            MediaKind::Audio => {
                let timestamp = match frame.pts {
                    Some(pts) => pts,
                    None => state.last_upstream_ts,
                };
                state.last_upstream_ts = timestamp + frame.duration.unwrap_or(0);
                timestamp
            }
        };
        slot.timestamp = clock_time_to_ticks(timestamp);

        if let Some(duration) = frame.duration {
            slot.tick_count = clock_time_to_ticks(scale(consumed as u64, duration, size as u64));
        }

        if offset == 0 {
            if frame.sync_point {
                slot.flags.insert(BufferFlags::SYNCFRAME);
            }
            if let Some(number) = pending {
                let ticks = slot.timestamp;
                if let Some(pending) = state.pending.get_mut(number) {
                    pending.ticks = Some(ticks);
                }
            }
        }

        offset += consumed;
        if offset == size {
            slot.flags.insert(BufferFlags::ENDOFFRAME);
        }
        if frame.header {
            slot.flags.insert(BufferFlags::CODECCONFIG);
        }

        state.started = true;
        if let Err(e) = session.in_port.release_buffer(slot) {
            shared.post_error(&mut state, DecoderError::Release(e), FlowStatus::Error);
            return (state, FlowStatus::Error);
        }
    }

    let flow = state.flow;
    (state, flow)
}
