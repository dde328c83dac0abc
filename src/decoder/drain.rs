// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Draining: flushing out every frame held by the component through an end of stream buffer.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::warn;

use crate::component::buffer::BufferFlags;
use crate::component::port::AcquireOutcome;
use crate::decoder::DecoderShared;
use crate::decoder::FlowStatus;
use crate::decoder::LoopState;
use crate::decoder::StreamState;
use crate::decoder::DRAIN_TIMEOUT;
use crate::utils::clock_time_to_ticks;

/// Rendezvous between a draining thread and the decode loop.
#[derive(Debug, Default)]
pub(crate) struct DrainState {
    draining: Mutex<bool>,
    cond: Condvar,
}

impl DrainState {
    pub(crate) fn begin(&self) {
        *self.draining.lock().unwrap() = true;
    }

    /// Called by the decode loop when the end of stream comes out of the component. Returns
    /// whether a drain was waiting for it.
    pub(crate) fn complete(&self) -> bool {
        let mut draining = self.draining.lock().unwrap();
        let was_draining = *draining;
        *draining = false;
        self.cond.notify_all();
        was_draining
    }

    /// Releases any waiting drain, e.g. on flush or error.
    pub(crate) fn cancel(&self) {
        self.complete();
    }

    /// Blocks until the drain completes, or `timeout` elapses if given. Returns `false` on
    /// timeout, in which case the drain is abandoned.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut draining = self.draining.lock().unwrap();

        while *draining {
            match deadline {
                None => draining = self.cond.wait(draining).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *draining = false;
                        return false;
                    }
                    draining = self.cond.wait_timeout(draining, deadline - now).unwrap().0;
                }
            }
        }

        true
    }
}

/// Sends an end of stream to the component and waits until the decode loop has output every frame
/// before it. The stream lock is released during the wait and returned re-acquired.
///
/// `is_eos` marks the end of the stream, after which further frames are refused.
pub(crate) fn drain<'a>(
    shared: &'a DecoderShared,
    mut state: MutexGuard<'a, StreamState>,
    is_eos: bool,
) -> (MutexGuard<'a, StreamState>, FlowStatus) {
    debug!("Draining component");

    if !state.started {
        debug!("Component not started yet");
        return (state, FlowStatus::Ok);
    }
    state.started = false;

    if state.eos {
        debug!("Component is already EOS");
        return (state, FlowStatus::Ok);
    }
    if is_eos {
        state.eos = true;
    }

    let Some(session) = state.session.clone() else {
        return (state, FlowStatus::Ok);
    };
    let loop_running = state.loop_state != LoopState::Stopped;
    let hacks = session.component.hacks();
    let timeout = hacks.drain_may_not_return.then_some(DRAIN_TIMEOUT);

    if hacks.no_empty_eos_buffer {
        warn!("Component does not support empty EOS buffers");
        if !loop_running {
            return (state, FlowStatus::Ok);
        }

        // Nothing can make the component return an end of stream, so have the loop stop once it
        // runs out of output buffers.
        shared.drain.begin();
        state.loop_state = LoopState::Draining;
        session.out_port.signal_eos();
        drop(state);

        if !shared.drain.wait(timeout) {
            warn!("Drain timed out");
        }
        let mut state = shared.lock();
        state.started = false;
        return (state, FlowStatus::Ok);
    }

    // Input buffers are acquired without the stream lock, as this may block until the component
    // is done with one.
    drop(state);
    let mut slot = match session.in_port.acquire_buffer() {
        AcquireOutcome::Buffer(slot) => slot,
        AcquireOutcome::Flushing => {
            debug!("Flushing");
            return (shared.lock(), FlowStatus::Flushing);
        }
        other => {
            error!("Failed to acquire buffer for draining: {:?}", other);
            return (shared.lock(), FlowStatus::Error);
        }
    };

    let mut state = shared.lock();
    if loop_running {
        state.loop_state = LoopState::Draining;
    }
    shared.drain.begin();

    slot.reset();
    slot.timestamp = clock_time_to_ticks(state.last_upstream_ts);
    slot.flags.insert(BufferFlags::EOS);
    drop(state);

    if let Err(e) = session.in_port.release_buffer(slot) {
        error!("Failed to drain component: {}", e);
        shared.drain.cancel();
        return (shared.lock(), FlowStatus::Error);
    }

    debug!("Waiting until component is drained");
    if !shared.drain.wait(timeout) {
        warn!("Drain timed out");
    } else {
        debug!("Drained component");
    }

    let mut state = shared.lock();
    state.started = false;
    (state, FlowStatus::Ok)
}
