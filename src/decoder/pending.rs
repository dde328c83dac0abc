// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frames submitted to the component and not output yet.
//!
//! Components may reorder and merge frames, so output buffers are matched back to their input
//! frame by timestamp.

use std::collections::VecDeque;

use crate::utils::ClockTime;
use crate::utils::TICKS_PER_SECOND;

/// Frames whose timestamp is further than this behind the matched frame are considered lost.
pub const MAX_FRAME_DIST_TICKS: u64 = 5 * TICKS_PER_SECOND;
/// Frames submitted more than this many frames before the matched frame are considered lost.
pub const MAX_FRAME_DIST_FRAMES: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFrame {
    /// Submission order of the frame.
    pub number: u64,
    pub pts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub sync_point: bool,
    /// Timestamp the frame was handed to the component with, in ticks. `None` until then.
    pub ticks: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PendingFrames {
    frames: VecDeque<PendingFrame>,
    next_number: u64,
}

impl PendingFrames {
    /// Registers a new frame and returns its number.
    pub fn push(
        &mut self,
        pts: Option<ClockTime>,
        duration: Option<ClockTime>,
        sync_point: bool,
    ) -> u64 {
        let number = self.next_number;
        self.next_number += 1;
        self.frames.push_back(PendingFrame { number, pts, duration, sync_point, ticks: None });
        number
    }

    pub fn get_mut(&mut self, number: u64) -> Option<&mut PendingFrame> {
        self.frames.iter_mut().find(|frame| frame.number == number)
    }

    pub fn remove(&mut self, number: u64) -> Option<PendingFrame> {
        let pos = self.frames.iter().position(|frame| frame.number == number)?;
        self.frames.remove(pos)
    }

    /// Takes the submitted frame whose timestamp is nearest to `ticks`. Ties go to the frame
    /// submitted first. Frames not handed to the component yet are ignored.
    pub fn take_nearest(&mut self, ticks: u64) -> Option<PendingFrame> {
        let mut best: Option<(usize, u64)> = None;

        for (pos, frame) in self.frames.iter().enumerate() {
            let Some(frame_ticks) = frame.ticks else {
                continue;
            };
            let diff = frame_ticks.abs_diff(ticks);

            if best.map_or(true, |(_, best_diff)| diff < best_diff) {
                best = Some((pos, diff));
                if diff == 0 {
                    break;
                }
            }
        }

        best.and_then(|(pos, _)| self.frames.remove(pos))
    }

    /// Takes the submitted frames that fell too far behind `matched`, either in time or in
    /// submission order. Only frames submitted before `matched` and not presented after it are
    /// considered.
    pub fn take_lost(&mut self, matched: &PendingFrame) -> Vec<PendingFrame> {
        let Some(matched_ticks) = matched.ticks else {
            return Vec::new();
        };

        let mut lost = Vec::new();
        let mut kept = VecDeque::with_capacity(self.frames.len());
        for frame in self.frames.drain(..) {
            let is_lost = match frame.ticks {
                Some(ticks) if frame.number < matched.number && ticks <= matched_ticks => {
                    let diff_ticks = if ticks == 0 || matched_ticks == 0 {
                        0
                    } else {
                        matched_ticks - ticks
                    };
                    diff_ticks > MAX_FRAME_DIST_TICKS
                        || matched.number - frame.number > MAX_FRAME_DIST_FRAMES
                }
                _ => false,
            };

            if is_lost {
                lost.push(frame);
            } else {
                kept.push_back(frame);
            }
        }
        self.frames = kept;

        lost
    }

    /// Takes the submitted frames presented before `time`. The component outputs in presentation
    /// order, so these will never be output.
    pub fn take_older_than(&mut self, time: ClockTime) -> Vec<PendingFrame> {
        let (older, kept): (Vec<_>, Vec<_>) = self.frames.drain(..).partition(|frame| {
            frame.ticks.is_some() && frame.pts.map_or(false, |pts| pts < time)
        });
        self.frames = kept.into();

        older
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
