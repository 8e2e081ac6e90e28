//! Frame-range and lattice arithmetic.
//!
//! A job renders the lattice `start, start+step, …, ≤ end`. All range
//! math lives here so the store backings, the orchestrator, and the
//! worker agree on exactly one definition of `frame_total`, chunking,
//! and run coalescing.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::FrameNumber;

/// An inclusive frame range with a positive step.
///
/// `frame_total` is fixed by construction; chunking and splitting
/// create new ranges, they never mutate an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: FrameNumber,
    pub end: FrameNumber,
    pub step: i64,
}

impl FrameRange {
    /// Build a validated range. `end < start` is a validation error;
    /// a non-positive step is clamped to 1.
    pub fn new(start: FrameNumber, end: FrameNumber, step: i64) -> Result<Self, CoreError> {
        if end < start {
            return Err(CoreError::Validation(format!(
                "end_frame {end} must be >= start_frame {start}"
            )));
        }
        Ok(Self {
            start,
            end,
            step: step.max(1),
        })
    }

    /// Number of lattice frames: `(end - start) / step + 1`.
    pub fn frame_total(&self) -> i64 {
        (self.end - self.start) / self.step + 1
    }

    /// Iterate the lattice frames in ascending order.
    pub fn frames(&self) -> impl Iterator<Item = FrameNumber> {
        let FrameRange { start, step, .. } = *self;
        (0..self.frame_total()).map(move |i| start + i * step)
    }

    /// True when `frame` lies within the range and on the lattice.
    pub fn contains_lattice(&self, frame: FrameNumber) -> bool {
        frame >= self.start && frame <= self.end && (frame - self.start) % self.step == 0
    }

    /// Partition the lattice into consecutive chunks of at most
    /// `chunk_size` frames each. `chunk_size <= 0` yields the whole
    /// range as a single chunk.
    ///
    /// Chunks cover the lattice with no overlap and no gap; every
    /// chunk keeps the parent step.
    pub fn chunks(&self, chunk_size: i64) -> Vec<FrameRange> {
        if chunk_size <= 0 {
            return vec![*self];
        }
        let lattice: Vec<FrameNumber> = self.frames().collect();
        lattice
            .chunks(chunk_size as usize)
            .map(|block| FrameRange {
                start: block[0],
                end: *block.last().unwrap_or(&block[0]),
                step: self.step,
            })
            .collect()
    }
}

/// Sort, deduplicate, and coalesce frames into maximal contiguous
/// (step 1) runs, returned as inclusive `(start, end)` pairs.
///
/// Used by frame resubmission: `[3,4,5,9]` becomes `[(3,5), (9,9)]`.
pub fn coalesce_runs(frames: &[FrameNumber]) -> Vec<(FrameNumber, FrameNumber)> {
    let mut sorted: Vec<FrameNumber> = frames.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return runs;
    };

    let (mut lo, mut hi) = (first, first);
    for frame in iter {
        if frame == hi + 1 {
            hi = frame;
        } else {
            runs.push((lo, hi));
            lo = frame;
            hi = frame;
        }
    }
    runs.push((lo, hi));
    runs
}
