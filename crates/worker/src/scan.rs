//! Output-directory reconciliation.
//!
//! Render progress is never inferred from tool logs. Instead the
//! worker periodically rescans the job's output directory and decides,
//! per file, whether it represents a finished frame. A file counts
//! only when both hold:
//!
//! - its size meets the per-format minimum (renderers write headers
//!   first, so tiny files are in-progress or aborted writes), and
//! - it has sat unmodified for the quiet period (a file still being
//!   streamed to disk keeps getting newer).
//!
//! The frame number comes from the file name: the stem must contain
//! exactly one run of 1 to 6 digits. Names with zero or several such
//! runs are skipped; version markers like `v002` make a name
//! ambiguous, and 7+ digit runs (timestamps) are not frame tokens.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use elara_core::range::FrameRange;
use elara_core::types::FrameNumber;
use regex::Regex;
use walkdir::WalkDir;

fn digit_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// Extract the frame number from a file stem, if it is unambiguous.
pub fn frame_number(stem: &str) -> Option<FrameNumber> {
    let mut token = None;
    for run in digit_runs().find_iter(stem) {
        if run.as_str().len() > 6 {
            continue;
        }
        if token.is_some() {
            return None;
        }
        token = Some(run.as_str());
    }
    token.and_then(|t| t.parse().ok())
}

/// Output formats a renderer can produce. Anything else in the output
/// tree (temp files, previews, partial downloads) is never a finished
/// frame no matter what it is named or how big it is.
const OUTPUT_FORMATS: &[&str] = &[
    "exr", "png", "jpg", "jpeg", "tif", "tiff", "bmp", "hdr", "tx", "tga",
];

pub fn recognized_format(extension: &str) -> bool {
    let ext = extension.to_ascii_lowercase();
    OUTPUT_FORMATS.contains(&ext.as_str())
}

/// Minimum byte size for a finished frame of the given format.
/// Unlisted formats get the conservative default, as does EXR.
pub fn min_complete_size(extension: &str) -> u64 {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => 16 * 1024,
        "png" | "bmp" => 32 * 1024,
        "tif" | "tiff" => 64 * 1024,
        _ => 128 * 1024,
    }
}

/// Completeness decision for one output file.
pub fn is_complete(extension: &str, size: u64, unmodified_for: Duration, quiet: Duration) -> bool {
    recognized_format(extension)
        && size >= min_complete_size(extension)
        && unmodified_for >= quiet
}

/// Result of one output-directory scan.
#[derive(Debug, Default, Clone)]
pub struct ScanResult {
    /// Lattice frames with a complete output file.
    pub done: BTreeSet<FrameNumber>,
}

impl ScanResult {
    /// First lattice frame with no complete output yet. Rendering
    /// resumes here after a crash or requeue, so finished frames are
    /// never redone.
    pub fn resume_frame(&self, range: &FrameRange) -> Option<FrameNumber> {
        range.frames().find(|f| !self.done.contains(f))
    }

    /// Resume point, trusting the server-reported done counter when
    /// the scan saw nothing at all. Covers output locations that are
    /// not mounted on this host: the files exist somewhere, this
    /// worker just cannot see them.
    pub fn resume_frame_or_reported(
        &self,
        range: &FrameRange,
        reported_done: i64,
    ) -> Option<FrameNumber> {
        let resume = self.resume_frame(range)?;
        if self.done.is_empty() && reported_done > 0 {
            let fallback = range.start + reported_done * range.step;
            if fallback <= range.end {
                return Some(fallback);
            }
        }
        Some(resume)
    }

    /// Lattice frames with no complete output.
    pub fn missing(&self, range: &FrameRange) -> Vec<FrameNumber> {
        range.frames().filter(|f| !self.done.contains(f)).collect()
    }

    pub fn is_lattice_complete(&self, range: &FrameRange) -> bool {
        range.frames().all(|f| self.done.contains(&f))
    }

    /// Lattice frames done in an unbroken run from `start`. This is
    /// the only count that translates back into a resume frame, so it
    /// is what the worker reports as the job's done counter.
    pub fn aligned_prefix(&self, range: &FrameRange) -> usize {
        range.frames().take_while(|f| self.done.contains(f)).count()
    }
}

/// Walk `output_dir` and collect the job's finished frames. Renderers
/// nest output under per-layer subdirectories, so the walk recurses.
/// Files outside the lattice belong to other jobs sharing the
/// directory and are ignored, as are unreadable entries.
pub fn scan_output(output_dir: &Path, range: &FrameRange, quiet: Duration) -> ScanResult {
    let mut result = ScanResult::default();
    for entry in WalkDir::new(output_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(frame) = frame_number(stem) else {
            continue;
        };
        if !range.contains_lattice(frame) {
            continue;
        }
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let Ok(meta) = entry.metadata() else { continue };
        let unmodified_for = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if is_complete(extension, meta.len(), unmodified_for, quiet) {
            result.done.insert(frame);
        }
    }
    result
}
