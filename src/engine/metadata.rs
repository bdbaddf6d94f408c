//! Tracks whether frames arrive with any detection metadata at all.
//!
//! A post-process element whose metadata the engine cannot read produces
//! frames that look exactly like an empty scene. The watch flags the run once
//! the first `METADATA_CHECK_FRAMES` frames all came without metadata.

/// Frames inspected before metadata is declared unreadable.
pub const METADATA_CHECK_FRAMES: u64 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetadataWatch {
    frames: u64,
    frames_without_metadata: u64,
    seen_metadata: bool,
    flagged: bool,
}

impl MetadataWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame carrying `entries` metadata entries.
    ///
    /// Returns `true` exactly once: on the frame that completes the check
    /// window without any metadata having been seen.
    pub fn observe(&mut self, entries: usize) -> bool {
        self.frames += 1;
        if entries == 0 {
            self.frames_without_metadata += 1;
        } else {
            self.seen_metadata = true;
        }
        if !self.flagged && !self.seen_metadata && self.frames >= METADATA_CHECK_FRAMES {
            self.flagged = true;
            return true;
        }
        false
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frames_without_metadata(&self) -> u64 {
        self.frames_without_metadata
    }

    /// Flagged and still no metadata since.
    pub fn is_unreadable(&self) -> bool {
        self.flagged && !self.seen_metadata
    }
}
