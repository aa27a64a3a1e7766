//! Replay options.
//!
//! Assembled by the CLI from flags; there is no config file for a
//! run-once tool. Everything carries an explicit default so embedders can
//! deserialize a partial table.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::player::DEFAULT_SKEW_WINDOW_NS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Where the timeline files land. Defaults to the trace root.
    pub output_dir: Option<PathBuf>,
    /// Per-host clock offset table (`host offset_ns` lines).
    pub clock_offsets: Option<PathBuf>,
    /// Count clock regressions instead of failing the run on them.
    pub tolerate_unsorted: bool,
    /// Allow nesting a task execution over a non-running frame.
    pub relax_nesting: bool,
    /// Stop after this many replayed events.
    pub max_events: Option<u64>,
    /// Progress log cadence, in events.
    pub progress_every: u64,
    /// Widest credible clock spread between streams at startup, in ns.
    pub skew_window_ns: i64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            output_dir: None,
            clock_offsets: None,
            tolerate_unsorted: false,
            relax_nesting: false,
            max_events: None,
            progress_every: 5_000_000,
            skew_window_ns: DEFAULT_SKEW_WINDOW_NS,
        }
    }
}
