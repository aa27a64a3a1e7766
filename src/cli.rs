//! CLI surface for the replay tool.
//!
//! One command: point it at a trace directory, get `cpu.tsv` and
//! `thread.tsv` back. Everything else is a knob on that.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::info;

use crate::Result;
use crate::config::Options;
use crate::emu::Emu;

#[derive(Parser, Debug)]
#[command(
    name = "unspool",
    version,
    about = "Replay a recorded execution trace into timeline files"
)]
pub struct Cli {
    /// Trace directory to replay.
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Directory for the timeline files (default: the trace directory).
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Clock offset table for multi-host traces.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub clock_offsets: Option<PathBuf>,

    /// Keep replaying when the merged clock goes backwards.
    #[arg(long, default_value_t = false)]
    pub tolerate_unsorted: bool,

    /// Accept tasks nested over a paused one.
    #[arg(long, default_value_t = false)]
    pub relax_nesting: bool,

    /// Stop after this many events.
    #[arg(long, value_name = "N")]
    pub max_events: Option<u64>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the CLI (used by bin).
pub fn run(cli: Cli) -> Result<()> {
    let options = Options {
        output_dir: cli.output,
        clock_offsets: cli.clock_offsets,
        tolerate_unsorted: cli.tolerate_unsorted,
        relax_nesting: cli.relax_nesting,
        max_events: cli.max_events,
        ..Options::default()
    };
    let mut emu = Emu::new(&cli.trace, options)?;
    emu.run()?;
    let out_dir = emu.out_dir().to_path_buf();
    let progress = emu.finish()?;
    info!(
        events = progress.events,
        regressions = progress.regressions,
        out_dir = %out_dir.display(),
        "replay complete"
    );
    Ok(())
}
