#![forbid(unsafe_code)]

pub mod bay;
pub mod chan;
#[cfg(feature = "cli")]
pub mod cli;
pub mod clkoff;
pub mod config;
pub mod emu;
pub mod error;
pub mod event;
mod heap;
pub mod model;
pub mod mux;
pub mod player;
pub mod record;
pub mod sort;
pub mod stream;
pub mod system;
pub mod task;
pub mod timeline;
pub mod trace;
pub mod track;
pub mod value;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main replay types at crate root for convenience
pub use crate::config::Options;
pub use crate::emu::Emu;
pub use crate::player::{Player, PlayerEv, PlayerOptions, Progress};
pub use crate::system::{System, ThreadState};
pub use crate::trace::Trace;
pub use crate::value::Value;
