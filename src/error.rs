use thiserror::Error;

use crate::bay::BayError;
use crate::clkoff::ClkoffError;
use crate::model::ModelError;
use crate::player::PlayerError;
use crate::system::SystemError;
use crate::timeline::TimelineError;
use crate::trace::TraceError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the stage errors, so a
/// caller driving a whole replay can use one `Result` type while the
/// individual stages keep their own.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Clkoff(#[from] ClkoffError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error(transparent)]
    Bay(#[from] BayError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("output write failed")]
    Io(#[from] std::io::Error),
}
