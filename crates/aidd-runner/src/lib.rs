//! Runner supervision for stage loops: launch an agent runner as a child
//! process, capture bounded output, tee JSON-lines streams, and classify
//! launcher failures with stable reason codes.

pub mod error;
pub mod process;
pub mod stream;
pub mod types;

pub use error::{Result, RunnerError};
pub use process::launch;
pub use types::{LaunchResult, OutputLimits, RunnerSpec, StreamMode};
