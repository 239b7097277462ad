//! One-shot child process lifecycle: start, record, stop.

pub mod record;
pub mod signal;
pub mod tracker;

pub use record::{ProcessRecord, Slot};
pub use signal::StopSignal;
pub use tracker::{ExitReport, LaunchSpec, ProcessTracker, StopOutcome, StopRequest};
