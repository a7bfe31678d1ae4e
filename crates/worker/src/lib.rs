pub mod runner;
pub mod sync;

pub use runner::{PollOutcome, PollSettings, Worker};
pub use sync::{CycleFailure, CycleReport, CycleStage, EntitySync, Pacing, SyncError, SyncOptions};
