pub mod combine;
pub mod errors;
pub mod runner;

pub use combine::{CombineReport, SheetOutcome, SheetStatus, sheet_name};
pub use errors::BatchError;
pub use runner::{BatchReport, BatchRunner, BatchSettings, FileOutcome, FileStatus};
