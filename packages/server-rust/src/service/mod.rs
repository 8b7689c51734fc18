//! Record operations and the machinery they run on.
//!
//! 1. **Record service** (`record`): validation, pagination defaults and
//!    re-fetch orchestration over a `RecordRepository`
//! 2. **Configuration** (`config`): service limits
//! 3. **Background workers** (`worker`): periodic maintenance tasks

pub mod config;
pub mod record;
pub mod worker;

pub use config::{ServiceConfig, DEFAULT_MAX_VALUE_BYTES};
pub use record::RecordService;
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerStopped};
