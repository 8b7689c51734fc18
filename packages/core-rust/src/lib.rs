//! `kvstore` core: record model, error taxonomy, pagination and API envelopes.

pub mod clock;
pub mod error;
pub mod messages;
pub mod pagination;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::{KvError, KvResult};
pub use messages::{
    CreateRecordRequest, DeleteMode, DeleteRecordRequest, ErrorBody, UpdateRecordRequest,
};
pub use pagination::{Page, PageParamError, PageRequest, DEFAULT_LIMIT, MAX_LIMIT};
pub use types::Record;

