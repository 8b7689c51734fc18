//! Admission control: per-client token buckets in front of the API.
//!
//! - `bucket`: the token bucket refill/consume rule
//! - `limiter`: bounded identity → bucket map
//! - `identity`: client identity from forwarding headers or the peer address
//! - `layer`: tower layer returning 429 before any handler runs
//! - `sweeper`: background eviction of idle buckets

pub mod bucket;
pub mod identity;
pub mod layer;
pub mod limiter;
pub mod sweeper;

pub use bucket::TokenBucket;
pub use identity::client_identity;
pub use layer::{RateLimitLayer, RateLimitService};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use sweeper::{BucketSweeper, SweepTask};
