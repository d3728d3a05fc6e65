//! HTTP sessions, rate limiting, retry policy and persistence gateways for the event catalog.

pub mod gateway;
pub mod http;
pub mod rate_limit;
pub mod retry;

pub use gateway::{
    CandidateWindow, FileGateway, MemoryGateway, PersistenceError, PersistenceGateway, PgGateway,
    UpsertOutcome,
};
pub use http::{HttpClient, HttpClientConfig, HttpSession};
pub use rate_limit::{deadline_after, TokenBucket, TokenBucketConfig};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};

pub const CRATE_NAME: &str = "evcat-storage";
