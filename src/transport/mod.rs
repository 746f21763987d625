//! Resilience transport
//!
//! Timeout-bounded HTTP execution, retry with backoff, and the per-provider
//! gateway that places the concurrency limiter in front of it.

pub mod gateway;
pub mod http;
pub mod retry;

pub use gateway::{check_status, decode_response, Gateway};
pub use http::{is_retryable_status, HttpResponse, Transport};
pub use retry::{parse_retry_after, with_retry, RetryDecision, RetryPolicy, RetryableError};
