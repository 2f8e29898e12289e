//! Core services and infrastructure

pub mod cache;
pub mod error;
pub mod ids;
pub mod retry;

/// Current UTC time as UNIX seconds.
///
/// Every expiry in the engine (message TTL, claim TTL, counter stall
/// window) is an absolute second-resolution timestamp evaluated lazily by
/// whichever operation next reads the row.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
