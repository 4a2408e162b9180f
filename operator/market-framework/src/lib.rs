//! Shared plumbing for the marketplace services: block-cursor event
//! synchronization, the relational store, the message bus, bus query
//! responders, task supervision and the health endpoint.

pub mod bus;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod evm;
pub mod health;
pub mod model;
pub mod query;
pub mod repository;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod telemetry;

/// Block numbers arrive as `u64` but are stored in signed `BIGINT`
/// columns. Out-of-range values clamp instead of failing.
pub trait SaturatingConvert<T> {
    fn saturating_to(self) -> T;
}

impl SaturatingConvert<i64> for u64 {
    fn saturating_to(self) -> i64 {
        i64::try_from(self).unwrap_or(i64::MAX)
    }
}

impl SaturatingConvert<u64> for i64 {
    /// Negative values clamp to zero.
    fn saturating_to(self) -> u64 {
        u64::try_from(self).unwrap_or(0)
    }
}

impl SaturatingConvert<i64> for usize {
    fn saturating_to(self) -> i64 {
        i64::try_from(self).unwrap_or(i64::MAX)
    }
}
