//! The cadenza scheduling daemon: a single-process supervisor that reads a
//! declarative job catalog, computes wakeups from schedule expressions,
//! admits runs under concurrency-group caps, supervises child processes,
//! and drives the persistent run log.

pub mod arbiter;
pub mod cli;
pub mod environment;
pub mod reactor;
pub mod supervisor;
pub mod triggers;
