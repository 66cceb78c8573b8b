//! Infrastructure lifecycle orchestration for a single managed cluster.
//!
//! Drives an infrastructure-as-code backend (`terraform`) through bootstrap
//! and destroy, keeping per-slot state in a local cache so operations resume
//! after restarts, and watches live node readiness to record when the
//! cluster has finished bootstrapping.
//!
//! - **[`core`]**: pure logic (plan parsing, the bootstrap predicate, the
//!   pipeline state machine). No I/O.
//! - **[`io`]**: side effects (state cache, backend processes, config files,
//!   marker stores, node feeds), each behind a trait where tests need a fake.
//!
//! Orchestration lives on top: [`runner`] (one backend invocation per slot),
//! [`pipeline`] (bootstrap/destroy with pre- and post-conditions),
//! [`shutdown`] (signal-driven cancellation) and [`reconcile`] (bootstrap
//! completion watcher).

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod reconcile;
pub mod runner;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
