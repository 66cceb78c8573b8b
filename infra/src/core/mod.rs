//! Deterministic, pure logic shared by the orchestration layers.
//!
//! Nothing in here touches the filesystem, spawns processes or talks to the
//! cluster. Everything operates on in-memory values and is tested in
//! isolation.

pub mod bootstrap;
pub mod lifecycle;
pub mod plan;
pub mod slot;
pub mod tfstate;
pub mod types;
