//! Side-effecting adapters: filesystem, child processes, the terminal and the
//! cluster API.

pub mod approval;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod marker;
pub mod nodes;
pub mod process;
pub mod state_cache;
