//! Host-facing command contract and bridge for driving the update engine
//! from a native app shell.

pub mod channel;
pub mod contract;
pub mod handler;
pub mod stdio;
