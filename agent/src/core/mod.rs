//! Deterministic logic shared by the agent.
//!
//! Core modules are free of I/O side effects: they decode server replies,
//! name phases and statuses, and compute checkin timing.

pub mod command;
pub mod timing;
pub mod types;
