//! Provisioning node agent.
//!
//! The agent checks in with a provisioning server and drives the node
//! through out-of-band configuration phases (firmware, bmc, ilo, raid,
//! bios), each run as a background script fetched from the server.
//!
//! - **[`core`]**: Pure protocol and bookkeeping types. No I/O.
//! - **[`io`]**: Files, processes, HTTP and privileged OS actions, behind
//!   traits so tests can substitute fakes.
//!
//! Orchestration modules ([`phases`], [`control_loop`], [`web`]) combine the
//! two into the running agent.

pub mod control_loop;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod phases;
pub mod signals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod web;
