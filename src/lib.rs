//! relaybee: soak and chaos agent for the relaybee pub-sub client runtime
//!
//! The agent builds an in-process broker cluster, connects a `relaybee_client`
//! connection to it and keeps traffic flowing while nodes are taken down, so that
//! failover, slow-consumer handling and ordered delivery can be watched over long runs.
//!
//! ## Modules
//!
//! * `config`: TOML configuration (`[logger]`, `[client]`, `[soak]`) validated with
//!   the `validator` crate.
//!
//! * `core`: runtime components:
//!   - Readiness tracking driven by the client's connection state
//!   - The soak workload runner
//!
//! * `logger`: `tracing` subscriber setup with console (compact, pretty, JSON) and
//!   optional systemd journald output.

pub mod config;
pub mod core;
pub mod logger;
