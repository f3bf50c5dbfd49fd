//! canaryd — a dead-man's-switch monitor.
//!
//! Operators register named "canaries", each with a cadence at which an
//! external job is expected to trigger (ping) it. A single timer watches
//! the soonest deadline; canaries that miss theirs are marked late and a
//! notification goes out, with a recovery notification when they report
//! again. Management happens over a small HTTP/JSON API ([`server`]) or
//! the `canaryctl` CLI.

pub mod cadence;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod notify;
pub mod server;
pub mod store;
