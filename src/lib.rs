//! httpcore - the reusable core of an HTTP/1.1 serving substrate.
//!
//! Four subsystems, built leaf-first: [`monitor`] (counters and response-time
//! percentiles), [`timeout`] (per-session deadline timers), [`session`] (the
//! per-connection read/dispatch/write state machine, with WebSocket upgrade
//! hand-off), and [`pool`] (admission, reuse, idle eviction, and queueing
//! under saturation). [`config`] is the validated data carrier consumed at
//! construction; [`api`] exposes the monitor's metrics over HTTP for
//! external scraping.

#![recursion_limit = "256"]

pub mod api;
pub mod config;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod session;
pub mod timeout;
pub mod utils;

pub use utils::error::{HttpCoreError, Result};
