//! Common utilities for usb-proxy
//!
//! This crate provides the execution primitives the proxy is built on: the
//! blocking command bridge to a worker thread, worker launch with a started
//! flag, error handling and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod worker;

pub use channel::{
    CallerLink, DEFAULT_QUEUE_DEPTH, Reply, WorkerLink, call_inline, create_worker_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use worker::{WorkerThread, spawn_worker};
