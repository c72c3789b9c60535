//! Core runtime of the UDS endpoint actor.
//!
//! The actor mediates between a central broker and the machine it runs on:
//! it registers the machine, drives first-boot configuration (rename,
//! domain join, one-shot hooks), serves a locally reachable control plane
//! over TLS and routes asynchronous events between the broker, a user-space
//! client on the same host and the operating system.

#![forbid(unsafe_code)]

// Declare the modules to re-export
pub mod actor;
pub mod broker;
pub mod consts;
pub mod error;
pub mod log;
pub mod platform;
pub mod router;
pub mod security;
pub mod server;
pub mod types;
pub mod utils;
pub mod webserver;

pub use error::{ActorError, Result};
pub use server::{stop_flag, ActorService, StopFlag};
