//! Tokengate - In-Process Admission Control
//!
//! This crate implements a per-key limiter that hands out opaque tokens
//! while a key is under its capacity and decays every key's usage by one
//! on a fixed tick, so past requests stop counting against future ones.

pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;

pub use error::{ErrorKind, LimiterError, Result};
pub use ratelimit::{LimiterOption, Limiter, Token};
