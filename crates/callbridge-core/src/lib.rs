//! Core types, config, errors, and the per-call session store for Call Bridge.

pub mod config;
pub mod error;
pub mod session;
pub mod types;
