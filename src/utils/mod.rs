//! Shared helpers for the binaries.

pub mod bootstrap;
pub mod retry;
