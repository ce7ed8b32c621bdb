//! Pure utility functions.
//!
//! Stateless helpers and small abstractions used across the codebase.

pub mod bootstrap;
pub mod clock;
pub mod retry;
