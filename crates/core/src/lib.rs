//! `elara-core` — shared types, errors, and frame-range arithmetic for
//! the render farm.
//!
//! This crate has no I/O. Everything here is pure so that the store,
//! server, and worker crates can all depend on it without pulling in
//! runtime or database machinery.

pub mod error;
pub mod range;
pub mod types;
