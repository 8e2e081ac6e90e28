//! Elara render worker library.
//!
//! A worker registers with the orchestrator, claims jobs, drives the
//! external render tool, and reconciles progress against the files the
//! tool writes to the output directory. The filesystem is the ground
//! truth: counters and per-frame outcomes are derived from completed
//! output files, not from parsing render logs.

pub mod client;
pub mod config;
pub mod runner;
pub mod scan;
