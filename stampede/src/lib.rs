//! The stampede distributed load-generation coordinator.
//!
//! This library supports the stampede binary found elsewhere in this project.
//! A single manager accepts REST commands to start, ramp and stop load
//! attacks; worker nodes connect to the manager over a long-lived stream,
//! advertise the scenarios they can run and spawn virtual users that exercise
//! a target service over HTTP.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unnecessary_to_owned)]
#![deny(clippy::float_cmp)]
#![deny(clippy::rc_buffer)]
#![deny(clippy::redundant_allocation)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod caller;
pub mod core;
pub mod gateway;
pub mod generator;
pub mod manager;
pub mod proto;
pub mod scenario;
pub mod wire;
