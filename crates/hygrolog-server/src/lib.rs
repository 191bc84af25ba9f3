//! # hygrolog-server
//!
//! HTTP layer and process plumbing for the hygrolog sensor logger.
//!
//! This library provides the read-only REST API over stored readings,
//! logging setup and the shared handler state. The `hygrolog-server`
//! binary wires these together with the poller from `hygrolog-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
