//! End-to-end tests of the engine through its session API.
//!
//! Processes run directly on the host, so the tests use `/bin/sh` and are
//! unix only.

#![cfg(unix)]

mod cache_tests;
mod common;
mod pipeline_tests;
