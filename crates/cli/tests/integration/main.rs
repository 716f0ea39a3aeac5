#![cfg(unix)]

mod cache_tests;
mod common;
mod gc_tests;
mod run_tests;
