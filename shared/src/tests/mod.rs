//! Test modules for the shared crate

mod config_tests;
mod hashing_tests;
mod state_tests;
