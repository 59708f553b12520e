// src/utils/mod.rs
//! Common utilities: configuration, errors, time

pub mod config;
pub mod errors;
pub mod time;
