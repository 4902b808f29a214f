//! A3S Build CLI - inspect and exercise the build cache.

pub mod commands;
pub mod output;
