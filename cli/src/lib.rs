//! Inlay CLI library.

pub mod commands;
pub mod git;
