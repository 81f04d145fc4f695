//! CLI command implementations.

pub mod common;
pub mod demo;
pub mod factories;
pub mod inspect;
pub mod run;
pub mod settings;
