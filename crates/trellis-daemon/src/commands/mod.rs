//! Control socket command handlers.
//!
//! Each submodule implements the commands for one category.

pub mod diagnostics;
pub mod network;
