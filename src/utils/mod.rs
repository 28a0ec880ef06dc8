//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Process execution with captured output and timeouts
//! - `parser` - Text truncation
//! - `validation` - Input validation helpers

pub mod command;
pub mod parser;
pub mod validation;
