//! Utility macros shared across the crate

pub mod enum_macros;
