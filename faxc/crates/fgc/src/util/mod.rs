//! Util Module - Shared Utilities

pub mod alignment;

pub use alignment::Alignment;
