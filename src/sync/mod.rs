//! The config sync engine (C6, §4.6).

pub mod engine;
pub mod projection;
