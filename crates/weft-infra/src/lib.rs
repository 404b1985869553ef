//! Infrastructure layer for weft.
//!
//! Contains implementations of the ports defined in `weft-core`: SQLite run
//! storage, filesystem artifact transfer, and the engine config loader.

pub mod artifact;
pub mod config;
pub mod sqlite;
