pub mod config;
pub mod consolidate;
