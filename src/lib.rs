// ABOUTME: Root library module exposing all public modules
// ABOUTME: Provides access to config, bridges, matrix edge, intake, and the API server

pub mod bridge;
pub mod config;
pub mod handler;
pub mod matrix;
pub mod render;
pub mod server;

// Re-export the routing core for consumers of this crate
pub use chatdesk_core as core;
