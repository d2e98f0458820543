//! # PrcDrop Gateway
//!
//! HTTP front end: accepts tracking requests, hot-reloads the selector table
//! and reports service health.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
