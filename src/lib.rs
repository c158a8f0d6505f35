//! Segmentation job queue
//!
//! Accepts segmentation jobs for image subjects, runs them against an
//! inference backend with bounded concurrency and strict priority ordering,
//! persists every state transition to PostgreSQL, and publishes status
//! events to per-project rooms over Redis pub/sub.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
