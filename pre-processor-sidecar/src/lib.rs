// Library interface for the pre-processor-sidecar ingestion core.
// Allows the binary entrypoint and integration tests to import modules.

pub mod admin;
pub mod config;
pub mod error;
pub mod fetch_service;
pub mod gateway;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod sync_service;
pub mod token;
