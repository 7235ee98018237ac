pub mod api;
pub mod app;
pub mod broker;
pub mod config;
pub mod events;
pub mod gateway;
pub mod ingest;
pub mod notifications;
pub mod rollup;
pub mod store;
pub mod types;
