pub mod api;
pub mod config;
pub mod consumer;
pub mod converter;
pub mod endpoint;
pub mod kafka;
pub mod producer;
pub mod prometheus;
pub mod registry;
pub mod request;
pub mod router;
pub mod server;
pub mod types;
