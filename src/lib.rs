pub mod app;
pub mod attachment;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod ollama;
pub mod store;
