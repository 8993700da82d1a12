pub mod config;
pub mod consumer;
pub mod error;
pub mod lifecycle;
pub mod processor;
pub mod reader;
