//! Core crate for the vidsmith editing service.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod probe;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod service;
pub mod store;
pub mod streaming;
