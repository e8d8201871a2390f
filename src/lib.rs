pub mod config;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod loader;
pub mod locator;
pub mod prompt;
pub mod render;
pub mod result;
pub mod server;
pub mod session;
