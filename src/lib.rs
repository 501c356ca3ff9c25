pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod sandbox;
pub mod server;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
