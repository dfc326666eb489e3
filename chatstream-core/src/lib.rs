pub mod accumulator;
pub mod config;
pub mod controller;
pub mod error;
pub mod http_client;
pub mod message_store;
pub mod model;
pub mod persistence;
pub mod render;
pub mod sse;
pub mod state;
pub mod telemetry;
pub mod transport;
