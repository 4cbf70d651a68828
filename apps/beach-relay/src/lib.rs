pub mod admission;
pub mod config;
pub mod connection;
pub mod hub;
pub mod rooms;
pub mod server;
pub mod telemetry;
