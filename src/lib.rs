pub mod agent;
pub mod agents;
pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod generator;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod telemetry;
