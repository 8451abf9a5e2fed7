mod client;
mod config;
mod input;
mod prediction;

pub use client::NetworkClient;
pub use config::{ClientConfig, PredictionConfig};
