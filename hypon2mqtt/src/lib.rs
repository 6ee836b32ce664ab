// externally visible interfaces
pub mod collector;
pub mod config;
pub mod daemon;
pub mod fetcher;
pub mod home_assistant;
pub mod http_transport;
pub mod merger;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod session;

// internal interfaces
mod home_assistant_config;
