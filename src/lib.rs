// Public API for integration tests and potential library usage

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod observer;
pub mod protocol;
pub mod recipients;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod types;
pub mod ws;
