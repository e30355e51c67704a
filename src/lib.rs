pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod events;
pub mod expiry;
pub mod lifecycle;
pub mod logging;
pub mod retrieval;
pub mod store;
