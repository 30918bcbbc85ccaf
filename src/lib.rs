//! Abuse prevention and cache coherence for a pinboard-style content API.

pub mod cache;
pub mod cache_keys;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod invalidation;
pub mod models;
pub mod routes;
pub mod security;
pub mod state;
pub mod store;
