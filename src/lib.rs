//! Real-time fanout server: per-topic WebSocket hubs bridged across
//! replicas over Redis pub/sub, with TTL presence and a session store
//! that degrades to an in-process cache when Redis is down.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod membership;
pub mod presence;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod ws;
