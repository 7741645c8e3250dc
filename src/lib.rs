// ABOUTME: Root library module exposing all public modules
// ABOUTME: Provides access to the hubs, router, bindings, adapters, and middleware

pub mod agent_hub;
pub mod bindings;
pub mod channel;
pub mod config;
pub mod middleware;
pub mod protocol;
pub mod realtime;
pub mod router;
pub mod server;
