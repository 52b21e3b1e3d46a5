// Random secrets and PKCE challenges
pub mod pkce;
pub mod secret;

// Key/value storage, pending sessions and encrypted credentials
pub mod credentials;
pub mod session;
pub mod store;

// Identity-provider client
pub mod oauth;

// Completion fan-out, local and across instances
pub mod broker;
pub mod cluster;

// Connect flow orchestration
pub mod flow;

// HTTP API
pub mod api;
pub mod auth;

// Service configuration
pub mod config;
