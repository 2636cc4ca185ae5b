// Error taxonomy
pub mod error;

// Encryption and password hashing
pub mod crypto;

// TTL key-value interface for ephemeral flow state
pub mod kv;

// Credential records and SQLite store
pub mod credentials;

// PKCE authorization flow and provider adapter
pub mod oauth;

// Credential lifecycle (refresh-on-expiry)
pub mod tokens;

// Per-user, per-action rate limiting
pub mod rate_limit;

// Single-use CSRF tokens
pub mod csrf;

// Login-attempt lockout
pub mod lockout;

// Security event log
pub mod audit;

// Configuration and secrets
pub mod config;

// HTTP callback endpoint and cleanup task
pub mod api;
