//! PKCE authorization flow against the cloud-storage OAuth provider.
//!
//! Three phases:
//! 1. Initiate: build the provider authorization URL, bind a fresh PKCE
//!    verifier to the user with a 15-minute TTL
//! 2. Callback: validate `state`, consume the verifier exactly once,
//!    exchange the code, encrypt and persist the credential
//! 3. Revoke: best-effort provider-side revocation, then clear the
//!    credential's active flag

pub mod pkce;

mod flow;
mod provider;

pub use flow::AuthFlow;
pub use provider::{HttpProvider, Provider, ProviderConfig, TokenSet};
