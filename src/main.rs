use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use keybridge::api::{self, AppState};
use keybridge::audit::SecurityLog;
use keybridge::config::{self, Secrets};
use keybridge::credentials::CredentialStore;
use keybridge::crypto::SecretBox;
use keybridge::kv::MemoryKv;
use keybridge::oauth::{AuthFlow, HttpProvider};
use keybridge::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keybridge=info".into()),
        )
        .init();

    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| "keybridge.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        config::load_config(&config_path)?
    } else {
        info!(path = %config_path, "config file not found, using defaults");
        Default::default()
    };

    let secrets = Secrets::from_env()?;

    let secret_box = Arc::new(SecretBox::new(&secrets.master_key)?);
    let credential_store = Arc::new(CredentialStore::open(&config.storage.credentials_db)?);
    let audit = Arc::new(SecurityLog::new(
        config.audit.capacity,
        config.audit.retention_hours,
    ));
    let kv = Arc::new(MemoryKv::new());

    let rate_limiter = Arc::new(RateLimiter::open(
        &config.storage.rate_limit_db,
        config.limits.policy_table(),
    )?);

    let provider_config = config.provider_config(&secrets);
    let provider = Arc::new(HttpProvider::new(provider_config.clone())?);

    let flow = Arc::new(AuthFlow::new(
        provider_config,
        provider,
        credential_store.clone(),
        secret_box,
        kv.clone(),
        audit.clone(),
        config.flow.pending_ttl_minutes,
    ));

    let linked = credential_store.list_active()?;
    info!(linked_accounts = linked.len(), "keybridge starting");

    tokio::spawn(api::run_cleanup(
        kv,
        audit.clone(),
        config.flow.cleanup_interval_seconds,
    ));

    let app = api::create_router(AppState {
        flow,
        audit,
        rate_limiter,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "callback server listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
