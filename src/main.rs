//! Kerbernetes API server entry point

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kerbernetes::bindings::KubeBindingManager;
use kerbernetes::cache::GroupBindingCache;
use kerbernetes::config::Config;
use kerbernetes::k8s::KubeHolder;
use kerbernetes::ldap::{BindLdapDirectory, LdapDirectory};
use kerbernetes::reconciler::Reconciler;
use kerbernetes::server::{router, AppState};
use kerbernetes::spnego::SpnegoGate;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> kerbernetes::Result<()> {
    let config = Config::parse();
    config.validate()?;

    // Leaves first: the keytab and the cluster connection are both fatal if
    // unavailable.
    let gate = Arc::new(SpnegoGate::from_keytab(&config.keytab_path)?);
    let holder = KubeHolder::connect(&config.namespace).await?;

    let cancel = CancellationToken::new();
    let cache = GroupBindingCache::new();
    let mut watch_task = tokio::spawn(cache.clone().run(holder.client.clone(), cancel.clone()));

    let bindings: Arc<dyn kerbernetes::bindings::BindingManager> = Arc::new(KubeBindingManager::new(
        holder.client.clone(),
        holder.namespace.clone(),
        config.token_audience.clone(),
        config.token_duration,
    ));

    let ldap: Option<Arc<dyn LdapDirectory>> = if config.ldap_enabled {
        info!(url = %config.ldap_url, "LDAP group resolution enabled");
        Some(Arc::new(BindLdapDirectory::new(&config)))
    } else {
        info!("LDAP group resolution disabled, serving tokens only");
        None
    };

    let state = AppState {
        reconciler: Arc::new(Reconciler::new(bindings.clone())),
        bindings,
        ldap,
        cache: cache.clone(),
    };

    // Requests may consult the cache as soon as they are accepted, so the
    // initial list must be in before the listener opens.
    info!("waiting for LdapGroupBinding cache sync");
    tokio::select! {
        _ = cache.wait_ready() => {}
        _ = &mut watch_task => {
            return Err(kerbernetes::Error::internal(
                "LdapGroupBinding watch failed before initial sync",
            ));
        }
    }

    let app = router(state, gate, &config.api_prefix);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| kerbernetes::Error::config(format!("failed to bind {addr}: {e}")))?;

    info!(addr = %addr, prefix = %config.api_prefix, "API server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            shutdown.cancel();
        })
        .await
        .map_err(|e| kerbernetes::Error::internal(format!("server error: {e}")))?;

    cancel.cancel();
    let _ = watch_task.await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
