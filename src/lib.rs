use std::sync::Arc;

use tokio::signal;
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod address;
pub mod auth;
pub mod config;
pub mod delivery;
pub mod disposable;
pub mod dns;
pub mod envelope;
pub mod error;
pub mod forwarding;
pub mod mime;
pub mod ratelimit;
pub mod smtp;

pub use config::{Environment, RelayConfig};
pub use smtp::{RelayServices, server::SmtpServer};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build every shared service the SMTP front end needs from a loaded config,
/// failing fast if DKIM signing material was configured but unreadable.
pub fn build_services(config: RelayConfig) -> anyhow::Result<RelayServices> {
    if CryptoProvider::get_default().is_none() {
        CryptoProvider::install_default(crypto::aws_lc_rs::default_provider())
            .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;
    }

    let disposable = disposable::DisposableDomains::load(
        config
            .disposable_domains_file
            .as_ref()
            .map(std::fs::read_to_string)
            .transpose()?
            .as_deref(),
    );

    let dns = dns::DnsResolver::new();
    let rate_limiter =
        ratelimit::RateLimiter::new(config.rate_limit.max, config.rate_limit.window());
    let forwarding = forwarding::ForwardingResolver::new(dns.clone());
    let spf = auth::spf::SpfVerifier::new()?;
    let dkim_verifier = auth::dkim::DkimVerifier::new()?;

    let dkim_signer = match (
        &config.dkim.domain_name,
        &config.dkim.selector,
        &config.dkim.private_key_file,
    ) {
        (Some(domain), Some(selector), Some(key_file)) => Some(Arc::new(
            auth::dkim::DkimSigningKey::from_pem_file(domain.clone(), selector.clone(), key_file)?,
        )),
        _ => None,
    };

    // spec.md §4.H: outbound EHLO uses the relay's configured name, i.e. one
    // of the configured exchanges, not the inbound greeting's server_name.
    let helo_domain = config
        .exchanges
        .first()
        .cloned()
        .unwrap_or_else(|| config.server_name.clone());
    let delivery = delivery::DeliveryClient::new(dns.clone(), helo_domain, config.environment);

    Ok(RelayServices {
        config: Arc::new(config),
        disposable: Arc::new(disposable),
        rate_limiter,
        forwarding: Arc::new(forwarding),
        spf: Arc::new(spf),
        dkim_verifier: Arc::new(dkim_verifier),
        dkim_signer,
        dns,
        delivery: Arc::new(delivery),
    })
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal");
}
