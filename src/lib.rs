//! Crate root: wires components A–I together and owns process lifecycle.
//! Grounded on the teacher's own `lib.rs` (`init_tracing`, `shutdown_signal`).

pub mod config;
pub mod forwarder;
pub mod parser;
pub mod recipients;
pub mod resolver;
mod smtp;
pub mod validator;

use std::sync::Arc;

use mail_auth::Resolver as MailAuthResolver;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::Config,
    forwarder::{Forwarder, HttpForwarder},
    recipients::{Directory, HttpDirectory},
    resolver::{HickoryResolver, Resolve},
    smtp::server::SmtpServer,
    validator::{
        Check, Validator, dkim::DkimCheck, dmarc::DmarcEvaluator, dnsbl::DnsblCheck,
        reverse_dns::ReverseDnsCheck, spf::SpfCheck,
    },
};

pub fn init_tracing(log_level: &str, production: bool) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("{}={log_level},info", env!("CARGO_CRATE_NAME")).into()),
    );

    if production {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().without_time())
            .init();
    }
}

/// Builds components A–I from [`Config`] and spawns the SMTP listener.
///
/// Returns the listener's join handle so the caller can await its shutdown
/// (grace window + forced close, §4.E) instead of guessing at a sleep.
pub async fn run(config: Config, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let resolver: Arc<dyn Resolve> = Arc::new(HickoryResolver::from_system_config());
    let mail_auth_resolver = Arc::new(
        MailAuthResolver::new_cloudflare_tls().expect("failed to build mail-auth resolver"),
    );

    let checks: Vec<Arc<dyn Check>> = vec![
        Arc::new(SpfCheck::new(
            mail_auth_resolver.clone(),
            config.hostname.clone(),
        )),
        Arc::new(DkimCheck::new(mail_auth_resolver.clone())),
        Arc::new(ReverseDnsCheck::new(resolver.clone())),
        Arc::new(DnsblCheck::new(resolver.clone(), &config.spamhaus_token)),
    ];

    let validator = Arc::new(Validator::new(checks, DmarcEvaluator::new(resolver.clone())));

    let directory: Arc<dyn Directory> = Arc::new(
        HttpDirectory::new(config.directory_base_url.clone(), &config.mail_token)
            .expect("failed to build directory client"),
    );

    let forwarder: Arc<dyn Forwarder> = Arc::new(
        HttpForwarder::new(config.mailer_base_url.clone(), &config.mail_token)
            .expect("failed to build forwarder client"),
    );

    let server = SmtpServer::new(
        config.bind_addr,
        config.hostname.clone(),
        config.certificate_path.clone(),
        config.private_key_path.clone(),
        config.production,
        validator,
        directory,
        forwarder,
        shutdown,
    );

    server.spawn()
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
