use std::{env, net::SocketAddr};

use derive_more::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str, default: impl Into<String>) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

/// Process-wide configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the mask directory RPC collaborator (component F).
    pub directory_base_url: String,
    /// Bearer credential for the outbound mailer HTTP API.
    #[debug("*****")]
    pub mail_token: String,
    /// Base URL of the outbound mailer HTTP API.
    pub mailer_base_url: String,
    /// Path to the PEM-encoded TLS certificate chain for STARTTLS.
    pub certificate_path: String,
    /// Path to the PEM-encoded TLS private key for STARTTLS.
    pub private_key_path: String,
    /// Whether TLS enforcement (STARTTLS required) is active.
    pub production: bool,
    /// `debug|info|warn|error`.
    pub log_level: String,
    /// Interpolated into the Spamhaus DNSBL zone name.
    #[debug("*****")]
    pub spamhaus_token: String,
    /// Advertised in the EHLO/greeting banner.
    pub hostname: String,
    /// SMTP listen address.
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let production = match env::var("PRODUCTION") {
            Ok(value) => value.parse().map_err(|source| ConfigError::Invalid {
                name: "PRODUCTION",
                source: Box::new(source),
            })?,
            Err(_) => true,
        };

        let bind_addr = optional("BIND_ADDR", "0.0.0.0:25")
            .parse()
            .map_err(|source: std::net::AddrParseError| ConfigError::Invalid {
                name: "BIND_ADDR",
                source: Box::new(source),
            })?;

        Ok(Config {
            directory_base_url: required("DIRECTORY_BASE_URL")?,
            mail_token: required("MAIL_TOKEN")?,
            mailer_base_url: optional("MAILER_BASE_URL", "https://api.zeptomail.eu/v1.1"),
            certificate_path: required("CERTIFICATE")?,
            private_key_path: required("PRIVATE_KEY")?,
            production,
            log_level: optional("LOG_LEVEL", "info"),
            spamhaus_token: required("SPAMHAUS_TOKEN")?,
            hostname: optional("HOSTNAME", "localhost"),
            bind_addr,
        })
    }
}
