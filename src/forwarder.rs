//! Forwarder (§4.H), grounded on `examples/original_source/mailer/mailer.go`
//! for the JSON schema and on `src/moneybird/production_api.rs` for the
//! `reqwest` client idiom.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

const BOUNCE_ADDRESS: &str = "bounce@bounce.maskr.app";

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("mailer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mailer returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub from_address: String,
    pub from_name: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

#[derive(Serialize)]
struct EmailAddress<'a> {
    address: &'a str,
}

#[derive(Serialize)]
struct Recipient<'a> {
    email_address: EmailAddress<'a>,
}

#[derive(Serialize)]
struct From<'a> {
    address: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct ForwardBody<'a> {
    bounce_address: &'a str,
    htmlbody: Option<&'a str>,
    textbody: Option<&'a str>,
    subject: &'a str,
    from: From<'a>,
    to: Vec<Recipient<'a>>,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &ForwardRequest) -> Result<(), ForwarderError>;
}

pub struct HttpForwarder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpForwarder {
    pub fn new(base_url: String, token: &str) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Zoho-enczapikey {token}").parse().unwrap(),
        );
        headers.insert(reqwest::header::ACCEPT, "application/json".parse().unwrap());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(HttpForwarder {
            client,
            endpoint: format!("{}/email", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &ForwardRequest) -> Result<(), ForwarderError> {
        let body = ForwardBody {
            bounce_address: BOUNCE_ADDRESS,
            htmlbody: request.html_body.as_deref(),
            textbody: request.text_body.as_deref(),
            subject: &request.subject,
            from: From {
                address: &request.from_address,
                name: &request.from_name,
            },
            to: request
                .to
                .iter()
                .map(|address| Recipient {
                    email_address: EmailAddress { address },
                })
                .collect(),
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();

        if status.as_u16() == 201 {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ForwarderError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
pub mod fixture {
    use std::sync::Mutex;

    use super::{ForwardRequest, Forwarder, ForwarderError};
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct FixtureForwarder {
        pub should_fail: bool,
        pub requests: Mutex<Vec<ForwardRequest>>,
    }

    #[async_trait]
    impl Forwarder for FixtureForwarder {
        async fn forward(&self, request: &ForwardRequest) -> Result<(), ForwarderError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.should_fail {
                return Err(ForwarderError::UnexpectedStatus {
                    status: 500,
                    body: "fixture failure".to_string(),
                });
            }
            Ok(())
        }
    }
}
