//! Recipient resolver (§4.F), grounded on the `MoneybirdApi` trait +
//! production/mock split in `src/moneybird/mod.rs` and
//! `src/moneybird/production_api.rs`, and on the fail-closed semantics of
//! `createHanderRcpt`/`GetMask` in
//! `examples/original_source/internal/smtp/smtp.go`.

use async_trait::async_trait;
use reqwest::{
    StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("mask not found")]
    NotFound,
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct MaskRecord {
    pub mask: String,
    pub forwarding_email: String,
    pub enabled: bool,
}

#[derive(Deserialize)]
struct GetMaskResponse {
    email: String,
    enabled: bool,
}

/// RPC-shaped collaborator: mask lookup plus the counter side effects that
/// share its base URL and client (§4.F).
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_mask(&self, mask_address: &str) -> Result<MaskRecord, DirectoryError>;
    async fn increment_received_count(&self, mask_address: &str);
    async fn increment_forwarded_count(&self, mask_address: &str);
}

pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: String, token: &str) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(ACCEPT, "application/json".parse().unwrap());

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(HttpDirectory { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn get_mask(&self, mask_address: &str) -> Result<MaskRecord, DirectoryError> {
        let mask_address = mask_address.to_lowercase();

        let response = self
            .client
            .get(self.url("masks"))
            .query(&[("mask_address", &mask_address)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound);
        }

        let parsed: GetMaskResponse = response.error_for_status()?.json().await?;

        Ok(MaskRecord {
            mask: mask_address,
            forwarding_email: parsed.email,
            enabled: parsed.enabled,
        })
    }

    async fn increment_received_count(&self, mask_address: &str) {
        if let Err(e) = self
            .client
            .post(self.url("masks/increment-received"))
            .json(&serde_json::json!({ "mask_address": mask_address }))
            .send()
            .await
        {
            warn!(error = %e, "failed to increment received count");
        }
    }

    async fn increment_forwarded_count(&self, mask_address: &str) {
        if let Err(e) = self
            .client
            .post(self.url("masks/increment-forwarded"))
            .json(&serde_json::json!({ "mask_address": mask_address }))
            .send()
            .await
        {
            warn!(error = %e, "failed to increment forwarded count");
        }
    }
}

#[cfg(test)]
pub mod fixture {
    use std::{collections::HashMap, sync::Mutex};

    use super::{Directory, DirectoryError, MaskRecord};
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct FixtureDirectory {
        pub masks: HashMap<String, MaskRecord>,
        pub received_counts: Mutex<Vec<String>>,
        pub forwarded_counts: Mutex<Vec<String>>,
    }

    impl FixtureDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_mask(mut self, record: MaskRecord) -> Self {
            self.masks.insert(record.mask.clone(), record);
            self
        }
    }

    #[async_trait]
    impl Directory for FixtureDirectory {
        async fn get_mask(&self, mask_address: &str) -> Result<MaskRecord, DirectoryError> {
            self.masks
                .get(&mask_address.to_lowercase())
                .cloned()
                .ok_or(DirectoryError::NotFound)
        }

        async fn increment_received_count(&self, mask_address: &str) {
            self.received_counts
                .lock()
                .unwrap()
                .push(mask_address.to_string());
        }

        async fn increment_forwarded_count(&self, mask_address: &str) {
            self.forwarded_counts
                .lock()
                .unwrap()
                .push(mask_address.to_string());
        }
    }
}
