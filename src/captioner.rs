// src/captioner.rs
//
// Client for the external captioning server: a weapon crop goes in as
// base64 JPEG, a short natural-language description comes out. The model
// itself is a black box behind HTTP.

use crate::types::CaptionConfig;
use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Image region -> natural-language description.
pub trait Captioner: Send + Sync {
    fn describe(&self, region_jpeg: &[u8]) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CaptionRequest {
    image_base64: String,
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    caption: String,
}

pub struct HttpCaptioner {
    http_client: reqwest::blocking::Client,
    server_url: String,
}

impl HttpCaptioner {
    pub fn new(config: &CaptionConfig) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build caption HTTP client")?;

        Ok(Self {
            http_client,
            server_url: config.server_url.clone(),
        })
    }
}

impl Captioner for HttpCaptioner {
    fn describe(&self, region_jpeg: &[u8]) -> Result<String> {
        let request = CaptionRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(region_jpeg),
        };

        let url = format!("{}/caption", self.server_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .context("Caption request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Caption server returned {}", response.status());
        }

        let parsed: CaptionResponse = response
            .json()
            .context("Failed to parse caption response")?;

        debug!("🧠 Caption: {}", parsed.caption);
        Ok(parsed.caption)
    }
}
