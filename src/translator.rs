// src/translator.rs

use crate::types::TranslateConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Description -> localized description. Fail-soft: a translation failure
/// must never cost the alert, so callers always get text back.
pub trait Translator: Send + Sync {
    fn to_spanish(&self, text: &str) -> String;
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

pub struct HttpTranslator {
    http_client: reqwest::blocking::Client,
    server_url: String,
}

impl HttpTranslator {
    pub fn new(config: &TranslateConfig) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build translate HTTP client")?;

        Ok(Self {
            http_client,
            server_url: config.server_url.clone(),
        })
    }

    fn request(&self, text: &str) -> Result<String> {
        let url = format!("{}/translate", self.server_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(&url)
            .json(&TranslateRequest {
                q: text,
                source: "en",
                target: "es",
            })
            .send()
            .context("Translate request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Translate server returned {}", response.status());
        }

        let parsed: TranslateResponse = response
            .json()
            .context("Failed to parse translate response")?;
        Ok(parsed.translated_text)
    }
}

impl Translator for HttpTranslator {
    fn to_spanish(&self, text: &str) -> String {
        match self.request(text) {
            Ok(translated) => translated,
            Err(e) => {
                warn!("❌ Translation failed, keeping original text: {e:#}");
                text.to_string()
            }
        }
    }
}
