//! Routes completion requests to the configured provider client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

use crate::io::config::{Credentials, Provider};
use crate::llm::anthropic::{AnthropicAuth, AnthropicClient};
use crate::llm::gemini::GeminiClient;
use crate::llm::{Completion, CompletionRequest, ModelProvider, ProviderError};

/// Holds one HTTP client per provider that has credentials.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    anthropic: Option<AnthropicClient>,
    gemini: Option<GeminiClient>,
}

impl ProviderRouter {
    pub fn new(credentials: &Credentials, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build HTTP client")?;
        let anthropic_auth = credentials
            .anthropic_api_key
            .clone()
            .map(AnthropicAuth::ApiKey)
            .or_else(|| {
                credentials
                    .anthropic_auth_token
                    .clone()
                    .map(AnthropicAuth::AuthToken)
            });
        Ok(Self {
            anthropic: anthropic_auth.map(|auth| AnthropicClient::new(http.clone(), auth)),
            gemini: credentials
                .gemini_api_key
                .clone()
                .map(|key| GeminiClient::new(http, key)),
        })
    }
}

impl ModelProvider for ProviderRouter {
    fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Anthropic => self.anthropic.is_some(),
            Provider::Gemini => self.gemini.is_some(),
        }
    }

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        match request.provider {
            Provider::Anthropic => self
                .anthropic
                .as_ref()
                .ok_or(ProviderError::NotConfigured(Provider::Anthropic.as_str()))?
                .complete(request),
            Provider::Gemini => self
                .gemini
                .as_ref()
                .ok_or(ProviderError::NotConfigured(Provider::Gemini.as_str()))?
                .complete(request),
        }
    }
}
