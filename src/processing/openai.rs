//! OpenAI-compatible processing client
//!
//! One adapter covers the OpenAI API, Azure OpenAI deployments, and any
//! OpenAI-compatible endpoint (`custom` with a base URL, e.g. Ollama).
//! Structured output uses the `json_schema` response format; transport
//! failures retry with backoff up to the configured limit.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{ApiKind, ProviderConfig};
use crate::error::{MemoriError, Result};

use super::{ProcessingClient, StructuredReply};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    http: reqwest::Client,
    config: ProviderConfig,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let endpoint = build_endpoint(&config)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .map_err(|e| MemoriError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_type {
            ApiKind::Azure => {
                if let Some(key) = &self.config.api_key {
                    request = request.header("api-key", key);
                }
            }
            ApiKind::Openai | ApiKind::Custom => {
                if let Some(key) = &self.config.api_key {
                    request = request.bearer_auth(key);
                }
                if let Some(org) = &self.config.organization {
                    request = request.header("OpenAI-Organization", org);
                }
                if let Some(project) = &self.config.project {
                    request = request.header("OpenAI-Project", project);
                }
            }
        }
        for (name, value) in &self.config.default_headers {
            request = request.header(name, value);
        }
        if !self.config.default_query.is_empty() {
            let pairs: Vec<(&str, &str)> = self
                .config
                .default_query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            request = request.query(&pairs);
        }
        request
    }

    async fn call_once(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let request = self.apply_auth(self.http.post(&self.endpoint)).json(payload);
        let response = request
            .send()
            .await
            .map_err(|e| MemoriError::ClassifierUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoriError::ClassifierUnavailable(format!(
                "{}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoriError::ClassifierMalformed(format!(
                "{}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MemoriError::ClassifierMalformed(e.to_string()))
    }
}

fn build_endpoint(config: &ProviderConfig) -> Result<String> {
    match config.api_type {
        ApiKind::Azure => {
            let endpoint = config.azure_endpoint.as_deref().ok_or_else(|| {
                MemoriError::Config("provider.azure_endpoint required for azure".to_string())
            })?;
            let deployment = config.azure_deployment.as_deref().ok_or_else(|| {
                MemoriError::Config("provider.azure_deployment required for azure".to_string())
            })?;
            let api_version = config
                .api_version
                .as_deref()
                .unwrap_or("2024-06-01");
            Ok(format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ))
        }
        ApiKind::Openai | ApiKind::Custom => {
            let base = config
                .base_url
                .as_deref()
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/');
            Ok(format!("{}/chat/completions", base))
        }
    }
}

#[async_trait]
impl ProcessingClient for OpenAiClient {
    async fn structured(
        &self,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<StructuredReply> {
        let payload = json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_reply",
                    "strict": true,
                    "schema": schema,
                },
            },
        });

        let mut attempt = 0;
        let body = loop {
            match self.call_once(&payload).await {
                Ok(body) => break body,
                Err(e) if matches!(e, MemoriError::ClassifierUnavailable(_))
                    && attempt < self.config.max_retries =>
                {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(error = %e, attempt, "provider call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let message = &body["choices"][0]["message"];
        if let Some(refusal) = message["refusal"].as_str() {
            debug!(refusal, "provider refused structured request");
            return Ok(StructuredReply::Refusal(refusal.to_string()));
        }

        let content = message["content"].as_str().ok_or_else(|| {
            MemoriError::ClassifierMalformed("response carries no message content".to_string())
        })?;
        let parsed: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| MemoriError::ClassifierMalformed(format!("non-JSON content: {}", e)))?;

        Ok(StructuredReply::Parsed(parsed))
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_endpoint_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(
            build_endpoint(&config).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn custom_endpoint_uses_base_url() {
        let config = ProviderConfig {
            api_type: ApiKind::Custom,
            base_url: Some("http://localhost:11434/v1/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_endpoint(&config).unwrap(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn azure_endpoint_requires_deployment() {
        let config = ProviderConfig {
            api_type: ApiKind::Azure,
            azure_endpoint: Some("https://acme.openai.azure.com".to_string()),
            ..Default::default()
        };
        assert!(build_endpoint(&config).is_err());

        let config = ProviderConfig {
            api_type: ApiKind::Azure,
            azure_endpoint: Some("https://acme.openai.azure.com".to_string()),
            azure_deployment: Some("gpt4o".to_string()),
            api_version: Some("2024-06-01".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_endpoint(&config).unwrap(),
            "https://acme.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-06-01"
        );
    }
}
