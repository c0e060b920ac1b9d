use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmuxError;
use crate::providers::common::{missing_endpoint, parse_failure, send_checked};
use crate::types::{BackendName, ProviderSettings};

/// One entry of a backend's model catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
    size: Option<u64>,
}

#[derive(Deserialize)]
struct OpenAiModelPage {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Deserialize)]
struct OpenAiModel {
    id: String,
    owned_by: Option<String>,
}

/// List installed (Ollama) or served (OpenAI-compatible) models.
pub async fn list_models(
    client: &Client,
    backend: BackendName,
    settings: &ProviderSettings,
) -> Result<Vec<ModelInfo>, LlmuxError> {
    match backend {
        BackendName::Ollama => {
            let endpoint = settings.endpoint().ok_or_else(|| missing_endpoint(backend))?;
            let response = send_checked(backend, client.get(format!("{endpoint}/api/tags"))).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| parse_failure(backend, e))?;
            let tags: OllamaTags =
                serde_json::from_slice(&bytes).map_err(|e| parse_failure(backend, e))?;
            Ok(tags
                .models
                .into_iter()
                .map(|t| ModelInfo {
                    id: t.name,
                    owned_by: None,
                    size_bytes: t.size,
                })
                .collect())
        }
        BackendName::OpenAiCompatible => {
            let endpoint = settings.endpoint().ok_or_else(|| missing_endpoint(backend))?;
            let mut request = client.get(format!("{endpoint}/models"));
            if let Some(key) = settings.api_key() {
                request = request.bearer_auth(key);
            }
            let response = send_checked(backend, request).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| parse_failure(backend, e))?;
            let page: OpenAiModelPage =
                serde_json::from_slice(&bytes).map_err(|e| parse_failure(backend, e))?;
            Ok(page
                .data
                .into_iter()
                .map(|m| ModelInfo {
                    id: m.id,
                    owned_by: m.owned_by,
                    size_bytes: None,
                })
                .collect())
        }
        other => Err(LlmuxError::Configuration {
            backend: other.to_string(),
            message: format!("model listing is not supported for {}", other.title()),
        }),
    }
}
