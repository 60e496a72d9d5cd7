//! Model catalogs of the remote inference services.
//!
//! Each remote service exposes a list of installed models and a way to pull one.
//! Ollama serves the LLM; Speaches serves both STT and TTS models.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// How the service answered a provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The service reported the model was already installed.
    AlreadyExisted,
    /// The service downloaded the model for this request.
    Provisioned,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl CatalogError {
    /// The service understood the request and refused it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CatalogError::Status { status, .. } if (400..500).contains(status))
    }
}

/// A remote service that hosts models.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Base address of the service, used to key provisioning state.
    fn base_url(&self) -> String;

    /// Identifiers of the models currently installed on the service.
    async fn list_models(&self) -> Result<Vec<String>, CatalogError>;

    /// Asks the service to download `model_id` and waits for it to finish.
    async fn provision(&self, model_id: &str) -> Result<PullOutcome, CatalogError>;
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CatalogError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OllamaPullStatus {
    #[serde(default)]
    status: String,
}

/// Model catalog of an Ollama server (`/api/tags`, `/api/pull`).
pub struct OllamaCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

/// Ollama lists untagged pulls as `name:latest`; expose both spellings.
fn ollama_names(tags: OllamaTags) -> Vec<String> {
    let mut names = Vec::with_capacity(tags.models.len());
    for model in tags.models {
        if let Some(stripped) = model.name.strip_suffix(":latest") {
            names.push(stripped.to_string());
        }
        names.push(model.name);
    }
    names
}

#[async_trait]
impl ModelCatalog for OllamaCatalog {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    async fn list_models(&self) -> Result<Vec<String>, CatalogError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let tags: OllamaTags = error_for_status(response).await?.json().await?;
        Ok(ollama_names(tags))
    }

    async fn provision(&self, model_id: &str) -> Result<PullOutcome, CatalogError> {
        debug!(model = %model_id, "POST /api/pull");
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&json!({ "model": model_id, "stream": false }))
            .send()
            .await?;
        let pull: OllamaPullStatus = error_for_status(response).await?.json().await?;
        if pull.status == "success" {
            Ok(PullOutcome::Provisioned)
        } else {
            Err(CatalogError::Malformed(format!(
                "pull finished with status '{}'",
                pull.status
            )))
        }
    }
}

#[derive(Deserialize)]
struct SpeachesModels {
    #[serde(default)]
    data: Vec<SpeachesModel>,
}

#[derive(Deserialize)]
struct SpeachesModel {
    id: String,
}

/// Model catalog of a Speaches server (`/v1/models`).
///
/// `POST /v1/models/{id}` answers 201 after a fresh download and 200 when the
/// model was already installed.
pub struct SpeachesCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl SpeachesCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ModelCatalog for SpeachesCatalog {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    async fn list_models(&self) -> Result<Vec<String>, CatalogError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await?;
        let models: SpeachesModels = error_for_status(response).await?.json().await?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn provision(&self, model_id: &str) -> Result<PullOutcome, CatalogError> {
        debug!(model = %model_id, "POST /v1/models/{{id}}");
        let response = self
            .client
            .post(format!("{}/v1/models/{}", self.base_url, model_id))
            .send()
            .await?;
        let response = error_for_status(response).await?;
        match response.status() {
            reqwest::StatusCode::CREATED => Ok(PullOutcome::Provisioned),
            _ => Ok(PullOutcome::AlreadyExisted),
        }
    }
}
