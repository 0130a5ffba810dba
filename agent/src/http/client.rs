//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::errors::DeploymentError;

/// Error body returned by the deployment host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Category, see [`DeploymentError::kind`]
    pub error: String,
    pub message: String,
}

/// HTTP client for the deployment host
pub struct HttpClient {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, DeploymentError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            DeploymentError::ConfigError(format!("invalid base URL '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DeploymentError::ConfigError(format!(
                "'{}' cannot be used as a base URL",
                base_url
            )));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of `segments` below the base URL; each segment is percent-encoded
    pub fn url(&self, segments: &[&str]) -> Result<Url, DeploymentError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DeploymentError::ConfigError(format!("'{}' cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, DeploymentError> {
        let url = self.url(segments)?;
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).send().await?;
        Self::parse("GET", response).await
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, DeploymentError> {
        let url = self.url(segments)?;
        debug!("POST {}", url);
        let response = self.authorize(self.client.post(url).json(body)).send().await?;
        Self::parse("POST", response).await
    }

    /// Make a PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, DeploymentError> {
        let url = self.url(segments)?;
        debug!("PUT {}", url);
        let response = self.authorize(self.client.put(url).json(body)).send().await?;
        Self::parse("PUT", response).await
    }

    /// Make a DELETE request
    pub async fn delete<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, DeploymentError> {
        let url = self.url(segments)?;
        debug!("DELETE {}", url);
        let response = self.authorize(self.client.delete(url)).send().await?;
        Self::parse("DELETE", response).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Decode a success body, or turn an error body back into its category
    async fn parse<T: DeserializeOwned>(method: &str, response: Response) -> Result<T, DeploymentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => {
                debug!("HTTP {} rejected: {} - {}", method, status, err.message);
                Err(DeploymentError::from_kind(&err.error, err.message))
            }
            Err(_) => {
                error!("HTTP {} failed: {} - {}", method, status, body);
                Err(DeploymentError::ServerError(format!("{}: {}", status, body)))
            }
        }
    }
}
