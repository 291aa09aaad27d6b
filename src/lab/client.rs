//! HTTP access to the lab endpoints

use crate::config::ClientConfig;
use crate::error::{LabError, LabResult};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Path of the lab endpoint, relative to the base URL
pub const LAB_PATH: &str = "/api/app/lab";

/// Body of a streamed module execution
#[derive(Debug, Clone, Serialize)]
struct ExecuteRequest<'a> {
    module: &'a str,
    args: &'a BTreeMap<String, String>,
}

/// Client for the lab server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LabClient {
    http: Client,
    base_url: String,
}

impl LabClient {
    /// Create a client with default connection settings
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Create a client from configuration
    pub fn from_config(config: &ClientConfig) -> LabResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| LabError::config_error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of the lab endpoint
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), LAB_PATH)
    }

    /// `GET /api/app/lab?module=<name>`; the JSON body is returned untouched
    pub async fn fetch_module_spec(&self, module: &str) -> LabResult<serde_json::Value> {
        info!("Fetching spec for module {}", module);

        let response = self
            .http
            .get(self.endpoint())
            .query(&[("module", module)])
            .send()
            .await?;

        let response = check_status(response)?;
        let value = response.json::<serde_json::Value>().await?;

        debug!("Received spec for module {}", module);
        Ok(value)
    }

    /// `POST /api/app/lab` and hand back the open SSE response
    pub async fn open_module_stream(
        &self,
        module: &str,
        args: &BTreeMap<String, String>,
    ) -> LabResult<Response> {
        info!("Executing module {} with {} args", module, args.len());

        let response = self
            .http
            .post(self.endpoint())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(&ExecuteRequest { module, args })
            .send()
            .await?;

        let response = check_status(response)?;

        if response.status() == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            warn!("Module {} stream has an empty body", module);
            return Err(LabError::EmptyBody);
        }

        Ok(response)
    }
}

fn check_status(response: Response) -> LabResult<Response> {
    let status = response.status();
    if !status.is_success() {
        warn!("Lab server answered {} for {}", status, response.url());
        return Err(LabError::status(status.as_u16()));
    }
    Ok(response)
}
