use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::ServerInfo;
use crate::error::{AppError, AppResult};

/// Load figures a probe may report back
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
}

/// Active health check against one backend server
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, server: &ServerInfo) -> AppResult<ProbeReport>;
}

/// `GET http://host:port<path>`; any 2xx is healthy. A JSON body with
/// `cpu_usage`/`memory_usage` updates the server's load.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, server: &ServerInfo) -> AppResult<ProbeReport> {
        let url = format!("http://{}{}", server.address(), self.path);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Network(format!(
                "health probe {} returned {}",
                url,
                response.status()
            )));
        }

        // body is optional
        Ok(response.json::<ProbeReport>().await.unwrap_or_default())
    }
}
