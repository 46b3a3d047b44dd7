use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::info;

use crate::types::FirmwareManifest;

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// The firmware distribution endpoint.
#[async_trait]
pub trait UpdateServer: Send + Sync {
    async fn fetch_manifest(&self) -> Result<FirmwareManifest>;
    async fn download_program(&self) -> Result<Vec<u8>>;
}

pub struct HttpUpdateServer {
    client: Client,
    base_url: String,
}

impl HttpUpdateServer {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(HttpUpdateServer {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UpdateServer for HttpUpdateServer {
    async fn fetch_manifest(&self) -> Result<FirmwareManifest> {
        let url = format!("{}/manifest", self.base_url);
        let manifest = self
            .client
            .get(&url)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<FirmwareManifest>()
            .await?;
        Ok(manifest)
    }

    async fn download_program(&self) -> Result<Vec<u8>> {
        let url = format!("{}/script", self.base_url);
        info!("Downloading firmware from {}", url);
        let response = self.client.get(&url).timeout(DOWNLOAD_TIMEOUT).send().await?;
        let bytes = response.error_for_status()?.bytes().await?.to_vec();
        info!("Firmware downloaded successfully ({} bytes).", bytes.len());
        Ok(bytes)
    }
}
