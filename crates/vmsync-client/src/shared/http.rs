use crate::shared::config::SyncConfig;
use crate::shared::error::{SyncError, SyncResult};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

const MAX_ERROR_BODY: usize = 256;

/// Thin JSON client over the dashboard REST backend.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(segment.trim_matches('/'));
        }
        url.push('/');
        url
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(String, String)],
    ) -> SyncResult<T> {
        let response = self.client.get(self.url(segments)).query(query).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> SyncResult<T> {
        let response = self.client.post(self.url(segments)).json(body).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// POST without a body whose response content is irrelevant.
    pub async fn post_empty(&self, segments: &[&str]) -> SyncResult<()> {
        let response = self.client.post(self.url(segments)).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    Err(SyncError::HttpStatus {
        status: status.as_u16(),
        message,
    })
}
