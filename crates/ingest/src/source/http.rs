use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use vault_core::config::FetchConfig;

use super::traits::{DocumentSource, SourceError};

/// Fetches documents over HTTP(S) from `{base_url}/{remote_path}`.
pub struct HttpDocumentSource {
    client: Client,
    base_url: String,
}

impl HttpDocumentSource {
    pub fn new(config: &FetchConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SourceError::InvalidRequest(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base_url, remote_path.trim_start_matches('/'))
    }
}

/// Map a non-success status onto a [`SourceError`].
///
/// 429 counts as a server error: EDGAR answers it when we are going too fast
/// and a later attempt succeeds.
pub fn classify_status(status: StatusCode, path: &str) -> Option<SourceError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(SourceError::Server {
            status: status.as_u16(),
            path: path.to_string(),
        })
    } else {
        Some(SourceError::Client {
            status: status.as_u16(),
            path: path.to_string(),
        })
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    if e.is_builder() {
        SourceError::InvalidRequest(e.to_string())
    } else {
        SourceError::Transport(e.to_string())
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn download(&self, remote_path: &str, dest: &Path) -> Result<u64, SourceError> {
        let url = self.url_for(remote_path);
        debug!(%url, "Downloading filing");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        if let Some(err) = classify_status(response.status(), remote_path) {
            return Err(err);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(transport_error)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(%url, bytes = written, "Download complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK, "a/b").is_none());

        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, "a/b").unwrap();
        assert!(err.is_retryable());

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "a/b").unwrap();
        assert!(err.is_retryable());

        let err = classify_status(StatusCode::NOT_FOUND, "a/b").unwrap();
        assert!(!err.is_retryable());
        assert!(matches!(err, SourceError::Client { status: 404, .. }));
    }

    #[test]
    fn urls_join_cleanly() {
        let mut config = vault_core::Config::for_profile("").fetch;
        config.base_url = "https://www.sec.gov/Archives/".into();
        let source = HttpDocumentSource::new(&config).unwrap();
        assert_eq!(
            source.url_for("/edgar/data/1001/x.txt"),
            "https://www.sec.gov/Archives/edgar/data/1001/x.txt"
        );
    }
}
