use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{Result, RenderError};

/// Brings a source media reference onto local storage
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `source` into `destination`, returning the local path
    async fn fetch(&self, source: &str, destination: &Path) -> Result<PathBuf>;
}

/// Fetches `http(s)://` references over the network and copies `file://` or plain paths
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lyric-render/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<PathBuf> {
        info!("Downloading source media {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RenderError::Download(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(RenderError::Download(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let temp_path = destination.with_extension("part");
        let mut file = fs::File::create(&temp_path).await?;
        let mut downloaded = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RenderError::Download(format!("{}: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);

        fs::rename(&temp_path, destination).await?;
        info!("Downloaded {} bytes to {}", downloaded, destination.display());

        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &str, destination: &Path) -> Result<PathBuf> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.download(source, destination).await;
        }

        let local = source.strip_prefix("file://").unwrap_or(source);
        info!("Copying local source media {}", local);
        fs::copy(local, destination)
            .await
            .map_err(|e| RenderError::Download(format!("{}: {}", local, e)))?;

        Ok(destination.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_local_path_and_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("song.mp3");
        std::fs::write(&source, b"ID3").unwrap();

        let fetcher = HttpFetcher::new().unwrap();

        let plain = fetcher
            .fetch(&source.to_string_lossy(), &dir.path().join("a"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(plain).unwrap(), b"ID3");

        let url = format!("file://{}", source.display());
        let via_url = fetcher.fetch(&url, &dir.path().join("b")).await.unwrap();
        assert_eq!(std::fs::read(via_url).unwrap(), b"ID3");
    }

    #[tokio::test]
    async fn test_missing_source_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch("/nonexistent/song.mp3", &dir.path().join("source"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Download(_)));
    }

    #[tokio::test]
    async fn test_http_fetch_and_error_status() {
        use axum::{Router, routing::get};

        let app = Router::new().route("/song.mp3", get(|| async { "audio-bytes" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let path = fetcher
            .fetch(&format!("http://{}/song.mp3", addr), &dir.path().join("source"))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "audio-bytes");

        let err = fetcher
            .fetch(&format!("http://{}/missing.mp3", addr), &dir.path().join("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Download(ref msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch("http://127.0.0.1:1/song.mp3", &dir.path().join("source"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Download(_)));
    }
}
