//! Payload and manifest retrieval

use async_trait::async_trait;
use hvnode_core::{HvnodeError, HvnodeResult};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Progress callback: `(bytes_so_far, total_bytes)`; total is 0 when unknown.
pub type Progress<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Retrieves a resource by URL into a local file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Write the resource at `url` to `dest`, returning the number of bytes
    /// written.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<Progress<'_>>,
    ) -> HvnodeResult<u64>;
}

/// Fetcher for `http(s)://` and `file://` URLs and bare local paths.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

enum Source {
    Remote(reqwest::Url),
    Local(PathBuf),
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn resolve(url: &str) -> HvnodeResult<Source> {
        match url::Url::parse(url) {
            Ok(parsed) => match parsed.scheme() {
                "http" | "https" => Ok(Source::Remote(parsed)),
                "file" => parsed.to_file_path().map(Source::Local).map_err(|_| {
                    HvnodeError::InvalidInput {
                        field: "url".to_string(),
                        message: format!("'{}' is not a valid file URL", url),
                    }
                }),
                // A Windows drive letter parses as a one-letter scheme.
                scheme if scheme.len() == 1 => Ok(Source::Local(PathBuf::from(url))),
                scheme => Err(HvnodeError::InvalidInput {
                    field: "url".to_string(),
                    message: format!("unsupported scheme '{}'", scheme),
                }),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Source::Local(PathBuf::from(url))),
            Err(e) => Err(HvnodeError::InvalidInput {
                field: "url".to_string(),
                message: format!("'{}': {}", url, e),
            }),
        }
    }

    async fn get(&self, url: reqwest::Url) -> HvnodeResult<reqwest::Response> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        mut progress: Option<Progress<'_>>,
    ) -> HvnodeResult<u64> {
        let mut out = tokio::fs::File::create(dest).await?;
        let mut so_far = 0u64;

        match Self::resolve(url)? {
            Source::Remote(remote) => {
                info!("Downloading {}", remote);
                let mut response = self.get(remote).await?;
                let total = response.content_length().unwrap_or(0);
                while let Some(chunk) = response.chunk().await? {
                    out.write_all(&chunk).await?;
                    so_far += chunk.len() as u64;
                    if let Some(report) = progress.as_mut() {
                        report(so_far, total);
                    }
                }
            }
            Source::Local(path) => {
                debug!("Copying {}", path.display());
                let mut input = tokio::fs::File::open(&path).await?;
                let total = input.metadata().await?.len();
                let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
                loop {
                    let read = input.read(&mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    out.write_all(&buffer[..read]).await?;
                    so_far += read as u64;
                    if let Some(report) = progress.as_mut() {
                        report(so_far, total);
                    }
                }
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(so_far)
    }
}
