//! Streaming HTTP download with the `.tmp` + rename pattern, so a reader
//! observing the final path sees either nothing or fully-written bytes.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected status {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// `.tmp` sibling of a destination path.
pub fn tmp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Download `url` into `dest`, streaming through a `.tmp` sibling that is
/// renamed into place on success and removed on failure.
pub async fn download_to(client: &Client, url: &str, dest: &Path) -> Result<(), DownloadError> {
    let tmp = tmp_sibling(dest);
    match stream_to(client, url, &tmp).await {
        Ok(bytes) => {
            tokio::fs::rename(&tmp, dest).await?;
            debug!(url, dest = %dest.display(), bytes, "download complete");
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn stream_to(client: &Client, url: &str, tmp: &Path) -> Result<u64, DownloadError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status,
        });
    }

    let mut file = tokio::fs::File::create(tmp).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
