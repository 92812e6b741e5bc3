//! Firmware payload sources for multipart uploads

use std::io;
use std::path::PathBuf;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use url::Url;

use crate::errors::ProtocolError;

const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_FILENAME: &str = "firmware.bin";

pub type PayloadStream = BoxStream<'static, io::Result<Vec<u8>>>;

/// Where a payload is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadLocation {
    Remote(Url),
    Local(PathBuf),
}

/// A re-openable payload reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSource {
    location: PayloadLocation,
    filename: String,
}

/// An opened payload stream
pub struct OpenedPayload {
    pub stream: PayloadStream,
    pub size: Option<u64>,
    pub filename: String,
}

impl PayloadSource {
    /// Parse an `http(s)://` URL, `file://` URL or local path
    pub fn parse(reference: &str) -> Result<Self, ProtocolError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ProtocolError::Payload("Empty payload reference".to_string()));
        }

        if let Ok(url) = Url::parse(reference) {
            match url.scheme() {
                "http" | "https" => {
                    let filename = url
                        .path_segments()
                        .and_then(|mut segments| segments.next_back())
                        .filter(|name| !name.is_empty())
                        .unwrap_or(DEFAULT_FILENAME)
                        .to_string();
                    return Ok(Self {
                        location: PayloadLocation::Remote(url),
                        filename,
                    });
                }
                "file" => {
                    let path = url.to_file_path().map_err(|_| {
                        ProtocolError::Payload(format!("Invalid file URL {}", reference))
                    })?;
                    return Ok(Self::local(path));
                }
                // single letter schemes are drive letters
                scheme if scheme.len() == 1 => {}
                scheme => {
                    return Err(ProtocolError::Payload(format!(
                        "Unsupported payload scheme {}",
                        scheme
                    )))
                }
            }
        }

        Ok(Self::local(PathBuf::from(reference)))
    }

    fn local(path: PathBuf) -> Self {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
        Self {
            location: PayloadLocation::Local(path),
            filename,
        }
    }

    pub fn location(&self) -> &PayloadLocation {
        &self.location
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Open a fresh stream over the payload
    pub async fn open(&self, http: &Client) -> Result<OpenedPayload, ProtocolError> {
        match &self.location {
            PayloadLocation::Remote(url) => {
                let response = http.get(url.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(ProtocolError::Payload(format!(
                        "Fetching {} returned HTTP {}",
                        url,
                        response.status().as_u16()
                    )));
                }
                let size = response.content_length();
                let stream = response
                    .bytes_stream()
                    .map_ok(|chunk| chunk.to_vec())
                    .map_err(io::Error::other)
                    .boxed();
                Ok(OpenedPayload {
                    stream,
                    size,
                    filename: self.filename.clone(),
                })
            }
            PayloadLocation::Local(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    ProtocolError::Payload(format!("Failed to open {}: {}", path.display(), e))
                })?;
                let size = file.metadata().await.ok().map(|meta| meta.len());
                Ok(OpenedPayload {
                    stream: file_chunks(file),
                    size,
                    filename: self.filename.clone(),
                })
            }
        }
    }
}

fn file_chunks(file: tokio::fs::File) -> PayloadStream {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok::<_, io::Error>(None);
        }
        buf.truncate(read);
        Ok(Some((buf, file)))
    })
    .boxed()
}

async fn buffer(mut stream: PayloadStream) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

/// Multipart upload body, rebuilt per attempt
#[derive(Debug, Clone)]
pub struct MultipartSpec {
    /// Serialized `UpdateParameters` JSON
    pub parameters: String,
    pub source: PayloadSource,
}

impl MultipartSpec {
    /// Build the `UpdateParameters` + `UpdateFile` form.
    ///
    /// Payloads of known size are streamed with a Content-Length. Unknown
    /// sizes are buffered; if the source stream ends early while buffering,
    /// the source is reopened and streamed without a length.
    pub async fn build_form(&self, http: &Client) -> Result<Form, ProtocolError> {
        let parameters = Part::text(self.parameters.clone()).mime_str("application/json")?;

        let OpenedPayload {
            stream,
            size,
            filename,
        } = self.source.open(http).await?;

        let file = match size {
            Some(size) => {
                debug!("Streaming {} ({} bytes)", filename, size);
                Part::stream_with_length(Body::wrap_stream(stream), size)
            }
            None => match buffer(stream).await {
                Ok(data) => {
                    debug!("Buffered {} ({} bytes)", filename, data.len());
                    Part::bytes(data)
                }
                Err(e) => {
                    warn!(
                        "Payload stream for {} closed early ({}), streaming without length",
                        filename, e
                    );
                    let reopened = self.source.open(http).await?;
                    Part::stream(Body::wrap_stream(reopened.stream))
                }
            },
        };
        let file = file
            .file_name(filename)
            .mime_str("application/octet-stream")?;

        Ok(Form::new()
            .part("UpdateParameters", parameters)
            .part("UpdateFile", file))
    }
}
