//! Azure Blob Storage uploader over the REST API, authorised by a container
//! SAS token. Small artifacts go up with a single Put Blob; larger ones are
//! staged with Put Block and committed with Put Block List.

use super::uploader::{collision_name, expired_artifacts, BackupUploader, UploadReceipt};
use super::UploadSettings;
use crate::backup::Artifact;
use crate::credentials::Credential;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Body, Client, Method, StatusCode, Url};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use zeroize::Zeroizing;

const API_VERSION: &str = "2021-08-06";
const MAX_COLLISIONS: u32 = 1000;

pub struct BlobUploader {
    client: Client,
    container_url: Url,
    folder: Option<String>,
    sas: Zeroizing<String>,
    chunk_threshold: u64,
    chunk_size: usize,
}

impl BlobUploader {
    pub fn new(
        container_url: &str,
        folder: Option<String>,
        credential: &Credential,
        settings: &UploadSettings,
    ) -> Result<Self> {
        let container_url = Url::parse(container_url.trim_end_matches('/'))
            .map_err(|e| BackupError::Config(format!("invalid container URL '{}': {}", container_url, e)))?;
        if container_url.query().is_some() {
            return Err(BackupError::Config(
                "container URL must not carry a query string; store the SAS token as a credential".into(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| BackupError::Upload(format!("failed to build HTTP client: {}", e)))?;

        let folder = folder
            .map(|f| f.trim_matches('/').to_string())
            .filter(|f| !f.is_empty());

        Ok(Self {
            client,
            container_url,
            folder,
            sas: Zeroizing::new(credential.secret().trim_start_matches('?').to_string()),
            chunk_threshold: settings.blob_chunk_threshold,
            chunk_size: settings.blob_chunk_size,
        })
    }

    fn blob_path(&self, file_name: &str) -> String {
        match &self.folder {
            Some(folder) => format!("{}/{}", folder, file_name),
            None => file_name.to_string(),
        }
    }

    /// Public location of a blob, without the SAS token.
    fn location(&self, blob_path: &str) -> String {
        format!("{}/{}", self.container_url.as_str().trim_end_matches('/'), blob_path)
    }

    fn url(&self, blob_path: Option<&str>, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.container_url.clone();
        if let Some(path) = blob_path {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackupError::Config("container URL cannot be a base".into()))?;
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        let query = match url.query() {
            Some(q) if !q.is_empty() => format!("{}&{}", q, self.sas.as_str()),
            _ => self.sas.to_string(),
        };
        url.set_query(Some(&query));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client.request(method, url).header("x-ms-version", API_VERSION)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &format!("{}: {}", context, error_code(&body))))
    }

    /// Like `send`, but a write refused because the blob already exists
    /// yields `Ok(false)`.
    async fn send_if_absent(&self, builder: reqwest::RequestBuilder, context: &str) -> Result<bool> {
        let response = builder.header(IF_NONE_MATCH, "*").send().await?;
        let status = response.status();
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(false),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_status(status, &format!("{}: {}", context, error_code(&body))))
            }
        }
    }

    async fn exists(&self, blob_path: &str) -> Result<bool> {
        let url = self.url(Some(blob_path), &[])?;
        let response = self.request(Method::HEAD, url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(classify_status(s, "cannot check blob")),
        }
    }

    async fn ensure_container(&self) -> Result<()> {
        let list = self.url(None, &[("restype", "container"), ("comp", "list"), ("maxresults", "1")])?;
        let response = self.request(Method::GET, list).send().await?;
        match response.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => return Err(classify_status(s, "cannot list container")),
        }

        let create = self.url(None, &[("restype", "container")])?;
        let response = self
            .request(Method::PUT, create)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => {
                info!("Created container {}", self.container_url);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            s => Err(classify_status(s, "cannot create container")),
        }
    }

    async fn put_blob(&self, artifact: &Artifact, blob_path: &str) -> Result<bool> {
        let file = File::open(artifact.path()).await?;
        let url = self.url(Some(blob_path), &[])?;
        let builder = self
            .request(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, "application/zip")
            .header(CONTENT_LENGTH, artifact.size())
            .body(Body::wrap_stream(ReaderStream::new(file)));
        self.send_if_absent(builder, "put blob").await
    }

    async fn put_blocks(&self, artifact: &Artifact, blob_path: &str) -> Result<bool> {
        let mut file = File::open(artifact.path()).await?;
        let mut block_ids = Vec::new();
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            let filled = read_full(&mut file, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            let block_id = STANDARD.encode(format!("{:08}", block_ids.len()));
            let url = self.url(Some(blob_path), &[("comp", "block"), ("blockid", &block_id)])?;
            let builder = self
                .request(Method::PUT, url)
                .header(CONTENT_LENGTH, filled)
                .body(buffer[..filled].to_vec());
            self.send(builder, "put block").await?;
            debug!("Staged block {} ({} bytes) of {}", block_ids.len(), filled, blob_path);
            block_ids.push(block_id);
        }

        let url = self.url(Some(blob_path), &[("comp", "blocklist")])?;
        let manifest = block_list_xml(&block_ids);
        let builder = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "application/xml")
            .header("x-ms-blob-content-type", "application/zip")
            .body(manifest);
        self.send_if_absent(builder, "put block list").await
    }

    /// Blob names below the folder prefix, following continuation markers.
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker = String::new();
        loop {
            let mut params = vec![("restype", "container"), ("comp", "list"), ("prefix", prefix)];
            if !marker.is_empty() {
                params.push(("marker", marker.as_str()));
            }
            let url = self.url(None, &params)?;
            let body = self
                .send(self.request(Method::GET, url), "list blobs")
                .await?
                .text()
                .await?;
            names.extend(xml_values(&body, "Name"));
            marker = xml_values(&body, "NextMarker").into_iter().next().unwrap_or_default();
            if marker.is_empty() {
                return Ok(names);
            }
        }
    }
}

#[async_trait]
impl BackupUploader for BlobUploader {
    async fn upload(&self, artifact: &Artifact) -> Result<UploadReceipt> {
        self.ensure_container().await?;

        let chunked = artifact.size() > self.chunk_threshold;
        for n in 0..=MAX_COLLISIONS {
            let candidate = if n == 0 {
                artifact.file_name().to_string()
            } else {
                collision_name(artifact.file_name(), n)
            };
            let blob_path = self.blob_path(&candidate);

            let stored = if chunked {
                // skip staging blocks for a name that is visibly taken
                !self.exists(&blob_path).await? && self.put_blocks(artifact, &blob_path).await?
            } else {
                self.put_blob(artifact, &blob_path).await?
            };
            if !stored {
                debug!("{} exists, trying next name", blob_path);
                continue;
            }

            let location = self.location(&blob_path);
            info!("Uploaded {} bytes to {}", artifact.size(), location);
            return Ok(UploadReceipt {
                location,
                bytes: artifact.size(),
            });
        }
        Err(BackupError::Upload(format!(
            "no free blob name for {} in {}",
            artifact.file_name(),
            self.container_url
        )))
    }

    async fn test_connection(&self) -> Result<()> {
        let url = self.url(None, &[("restype", "container"), ("comp", "list"), ("maxresults", "1")])?;
        self.send(self.request(Method::GET, url), "list container").await?;
        Ok(())
    }

    async fn prune(&self, job_id: &str, keep: usize) -> Result<usize> {
        let prefix = self.blob_path(&format!("{}_", job_id));
        let dir = self.folder.as_ref().map(|f| format!("{}/", f)).unwrap_or_default();

        let names: Vec<String> = self
            .list_names(&prefix)
            .await?
            .into_iter()
            .filter_map(|n| n.strip_prefix(&dir).map(str::to_string))
            .filter(|n| !n.contains('/'))
            .collect();

        let mut deleted = 0;
        for name in expired_artifacts(&names, job_id, keep) {
            let url = self.url(Some(&self.blob_path(&name)), &[])?;
            self.send(self.request(Method::DELETE, url), "delete blob").await?;
            debug!("Deleted old backup {}", name);
            deleted += 1;
        }
        Ok(deleted)
    }

    fn name(&self) -> &'static str {
        "Blob"
    }
}

pub(crate) fn classify_status(status: StatusCode, context: &str) -> BackupError {
    let msg = format!("{} (HTTP {})", context, status.as_u16());
    match status.as_u16() {
        401 | 403 => BackupError::UploadAuth(msg),
        408 | 429 | 500..=599 => BackupError::UploadTransient(msg),
        _ => BackupError::Upload(msg),
    }
}

async fn read_full(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Text of every `<tag>...</tag>` element. The listing responses are flat
/// enough that a scan is all that is needed.
fn xml_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else {
            break;
        };
        values.push(element_text(&rest[..end]));
        rest = &rest[end + close.len()..];
    }
    values
}

/// Element content with CDATA sections taken verbatim and entity references
/// (named and numeric) resolved everywhere else.
fn element_text(raw: &str) -> String {
    let mut text = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("<![CDATA[") {
        text.push_str(&unescape(&rest[..start]));
        let body = &rest[start + 9..];
        match body.find("]]>") {
            Some(end) => {
                text.push_str(&body[..end]);
                rest = &body[end + 3..];
            }
            None => {
                text.push_str(body);
                return text;
            }
        }
    }
    text.push_str(&unescape(rest));
    text
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let resolved = tail.find(';').and_then(|semi| {
            let ch = match &tail[1..semi] {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                entity => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });
        match resolved {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn error_code(body: &str) -> String {
    xml_values(body, "Code")
        .into_iter()
        .next()
        .unwrap_or_else(|| "no error code".to_string())
}
