//! HTTP client for one registry endpoint.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Method, RequestBuilder, Response, StatusCode};
use strata_core::config::{RegistryConfig, UploadMode};
use strata_core::error::{Result, StrataError};
use strata_core::media_type;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::auth::RegistryAuth;
use crate::digest::{Digest, StreamingDigest};
use crate::manifest::ImageManifest;

/// Base delay between retried GET/HEAD attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// A session against one registry, shared by every operation on it.
///
/// Redirects are never followed: a 3xx answer to an existence check means
/// "present", and a redirect in answer to a mount means it was not honored.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base: Url,
    auth: RegistryAuth,
    retries: u32,
    chunk_size: u64,
    upload_mode: UploadMode,
    public_host: Option<String>,
    cancel: CancellationToken,
}

impl RegistryClient {
    /// Build a client from registry settings, with credentials from the
    /// config or the environment.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        Self::with_auth(config, RegistryAuth::from_config(config))
    }

    pub fn with_auth(config: &RegistryConfig, auth: RegistryAuth) -> Result<Self> {
        let mut base = Url::parse(&config.url).map_err(|e| {
            StrataError::ConfigError(format!("Invalid registry url '{}': {}", config.url, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let http = builder.build().map_err(|e| {
            StrataError::ConfigError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            http,
            base,
            auth,
            retries: config.retries,
            chunk_size: config.chunk_size.max(1),
            upload_mode: config.upload_mode,
            public_host: config.public_host.clone(),
            cancel: CancellationToken::new(),
        })
    }

    /// Tie every operation of this client to `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn upload_mode(&self) -> UploadMode {
        self.upload_mode
    }

    /// `host[:port]` of the registry endpoint.
    pub fn registry_host(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Host used in published image URIs.
    pub fn public_host(&self) -> String {
        self.public_host
            .clone()
            .unwrap_or_else(|| self.registry_host())
    }

    // --- existence ---

    /// `HEAD /v2/{repo}/blobs/{digest}`.
    pub async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<bool> {
        let url = self.entity_url(repo, "blobs", &digest.to_string())?;
        self.guard("blob existence check", self.entity_exists(repo, url))
            .await
    }

    /// `HEAD /v2/{repo}/manifests/{reference}`.
    pub async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<bool> {
        let url = self.entity_url(repo, "manifests", reference)?;
        self.guard("manifest existence check", self.entity_exists(repo, url))
            .await
    }

    async fn entity_exists(&self, repo: &str, url: Url) -> Result<bool> {
        let response = self.send_idempotent(Method::HEAD, &url, None).await?;
        let status = response.status();
        tracing::debug!(repo, url = %url, status = status.as_u16(), "HEAD");
        if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else if status.is_success() || status.is_redirection() {
            Ok(true)
        } else {
            Err(registry_error(repo, &url, response).await)
        }
    }

    // --- upload ---

    /// `POST /v2/{repo}/blobs/uploads/`, returning the session location.
    pub async fn start_upload(&self, repo: &str) -> Result<Url> {
        self.guard("upload start", async {
            let url = self.uploads_url(repo)?;
            let response = self.send(self.request(Method::POST, &url), &url).await?;
            let response = check_success(repo, &url, response).await?;
            self.location(repo, &url, &response)
        })
        .await
    }

    /// Upload a blob using the configured upload mode.
    pub async fn upload_blob(
        &self,
        repo: &str,
        digest: &Digest,
        path: &Path,
        content_type: &str,
    ) -> Result<()> {
        match self.upload_mode {
            UploadMode::Monolithic => {
                self.monolithic_upload(repo, digest, path, content_type)
                    .await
            }
            UploadMode::Chunked => self.chunked_upload(repo, digest, path).await,
        }
    }

    /// Start a session and complete it with one streamed `PUT ?digest=`.
    pub async fn monolithic_upload(
        &self,
        repo: &str,
        digest: &Digest,
        path: &Path,
        content_type: &str,
    ) -> Result<()> {
        self.guard("monolithic upload", async {
            let location = self.start_upload(repo).await?;
            let url = with_digest(location, digest);

            let file = tokio::fs::File::open(path).await.map_err(|e| {
                StrataError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open blob {}: {}", path.display(), e),
                ))
            })?;
            let size = file.metadata().await?.len();
            let body = Body::wrap_stream(ReaderStream::new(file));

            let request = self
                .request(Method::PUT, &url)
                .header(CONTENT_TYPE, content_type)
                .header(CONTENT_LENGTH, size)
                .body(body);
            let response = self.send(request, &url).await?;
            check_success(repo, &url, response).await?;

            tracing::info!(repo, digest = %digest, size, "Uploaded blob");
            Ok(())
        })
        .await
    }

    /// Upload a blob as sequential `PATCH` chunks followed by `PUT ?digest=`.
    ///
    /// Each chunk goes to the location returned by the previous response.
    /// A failed or cancelled session is abandoned, never resumed.
    pub async fn chunked_upload(&self, repo: &str, digest: &Digest, path: &Path) -> Result<()> {
        self.guard("chunked upload", async {
            let mut location = self.start_upload(repo).await?;
            let mut file = tokio::fs::File::open(path).await.map_err(|e| {
                StrataError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open blob {}: {}", path.display(), e),
                ))
            })?;

            let mut offset: u64 = 0;
            loop {
                let mut chunk = Vec::new();
                (&mut file)
                    .take(self.chunk_size)
                    .read_to_end(&mut chunk)
                    .await?;
                if chunk.is_empty() {
                    break;
                }
                let len = chunk.len() as u64;
                let range = format!("{}-{}", offset, offset + len - 1);

                let request = self
                    .request(Method::PATCH, &location)
                    .header(CONTENT_TYPE, media_type::OCTET_STREAM)
                    .header(CONTENT_LENGTH, len)
                    .header(CONTENT_RANGE, range.as_str())
                    .body(chunk);
                let response = self.send(request, &location).await?;
                let response = check_success(repo, &location, response).await?;
                tracing::debug!(repo, digest = %digest, range = %range, "Uploaded chunk");

                location = self.location(repo, &location, &response)?;
                offset += len;
            }

            let url = with_digest(location, digest);
            let request = self
                .request(Method::PUT, &url)
                .header(CONTENT_TYPE, media_type::OCTET_STREAM)
                .header(CONTENT_LENGTH, 0)
                .body(Vec::new());
            let response = self.send(request, &url).await?;
            check_success(repo, &url, response).await?;

            tracing::info!(repo, digest = %digest, size = offset, "Uploaded blob in chunks");
            Ok(())
        })
        .await
    }

    /// `POST /v2/{repo}/blobs/uploads/?mount={digest}&from={from}`.
    ///
    /// Only `201 Created` counts as a mount; anything else, including a
    /// regular upload session, is `MountRejected`.
    pub async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<()> {
        self.guard("blob mount", async {
            let mut url = self.uploads_url(repo)?;
            url.query_pairs_mut()
                .append_pair("mount", &digest.to_string())
                .append_pair("from", from);

            let response = self.send(self.request(Method::POST, &url), &url).await?;
            let status = response.status();
            if status != StatusCode::CREATED {
                return Err(StrataError::MountRejected {
                    repo: repo.to_string(),
                    digest: digest.to_string(),
                    from: from.to_string(),
                    status: status.as_u16(),
                });
            }

            tracing::info!(repo, digest = %digest, from, "Mounted blob");
            Ok(())
        })
        .await
    }

    // --- manifests ---

    /// `PUT /v2/{repo}/manifests/{reference}` with the schema 2 content type.
    pub async fn put_manifest(&self, repo: &str, reference: &str, path: &Path) -> Result<()> {
        self.guard("manifest put", async {
            let url = self.entity_url(repo, "manifests", reference)?;
            let body = tokio::fs::read(path).await.map_err(|e| {
                StrataError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read manifest {}: {}", path.display(), e),
                ))
            })?;

            let request = self
                .request(Method::PUT, &url)
                .header(CONTENT_TYPE, media_type::MANIFEST_V2)
                .body(body);
            let response = self.send(request, &url).await?;
            check_success(repo, &url, response).await?;

            tracing::info!(repo, reference, "Pushed manifest");
            Ok(())
        })
        .await
    }

    /// `GET /v2/{repo}/manifests/{reference}` accepting schema 2.
    pub async fn get_manifest(&self, repo: &str, reference: &str) -> Result<ImageManifest> {
        self.guard("manifest get", async {
            let url = self.entity_url(repo, "manifests", reference)?;
            let response = self
                .send_idempotent(Method::GET, &url, Some(media_type::MANIFEST_V2))
                .await?;
            let response = check_success(repo, &url, response).await?;
            let body = response.bytes().await.map_err(|e| transport(&url, e))?;
            Ok(serde_json::from_slice(&body)?)
        })
        .await
    }

    // --- blobs ---

    /// Fetch a small blob (an image config) into memory, verifying its digest.
    pub async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        self.guard("blob get", async {
            let url = self.entity_url(repo, "blobs", &digest.to_string())?;
            let response = self.send_idempotent(Method::GET, &url, None).await?;
            let response = check_success(repo, &url, response).await?;
            let body = response.bytes().await.map_err(|e| transport(&url, e))?;

            let actual = Digest::of_bytes(&body);
            if &actual != digest {
                return Err(StrataError::ContentMismatch {
                    path: url.to_string(),
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            Ok(body.to_vec())
        })
        .await
    }

    /// Stream a blob to `dest`, hashing as it arrives.
    ///
    /// Returns the response content type. A digest mismatch is
    /// `ContentMismatch`; the partial file is removed.
    pub async fn download_blob(&self, repo: &str, digest: &Digest, dest: &Path) -> Result<String> {
        self.guard("blob download", async {
            let url = self.entity_url(repo, "blobs", &digest.to_string())?;
            let response = self.send_idempotent(Method::GET, &url, None).await?;
            let mut response = check_success(repo, &url, response).await?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(media_type::LAYER_TAR)
                .to_string();

            let mut file = tokio::fs::File::create(dest).await?;
            let mut hasher = StreamingDigest::new();
            while let Some(chunk) = response.chunk().await.map_err(|e| transport(&url, e))? {
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);

            let size = hasher.len();
            let actual = hasher.finalize();
            if &actual != digest {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(StrataError::ContentMismatch {
                    path: dest.display().to_string(),
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }

            tracing::debug!(repo, digest = %digest, size, "Downloaded blob");
            Ok(content_type)
        })
        .await
    }

    // --- plumbing ---

    fn entity_url(&self, repo: &str, kind: &str, reference: &str) -> Result<Url> {
        self.join(&format!("v2/{}/{}/{}", repo, kind, reference))
    }

    fn uploads_url(&self, repo: &str) -> Result<Url> {
        self.join(&format!("v2/{}/blobs/uploads/", repo))
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| StrataError::Other(format!("Invalid registry path '{}': {}", path, e)))
    }

    /// Resolve the `Location` header of an upload response against the URL
    /// of the request that produced it.
    fn location(&self, repo: &str, url: &Url, response: &Response) -> Result<Url> {
        let value = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StrataError::RegistryError {
                repo: repo.to_string(),
                url: url.to_string(),
                status: response.status().as_u16(),
                body: "missing Location header".to_string(),
            })?;
        url.join(value).map_err(|e| {
            StrataError::Other(format!("Invalid upload location '{}': {}", value, e))
        })
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.auth.apply(self.http.request(method, url.clone()))
    }

    /// Send once. Used for every verb with side effects.
    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response> {
        request.send().await.map_err(|e| transport(url, e))
    }

    /// Send a GET or HEAD, retrying transport failures.
    async fn send_idempotent(
        &self,
        method: Method,
        url: &Url,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let mut request = self.request(method.clone(), url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            match self.send(request, url).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    attempt += 1;
                    tracing::warn!(
                        url = %url,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "Retrying registry request"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail with `Cancelled` as soon as the client's token fires, dropping
    /// whatever request is in flight.
    async fn guard<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StrataError::Cancelled(operation.to_string())),
            result = fut => result,
        }
    }
}

/// Append `digest` to an upload location, keeping its existing query.
fn with_digest(mut location: Url, digest: &Digest) -> Url {
    location
        .query_pairs_mut()
        .append_pair("digest", &digest.to_string());
    location
}

fn transport(url: &Url, error: reqwest::Error) -> StrataError {
    StrataError::Transport {
        url: url.to_string(),
        message: error.to_string(),
    }
}

async fn check_success(repo: &str, url: &Url, response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(registry_error(repo, url, response).await)
    }
}

async fn registry_error(repo: &str, url: &Url, response: Response) -> StrataError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(repo, url = %url, status, body = %body, "Registry error");
    StrataError::RegistryError {
        repo: repo.to_string(),
        url: url.to_string(),
        status,
        body,
    }
}
