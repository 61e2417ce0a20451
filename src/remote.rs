//! Remote object store client.
//!
//! The upload workers only see the [`RemoteStore`] trait. The production
//! implementation, [`HttpObjectStore`], issues plain HTTP `PUT`/`HEAD`
//! requests against an S3-compatible endpoint and classifies every failure
//! into one of three [`TransferError`] classes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const ENDPOINT_ENV: &str = "INPUT_SENTINEL_ENDPOINT";
pub const BUCKET_ENV: &str = "S3_BUCKET_NAME";
pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ZSTD_LEVEL: i32 = 3;

/// Failure of a single transfer, classified by how the caller should react.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Network error, timeout or throttling; retry with backoff
    #[error("transient transfer error: {0}")]
    Transient(String),
    /// Missing, invalid or expired credentials; pause until refreshed
    #[error("credential error: {0}")]
    Credential(String),
    /// The store rejected the request; retrying will not help
    #[error("permanent transfer error (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl TransferError {
    /// Short class name used in log fields.
    pub fn class(&self) -> &'static str {
        match self {
            TransferError::Transient(_) => "transient",
            TransferError::Credential(_) => "credential",
            TransferError::Permanent { .. } => "permanent",
        }
    }

    /// Classify an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => TransferError::Credential(format!("{status}: {message}")),
            408 | 429 => TransferError::Transient(format!("{status}: {message}")),
            s if s >= 500 => TransferError::Transient(format!("{status}: {message}")),
            _ => TransferError::Permanent {
                status: Some(status),
                message,
            },
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return TransferError::Permanent {
                status: None,
                message: err.to_string(),
            };
        }
        TransferError::Transient(err.to_string())
    }
}

/// Per-request upload options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: String,
    /// Ask the store to encrypt the object at rest
    pub encrypt_at_rest: bool,
    /// zstd-compress the body before sending
    pub compress: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            encrypt_at_rest: true,
            compress: true,
        }
    }
}

/// Body as sent over the wire for the given options.
pub fn encode_body(body: Vec<u8>, options: &PutOptions) -> Result<Vec<u8>, TransferError> {
    if !options.compress {
        return Ok(body);
    }
    zstd::encode_all(body.as_slice(), ZSTD_LEVEL).map_err(|e| TransferError::Permanent {
        status: None,
        message: format!("compression failed: {e}"),
    })
}

/// Destination for artifacts.
///
/// `put` must be safely repeatable for the same key: uploading the same
/// artifact twice overwrites one object rather than creating two.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, options: &PutOptions)
        -> Result<(), TransferError>;

    async fn exists(&self, key: &str) -> Result<bool, TransferError>;

    /// Confirm the current credentials are accepted.
    async fn check_credentials(&self) -> Result<(), TransferError>;
}

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Source of credentials. Called before every request, so a refreshed
/// credential is picked up without restarting.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

/// Reads credentials from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credentials(&self) -> Option<Credentials> {
        let access_key_id = non_empty_env(ACCESS_KEY_ENV)?;
        let secret_access_key = non_empty_env(SECRET_KEY_ENV)?;
        Some(Credentials {
            access_key_id,
            secret_access_key,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Where objects go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://s3.eu-west-1.amazonaws.com`
    pub endpoint: String,
    pub bucket: String,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }

    /// Load from `INPUT_SENTINEL_ENDPOINT` and `S3_BUCKET_NAME`.
    pub fn from_env() -> Option<Self> {
        Some(Self::new(non_empty_env(ENDPOINT_ENV)?, non_empty_env(BUCKET_ENV)?))
    }

    pub fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.bucket)
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_url(), key.trim_start_matches('/'))
    }
}

/// HTTP client for an S3-compatible object store.
pub struct HttpObjectStore {
    config: RemoteConfig,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpObjectStore {
    pub fn new(
        config: RemoteConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransferError::Permanent {
                status: None,
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            config,
            client,
            credentials,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn current_credentials(&self) -> Result<Credentials, TransferError> {
        self.credentials
            .credentials()
            .ok_or_else(|| TransferError::Credential("no credentials available".to_string()))
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, TransferError> {
        let creds = self.current_credentials()?;
        Ok(request.basic_auth(creds.access_key_id, Some(creds.secret_access_key)))
    }
}

#[async_trait]
impl RemoteStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), TransferError> {
        let body = encode_body(body, options)?;

        let mut request = self
            .client
            .put(self.config.object_url(key))
            .header("Content-Type", options.content_type.as_str());
        if options.compress {
            request = request.header("Content-Encoding", "zstd");
        }
        if options.encrypt_at_rest {
            request = request.header("x-amz-server-side-encryption", "AES256");
        }

        let response = self
            .authorized(request)?
            .body(body)
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransferError::from_status(status.as_u16(), message));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        let request = self.client.head(self.config.object_url(key));
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(TransferError::from_status(status, "HEAD failed")),
        }
    }

    async fn check_credentials(&self) -> Result<(), TransferError> {
        let request = self.client.head(self.config.bucket_url());
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransferError::from_status(status.as_u16(), "bucket check failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(TransferError::from_status(403, "denied").class(), "credential");
        assert_eq!(TransferError::from_status(401, "expired").class(), "credential");
        assert_eq!(TransferError::from_status(503, "slow down").class(), "transient");
        assert_eq!(TransferError::from_status(429, "throttled").class(), "transient");
        assert_eq!(TransferError::from_status(408, "timeout").class(), "transient");
        assert!(matches!(
            TransferError::from_status(400, "bad"),
            TransferError::Permanent {
                status: Some(400),
                ..
            }
        ));
    }

    #[test]
    fn test_urls() {
        let config = RemoteConfig::new("https://store.example.com/", "evidence");
        assert_eq!(config.bucket_url(), "https://store.example.com/evidence");
        assert_eq!(
            config.object_url("/uploads/log_1.txt"),
            "https://store.example.com/evidence/uploads/log_1.txt"
        );
    }

    #[test]
    fn test_compressed_body_round_trips() {
        let body = b"Suspicious keyboard input detected and flagged!".repeat(20);
        let options = PutOptions::default();
        let encoded = encode_body(body.clone(), &options).unwrap();
        assert!(encoded.len() < body.len());
        assert_eq!(zstd::decode_all(encoded.as_slice()).unwrap(), body);

        let plain = PutOptions {
            compress: false,
            ..PutOptions::default()
        };
        assert_eq!(encode_body(body.clone(), &plain).unwrap(), body);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "hunter2".to_string(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("AKIA"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_credential_error() {
        struct NoCredentials;
        impl CredentialProvider for NoCredentials {
            fn credentials(&self) -> Option<Credentials> {
                None
            }
        }

        let store = HttpObjectStore::new(
            RemoteConfig::new("http://127.0.0.1:9", "bucket"),
            Arc::new(NoCredentials),
        )
        .unwrap();
        let err = store
            .put("k", vec![1], &PutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), "credential");
    }
}
