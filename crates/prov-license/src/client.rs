//! License authority client

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prov_core::{
    AccountToken, ActivationKey, License, LicenseErrorKind, LicenseProvider, ProvisionError,
    ProvisionResult,
};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::config::LicenseClientConfig;
use crate::store::LicenseStore;
use crate::types::{ErrorResponse, LicenseRequest, LicenseResponse};

/// Per-key slot; holding its lock means a request for that key is in flight.
/// Callers queued on it get the license once the request settles.
type KeySlot = Arc<tokio::sync::Mutex<Option<License>>>;

/// Outcome of a single request attempt
enum Attempt {
    Retryable(String),
    Fatal(ProvisionError),
}

/// Client for the remote license authority
///
/// Requests for the same activation key are serialized and concurrent
/// callers share one result, so they never generate duplicate load for one
/// key. Slots are dropped once their request settles, so the client only
/// tracks keys in flight.
pub struct LicenseClient {
    client: Client,
    base_url: Url,
    config: LicenseClientConfig,
    token: AccountToken,
    backoff: ExponentialBackoff,
    store: Option<LicenseStore>,
    slots: Mutex<HashMap<ActivationKey, KeySlot>>,
}

impl LicenseClient {
    /// Create a new license client from configuration
    pub fn new(config: LicenseClientConfig, token: AccountToken) -> ProvisionResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeouts.request_ms))
            .connect_timeout(Duration::from_millis(config.timeouts.connect_ms))
            .build()
            .map_err(|e| ProvisionError::validation(format!("cannot build HTTP client: {}", e)))?;

        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ProvisionError::validation(format!("invalid license server URL '{}': {}", config.base_url, e))
        })?;

        let backoff = ExponentialBackoff::from(&config.retry);
        let store = config.storage_dir.clone().map(LicenseStore::new);

        info!(
            "License client created for {} (token {})",
            base_url,
            token.redacted()
        );

        Ok(Self {
            client,
            base_url,
            config,
            token,
            backoff,
            store,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &LicenseClientConfig {
        &self.config
    }

    /// Local store issued licenses are written to, if configured
    pub fn store(&self) -> Option<&LicenseStore> {
        self.store.as_ref()
    }

    /// Request the license for `key`
    ///
    /// An "already issued" answer is treated as success. Rate limiting and
    /// network failures are retried with exponential backoff up to the
    /// configured budget.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn request_license(&self, key: &ActivationKey) -> ProvisionResult<License> {
        let slot = self.slots.lock().entry(*key).or_default().clone();
        let mut cached = slot.lock().await;
        if let Some(license) = cached.as_ref() {
            debug!("Using license obtained earlier in this run");
            return Ok(license.clone());
        }

        let result = self.request_with_retry(key).await;
        if let Ok(license) = &result {
            if let Some(store) = &self.store {
                if let Err(e) = store.save(license) {
                    warn!("Failed to store license locally: {}", e);
                }
            }
            *cached = Some(license.clone());
        }
        self.release_slot(key, &slot);
        result
    }

    /// Forget the slot of `key` unless a newer request replaced it
    fn release_slot(&self, key: &ActivationKey, slot: &KeySlot) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    /// Probe whether the authority is reachable
    #[instrument(skip(self))]
    pub async fn is_available(&self) -> bool {
        let url = match self.base_url.join(&self.config.endpoints.health) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let probe = self
            .client
            .get(url)
            .timeout(Duration::from_millis(self.config.timeouts.probe_ms))
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("License server not reachable: {}", e);
                false
            }
        }
    }

    async fn request_with_retry(&self, key: &ActivationKey) -> ProvisionResult<License> {
        let max_retries = self.config.retry.max_retries;
        let mut attempt = 0;
        loop {
            match self.send_once(key).await {
                Ok(license) => return Ok(license),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(reason)) => {
                    if attempt >= max_retries {
                        return Err(ProvisionError::license(
                            LicenseErrorKind::TransientExhausted,
                            format!("gave up after {} attempts: {}", attempt + 1, reason),
                        ));
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "License request attempt {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(&self, key: &ActivationKey) -> Result<License, Attempt> {
        let url = self
            .base_url
            .join(&self.config.endpoints.licenses)
            .map_err(|e| Attempt::Fatal(ProvisionError::validation(e.to_string())))?;

        let body = LicenseRequest {
            activation_key: key.to_hex(),
            license_type: self.config.license_type,
            validity_days: self.config.validity_days,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(self.token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.to_string()))?;

        self.handle_response(key, response).await
    }

    async fn handle_response(
        &self,
        key: &ActivationKey,
        response: reqwest::Response,
    ) -> Result<License, Attempt> {
        let status = response.status();

        // A body cut short is a network failure, a complete but invalid one is not
        let body = response.bytes().await;

        if status.is_success() {
            let bytes =
                body.map_err(|e| Attempt::Retryable(format!("license response cut short: {}", e)))?;
            let body: LicenseResponse = serde_json::from_slice(&bytes).map_err(|e| {
                fatal(
                    LicenseErrorKind::Protocol,
                    format!("unreadable license response: {}", e),
                )
            })?;
            if body.already_issued {
                info!("License already issued for this key, no credit used");
            }
            return decode_license(key, &body.license);
        }

        let text = match body {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            // The conflict body carries the license
            Err(e) if status == StatusCode::CONFLICT => {
                return Err(Attempt::Retryable(format!("conflict response cut short: {}", e)))
            }
            Err(_) => format!("HTTP {}", status),
        };
        let error: ErrorResponse = serde_json::from_str(&text).unwrap_or_else(|_| ErrorResponse {
            message: Some(text.clone()),
            ..Default::default()
        });

        match status {
            StatusCode::CONFLICT => match error.license.as_deref() {
                Some(encoded) => {
                    info!("License already issued for this key, no credit used");
                    decode_license(key, encoded)
                }
                None => Err(fatal(
                    LicenseErrorKind::Protocol,
                    format!("conflict without license body: {}", error.describe()),
                )),
            },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Err(Attempt::Retryable(format!("HTTP {}", status.as_u16())))
            }
            s if s.is_server_error() => Err(Attempt::Retryable(format!(
                "HTTP {}: {}",
                s.as_u16(),
                error.describe()
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(fatal(LicenseErrorKind::InvalidToken, error.describe()))
            }
            StatusCode::PAYMENT_REQUIRED => {
                Err(fatal(LicenseErrorKind::QuotaExceeded, error.describe()))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(fatal(LicenseErrorKind::MalformedKey, error.describe()))
            }
            s => Err(fatal(
                LicenseErrorKind::Protocol,
                format!("unexpected HTTP {}: {}", s.as_u16(), error.describe()),
            )),
        }
    }
}

fn fatal(kind: LicenseErrorKind, message: String) -> Attempt {
    Attempt::Fatal(ProvisionError::license(kind, message))
}

fn decode_license(key: &ActivationKey, encoded: &str) -> Result<License, Attempt> {
    License::from_base64(*key, encoded).map_err(|e| {
        Attempt::Fatal(ProvisionError::license(
            LicenseErrorKind::Protocol,
            e.to_string(),
        ))
    })
}

#[async_trait]
impl LicenseProvider for LicenseClient {
    async fn request_license(&self, key: &ActivationKey) -> ProvisionResult<License> {
        LicenseClient::request_license(self, key).await
    }

    async fn is_available(&self) -> bool {
        LicenseClient::is_available(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> LicenseClient {
        let config = LicenseClientConfig::builder(base_url).build();
        LicenseClient::new(config, AccountToken::new("abcd1234efgh5678").unwrap()).unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        let config = LicenseClientConfig::builder("not a url").build();
        let err = LicenseClient::new(config, AccountToken::new("abcd1234efgh5678").unwrap());
        assert!(matches!(err, Err(ProvisionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_settled_requests_release_their_slot() {
        let config = LicenseClientConfig::builder("http://127.0.0.1:9")
            .retry(0, 1, 1)
            .build();
        let c = LicenseClient::new(config, AccountToken::new("abcd1234efgh5678").unwrap()).unwrap();
        let key = ActivationKey::from_bytes([9; 32]);

        assert!(c.request_license(&key).await.is_err());
        assert!(c.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) on localhost is assumed closed
        let c = client("http://127.0.0.1:9");
        assert!(!c.is_available().await);
    }
}
