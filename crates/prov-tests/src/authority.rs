//! In-process license authority
//!
//! Issues one license per activation key and bills only the first issuance;
//! repeated requests get the stored license back as "already issued".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use prov_core::{ActivationKey, License, ProvisionResult};
use prov_license::{ErrorResponse, LicenseRequest, LicenseResponse};

use crate::server::TestServer;

#[derive(Default)]
struct AuthorityState {
    token: String,
    issued: Mutex<HashMap<String, String>>,
    requests: AtomicUsize,
    billing_events: AtomicUsize,
    offline: AtomicBool,
    out_of_credit: AtomicBool,
}

pub struct MockAuthority {
    state: Arc<AuthorityState>,
    server: TestServer,
}

impl MockAuthority {
    /// Start an authority accepting `token`
    pub async fn start(token: &str) -> std::io::Result<Self> {
        let state = Arc::new(AuthorityState {
            token: token.to_string(),
            ..Default::default()
        });
        let router = Router::new()
            .route("/api/v1/licenses", post(issue))
            .route("/health", get(health))
            .with_state(state.clone());
        let server = TestServer::start(router).await?;
        Ok(Self { state, server })
    }

    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Answer every request with 503 while set
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse new issuances with 402 while set
    pub fn set_out_of_credit(&self, out: bool) {
        self.state.out_of_credit.store(out, Ordering::SeqCst);
    }

    /// License requests received, including retries and repeats
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Issuances that consumed a credit
    pub fn billing_events(&self) -> usize {
        self.state.billing_events.load(Ordering::SeqCst)
    }

    /// The blob this authority issues for `key`
    pub fn license_for(key: &ActivationKey) -> ProvisionResult<License> {
        License::new(*key, format!("signed-license:{}", key.to_hex()).into_bytes())
    }
}

fn error(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: None,
            license: None,
        }),
    )
        .into_response()
}

async fn health(State(state): State<Arc<AuthorityState>>) -> StatusCode {
    if state.offline.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn issue(
    State(state): State<Arc<AuthorityState>>,
    headers: HeaderMap,
    Json(req): Json<LicenseRequest>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.offline.load(Ordering::SeqCst) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "maintenance");
    }

    let bearer = format!("Bearer {}", state.token);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(bearer.as_str()) {
        return error(StatusCode::UNAUTHORIZED, "invalid_token");
    }

    let key: ActivationKey = match req.activation_key.parse() {
        Ok(key) => key,
        Err(_) => return error(StatusCode::BAD_REQUEST, "malformed_key"),
    };

    let mut issued = state.issued.lock();
    if let Some(existing) = issued.get(&req.activation_key) {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: ErrorResponse::ALREADY_ISSUED.to_string(),
                message: None,
                license: Some(existing.clone()),
            }),
        )
            .into_response();
    }
    if state.out_of_credit.load(Ordering::SeqCst) {
        return error(StatusCode::PAYMENT_REQUIRED, "quota_exceeded");
    }

    let license = match MockAuthority::license_for(&key) {
        Ok(license) => license.to_base64(),
        Err(_) => return error(StatusCode::INTERNAL_SERVER_ERROR, "signing_failed"),
    };
    state.billing_events.fetch_add(1, Ordering::SeqCst);
    issued.insert(req.activation_key, license.clone());
    (
        StatusCode::CREATED,
        Json(LicenseResponse {
            license,
            already_issued: false,
        }),
    )
        .into_response()
}
