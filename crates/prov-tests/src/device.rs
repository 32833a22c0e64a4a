//! Simulated device web server for OTA uploads

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;

use crate::server::TestServer;

/// One received upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub part: String,
    pub len: usize,
}

struct DeviceState {
    uploads: Mutex<Vec<Upload>>,
    status: AtomicU16,
    delay_ms: AtomicU64,
}

pub struct MockOtaDevice {
    state: Arc<DeviceState>,
    server: TestServer,
}

impl MockOtaDevice {
    /// Start a device on `ip` at `port`; port 0 picks a free one
    pub async fn start(ip: IpAddr, port: u16) -> std::io::Result<Self> {
        let state = Arc::new(DeviceState {
            uploads: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
            delay_ms: AtomicU64::new(0),
        });
        let router = Router::new()
            .route("/update/{part}", post(upload))
            .with_state(state.clone());
        let server = TestServer::bind(SocketAddr::new(ip, port), router).await?;
        Ok(Self { state, server })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr
    }

    /// Status answered to every upload
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    /// Delay before answering each upload
    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.uploads.lock().clone()
    }
}

async fn upload(
    State(state): State<Arc<DeviceState>>,
    Path(part): Path<String>,
    body: Bytes,
) -> StatusCode {
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    state.uploads.lock().push(Upload {
        part,
        len: body.len(),
    });
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
