//! HTTP transports against an in-process device web server

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use prov_core::OtaTransport;
use prov_delivery::{DeviceApiClient, HttpOtaTransport, OtaConfig};
use tokio::net::TcpListener;

#[derive(Default)]
struct Device {
    uploads: Mutex<Vec<(String, usize)>>,
    settings: Mutex<Vec<serde_json::Value>>,
}

async fn upload(
    State(device): State<Arc<Device>>,
    Path(part): Path<String>,
    body: Bytes,
) -> StatusCode {
    if part == "broken" {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    device.uploads.lock().push((part, body.len()));
    StatusCode::OK
}

async fn settings(State(device): State<Arc<Device>>, Json(body): Json<serde_json::Value>) -> StatusCode {
    device.settings.lock().push(body);
    StatusCode::OK
}

struct MockDevice {
    state: Arc<Device>,
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl MockDevice {
    async fn start() -> Self {
        let state = Arc::new(Device::default());
        let router = Router::new()
            .route("/update/{part}", post(upload))
            .route("/api/settings/clients/udp", post(settings))
            .route("/api/settings/static-ip", post(settings))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Self { state, port, handle }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

#[tokio::test]
async fn test_ota_upload_posts_payload() {
    let device = MockDevice::start().await;
    let transport = HttpOtaTransport::new(&OtaConfig {
        port: device.port,
        ..OtaConfig::default()
    })
    .unwrap();

    let status = transport
        .upload(localhost(), "update/www", vec![7u8; 1024].into())
        .await
        .unwrap();
    assert_eq!(status, 200);
    let status = transport
        .upload(localhost(), "/update/broken", vec![1u8].into())
        .await
        .unwrap();
    assert_eq!(status, 500);
    assert_eq!(*device.state.uploads.lock(), vec![("www".to_string(), 1024)]);
}

#[tokio::test]
async fn test_ota_upload_to_closed_port_is_unreachable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let transport = HttpOtaTransport::new(&OtaConfig {
        port,
        ..OtaConfig::default()
    })
    .unwrap();
    let err = transport
        .upload(localhost(), "update/www", vec![0u8; 4].into())
        .await
        .unwrap_err();
    assert!(err.is_unreachable());
}

#[tokio::test]
async fn test_device_api_requests() {
    let device = MockDevice::start().await;
    let client = DeviceApiClient::new("http", device.port, Duration::from_secs(2)).unwrap();

    client
        .add_udp_client(localhost(), "192.168.2.100".parse().unwrap(), 14550, true)
        .await
        .unwrap();
    client
        .set_static_ip(
            localhost(),
            "192.168.2.50".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            "192.168.2.1".parse().unwrap(),
        )
        .await
        .unwrap();
    client.reset_static_ip(localhost()).await.unwrap();

    let seen = device.state.settings.lock().clone();
    assert_eq!(
        seen,
        vec![
            serde_json::json!({"ip": "192.168.2.100", "port": 14550, "save": true}),
            serde_json::json!({
                "ip_sta": "192.168.2.50",
                "ip_sta_netmsk": "255.255.255.0",
                "ip_sta_gw": "192.168.2.1"
            }),
            serde_json::json!({"ip_sta": "", "ip_sta_netmsk": "", "ip_sta_gw": ""}),
        ]
    );
}
