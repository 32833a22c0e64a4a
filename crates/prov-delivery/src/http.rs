//! HTTP transports: OTA uploads and the device web API

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prov_core::{DeliveryErrorKind, OtaTransport, ProvisionError, ProvisionResult, TransportError};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::OtaConfig;

fn base_url(scheme: &str, address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(v4) => format!("{}://{}:{}", scheme, v4, port),
        IpAddr::V6(v6) => format!("{}://[{}]:{}", scheme, v6, port),
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::ConnectionFailed(e.to_string())
    } else {
        TransportError::SendFailed(e.to_string())
    }
}

/// OTA uploads over the device's HTTP server
#[derive(Debug, Clone)]
pub struct HttpOtaTransport {
    client: Client,
    scheme: String,
    port: u16,
}

impl HttpOtaTransport {
    pub fn new(config: &OtaConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client,
            scheme: config.scheme.clone(),
            port: config.port,
        })
    }
}

#[async_trait]
impl OtaTransport for HttpOtaTransport {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn upload(&self, address: IpAddr, path: &str, payload: Bytes) -> Result<u16, TransportError> {
        let url = format!(
            "{}/{}",
            base_url(&self.scheme, address, self.port),
            path.trim_start_matches('/')
        );
        debug!(%url, "Uploading");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(map_reqwest)?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Serialize)]
struct UdpClientRequest<'a> {
    ip: &'a str,
    port: u16,
    save: bool,
}

#[derive(Debug, Serialize)]
struct StaticIpRequest<'a> {
    ip_sta: &'a str,
    ip_sta_netmsk: &'a str,
    ip_sta_gw: &'a str,
}

/// Client for the device's settings web API
#[derive(Debug, Clone)]
pub struct DeviceApiClient {
    client: Client,
    scheme: String,
    port: u16,
}

impl DeviceApiClient {
    pub const UDP_CLIENTS_PATH: &'static str = "api/settings/clients/udp";
    pub const STATIC_IP_PATH: &'static str = "api/settings/static-ip";

    pub fn new(scheme: impl Into<String>, port: u16, timeout: Duration) -> ProvisionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::validation(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            port,
        })
    }

    /// Register a UDP client the device streams telemetry to
    #[instrument(skip(self))]
    pub async fn add_udp_client(
        &self,
        device: IpAddr,
        client_ip: IpAddr,
        client_port: u16,
        save: bool,
    ) -> ProvisionResult<()> {
        let ip = client_ip.to_string();
        let body = UdpClientRequest {
            ip: &ip,
            port: client_port,
            save,
        };
        self.post(device, Self::UDP_CLIENTS_PATH, &body).await?;
        info!(%device, %client_ip, client_port, "UDP client added");
        Ok(())
    }

    /// Give the device a static station address
    #[instrument(skip(self))]
    pub async fn set_static_ip(
        &self,
        device: IpAddr,
        ip: IpAddr,
        netmask: IpAddr,
        gateway: IpAddr,
    ) -> ProvisionResult<()> {
        let (ip, netmask, gateway) = (ip.to_string(), netmask.to_string(), gateway.to_string());
        let body = StaticIpRequest {
            ip_sta: &ip,
            ip_sta_netmsk: &netmask,
            ip_sta_gw: &gateway,
        };
        self.post(device, Self::STATIC_IP_PATH, &body).await
    }

    /// Switch the device back to DHCP
    #[instrument(skip(self))]
    pub async fn reset_static_ip(&self, device: IpAddr) -> ProvisionResult<()> {
        let body = StaticIpRequest {
            ip_sta: "",
            ip_sta_netmsk: "",
            ip_sta_gw: "",
        };
        self.post(device, Self::STATIC_IP_PATH, &body).await
    }

    async fn post<T: Serialize + ?Sized>(&self, device: IpAddr, path: &str, body: &T) -> ProvisionResult<()> {
        let url = format!("{}/{}", base_url(&self.scheme, device, self.port), path);
        let failed = |message: String| {
            ProvisionError::delivery(DeliveryErrorKind::NetworkTargetFailed, device.to_string(), message)
        };
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| failed(map_reqwest(e).to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        Ok(())
    }
}
