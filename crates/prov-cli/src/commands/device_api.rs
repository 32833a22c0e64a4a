//! Device web API commands

use std::net::IpAddr;

use anyhow::Result;
use prov_delivery::DeviceApiClient;

use crate::output::OutputContext;

pub async fn add_udp_client(
    client: &DeviceApiClient,
    device: IpAddr,
    client_ip: IpAddr,
    client_port: u16,
    save: bool,
    ctx: &OutputContext,
) -> Result<()> {
    client
        .add_udp_client(device, client_ip, client_port, save)
        .await?;
    ctx.success(&format!(
        "{} now streams to {}:{}{}",
        device,
        client_ip,
        client_port,
        if save { " (saved)" } else { "" }
    ));
    Ok(())
}

pub async fn set_static_ip(
    client: &DeviceApiClient,
    device: IpAddr,
    ip: IpAddr,
    netmask: IpAddr,
    gateway: IpAddr,
    ctx: &OutputContext,
) -> Result<()> {
    client.set_static_ip(device, ip, netmask, gateway).await?;
    ctx.success(&format!("{} will use {} after reboot", device, ip));
    Ok(())
}

pub async fn reset_static_ip(client: &DeviceApiClient, device: IpAddr, ctx: &OutputContext) -> Result<()> {
    client.reset_static_ip(device).await?;
    ctx.success(&format!("{} will use DHCP after reboot", device));
    Ok(())
}
