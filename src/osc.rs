use rosc::OscPacket;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stage::Stage;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid IP:Port formatting: {0}")]
    InvalidIpFormatting(String),
    #[error("Binding Error: {0}")]
    BindingError(String),
}

fn default_prefix() -> String {
    String::from("/event")
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct OscConfig {
    /// Local `IP:Port` to listen on
    pub bind: String,
    /// Address prefix in front of event names
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            bind: String::from("0.0.0.0:9000"),
            prefix: default_prefix(),
        }
    }
}

/// Event named by `address`, which must be `<prefix>/<event>`.
pub fn event_name<'a>(address: &'a str, prefix: &str) -> Option<&'a str> {
    let name = address
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    (!name.is_empty()).then_some(name)
}

/// Every event addressed by `packet`, bundles included, in packet order.
pub fn events_for_packet(packet: &OscPacket, prefix: &str) -> Vec<String> {
    match packet {
        OscPacket::Message(message) => event_name(&message.addr, prefix)
            .map(|name| vec![name.to_string()])
            .unwrap_or_default(),
        OscPacket::Bundle(bundle) => bundle
            .content
            .iter()
            .flat_map(|p| events_for_packet(p, prefix))
            .collect(),
    }
}

/// Background UDP listener. Dropping it stops the task.
pub struct OscListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for OscListener {
    fn drop(&mut self) {
        self.task.abort_handle().abort();
        debug!("OSC listener dropped");
    }
}

impl OscListener {
    /// Binds `config.bind` and fires an event for every matching message.
    /// Must be called inside a tokio runtime.
    pub async fn bind(config: &OscConfig, stage: Arc<Stage>) -> Result<Self, Error> {
        let address: SocketAddr = config
            .bind
            .parse()
            .map_err(|_| Error::InvalidIpFormatting(config.bind.clone()))?;
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| Error::BindingError(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::BindingError(e.to_string()))?;
        info!(%local_addr, prefix = %config.prefix, "listening for OSC");

        let prefix = config.prefix.clone();
        let task = tokio::spawn(async move {
            let mut buffer = [0u8; rosc::decoder::MTU];
            loop {
                let (size, peer) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("OSC receive failed: {e}");
                        continue;
                    }
                };
                match rosc::decoder::decode_udp(&buffer[..size]) {
                    Ok((_, packet)) => {
                        for event in events_for_packet(&packet, &prefix) {
                            debug!(%peer, event = %event, "OSC trigger");
                            let _ = stage.trigger_event(&event);
                        }
                    }
                    Err(e) => debug!(%peer, "undecodable OSC packet: {e}"),
                }
            }
        });
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
