//! UDP broadcast discovery.
//! Projectors announce themselves on ports 6666/6667; we listen until the
//! wanted device id shows up or the timeout expires.

use crate::error::{ProjectorError, Result};
use crate::transport::crypto::EcbCipher;
use crate::transport::protocol::{self, Version};
use log::{debug, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// v3.4 broadcast key (md5 of the well-known app secret).
const UDP_KEY_34: &[u8] = &[
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];
const UDP_KEY_33: &[u8] = b"yG9shRKIBrIBUjc3";

pub const DISCOVERY_PORTS: [u16; 2] = [6666, 6667];

/// A device announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub id: String,
    pub ip: String,
    pub version: Option<Version>,
}

/// Listens for announcements from one device.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub timeout: Duration,
    pub bind_addr: String,
    pub ports: Vec<u16>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(18),
            bind_addr: "0.0.0.0".to_string(),
            ports: DISCOVERY_PORTS.to_vec(),
        }
    }
}

impl Discovery {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|_| ProjectorError::Configuration(format!("bad bind address {}", self.bind_addr)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on port {}: {}", port, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on port {}: {}", port, e);
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Waits for `device_id` to announce itself. `Ok(None)` on timeout.
    pub async fn find(&self, device_id: &str) -> Result<Option<Discovered>> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push(s),
                Err(e) => warn!("Failed to listen on port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(ProjectorError::Connection(
                "no discovery port could be bound".into(),
            ));
        }

        info!("Searching for device {} on the local network...", device_id);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
        let cancel = CancellationToken::new();
        for socket in sockets {
            let tx = tx.clone();
            let ct = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok((len, _)) => {
                                if tx.send(buf[..len].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut found = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                packet = rx.recv() => {
                    let Some(packet) = packet else { break };
                    if let Some(res) = parse_packet(&packet) {
                        debug!("Announcement from {} at {}", res.id, res.ip);
                        if res.id == device_id {
                            found = Some(res);
                            break;
                        }
                    }
                }
            }
        }
        cancel.cancel();

        match &found {
            Some(res) => info!(
                "Found device {} at {} (version {:?})",
                res.id, res.ip, res.version
            ),
            None => debug!("Device {} not found within {:?}", device_id, self.timeout),
        }
        Ok(found)
    }
}

/// Decodes one announcement: plain JSON, or a 55AA frame whose payload is
/// encrypted with one of the broadcast keys.
pub fn parse_packet(data: &[u8]) -> Option<Discovered> {
    if let Ok(val) = serde_json::from_slice::<Value>(data) {
        return parse_json(&val);
    }

    for with_retcode in [true, false] {
        let Ok(frame) = protocol::decode_frame(data, None, Some(with_retcode)) else {
            continue;
        };
        if frame.payload.is_empty() {
            continue;
        }
        if let Ok(val) = serde_json::from_slice::<Value>(&frame.payload) {
            return parse_json(&val);
        }
        for key in [UDP_KEY_34, UDP_KEY_33] {
            if let Ok(cipher) = EcbCipher::new(key)
                && let Ok(plain) = cipher.decrypt(&frame.payload)
                && let Ok(val) = serde_json::from_slice::<Value>(&plain)
            {
                return parse_json(&val);
            }
        }
    }
    None
}

fn parse_json(val: &Value) -> Option<Discovered> {
    let id = val
        .get("gwId")
        .or_else(|| val.get("devId"))
        .and_then(Value::as_str)?;
    let ip = val.get("ip").and_then(Value::as_str)?;
    let version = val
        .get("version")
        .and_then(Value::as_str)
        .and_then(|s| Version::from_str(s).ok());
    Some(Discovered {
        id: id.to_string(),
        ip: ip.to_string(),
        version,
    })
}
