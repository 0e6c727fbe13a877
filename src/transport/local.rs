//! Tuya LAN client (protocol v3.3 / v3.4).
//! Owns the TCP link, the v3.4 session-key handshake, the reader and
//! heartbeat tasks, and turns device frames into [`DeviceEvent`]s.

use crate::dp::{DpSnapshot, SetRequest};
use crate::error::{ProjectorError, Result};
use crate::transport::crypto::{EcbCipher, hmac_sha256, verify_hmac_sha256};
use crate::transport::discovery::Discovery;
use crate::transport::protocol::{
    self, CommandType, Frame, HEADER_LEN, PREFIX_55AA, Version, decode_frame, encode_frame,
};
use crate::transport::{DeviceEvent, Query, Transport};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PORT: u16 = 6668;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 64;
const NONCE_LEN: usize = 16;

const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_T: &str = "t";
const KEY_DPS: &str = "dps";
const KEY_DP_ID: &str = "dpId";

/// Builder for [`LocalClient`].
#[derive(Debug, Clone)]
pub struct LocalClientBuilder {
    id: String,
    local_key: String,
    address: Option<String>,
    version: Version,
    port: u16,
    connection_timeout: Duration,
    discovery: Discovery,
}

impl LocalClientBuilder {
    pub fn new(id: impl Into<String>, local_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            local_key: local_key.into(),
            address: None,
            version: Version::Auto,
            port: DEFAULT_PORT,
            connection_timeout: CONNECTION_TIMEOUT,
            discovery: Discovery::default(),
        }
    }

    /// Fixed IP address. Without one the device is found by broadcast.
    pub fn address(mut self, address: Option<String>) -> Self {
        self.address = address.filter(|a| !a.trim().is_empty());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn build(self) -> Result<LocalClient> {
        if self.local_key.len() != NONCE_LEN {
            return Err(ProjectorError::Configuration(format!(
                "local key of device {} must be 16 characters",
                self.id
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(LocalClient {
            inner: Arc::new(Inner {
                id: self.id,
                local_key: self.local_key.into_bytes(),
                address: self.address,
                version: self.version,
                port: self.port,
                connection_timeout: self.connection_timeout,
                discovery: self.discovery,
                resolved: Mutex::new(None),
                link: AsyncMutex::new(None),
                events,
                seqno: AtomicU32::new(1),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// A [`Transport`] speaking the Tuya LAN protocol to one device.
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    local_key: Vec<u8>,
    address: Option<String>,
    version: Version,
    port: u16,
    connection_timeout: Duration,
    discovery: Discovery,
    resolved: Mutex<Option<Endpoint>>,
    link: AsyncMutex<Option<Link>>,
    events: broadcast::Sender<DeviceEvent>,
    seqno: AtomicU32,
    generation: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    ip: String,
    version: Version,
}

struct Link {
    writer: OwnedWriteHalf,
    codec: FrameCodec,
    cancel: CancellationToken,
    generation: u64,
}

/// Per-connection encryption state.
#[derive(Clone)]
struct FrameCodec {
    version: Version,
    local_key: Vec<u8>,
    session_key: Option<[u8; NONCE_LEN]>,
}

impl FrameCodec {
    fn new(version: Version, local_key: &[u8]) -> Self {
        Self {
            version,
            local_key: local_key.to_vec(),
            session_key: None,
        }
    }

    fn cipher_key(&self) -> &[u8] {
        match &self.session_key {
            Some(key) => key,
            None => &self.local_key,
        }
    }

    fn hmac_key(&self) -> Option<&[u8]> {
        self.version.uses_session_key().then(|| self.cipher_key())
    }

    /// Encrypts a payload and adds the version header where the command
    /// expects one. v3.3 puts the header in clear text in front of the
    /// ciphertext; v3.4 encrypts it along with the payload.
    fn seal(&self, cmd: CommandType, payload: &[u8]) -> Result<Vec<u8>> {
        let cipher = EcbCipher::new(self.cipher_key())?;
        let with_header = !cmd.skips_version_header();
        if self.version.uses_session_key() {
            let plain = if with_header {
                protocol::add_version_header(self.version, payload)
            } else {
                payload.to_vec()
            };
            cipher.encrypt(&plain, true)
        } else {
            let sealed = cipher.encrypt(payload, true)?;
            Ok(if with_header {
                protocol::add_version_header(self.version, &sealed)
            } else {
                sealed
            })
        }
    }

    fn pack(&self, seqno: u32, cmd: CommandType, payload: &[u8]) -> Result<Vec<u8>> {
        let frame = Frame::new(seqno, cmd, self.seal(cmd, payload)?);
        encode_frame(&frame, self.hmac_key())
    }

    /// Verifies and decrypts one device frame.
    fn unpack(&self, data: &[u8]) -> Result<Frame> {
        let mut frame = decode_frame(data, self.hmac_key(), None)?;
        frame.payload = self.open(&frame.payload)?;
        Ok(frame)
    }

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let cipher = EcbCipher::new(self.cipher_key())?;
        if self.version.uses_session_key() {
            let plain = cipher.decrypt(payload)?;
            Ok(protocol::strip_version_header(self.version, &plain).to_vec())
        } else {
            let body = protocol::strip_version_header(self.version, payload);
            if body.first() == Some(&b'{') {
                // Some firmwares answer errors unencrypted.
                return Ok(body.to_vec());
            }
            cipher.decrypt(body)
        }
    }
}

/// Checks the device's handshake answer and returns its nonce.
fn verify_negotiation(
    local_key: &[u8],
    local_nonce: &[u8],
    response: &[u8],
) -> Result<[u8; NONCE_LEN]> {
    if response.len() < NONCE_LEN + 32 {
        return Err(ProjectorError::KeyOrVersion);
    }
    let (remote_nonce, tag) = response.split_at(NONCE_LEN);
    verify_hmac_sha256(local_key, local_nonce, &tag[..32])
        .map_err(|_| ProjectorError::KeyOrVersion)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(remote_nonce);
    Ok(nonce)
}

/// `AES-ECB(local_key, local_nonce XOR remote_nonce)` without padding.
fn derive_session_key(
    local_key: &[u8],
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> Result<[u8; NONCE_LEN]> {
    let mixed: Vec<u8> = local_nonce
        .iter()
        .zip(remote_nonce)
        .map(|(a, b)| a ^ b)
        .collect();
    let encrypted = EcbCipher::new(local_key)?.encrypt(&mixed, false)?;
    let mut key = [0u8; NONCE_LEN];
    key.copy_from_slice(&encrypted[..NONCE_LEN]);
    Ok(key)
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Command and JSON body for a DP write.
fn control_message(version: Version, id: &str, dps: Value) -> (CommandType, Value) {
    let t = timestamp();
    if version.uses_session_key() {
        (
            CommandType::ControlNew,
            json!({ "protocol": 5, KEY_T: t, "data": { KEY_DPS: dps } }),
        )
    } else {
        (
            CommandType::Control,
            json!({
                KEY_GW_ID: id,
                KEY_DEV_ID: id,
                KEY_UID: id,
                KEY_T: t.to_string(),
                KEY_DPS: dps,
            }),
        )
    }
}

/// Command and JSON body for a state query.
fn query_message(version: Version, id: &str, query: &Query) -> (CommandType, Value) {
    match query {
        Query::Refresh(dps) => (CommandType::UpdateDps, json!({ KEY_DP_ID: dps })),
        Query::Schema if version.uses_session_key() => (CommandType::DpQueryNew, json!({})),
        Query::Schema => (
            CommandType::DpQuery,
            json!({
                KEY_GW_ID: id,
                KEY_DEV_ID: id,
                KEY_UID: id,
                KEY_T: timestamp().to_string(),
                KEY_DPS: {},
            }),
        ),
    }
}

/// Reads the next frame, skipping bytes until a 55AA prefix is found.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let mut skipped = 0usize;
    while u32::from_be_bytes(head) != PREFIX_55AA {
        if skipped >= protocol::MAX_FRAME_LEN {
            return Err(ProjectorError::InvalidHeader);
        }
        head.rotate_left(1);
        head[3] = reader.read_u8().await?;
        skipped += 1;
    }

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&head);
    reader.read_exact(&mut header[4..]).await?;
    let total = protocol::frame_length(&header)?;

    let mut data = vec![0u8; total];
    data[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut data[HEADER_LEN..]).await?;
    Ok(data)
}

impl LocalClient {
    pub fn builder(id: impl Into<String>, local_key: impl Into<String>) -> LocalClientBuilder {
        LocalClientBuilder::new(id, local_key)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Version in use once the device has been resolved.
    pub fn version(&self) -> Option<Version> {
        self.inner.resolved.lock().as_ref().map(|e| e.version)
    }
}

impl Inner {
    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: DeviceEvent) {
        // No receivers is fine; the session may not have subscribed yet.
        let _ = self.events.send(event);
    }

    async fn resolve(&self) -> Result<Endpoint> {
        if let Some(addr) = &self.address {
            let version = match self.version {
                Version::Auto => Version::V3_3,
                v => v,
            };
            return Ok(Endpoint {
                ip: addr.clone(),
                version,
            });
        }

        let found = self.discovery.find(&self.id).await?.ok_or_else(|| {
            ProjectorError::Connection(format!(
                "device {} was not found on the local network",
                self.id
            ))
        })?;
        let version = match self.version {
            Version::Auto => found
                .version
                .filter(|v| *v != Version::Auto)
                .unwrap_or(Version::V3_3),
            v => v,
        };
        Ok(Endpoint {
            ip: found.ip,
            version,
        })
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, data: &[u8]) -> Result<()> {
        timeout(self.connection_timeout, writer.write_all(data))
            .await
            .map_err(|_| ProjectorError::Timeout)??;
        Ok(())
    }

    async fn read_frame_timed(&self, reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
        timeout(self.connection_timeout, read_frame(reader))
            .await
            .map_err(|_| ProjectorError::Timeout)?
    }

    /// v3.4 session-key negotiation. On success `codec` carries the key.
    async fn negotiate(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        codec: &mut FrameCodec,
    ) -> Result<()> {
        debug!("Negotiating session key with device {}", self.id);
        let mut local_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut local_nonce);

        let start = codec.pack(self.next_seqno(), CommandType::SessKeyNegStart, &local_nonce)?;
        self.write_frame(writer, &start).await?;

        let raw = self.read_frame_timed(reader).await.map_err(|e| match e {
            ProjectorError::Io(_) => ProjectorError::KeyOrVersion,
            e => e,
        })?;
        let resp = codec.unpack(&raw)?;
        if resp.command() != Some(CommandType::SessKeyNegResp) {
            return Err(ProjectorError::KeyOrVersion);
        }
        let remote_nonce = verify_negotiation(&self.local_key, &local_nonce, &resp.payload)?;

        let proof = hmac_sha256(&self.local_key, &remote_nonce)?;
        let finish = codec.pack(self.next_seqno(), CommandType::SessKeyNegFinish, &proof)?;
        self.write_frame(writer, &finish).await?;

        codec.session_key = Some(derive_session_key(
            &self.local_key,
            &local_nonce,
            &remote_nonce,
        )?);
        debug!("Session key established for device {}", self.id);
        Ok(())
    }

    /// The cached endpoint, resolving and caching it when there is none.
    async fn endpoint(&self) -> Result<Endpoint> {
        if let Some(endpoint) = self.resolved.lock().clone() {
            return Ok(endpoint);
        }
        let endpoint = self.resolve().await?;
        debug!(
            "Device {} resolved to {} (protocol {})",
            self.id, endpoint.ip, endpoint.version
        );
        *self.resolved.lock() = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn open_link(self: &Arc<Self>) -> Result<()> {
        self.close_link().await;

        let endpoint = self.endpoint().await?;

        let addr = format!("{}:{}", endpoint.ip, self.port);
        debug!("Connecting to device {} at {}", self.id, addr);
        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProjectorError::Timeout)??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let mut codec = FrameCodec::new(endpoint.version, &self.local_key);
        if endpoint.version.uses_session_key() {
            self.negotiate(&mut reader, &mut writer, &mut codec).await?;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        tokio::spawn(self.clone().run_reader(reader, codec.clone(), cancel.clone(), generation));
        tokio::spawn(self.clone().run_heartbeat(cancel.clone()));

        *self.link.lock().await = Some(Link {
            writer,
            codec,
            cancel,
            generation,
        });
        info!(
            "Connected to device {} at {} (protocol {})",
            self.id, endpoint.ip, endpoint.version
        );
        self.emit(DeviceEvent::Connected);
        Ok(())
    }

    async fn close_link(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            link.cancel.cancel();
            let _ = link.writer.shutdown().await;
            debug!("Closed link to device {}", self.id);
        }
    }

    async fn send(&self, cmd: CommandType, body: &Value) -> Result<()> {
        let payload = serde_json::to_vec(body)?;
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ProjectorError::Offline)?;
        let data = link.codec.pack(self.next_seqno(), cmd, &payload)?;
        debug!(
            "Sending cmd=0x{:02X} to device {}: {}",
            cmd as u32, self.id, body
        );
        self.write_frame(&mut link.writer, &data).await
    }

    async fn run_reader(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        codec: FrameCodec,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = read_frame(&mut reader) => res,
            };
            match res {
                Ok(data) => match codec.unpack(&data) {
                    Ok(frame) => self.dispatch(frame),
                    Err(e) => {
                        debug!("Dropping frame from device {}: {}", self.id, e);
                        self.emit(DeviceEvent::Error(e.to_string()));
                    }
                },
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("Connection to device {} lost: {}", self.id, e);
                    cancel.cancel();
                    let mut guard = self.link.lock().await;
                    if guard.as_ref().is_some_and(|l| l.generation == generation) {
                        *guard = None;
                    }
                    drop(guard);
                    self.emit(DeviceEvent::Disconnected);
                    break;
                }
            }
        }
        debug!("Reader task for device {} stopped", self.id);
    }

    fn dispatch(&self, frame: Frame) {
        if frame.payload.is_empty() {
            debug!("Ack cmd=0x{:02X} from device {}", frame.cmd, self.id);
            return;
        }
        let value = match serde_json::from_slice::<Value>(&frame.payload) {
            Ok(v) => v,
            Err(_) => {
                let text = String::from_utf8_lossy(&frame.payload).into_owned();
                debug!(
                    "Non-JSON payload from device {} (hex): {}",
                    self.id,
                    hex::encode(&frame.payload)
                );
                self.emit(DeviceEvent::Error(text));
                return;
            }
        };
        debug!(
            "Received cmd=0x{:02X} from device {}: {}",
            frame.cmd, self.id, value
        );

        let Some(snapshot) = DpSnapshot::from_payload(&value) else {
            return;
        };
        match frame.command() {
            Some(CommandType::DpQuery) | Some(CommandType::DpQueryNew) => {
                self.emit(DeviceEvent::DpRefresh(snapshot))
            }
            Some(CommandType::Status) | Some(CommandType::Control) | Some(CommandType::ControlNew) => {
                self.emit(DeviceEvent::Data(snapshot))
            }
            _ => debug!("Ignoring cmd=0x{:02X} from device {}", frame.cmd, self.id),
        }
    }

    async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let body = json!({ KEY_GW_ID: self.id, KEY_DEV_ID: self.id });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.send(CommandType::HeartBeat, &body).await {
                        debug!("Heartbeat to device {} failed: {}", self.id, e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalClient {
    /// Discovery only runs when no endpoint is cached; a failed connect
    /// clears the cache.
    async fn find(&self) -> Result<()> {
        self.inner
            .endpoint()
            .await
            .map(|_| ())
            .map_err(ProjectorError::into_connection)
    }

    async fn connect(&self) -> Result<()> {
        let res = self.inner.open_link().await;
        if res.is_err() {
            self.inner.close_link().await;
            // Force a fresh lookup next time; the device may have moved.
            if self.inner.address.is_none() {
                *self.inner.resolved.lock() = None;
            }
        }
        res.map_err(ProjectorError::into_connection)
    }

    async fn get(&self, query: Query) -> Result<()> {
        let version = self.version().unwrap_or_default();
        let (cmd, body) = query_message(version, &self.inner.id, &query);
        self.inner
            .send(cmd, &body)
            .await
            .map_err(ProjectorError::into_command)
    }

    async fn set(&self, request: SetRequest) -> Result<()> {
        let version = self.version().unwrap_or_default();
        let (cmd, body) = control_message(version, &self.inner.id, request.to_dps());
        self.inner
            .send(cmd, &body)
            .await
            .map_err(ProjectorError::into_command)
    }

    async fn disconnect(&self) {
        self.inner.close_link().await;
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    fn device_frame(codec: &FrameCodec, cmd: CommandType, payload: &[u8]) -> Vec<u8> {
        let mut frame = Frame::new(3, cmd, codec.seal(cmd, payload).unwrap());
        frame.retcode = Some(0);
        encode_frame(&frame, codec.hmac_key()).unwrap()
    }

    #[test]
    fn test_v33_status_frame_is_opened() {
        let codec = FrameCodec::new(Version::V3_3, KEY);
        let body = br#"{"dps":{"20":true}}"#;
        let frame = codec.unpack(&device_frame(&codec, CommandType::Status, body)).unwrap();
        assert_eq!(frame.retcode, Some(0));
        assert_eq!(frame.payload, body.to_vec());
    }

    #[test]
    fn test_v33_push_without_retcode_is_opened() {
        let codec = FrameCodec::new(Version::V3_3, KEY);
        let body = br#"{"dps":{"20":true}}"#;
        let sealed = codec.seal(CommandType::Status, body).unwrap();
        let raw = encode_frame(&Frame::new(4, CommandType::Status, sealed), None).unwrap();

        let frame = codec.unpack(&raw).unwrap();
        assert_eq!(frame.retcode, None);
        assert_eq!(frame.payload, body.to_vec());
    }

    #[test]
    fn test_v33_control_carries_clear_version_header() {
        let codec = FrameCodec::new(Version::V3_3, KEY);
        let sealed = codec.seal(CommandType::Control, b"{}").unwrap();
        assert!(sealed.starts_with(b"3.3"));
        let query = codec.seal(CommandType::DpQuery, b"{}").unwrap();
        assert_eq!(query.len(), 16);
    }

    #[test]
    fn test_v34_frames_use_session_key() {
        let mut codec = FrameCodec::new(Version::V3_4, KEY);
        codec.session_key = Some(*b"fedcba9876543210");
        let body = br#"{"protocol":4,"data":{"dps":{"101":500}}}"#;
        let raw = device_frame(&codec, CommandType::ControlNew, body);
        assert_eq!(codec.unpack(&raw).unwrap().payload, body.to_vec());

        let stale = FrameCodec::new(Version::V3_4, KEY);
        assert_eq!(stale.unpack(&raw), Err(ProjectorError::HmacMismatch));
    }

    #[test]
    fn test_negotiation_response_is_verified() {
        let local_nonce = [7u8; NONCE_LEN];
        let remote_nonce = [9u8; NONCE_LEN];
        let mut response = remote_nonce.to_vec();
        response.extend_from_slice(&hmac_sha256(KEY, &local_nonce).unwrap());

        assert_eq!(
            verify_negotiation(KEY, &local_nonce, &response).unwrap(),
            remote_nonce
        );
        assert_eq!(
            verify_negotiation(KEY, &[0u8; NONCE_LEN], &response),
            Err(ProjectorError::KeyOrVersion)
        );
        assert_eq!(
            verify_negotiation(KEY, &local_nonce, &response[..20]),
            Err(ProjectorError::KeyOrVersion)
        );

        let key = derive_session_key(KEY, &local_nonce, &remote_nonce).unwrap();
        assert_ne!(&key[..], KEY);
    }

    #[test]
    fn test_message_shapes() {
        let dps = json!({"20": true});
        let (cmd, body) = control_message(Version::V3_4, "dev", dps.clone());
        assert_eq!(cmd, CommandType::ControlNew);
        assert_eq!(body["protocol"], json!(5));
        assert_eq!(body["data"]["dps"], dps);

        let (cmd, body) = control_message(Version::V3_3, "dev", dps.clone());
        assert_eq!(cmd, CommandType::Control);
        assert_eq!(body[KEY_DEV_ID], json!("dev"));
        assert!(body[KEY_T].is_string());

        let (cmd, body) = query_message(Version::V3_3, "dev", &Query::Refresh(vec![20, 101]));
        assert_eq!(cmd, CommandType::UpdateDps);
        assert_eq!(body, json!({"dpId": [20, 101]}));

        let (cmd, _) = query_message(Version::V3_4, "dev", &Query::Schema);
        assert_eq!(cmd, CommandType::DpQueryNew);
    }

    #[test]
    fn test_builder_checks_key_length() {
        assert!(LocalClient::builder("dev", "short").build().is_err());
        let client = LocalClient::builder("dev", "0123456789abcdef")
            .address(Some("10.0.0.5".into()))
            .version(Version::V3_4)
            .build()
            .unwrap();
        assert_eq!(client.id(), "dev");
        assert_eq!(client.version(), None);
    }

    #[tokio::test]
    async fn test_find_reuses_cached_endpoint() {
        let client = LocalClient::builder("dev", "0123456789abcdef")
            .discovery(Discovery::default().with_timeout(Duration::from_millis(1)))
            .build()
            .unwrap();
        *client.inner.resolved.lock() = Some(Endpoint {
            ip: "10.0.0.9".into(),
            version: Version::V3_4,
        });

        client.find().await.unwrap();
        assert_eq!(client.version(), Some(Version::V3_4));
        assert_eq!(
            client.inner.resolved.lock().as_ref().map(|e| e.ip.clone()),
            Some("10.0.0.9".to_string())
        );
    }
}
