//! Lifecycle of one physical-device connection.
//!
//! A [`DeviceSession`] owns the transport for a projector and runs a single
//! dispatcher task that connects (retrying every 60 s until it succeeds),
//! reconnects 5 s after a drop, and fans device events out to subscribers.
//! The projector controller and its scene controllers share one session.

use crate::dp::SetRequest;
use crate::error::{ProjectorError, Result};
use crate::timer::sleep_until_deadline;
use crate::transport::{DeviceEvent, Query, Transport};
use bitflags::bitflags;
use futures_util::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const STARTUP_RETRY: Duration = Duration::from_secs(60);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    /// A reconnect is scheduled or in progress.
    Reconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => f.write_str("connected"),
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

bitflags! {
    /// Event kinds a subscriber wants to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKinds: u8 {
        const DATA = 0b00001;
        const DP_REFRESH = 0b00010;
        const CONNECTED = 0b00100;
        const DISCONNECTED = 0b01000;
        const ERROR = 0b10000;
        const LINK = Self::CONNECTED.bits() | Self::DISCONNECTED.bits();
        const STATE = Self::DATA.bits() | Self::DP_REFRESH.bits();
    }
}

impl EventKinds {
    pub fn of(event: &DeviceEvent) -> Self {
        match event {
            DeviceEvent::Data(_) => EventKinds::DATA,
            DeviceEvent::DpRefresh(_) => EventKinds::DP_REFRESH,
            DeviceEvent::Connected => EventKinds::CONNECTED,
            DeviceEvent::Disconnected => EventKinds::DISCONNECTED,
            DeviceEvent::Error(_) => EventKinds::ERROR,
        }
    }
}

/// An ordered feed of the session events one subscriber asked for.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.rx;
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }
}

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    state: Mutex<LinkState>,
    subscribers: Mutex<Vec<(EventKinds, mpsc::UnboundedSender<DeviceEvent>)>>,
    /// Taken by the dispatcher on `start`.
    events: Mutex<Option<broadcast::Receiver<DeviceEvent>>>,
    cancel: CancellationToken,
}

/// Shared handle to a device session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl DeviceSession {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        // Subscribe now so nothing the transport emits before `start` is lost.
        let events = transport.events();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                transport,
                state: Mutex::new(LinkState::Disconnected),
                subscribers: Mutex::new(Vec::new()),
                events: Mutex::new(Some(events)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Registers a subscriber for the given event kinds.
    pub fn subscribe(&self, kinds: EventKinds) -> SessionEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push((kinds, tx));
        SessionEvents { rx }
    }

    /// Spawns the dispatcher. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(events) = self.inner.events.lock().take() else {
            debug!("Session {} already started", self.inner.name);
            return;
        };
        info!("Starting session for {}", self.inner.name);
        tokio::spawn(self.inner.clone().run(events));
    }

    /// Issues a state query; the answer arrives as a `dp-refresh` event.
    pub async fn get(&self, query: Query) -> Result<()> {
        self.inner
            .transport
            .get(query)
            .await
            .map_err(ProjectorError::into_command)
    }

    /// Writes one or more DPs. Fails with `Command` when the device is not
    /// connected or the transport rejects the request. Never retried.
    pub async fn set(&self, request: SetRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(ProjectorError::Command(format!(
                "{} is not connected",
                self.inner.name
            )));
        }
        debug!("Set on {}: {}", self.inner.name, request.to_dps());
        self.inner
            .transport
            .set(request)
            .await
            .map_err(ProjectorError::into_command)
    }

    /// Stops the dispatcher and closes the transport.
    pub async fn shutdown(&self) {
        info!("Shutting down session for {}", self.inner.name);
        self.inner.cancel.cancel();
        self.inner.transport.disconnect().await;
        *self.inner.state.lock() = LinkState::Disconnected;
    }
}

impl Inner {
    fn set_state(&self, state: LinkState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Session {}: {} -> {}", self.name, *current, state);
            *current = state;
        }
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Delivers an event to every interested subscriber, dropping closed ones.
    fn publish(&self, event: &DeviceEvent) {
        let kind = EventKinds::of(event);
        self.subscribers.lock().retain(|(kinds, tx)| {
            if kinds.intersects(kind) {
                tx.send(event.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    async fn establish(&self) -> Result<()> {
        self.transport.find().await?;
        self.transport.connect().await
    }

    async fn on_connected(&self) {
        self.set_state(LinkState::Connected);
        info!("{} connected", self.name);
        self.publish(&DeviceEvent::Connected);
        if let Err(e) = self.transport.get(Query::Schema).await {
            warn!("Failed to query state of {}: {}", self.name, e);
        }
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<DeviceEvent>) {
        loop {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = self.establish() => res,
            };
            match res {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "Failed to connect to {}: {}. Retrying in {}s",
                        self.name,
                        e,
                        STARTUP_RETRY.as_secs()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(STARTUP_RETRY) => {}
                    }
                }
            }
        }
        self.on_connected().await;

        let mut reconnect_at: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = events.recv() => match res {
                    Ok(event) => self.handle(event, &mut reconnect_at).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Session {} dropped {} device events", self.name, n);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sleep_until_deadline(reconnect_at) => {
                    reconnect_at = None;
                    self.set_state(LinkState::Reconnecting);
                    debug!("Reconnecting to {}", self.name);
                    let res = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        res = self.establish() => res,
                    };
                    match res {
                        Ok(()) => self.on_connected().await,
                        Err(e) => {
                            warn!(
                                "Reconnect to {} failed: {}. Retrying in {}s",
                                self.name,
                                e,
                                RECONNECT_DELAY.as_secs()
                            );
                            reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                        }
                    }
                }
            }
        }
        debug!("Session dispatcher for {} stopped", self.name);
    }

    async fn handle(&self, event: DeviceEvent, reconnect_at: &mut Option<Instant>) {
        match event {
            DeviceEvent::Connected => {
                if self.state() == LinkState::Connected {
                    debug!("Ignoring duplicate connected signal from {}", self.name);
                    return;
                }
                *reconnect_at = None;
                self.on_connected().await;
            }
            DeviceEvent::Disconnected => {
                if self.state() != LinkState::Connected {
                    debug!("Ignoring duplicate disconnected signal from {}", self.name);
                    return;
                }
                self.set_state(LinkState::Disconnected);
                warn!(
                    "{} disconnected. Reconnecting in {}s",
                    self.name,
                    RECONNECT_DELAY.as_secs()
                );
                self.publish(&DeviceEvent::Disconnected);
                *reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
            }
            DeviceEvent::Error(ref message) => {
                debug!("Transport error on {}: {}", self.name, message);
                self.publish(&event);
            }
            event => self.publish(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::DpSnapshot;
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn session_with(mock: &MockTransport) -> DeviceSession {
        DeviceSession::new("Galaxy", Arc::new(mock.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_retries_every_minute() {
        let mock = MockTransport::new();
        mock.push_connect_result(Err(ProjectorError::Connection("refused".into())));
        let session = session_with(&mock);
        let mut link = session.subscribe(EventKinds::LINK);
        session.start();

        settle().await;
        assert_eq!(mock.connects(), 1);
        assert!(!session.is_connected());
        assert!(link.try_recv().is_none());

        tokio::time::sleep(STARTUP_RETRY).await;
        assert_eq!(mock.connects(), 2);
        assert!(session.is_connected());
        assert_eq!(link.recv().await, Some(DeviceEvent::Connected));
        assert_eq!(mock.gets(), vec![Query::Schema]);

        settle().await;
        // The transport's own connected signal is collapsed.
        assert!(link.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let mock = MockTransport::new();
        let session = session_with(&mock);
        let mut link = session.subscribe(EventKinds::LINK);
        session.start();
        settle().await;
        assert_eq!(link.recv().await, Some(DeviceEvent::Connected));

        mock.push_connect_result(Err(ProjectorError::Connection("timeout".into())));
        mock.emit(DeviceEvent::Disconnected);
        mock.emit(DeviceEvent::Disconnected);
        settle().await;
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(link.try_recv(), Some(DeviceEvent::Disconnected));
        assert!(link.try_recv().is_none());

        tokio::time::sleep(RECONNECT_DELAY).await;
        assert_eq!(mock.connects(), 2);
        assert_eq!(session.state(), LinkState::Reconnecting);

        tokio::time::sleep(RECONNECT_DELAY).await;
        assert_eq!(mock.connects(), 3);
        assert!(session.is_connected());
        assert_eq!(link.try_recv(), Some(DeviceEvent::Connected));
        assert_eq!(mock.gets(), vec![Query::Schema, Query::Schema]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_receive_requested_kinds_in_order() {
        let mock = MockTransport::new();
        let session = session_with(&mock);
        let mut data = session.subscribe(EventKinds::STATE);
        let mut errors = session.subscribe(EventKinds::ERROR);
        session.start();
        settle().await;

        let first = DpSnapshot::from_pairs([(20, json!(true))]);
        let second = DpSnapshot::from_pairs([(101, json!(500))]);
        mock.emit(DeviceEvent::Data(first.clone()));
        mock.emit(DeviceEvent::Error("bad frame".into()));
        mock.emit(DeviceEvent::DpRefresh(second.clone()));
        settle().await;

        assert_eq!(data.try_recv(), Some(DeviceEvent::Data(first)));
        assert_eq!(data.try_recv(), Some(DeviceEvent::DpRefresh(second)));
        assert!(data.try_recv().is_none());
        assert_eq!(errors.try_recv(), Some(DeviceEvent::Error("bad frame".into())));
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_requires_connection() {
        let mock = MockTransport::new();
        let session = session_with(&mock);
        let err = session.set(SetRequest::single(20, true)).await.unwrap_err();
        assert!(matches!(err, ProjectorError::Command(_)));
        assert!(mock.sets().is_empty());

        session.start();
        settle().await;
        let multi = SetRequest::multiple([(21, json!("colour")), (24, json!("007801f403e8"))]);
        session.set(multi.clone()).await.unwrap();
        assert_eq!(mock.sets(), vec![multi]);

        mock.fail_sets(true);
        let err = session.set(SetRequest::single(20, false)).await.unwrap_err();
        assert!(matches!(err, ProjectorError::Command(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnecting() {
        let mock = MockTransport::new();
        let session = session_with(&mock);
        session.start();
        settle().await;

        mock.emit(DeviceEvent::Disconnected);
        settle().await;
        session.shutdown().await;
        tokio::time::sleep(RECONNECT_DELAY * 3).await;
        assert_eq!(mock.connects(), 1);
        assert_eq!(session.state(), LinkState::Disconnected);
    }
}
