//! In-memory transport for exercising sessions and controllers.

use crate::dp::SetRequest;
use crate::error::{ProjectorError, Result};
use crate::transport::{DeviceEvent, Query, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::time::Duration;

#[derive(Default)]
struct State {
    connect_results: VecDeque<Result<()>>,
    sets: Vec<SetRequest>,
    gets: Vec<Query>,
    set_delay: Option<Duration>,
}

/// Records requests and replays scripted outcomes.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    connects: Arc<AtomicUsize>,
    fail_sets: Arc<AtomicBool>,
    events: broadcast::Sender<DeviceEvent>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            connects: Arc::new(AtomicUsize::new(0)),
            fail_sets: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Queues the outcome of the next `connect` calls. Once drained,
    /// connects succeed.
    pub fn push_connect_result(&self, result: Result<()>) {
        self.state.lock().connect_results.push_back(result);
    }

    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().set_delay = Some(delay);
    }

    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> Vec<SetRequest> {
        self.state.lock().sets.clone()
    }

    pub fn gets(&self) -> Vec<Query> {
        self.state.lock().gets.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.sets.clear();
        state.gets.clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn find(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.state.lock().connect_results.pop_front();
        let result = next.unwrap_or(Ok(()));
        if result.is_ok() {
            self.emit(DeviceEvent::Connected);
        }
        result
    }

    async fn get(&self, query: Query) -> Result<()> {
        self.state.lock().gets.push(query);
        Ok(())
    }

    async fn set(&self, request: SetRequest) -> Result<()> {
        self.state.lock().sets.push(request);
        let delay = self.state.lock().set_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(ProjectorError::Command("device rejected the write".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
