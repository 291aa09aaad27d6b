//! Flow drivers: one user-triggered action and its request state
//!
//! Each flow owns its [`RequestState`]. Network work runs in a spawned task
//! that reports back over a channel with updates tagged by [`Generation`];
//! the owner applies them one at a time, in arrival order, through
//! [`OneShotFlow::next_change`] / [`StreamingFlow::next_change`]. Updates
//! from a superseded trigger are discarded.

use crate::error::{LabError, LabResult};
use crate::lab::client::LabClient;
use crate::lab::decoder::{ChunkSource, FrameReader};
use crate::lab::event::{parse_line, LineOutcome, Log, LogEntry};
use crate::lab::state::{Generation, RequestState, RequestStatus, Transition};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

/// Update produced by a flow task
pub trait FlowUpdate: Send + 'static {
    type Output;

    fn apply(self, state: &mut RequestState<Self::Output>, generation: Generation) -> Transition;
}

/// Outcome of a one-shot request
#[derive(Debug, Clone)]
pub enum OneShotUpdate {
    Success(serde_json::Value),
    Failed(String),
}

impl FlowUpdate for OneShotUpdate {
    type Output = serde_json::Value;

    fn apply(self, state: &mut RequestState<serde_json::Value>, generation: Generation) -> Transition {
        match self {
            OneShotUpdate::Success(value) => state.on_success(generation, value),
            OneShotUpdate::Failed(message) => state.on_error(generation, message),
        }
    }
}

/// Progress of a streamed request
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Entry(LogEntry),
    Finished,
    Failed(String),
}

impl FlowUpdate for StreamUpdate {
    type Output = Log;

    fn apply(self, state: &mut RequestState<Log>, generation: Generation) -> Transition {
        match self {
            StreamUpdate::Entry(entry) => state.on_partial_result(generation, entry),
            StreamUpdate::Finished => state.on_stream_end(generation),
            StreamUpdate::Failed(message) => state.on_error(generation, message),
        }
    }
}

struct Tagged<U> {
    generation: Generation,
    update: U,
}

/// Handle a flow task uses to report back
struct UpdateSender<U> {
    generation: Generation,
    tx: mpsc::UnboundedSender<Tagged<U>>,
}

impl<U> UpdateSender<U> {
    /// Returns false once the owning flow is gone
    fn send(&self, update: U) -> bool {
        self.tx
            .send(Tagged {
                generation: self.generation,
                update,
            })
            .is_ok()
    }
}

enum Next<U> {
    Update(Option<Tagged<U>>),
    TaskDone(Result<(), JoinError>),
}

/// State, channel and running task shared by both flow kinds
struct FlowDriver<U: FlowUpdate> {
    name: &'static str,
    state: RequestState<U::Output>,
    tx: mpsc::UnboundedSender<Tagged<U>>,
    rx: mpsc::UnboundedReceiver<Tagged<U>>,
    task: Option<JoinHandle<()>>,
}

impl<U: FlowUpdate> FlowDriver<U> {
    fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            state: RequestState::new(),
            tx,
            rx,
            task: None,
        }
    }

    fn start<F, Fut>(&mut self, run: F) -> Generation
    where
        F: FnOnce(UpdateSender<U>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.abort_task();
        let generation = self.state.trigger();
        let sender = UpdateSender {
            generation,
            tx: self.tx.clone(),
        };
        self.task = Some(tokio::spawn(run(sender)));
        info!("{} flow started request {}", self.name, generation);
        generation
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("{} flow aborting in-flight task", self.name);
            }
            task.abort();
        }
    }

    async fn next_change(&mut self) -> Option<RequestStatus> {
        loop {
            if !self.state.is_pending() {
                return None;
            }

            let next = match self.task.as_mut() {
                Some(task) => tokio::select! {
                    biased;
                    tagged = self.rx.recv() => Next::Update(tagged),
                    joined = task => Next::TaskDone(joined),
                },
                // Task already finished; only queued updates remain
                None => match self.rx.try_recv() {
                    Ok(tagged) => Next::Update(Some(tagged)),
                    Err(_) => Next::TaskDone(Ok(())),
                },
            };

            match next {
                Next::Update(Some(Tagged { generation, update })) => {
                    if update.apply(&mut self.state, generation).is_applied() {
                        return Some(self.state.status());
                    }
                }
                Next::Update(None) => return None,
                Next::TaskDone(Ok(())) => {
                    self.task = None;
                    while let Ok(Tagged { generation, update }) = self.rx.try_recv() {
                        if update.apply(&mut self.state, generation).is_applied() {
                            return Some(self.state.status());
                        }
                    }
                    if self.state.is_pending() {
                        error!("{} flow task ended without a result", self.name);
                        let generation = self.state.generation();
                        self.state.on_error(generation, "flow task ended without a result");
                        return Some(self.state.status());
                    }
                }
                Next::TaskDone(Err(e)) => {
                    self.task = None;
                    if e.is_panic() {
                        error!("{} flow task panicked", self.name);
                        let generation = self.state.generation();
                        self.state.on_error(generation, "flow task panicked");
                        return Some(self.state.status());
                    }
                }
            }
        }
    }

    fn cancel(&mut self) -> Transition {
        self.abort_task();
        let generation = self.state.generation();
        let transition = self.state.on_error(generation, LabError::Cancelled.to_string());
        if transition.is_applied() {
            info!("{} flow cancelled request {}", self.name, generation);
        }
        transition
    }
}

impl<U: FlowUpdate> Drop for FlowDriver<U> {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Request/response flow: fetch a module spec
pub struct OneShotFlow {
    client: LabClient,
    driver: FlowDriver<OneShotUpdate>,
}

impl OneShotFlow {
    pub fn new(client: LabClient) -> Self {
        Self {
            client,
            driver: FlowDriver::new("one-shot"),
        }
    }

    /// Start fetching the spec of `module`, replacing any request in flight
    pub fn trigger(&mut self, module: &str) -> Generation {
        let client = self.client.clone();
        let module = module.to_string();
        self.driver.start(move |sender| async move {
            let update = match client.fetch_module_spec(&module).await {
                Ok(value) => OneShotUpdate::Success(value),
                Err(e) => {
                    error!("Fetching spec for module {} failed: {}", module, e);
                    OneShotUpdate::Failed(e.to_string())
                }
            };
            sender.send(update);
        })
    }

    pub fn state(&self) -> &RequestState<serde_json::Value> {
        &self.driver.state
    }

    /// Apply the next update; `None` once the request has settled
    pub async fn next_change(&mut self) -> Option<RequestStatus> {
        self.driver.next_change().await
    }

    /// Wait until the current request settles
    pub async fn settle(&mut self) -> &RequestState<serde_json::Value> {
        while self.next_change().await.is_some() {}
        self.state()
    }

    pub fn cancel(&mut self) -> Transition {
        self.driver.cancel()
    }
}

/// Streamed flow: execute a module and collect its SSE log
pub struct StreamingFlow {
    client: LabClient,
    driver: FlowDriver<StreamUpdate>,
}

impl StreamingFlow {
    pub fn new(client: LabClient) -> Self {
        Self {
            client,
            driver: FlowDriver::new("streaming"),
        }
    }

    /// Start executing `module`, replacing any stream in flight
    pub fn trigger(&mut self, module: &str, args: BTreeMap<String, String>) -> Generation {
        let client = self.client.clone();
        let module = module.to_string();
        self.driver.start(move |sender| async move {
            let response = match client.open_module_stream(&module, &args).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Opening stream for module {} failed: {}", module, e);
                    sender.send(StreamUpdate::Failed(e.to_string()));
                    return;
                }
            };

            let mut reader = FrameReader::new(response);
            match pump_entries(&mut reader, |entry| sender.send(StreamUpdate::Entry(entry))).await {
                Ok(stats) => {
                    info!(
                        "Stream for module {} finished: {} entries, {} malformed, {} dropped",
                        module, stats.entries, stats.malformed, stats.dropped
                    );
                    sender.send(StreamUpdate::Finished);
                }
                Err(e) => {
                    error!("Stream for module {} failed: {}", module, e);
                    sender.send(StreamUpdate::Failed(e.to_string()));
                }
            }
        })
    }

    pub fn state(&self) -> &RequestState<Log> {
        &self.driver.state
    }

    /// Apply the next update; each streamed entry is its own change
    pub async fn next_change(&mut self) -> Option<RequestStatus> {
        self.driver.next_change().await
    }

    /// Wait until the current stream settles
    pub async fn settle(&mut self) -> &RequestState<Log> {
        while self.next_change().await.is_some() {}
        self.state()
    }

    pub fn cancel(&mut self) -> Transition {
        self.driver.cancel()
    }
}

/// Counters for one consumed stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub lines: usize,
    pub entries: usize,
    pub malformed: usize,
    pub dropped: usize,
}

/// Read every line from `reader` and hand each log entry to `on_entry`, in order.
///
/// Stops early, without error, when `on_entry` returns false. Payload
/// problems are counted and skipped; only read failures are returned.
pub async fn pump_entries<S, F>(reader: &mut FrameReader<S>, mut on_entry: F) -> LabResult<StreamStats>
where
    S: ChunkSource,
    F: FnMut(LogEntry) -> bool,
{
    let mut stats = StreamStats::default();
    while let Some(line) = reader.next_line().await? {
        stats.lines += 1;
        match parse_line(&line) {
            LineOutcome::Entry(entry) => {
                stats.entries += 1;
                if !on_entry(entry) {
                    debug!("Entry consumer went away, stopping stream");
                    break;
                }
            }
            LineOutcome::Malformed { .. } => stats.malformed += 1,
            LineOutcome::Dropped | LineOutcome::ServerError { .. } => stats.dropped += 1,
            LineOutcome::Ignored => {}
        }
    }
    Ok(stats)
}
