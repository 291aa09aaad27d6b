//! Request lifecycle state for one user-triggered flow

use crate::lab::event::{Log, LogEntry};
use tracing::debug;

/// Lifecycle status of a request flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    /// Nothing triggered yet
    #[default]
    Idle,
    /// Request in flight
    Pending,
    /// Finished with a result
    Success,
    /// Finished with an error message
    Error,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Idle => write!(f, "idle"),
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Success => write!(f, "success"),
            RequestStatus::Error => write!(f, "error"),
        }
    }
}

/// Tag identifying one trigger of a flow.
///
/// Updates carrying an older generation belong to a superseded request and
/// are never applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of feeding an update into a [`RequestState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

/// Status, result and error of one flow
#[derive(Debug, Clone)]
pub struct RequestState<T> {
    status: RequestStatus,
    result: Option<T>,
    error_message: Option<String>,
    generation: Generation,
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self {
            status: RequestStatus::Idle,
            result: None,
            error_message: None,
            generation: Generation::default(),
        }
    }
}

impl<T> RequestState<T> {
    /// Create an idle state
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Success or Error
    pub fn is_settled(&self) -> bool {
        matches!(self.status, RequestStatus::Success | RequestStatus::Error)
    }

    /// Start a new request, valid from any state.
    ///
    /// Clears the previous result and error before returning the generation
    /// that the new request's updates must carry.
    pub fn trigger(&mut self) -> Generation {
        self.result = None;
        self.error_message = None;
        self.status = RequestStatus::Pending;
        self.generation = self.generation.next();
        debug!("Request {} triggered", self.generation);
        self.generation
    }

    /// Finish the current request with a value
    pub fn on_success(&mut self, generation: Generation, value: T) -> Transition {
        if !self.accepts(generation, "success") {
            return Transition::Ignored;
        }
        self.status = RequestStatus::Success;
        self.result = Some(value);
        Transition::Applied
    }

    /// Finish the current request with an error; any result gathered so far is kept
    pub fn on_error(&mut self, generation: Generation, message: impl Into<String>) -> Transition {
        if !self.accepts(generation, "error") {
            return Transition::Ignored;
        }
        self.status = RequestStatus::Error;
        self.error_message = Some(message.into());
        Transition::Applied
    }

    fn accepts(&self, generation: Generation, update: &str) -> bool {
        if generation != self.generation {
            debug!(
                "Ignoring {} update from superseded request {} (current {})",
                update, generation, self.generation
            );
            return false;
        }
        if self.status != RequestStatus::Pending {
            debug!(
                "Ignoring {} update for request {} in {} state",
                update, generation, self.status
            );
            return false;
        }
        true
    }
}

impl RequestState<Log> {
    /// Append one streamed entry without changing status
    pub fn on_partial_result(&mut self, generation: Generation, entry: LogEntry) -> Transition {
        if !self.accepts(generation, "partial result") {
            return Transition::Ignored;
        }
        self.result.get_or_insert_with(Log::new).push(entry);
        Transition::Applied
    }

    /// Finish a streamed request with whatever the log holds
    pub fn on_stream_end(&mut self, generation: Generation) -> Transition {
        if !self.accepts(generation, "stream end") {
            return Transition::Ignored;
        }
        let log = self.result.take().unwrap_or_default();
        self.on_success(generation, log)
    }
}
