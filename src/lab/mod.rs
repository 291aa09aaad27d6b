//! Lab request flows and the SSE consumption pipeline

pub mod client;
pub mod decoder;
pub mod event;
pub mod flow;
pub mod state;

pub use client::LabClient;
pub use decoder::{ChunkSource, FrameReader, LineDecoder, Utf8StreamDecoder};
pub use event::{parse_line, LineOutcome, Log, LogEntry, SentAt};
pub use flow::{pump_entries, OneShotFlow, StreamStats, StreamingFlow};
pub use state::{Generation, RequestState, RequestStatus, Transition};
