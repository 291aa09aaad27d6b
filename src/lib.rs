pub mod cli;
pub mod config;
pub mod error;
pub mod lab;

pub use config::ClientConfig;
pub use error::{LabError, LabResult};
pub use lab::{LabClient, OneShotFlow, StreamingFlow};
