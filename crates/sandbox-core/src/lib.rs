pub mod config;
pub mod events;
pub mod language;
pub mod request;
pub mod types;

pub use config::{Backpressure, Config};
pub use events::{EventPayload, ExecutionEvent};
pub use language::Language;
pub use request::{
    CommandSpec, ExecutionRequest, ExecutionSpec, OutputMode, RequestError, RequestLimits, Timeout,
};
pub use types::*;
