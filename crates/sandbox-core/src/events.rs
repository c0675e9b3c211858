//! Streaming events emitted while an execution runs.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionResult, OutputStream};

/// Event type names, used as the SSE `event:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Output,
    Finished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Finished => "finished",
        }
    }
}

/// One event in an execution's output sequence.
///
/// A sequence is a run of `Output` events closed by exactly one
/// `Finished` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Output {
        stream: OutputStream,
        /// Arrival order across both streams within one execution.
        seq: u64,
        data: Vec<u8>,
    },
    Finished(Box<ExecutionResult>),
}

impl ExecutionEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Output { .. } => EventType::Output,
            Self::Finished(_) => EventType::Finished,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    /// JSON payload for transport.
    pub fn to_payload(&self) -> EventPayload {
        match self {
            Self::Output { stream, seq, data } => EventPayload::Output(OutputPayload {
                stream: *stream,
                seq: *seq,
                data: String::from_utf8_lossy(data).into_owned(),
            }),
            Self::Finished(result) => EventPayload::Finished(result.as_ref().clone()),
        }
    }
}

/// Payload of an `output` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub stream: OutputStream,
    pub seq: u64,
    pub data: String,
}

/// Wire form of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Output(OutputPayload),
    Finished(ExecutionResult),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Output(_) => EventType::Output,
            Self::Finished(_) => EventType::Finished,
        }
    }
}
