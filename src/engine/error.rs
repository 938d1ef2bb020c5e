use ulid::Ulid;

use crate::model::{Span, Status};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `start` is not strictly before `end`.
    InvalidWindow(Span),
    UnknownPatient(Ulid),
    UnknownDoctor(Ulid),
    /// An active appointment already holds part of the requested window.
    Unavailable { conflict: Ulid, span: Span },
    NotFound(Ulid),
    /// Identifier allocation collided with an existing appointment.
    DuplicateId(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition { id: Ulid, from: Status, to: Status },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(span) => {
                write!(f, "invalid window {span}: start must be before end")
            }
            EngineError::UnknownPatient(id) => write!(f, "unknown patient: {id}"),
            EngineError::UnknownDoctor(id) => write!(f, "unknown doctor: {id}"),
            EngineError::Unavailable { conflict, span } => write!(
                f,
                "doctor is not available: conflicts with appointment {conflict} at {span}"
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::DuplicateId(id) => write!(f, "duplicate appointment id: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot move from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
