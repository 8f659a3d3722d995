use ulid::Ulid;

use crate::model::{DeliveryMode, SessionStatus};

/// Which side of a proposed booking already holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Coach,
    Client,
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Party::Coach => f.write_str("the coach"),
            Party::Client => f.write_str("you"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    PermissionDenied(&'static str),
    /// The locked re-check found the interval occupied.
    SlotTaken { party: Party },
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },
    OutsideGraceWindow { grace_hours: i64 },
    MissingMeetingDetail(DeliveryMode),
    PaymentNotSettled(Ulid),
    UnknownTimezone(String),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse classification exposed at the service surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    PaymentRequired,
    NotFound,
    PermissionDenied,
    Internal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            EngineError::SlotTaken { .. } => ErrorClass::Conflict,
            EngineError::PaymentNotSettled(_) => ErrorClass::PaymentRequired,
            EngineError::WalError(_) => ErrorClass::Internal,
            EngineError::AlreadyExists(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::OutsideGraceWindow { .. }
            | EngineError::MissingMeetingDetail(_)
            | EngineError::UnknownTimezone(_)
            | EngineError::Invalid(_)
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            EngineError::SlotTaken { party } => {
                write!(f, "slot no longer available: {party} already ha{} a session at this time",
                    if *party == Party::Coach { "s" } else { "ve" })
            }
            EngineError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a {from} session")
            }
            EngineError::OutsideGraceWindow { grace_hours } => {
                write!(f, "inside the {grace_hours}h grace window before start")
            }
            EngineError::MissingMeetingDetail(mode) => match mode {
                DeliveryMode::Online => f.write_str("Online session must have a meeting link"),
                DeliveryMode::InPerson => {
                    f.write_str("In-person session must have a meeting address")
                }
            },
            EngineError::PaymentNotSettled(id) => {
                write!(f, "payment for session {id} is not settled")
            }
            EngineError::UnknownTimezone(name) => write!(f, "unknown timezone: {name}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
