use ulid::Ulid;

use crate::model::{BookingStatus, Minute};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-policy input: bad slot, closed day, over-limit.
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    UnknownService(Ulid),
    InactiveService(Ulid),
    /// Another holder has a live hold overlapping the slot.
    SlotHeld { slot: Minute },
    /// A maintenance block covers the slot.
    MaintenanceBlocked { slot: Minute },
    /// Every bay is taken for some part of the requested interval.
    CapacityExhausted(u32),
    HoldNotFound(Ulid),
    HoldExpired(Ulid),
    BookingNotFound(Ulid),
    /// The booking is in a terminal status and cannot change.
    TerminalStatus { id: Ulid, status: BookingStatus },
    /// A backing store could not be reached. Retryable.
    Unavailable(String),
    WalError(String),
}

impl EngineError {
    /// Taxonomy bucket, used for wire responses and metric labels.
    /// Buckets are never collapsed — the caller branches on them.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_)
            | EngineError::TerminalStatus { .. } => "invalid",
            EngineError::UnknownService(_)
            | EngineError::HoldNotFound(_)
            | EngineError::BookingNotFound(_) => "not_found",
            EngineError::InactiveService(_) => "invalid",
            EngineError::SlotHeld { .. }
            | EngineError::MaintenanceBlocked { .. }
            | EngineError::CapacityExhausted(_) => "conflict",
            EngineError::HoldExpired(_) => "expired",
            EngineError::Unavailable(_) | EngineError::WalError(_) => "unavailable",
        }
    }

    /// Connectivity-class failures are worth retrying with backoff;
    /// everything else is a definitive answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::WalError(_))
    }

    /// Fixed end-user message per taxonomy bucket.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            "conflict" => "this slot was just taken",
            "expired" => "your reservation expired, please pick a time again",
            "unavailable" => "please try again in a moment",
            _ => "the request could not be processed",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::UnknownService(id) => write!(f, "unknown service: {id}"),
            EngineError::InactiveService(id) => write!(f, "service is retired: {id}"),
            EngineError::SlotHeld { slot } => {
                write!(f, "slot {} is held by another customer", crate::model::format_hhmm(*slot))
            }
            EngineError::MaintenanceBlocked { slot } => {
                write!(f, "slot {} is blocked for maintenance", crate::model::format_hhmm(*slot))
            }
            EngineError::CapacityExhausted(cap) => {
                write!(f, "all {cap} bays are booked for that time")
            }
            EngineError::HoldNotFound(token) => write!(f, "hold not found: {token}"),
            EngineError::HoldExpired(token) => write!(f, "hold expired: {token}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::TerminalStatus { id, status } => {
                write!(f, "booking {id} is {} and cannot change", status.as_str())
            }
            EngineError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            EngineError::WalError(msg) => write!(f, "WAL error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}
