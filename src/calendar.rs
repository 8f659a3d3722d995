use std::fmt;

use async_trait::async_trait;
use chrono_tz::Tz;

use crate::model::{Span, UserProfile};

/// Opaque provider-side identifier for a created calendar event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandle(pub String);

#[derive(Debug)]
pub enum SyncError {
    Provider(String),
    Unavailable,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Provider(msg) => write!(f, "provider error: {msg}"),
            SyncError::Unavailable => write!(f, "calendar provider unavailable"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Boundary to an external calendar. Failures are soft for callers: a
/// session transition commits first and reports sync trouble as a
/// warning, never as an error.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    /// Create an event in the coach's calendar. `Ok(None)` means no
    /// provider is configured, which is not an error.
    async fn create_event(
        &self,
        coach: &UserProfile,
        summary: &str,
        description: &str,
        span: Span,
        tz: Tz,
    ) -> Result<Option<EventHandle>, SyncError>;

    async fn delete_event(
        &self,
        coach: &UserProfile,
        handle: &EventHandle,
    ) -> Result<(), SyncError>;
}

/// The no-provider default.
pub struct NullCalendarSync;

#[async_trait]
impl CalendarSync for NullCalendarSync {
    async fn create_event(
        &self,
        _coach: &UserProfile,
        _summary: &str,
        _description: &str,
        _span: Span,
        _tz: Tz,
    ) -> Result<Option<EventHandle>, SyncError> {
        Ok(None)
    }

    async fn delete_event(
        &self,
        _coach: &UserProfile,
        _handle: &EventHandle,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

#[cfg(test)]
pub struct RecordingCalendarSync {
    pub created: std::sync::Mutex<Vec<(ulid::Ulid, String, Span)>>,
    pub deleted: std::sync::Mutex<Vec<(ulid::Ulid, String)>>,
    pub fail: std::sync::atomic::AtomicBool,
    counter: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl RecordingCalendarSync {
    pub fn new() -> Self {
        Self {
            created: std::sync::Mutex::new(Vec::new()),
            deleted: std::sync::Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl CalendarSync for RecordingCalendarSync {
    async fn create_event(
        &self,
        coach: &UserProfile,
        summary: &str,
        _description: &str,
        span: Span,
        _tz: Tz,
    ) -> Result<Option<EventHandle>, SyncError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::Provider("simulated outage".into()));
        }
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.created
            .lock()
            .unwrap()
            .push((coach.id, summary.to_string(), span));
        Ok(Some(EventHandle(format!("evt-{n}"))))
    }

    async fn delete_event(
        &self,
        coach: &UserProfile,
        handle: &EventHandle,
    ) -> Result<(), SyncError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::Provider("simulated outage".into()));
        }
        self.deleted
            .lock()
            .unwrap()
            .push((coach.id, handle.0.clone()));
        Ok(())
    }
}

/// Stub whose `create_event` stalls until released, so a test can land
/// another transition while the provider call is in flight.
#[cfg(test)]
pub struct StallingCalendarSync {
    pub created: std::sync::Mutex<Vec<(ulid::Ulid, String, Span)>>,
    pub deleted: std::sync::Mutex<Vec<(ulid::Ulid, String)>>,
    entered: tokio::sync::Semaphore,
    gate: tokio::sync::Semaphore,
    counter: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl StallingCalendarSync {
    pub fn new() -> Self {
        Self {
            created: std::sync::Mutex::new(Vec::new()),
            deleted: std::sync::Mutex::new(Vec::new()),
            entered: tokio::sync::Semaphore::new(0),
            gate: tokio::sync::Semaphore::new(0),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Block until a `create_event` call has started and stalled.
    pub async fn wait_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    /// Let one stalled `create_event` finish.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[cfg(test)]
#[async_trait]
impl CalendarSync for StallingCalendarSync {
    async fn create_event(
        &self,
        coach: &UserProfile,
        summary: &str,
        _description: &str,
        span: Span,
        _tz: Tz,
    ) -> Result<Option<EventHandle>, SyncError> {
        self.entered.add_permits(1);
        self.gate.acquire().await.unwrap().forget();
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.created
            .lock()
            .unwrap()
            .push((coach.id, summary.to_string(), span));
        Ok(Some(EventHandle(format!("evt-{n}"))))
    }

    async fn delete_event(
        &self,
        coach: &UserProfile,
        handle: &EventHandle,
    ) -> Result<(), SyncError> {
        self.deleted
            .lock()
            .unwrap()
            .push((coach.id, handle.0.clone()));
        Ok(())
    }
}
