mod availability;
mod error;
mod overlap;
mod payments;
mod queries;
mod sessions;

pub use error::{EngineError, ErrorClass, Party};
pub use sessions::{BookingOutcome, CancelOutcome, Role, SessionField, permitted_fields};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::calendar::CalendarSync;
use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<CalendarState>>;
pub type SharedSession = Arc<RwLock<SessionRecord>>;

/// Daily booking window, local to the coach's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub working_hours: WorkingHours,
    pub lookahead_days: u32,
    /// Clients may not edit or cancel closer to start than this.
    pub grace_window_ms: Ms,
    /// Slots starting sooner than now + lead are not offered.
    pub min_lead_ms: Ms,
    /// Zone for users registered without one.
    pub default_tz: Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_hours: WorkingHours { start_hour: 9, end_hour: 17 },
            lookahead_days: 7,
            grace_window_ms: 24 * 3_600_000,
            min_lead_ms: 0,
            default_tz: chrono_tz::UTC,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) users: DashMap<Ulid, UserProfile>,
    pub(super) services: DashMap<Ulid, ServiceState>,
    pub(super) sessions: DashMap<Ulid, SharedSession>,
    /// One calendar per user; a session occupies two of them.
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    /// Keyed by session id (exactly one payment per session).
    pub(super) payments: DashMap<Ulid, PaymentRecord>,
    pub(super) reviews: DashMap<Ulid, Review>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) calendar_sync: Arc<dyn CalendarSync>,
    pub config: EngineConfig,
}

/// Mutable borrows of the locked state an event touches. Live operations
/// pass the guards they already hold; replay passes freshly acquired
/// uncontended ones. One apply path, no drift between the two.
pub(super) struct TxnGuards<'a> {
    pub client_cal: Option<&'a mut CalendarState>,
    pub coach_cal: Option<&'a mut CalendarState>,
    pub session: Option<&'a mut SessionRecord>,
}

impl<'a> TxnGuards<'a> {
    pub fn none() -> Self {
        Self { client_cal: None, coach_cal: None, session: None }
    }

    pub fn session_only(session: &'a mut SessionRecord) -> Self {
        Self { client_cal: None, coach_cal: None, session: Some(session) }
    }

    pub fn calendars(client: &'a mut CalendarState, coach: &'a mut CalendarState) -> Self {
        Self { client_cal: Some(client), coach_cal: Some(coach), session: None }
    }

    pub fn full(
        client: &'a mut CalendarState,
        coach: &'a mut CalendarState,
        session: &'a mut SessionRecord,
    ) -> Self {
        Self { client_cal: Some(client), coach_cal: Some(coach), session: Some(session) }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        calendar_sync: Arc<dyn CalendarSync>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            users: DashMap::new(),
            services: DashMap::new(),
            sessions: DashMap::new(),
            calendars: DashMap::new(),
            payments: DashMap::new(),
            reviews: DashMap::new(),
            wal_tx,
            notify,
            clock,
            calendar_sync,
            config,
        };

        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    /// Apply one event to state. No locking here — the caller supplies
    /// whatever guards the event needs via `g`.
    fn apply_event(&self, event: &Event, g: &mut TxnGuards<'_>) {
        match event {
            Event::UserRegistered { id, name, tz, admin } => {
                self.users.insert(
                    *id,
                    UserProfile { id: *id, name: name.clone(), tz: *tz, admin: *admin },
                );
                self.calendars
                    .insert(*id, Arc::new(RwLock::new(CalendarState::new(*id))));
            }
            Event::ServicePublished {
                id,
                coach_id,
                name,
                duration_min,
                price,
                currency,
                mode,
                active,
            } => {
                self.services.insert(
                    *id,
                    ServiceState {
                        id: *id,
                        coach_id: *coach_id,
                        name: name.clone(),
                        duration_min: *duration_min,
                        price: *price,
                        currency: currency.clone(),
                        mode: *mode,
                        active: *active,
                    },
                );
            }
            Event::ServiceUpdated { id, name, duration_min, price, active } => {
                if let Some(mut svc) = self.services.get_mut(id) {
                    svc.name = name.clone();
                    svc.duration_min = *duration_min;
                    svc.price = *price;
                    svc.active = *active;
                }
            }
            Event::SessionBooked {
                id,
                client_id,
                coach_id,
                service_id,
                start,
                duration_min,
                mode,
                price,
                currency,
                notes,
                method,
            } => {
                let record = SessionRecord {
                    id: *id,
                    client_id: *client_id,
                    coach_id: *coach_id,
                    service_id: *service_id,
                    start: *start,
                    duration_min: *duration_min,
                    mode: *mode,
                    status: SessionStatus::Pending,
                    notes: notes.clone(),
                    meeting_url: None,
                    meeting_address: None,
                    calendar_event: None,
                    price: *price,
                    currency: currency.clone(),
                };
                let span = record.span();
                self.sessions.insert(*id, Arc::new(RwLock::new(record)));
                self.payments.insert(
                    *id,
                    PaymentRecord {
                        session_id: *id,
                        amount: *price,
                        currency: currency.clone(),
                        method: *method,
                        settled_at: None,
                        external_ref: None,
                    },
                );
                g.client_cal
                    .as_mut()
                    .expect("booked: client calendar guard")
                    .occupy(*id, span);
                g.coach_cal
                    .as_mut()
                    .expect("booked: coach calendar guard")
                    .occupy(*id, span);
            }
            Event::SessionRescheduled { id, start, notes } => {
                let sess = g.session.as_mut().expect("reschedule: session guard");
                sess.start = *start;
                if let Some(n) = notes {
                    sess.notes = n.clone();
                }
                sess.status = SessionStatus::Changed;
                let span = sess.span();
                g.client_cal
                    .as_mut()
                    .expect("reschedule: client calendar guard")
                    .reassign(*id, span);
                g.coach_cal
                    .as_mut()
                    .expect("reschedule: coach calendar guard")
                    .reassign(*id, span);
            }
            Event::MeetingDetailsSet { id: _, meeting_url, meeting_address } => {
                let sess = g.session.as_mut().expect("details: session guard");
                if let Some(url) = meeting_url {
                    sess.meeting_url = Some(url.clone());
                }
                if let Some(addr) = meeting_address {
                    sess.meeting_address = Some(addr.clone());
                }
            }
            Event::SessionConfirmed { .. } => {
                g.session.as_mut().expect("confirm: session guard").status =
                    SessionStatus::Confirmed;
            }
            Event::SessionCancelled { id } => {
                g.session.as_mut().expect("cancel: session guard").status =
                    SessionStatus::Cancelled;
                g.client_cal
                    .as_mut()
                    .expect("cancel: client calendar guard")
                    .vacate(*id);
                g.coach_cal
                    .as_mut()
                    .expect("cancel: coach calendar guard")
                    .vacate(*id);
            }
            Event::CalendarEventLinked { id: _, handle } => {
                g.session.as_mut().expect("link: session guard").calendar_event =
                    Some(handle.clone());
            }
            Event::CalendarEventUnlinked { .. } => {
                g.session.as_mut().expect("unlink: session guard").calendar_event = None;
            }
            Event::PaymentSettled { session_id, external_ref, at } => {
                if let Some(mut pay) = self.payments.get_mut(session_id) {
                    pay.settled_at = Some(*at);
                    pay.external_ref = external_ref.clone();
                }
            }
            Event::ReviewLeft { session_id, rating, comment, at } => {
                self.reviews.insert(
                    *session_id,
                    Review {
                        session_id: *session_id,
                        rating: *rating,
                        comment: comment.clone(),
                        at: *at,
                    },
                );
            }
        }
    }

    /// Replay-time apply. We're the sole owner of the Arcs here, so
    /// try_write always succeeds instantly (no contention). Never use
    /// blocking_write — replay may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { .. }
            | Event::ServicePublished { .. }
            | Event::ServiceUpdated { .. }
            | Event::PaymentSettled { .. }
            | Event::ReviewLeft { .. } => {
                self.apply_event(event, &mut TxnGuards::none());
            }
            Event::SessionBooked { client_id, coach_id, .. } => {
                let (Some(client_arc), Some(coach_arc)) = (
                    self.calendars.get(client_id).map(|e| e.value().clone()),
                    self.calendars.get(coach_id).map(|e| e.value().clone()),
                ) else {
                    return;
                };
                let mut client = client_arc.try_write().expect("replay: uncontended write");
                let mut coach = coach_arc.try_write().expect("replay: uncontended write");
                self.apply_event(event, &mut TxnGuards::calendars(&mut client, &mut coach));
            }
            Event::SessionRescheduled { id, .. } | Event::SessionCancelled { id } => {
                let Some(sess_arc) = self.sessions.get(id).map(|e| e.value().clone()) else {
                    return;
                };
                let mut sess = sess_arc.try_write().expect("replay: uncontended write");
                let (Some(client_arc), Some(coach_arc)) = (
                    self.calendars.get(&sess.client_id).map(|e| e.value().clone()),
                    self.calendars.get(&sess.coach_id).map(|e| e.value().clone()),
                ) else {
                    return;
                };
                let mut client = client_arc.try_write().expect("replay: uncontended write");
                let mut coach = coach_arc.try_write().expect("replay: uncontended write");
                self.apply_event(
                    event,
                    &mut TxnGuards::full(&mut client, &mut coach, &mut sess),
                );
            }
            Event::MeetingDetailsSet { id, .. }
            | Event::SessionConfirmed { id }
            | Event::CalendarEventLinked { id, .. }
            | Event::CalendarEventUnlinked { id } => {
                let Some(sess_arc) = self.sessions.get(id).map(|e| e.value().clone()) else {
                    return;
                };
                let mut sess = sess_arc.try_write().expect("replay: uncontended write");
                self.apply_event(event, &mut TxnGuards::session_only(&mut sess));
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call. The caller holds the
    /// guards in `g`; the event becomes visible only once durable.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        g: &mut TxnGuards<'_>,
        recipients: &[Ulid],
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(event, g);
        for user in recipients {
            self.notify.send(*user, event);
        }
        Ok(())
    }

    // ── State lookup ─────────────────────────────────────

    pub(super) fn user_of(&self, id: &Ulid) -> Result<UserProfile, EngineError> {
        self.users
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn service_of(&self, id: &Ulid) -> Result<ServiceState, EngineError> {
        self.services
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn session_of(&self, id: &Ulid) -> Result<SharedSession, EngineError> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn calendar_of(&self, user: &Ulid) -> Result<SharedCalendar, EngineError> {
        self.calendars
            .get(user)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*user))
    }

    /// Write-lock two distinct calendars in sorted id order, the global
    /// lock order for every multi-calendar operation.
    pub(super) async fn lock_calendar_pair(
        &self,
        first: Ulid,
        second: Ulid,
    ) -> Result<
        (OwnedRwLockWriteGuard<CalendarState>, OwnedRwLockWriteGuard<CalendarState>),
        EngineError,
    > {
        debug_assert_ne!(first, second, "a session never spans one calendar twice");
        let lo_arc = self.calendar_of(&first.min(second))?;
        let hi_arc = self.calendar_of(&first.max(second))?;
        let lo = lo_arc.write_owned().await;
        let hi = hi_arc.write_owned().await;
        if first < second { Ok((lo, hi)) } else { Ok((hi, lo)) }
    }

    /// Read-side twin of `lock_calendar_pair`, same acquisition order.
    pub(super) async fn lock_calendar_pair_read(
        &self,
        first: Ulid,
        second: Ulid,
    ) -> Result<
        (OwnedRwLockReadGuard<CalendarState>, OwnedRwLockReadGuard<CalendarState>),
        EngineError,
    > {
        let lo_arc = self.calendar_of(&first.min(second))?;
        let hi_arc = self.calendar_of(&first.max(second))?;
        let lo = lo_arc.read_owned().await;
        let hi = hi_arc.read_owned().await;
        if first < second { Ok((lo, hi)) } else { Ok((hi, lo)) }
    }

    // ── Compaction ───────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL to the minimal event sequence reproducing current
    /// state. Cancelled sessions and settled payments survive; history
    /// is compacted, never erased.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for user in self.users.iter() {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
                tz: user.tz,
                admin: user.admin,
            });
        }
        for svc in self.services.iter() {
            events.push(Event::ServicePublished {
                id: svc.id,
                coach_id: svc.coach_id,
                name: svc.name.clone(),
                duration_min: svc.duration_min,
                price: svc.price,
                currency: svc.currency.clone(),
                mode: svc.mode,
                active: svc.active,
            });
        }
        let session_arcs: Vec<SharedSession> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for arc in session_arcs {
            let s = arc.read().await;
            let pay = self
                .payments
                .get(&s.id)
                .map(|p| p.value().clone())
                .expect("every session has a payment record");
            events.push(Event::SessionBooked {
                id: s.id,
                client_id: s.client_id,
                coach_id: s.coach_id,
                service_id: s.service_id,
                start: s.start,
                duration_min: s.duration_min,
                mode: s.mode,
                price: s.price,
                currency: s.currency.clone(),
                notes: s.notes.clone(),
                method: pay.method,
            });
            if s.meeting_url.is_some() || s.meeting_address.is_some() {
                events.push(Event::MeetingDetailsSet {
                    id: s.id,
                    meeting_url: s.meeting_url.clone(),
                    meeting_address: s.meeting_address.clone(),
                });
            }
            match s.status {
                SessionStatus::Pending => {}
                SessionStatus::Changed => {
                    events.push(Event::SessionRescheduled {
                        id: s.id,
                        start: s.start,
                        notes: None,
                    });
                }
                SessionStatus::Confirmed => {
                    events.push(Event::SessionConfirmed { id: s.id });
                }
                SessionStatus::Cancelled => {
                    events.push(Event::SessionCancelled { id: s.id });
                }
            }
            if let Some(handle) = &s.calendar_event {
                events.push(Event::CalendarEventLinked { id: s.id, handle: handle.clone() });
            }
            if let Some(at) = pay.settled_at {
                events.push(Event::PaymentSettled {
                    session_id: s.id,
                    external_ref: pay.external_ref.clone(),
                    at,
                });
            }
        }
        for review in self.reviews.iter() {
            events.push(Event::ReviewLeft {
                session_id: review.session_id,
                rating: review.rating,
                comment: review.comment.clone(),
                at: review.at,
            });
        }
        events
    }
}
