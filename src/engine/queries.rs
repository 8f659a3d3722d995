use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::availability::{candidate_starts, filter_available};
use super::sessions::{Role, permitted_fields};
use super::{Engine, EngineError, SharedSession};

impl Engine {
    /// Open slots for a service over the configured lookahead, in the
    /// coach's zone. With a client id, slots busy on the client side are
    /// filtered out too. Recomputed fresh per call.
    pub async fn compute_slots(
        &self,
        service_id: Ulid,
        client_id: Option<Ulid>,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let svc = self.service_of(&service_id)?;
        if !svc.active {
            return Err(EngineError::Invalid("service is not active"));
        }
        let coach = self.user_of(&svc.coach_id)?;

        let now = self.clock.now_ms();
        let earliest = now + self.config.min_lead_ms;
        let first_day = crate::clock::at_zone(now, coach.tz).date_naive();
        let candidates = candidate_starts(
            first_day,
            self.config.lookahead_days,
            self.config.working_hours,
            coach.tz,
            svc.duration_min,
        );

        let slots = match client_id {
            Some(cid) if cid != coach.id => {
                self.user_of(&cid)?;
                let (client_cal, coach_cal) =
                    self.lock_calendar_pair_read(cid, coach.id).await?;
                filter_available(candidates, earliest, &coach_cal, Some(&client_cal), coach.tz)
            }
            _ => {
                let coach_arc = self.calendar_of(&coach.id)?;
                let coach_cal = coach_arc.read().await;
                filter_available(candidates, earliest, &coach_cal, None, coach.tz)
            }
        };
        Ok(slots)
    }

    /// One session as seen by `actor`: local start in the viewer's zone,
    /// `editable`/`cancelable` computed from role, status and grace.
    pub async fn session_view(
        &self,
        session_id: Ulid,
        actor: Ulid,
    ) -> Result<SessionView, EngineError> {
        let viewer = self.user_of(&actor)?;
        let sess_arc = self.session_of(&session_id)?;
        let sess = sess_arc.read().await;
        let role = self.role_for(&actor, &sess)?;
        Ok(self.render_view(&sess, role, viewer.tz))
    }

    /// Every session the actor is a party to, chronological.
    pub async fn list_sessions_for(&self, actor: Ulid) -> Result<Vec<SessionView>, EngineError> {
        let viewer = self.user_of(&actor)?;
        let arcs: Vec<SharedSession> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::new();
        for arc in arcs {
            let sess = arc.read().await;
            let role = if sess.client_id == actor {
                Role::Client
            } else if sess.coach_id == actor {
                Role::Coach
            } else {
                continue;
            };
            views.push(self.render_view(&sess, role, viewer.tz));
        }
        views.sort_by_key(|v| (v.start, v.id));
        Ok(views)
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = self
            .services
            .iter()
            .map(|entry| {
                let svc = entry.value();
                ServiceInfo {
                    id: svc.id,
                    coach_id: svc.coach_id,
                    name: svc.name.clone(),
                    duration_min: svc.duration_min,
                    price: svc.price,
                    currency: svc.currency.clone(),
                    mode: svc.mode,
                    active: svc.active,
                }
            })
            .collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn review_of(&self, session_id: &Ulid) -> Option<Review> {
        self.reviews.get(session_id).map(|r| r.value().clone())
    }

    pub fn user_profile(&self, id: &Ulid) -> Option<UserProfile> {
        self.users.get(id).map(|u| u.value().clone())
    }

    fn render_view(&self, sess: &SessionRecord, role: Role, tz: Tz) -> SessionView {
        let now = self.clock.now_ms();
        // Coach and admin are never grace-bound; clients are.
        let unrestricted = role != Role::Client || self.grace_ok(sess.start, now);
        let editable = !permitted_fields(role, sess.status).is_empty() && unrestricted;
        let cancelable = sess.status != SessionStatus::Cancelled && unrestricted;
        SessionView {
            id: sess.id,
            client_id: sess.client_id,
            coach_id: sess.coach_id,
            service_id: sess.service_id,
            start: sess.start,
            start_local: crate::clock::local_rfc3339(sess.start, tz),
            duration_min: sess.duration_min,
            mode: sess.mode,
            status: sess.status,
            notes: sess.notes.clone(),
            meeting_url: sess.meeting_url.clone(),
            meeting_address: sess.meeting_address.clone(),
            calendar_event: sess.calendar_event.clone(),
            price: sess.price,
            currency: sess.currency.clone(),
            editable,
            cancelable,
        }
    }
}
