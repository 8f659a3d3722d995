use ulid::Ulid;

use crate::limits::MAX_EXTERNAL_REF_LEN;
use crate::model::{Event, PaymentInfo, SessionStatus};

use super::{Engine, EngineError, TxnGuards};

impl Engine {
    pub(super) fn payment_settled(&self, session_id: &Ulid) -> bool {
        self.payments
            .get(session_id)
            .is_some_and(|p| p.is_settled())
    }

    /// Record an out-of-band settlement. Idempotent: the first report
    /// wins and later ones return Ok without touching the record.
    pub async fn settle_payment(
        &self,
        session_id: Ulid,
        actor: Ulid,
        external_ref: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(r) = &external_ref
            && r.len() > MAX_EXTERNAL_REF_LEN
        {
            return Err(EngineError::LimitExceeded("external ref too long"));
        }
        let sess_arc = self.session_of(&session_id)?;
        // The session lock orders settlement against confirm: a confirm
        // either sees this settlement or fails the payment gate.
        let sess = sess_arc.write().await;
        self.role_for(&actor, &sess)?;

        if self.payment_settled(&session_id) {
            return Ok(());
        }
        if sess.status == SessionStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                from: SessionStatus::Cancelled,
                action: "settle",
            });
        }

        let event = Event::PaymentSettled {
            session_id,
            external_ref,
            at: self.clock.now_ms(),
        };
        let (client_id, coach_id) = (sess.client_id, sess.coach_id);
        self.persist_and_apply(&event, &mut TxnGuards::none(), &[client_id, coach_id])
            .await?;
        metrics::counter!(crate::observability::PAYMENTS_SETTLED_TOTAL).increment(1);
        Ok(())
    }

    /// Payment state for one session, visible to its parties and admins.
    pub async fn payment_of(&self, session_id: Ulid, actor: Ulid) -> Result<PaymentInfo, EngineError> {
        let sess_arc = self.session_of(&session_id)?;
        let sess = sess_arc.read().await;
        self.role_for(&actor, &sess)?;
        let pay = self
            .payments
            .get(&session_id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(session_id))?;
        Ok(PaymentInfo {
            session_id: pay.session_id,
            amount: pay.amount,
            currency: pay.currency,
            method: pay.method,
            settled_at: pay.settled_at,
            external_ref: pay.external_ref,
        })
    }
}
