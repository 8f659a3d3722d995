use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Decoder, Encoder, Framed};
use ulid::Ulid;

use crate::auth;
use crate::engine::{Engine, EngineError, ErrorClass};
use crate::limits::MAX_FRAME_LEN;
use crate::model::{DeliveryMode, Event, Ms, PaymentMethod};
use crate::observability;

// ── Line codec ───────────────────────────────────────────────────

/// Newline-delimited UTF-8 JSON frames, one object per line. A line
/// exceeding MAX_FRAME_LEN aborts the connection.
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(pos) = src.iter().position(|&b| b == b'\n') {
            if pos > MAX_FRAME_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too long"));
            }
            let line = src.split_to(pos + 1);
            let text = std::str::from_utf8(&line[..pos])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(text.trim_end_matches('\r').to_string()));
        }
        if src.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too long"));
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.put(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ── Envelopes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RequestFrame {
    id: u64,
    #[serde(flatten)]
    request: Request,
}

/// Every operation of the service surface. Requests name the acting
/// user explicitly; the gateway in front of us owns authentication.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterUser {
        id: Option<Ulid>,
        name: String,
        tz: Option<String>,
        admin: Option<bool>,
    },
    PublishService {
        id: Option<Ulid>,
        coach_id: Ulid,
        name: String,
        duration_min: u32,
        price: Decimal,
        currency: String,
        mode: DeliveryMode,
    },
    UpdateService {
        id: Ulid,
        actor: Ulid,
        name: String,
        duration_min: u32,
        price: Decimal,
        active: bool,
    },
    ListServices,
    Slots {
        service_id: Ulid,
        client_id: Option<Ulid>,
    },
    Book {
        id: Option<Ulid>,
        client_id: Ulid,
        service_id: Ulid,
        start: Ms,
        notes: Option<String>,
        method: PaymentMethod,
    },
    Reschedule {
        session_id: Ulid,
        actor: Ulid,
        start: Option<Ms>,
        notes: Option<String>,
    },
    SetMeetingDetails {
        session_id: Ulid,
        actor: Ulid,
        meeting_url: Option<String>,
        meeting_address: Option<String>,
    },
    Confirm {
        session_id: Ulid,
        actor: Ulid,
    },
    Cancel {
        session_id: Ulid,
        actor: Ulid,
    },
    Session {
        session_id: Ulid,
        actor: Ulid,
    },
    Sessions {
        actor: Ulid,
    },
    SettlePayment {
        session_id: Ulid,
        actor: Ulid,
        external_ref: Option<String>,
    },
    Payment {
        session_id: Ulid,
        actor: Ulid,
    },
    LeaveReview {
        session_id: Ulid,
        actor: Ulid,
        rating: u8,
        comment: Option<String>,
    },
    Review {
        session_id: Ulid,
    },
    Subscribe {
        user_id: Ulid,
    },
}

#[derive(Debug, Serialize)]
struct ResponseFrame {
    id: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireError {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct PushFrame<'a> {
    push: &'a Event,
    user_id: Ulid,
}

fn error_code(e: &EngineError) -> &'static str {
    match e.class() {
        ErrorClass::Validation => "validation_error",
        ErrorClass::Conflict => "conflict_error",
        ErrorClass::PaymentRequired => "payment_not_settled",
        ErrorClass::NotFound => "not_found",
        ErrorClass::PermissionDenied => "permission_denied",
        ErrorClass::Internal => "internal_error",
    }
}

fn encode<T: Serialize>(frame: &T) -> io::Result<String> {
    serde_json::to_string(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ── Connection loop ──────────────────────────────────────────────

/// Drive one client connection: hello handshake, then a request loop
/// with subscription pushes interleaved between responses.
pub async fn process_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
    token: Arc<str>,
) -> io::Result<()> {
    let mut framed = Framed::new(stream, LineCodec);

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    if !auth::check_hello(&first?, &token) {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        let denied = ResponseFrame {
            id: 0,
            ok: false,
            data: None,
            error: Some(WireError { code: "permission_denied", message: "bad token".into() }),
            warning: None,
        };
        framed.send(encode(&denied)?).await?;
        return Ok(());
    }
    framed.send(encode(&json!({"id": 0, "ok": true}))?).await?;

    // Subscription forwarders feed serialized push frames through this
    // channel so the socket has a single writer.
    let (push_tx, mut push_rx) = mpsc::channel::<String>(64);

    loop {
        tokio::select! {
            maybe_line = framed.next() => {
                let Some(line) = maybe_line else { break };
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let reply = dispatch_line(&engine, &line, &push_tx).await?;
                framed.send(reply).await?;
            }
            Some(push) = push_rx.recv() => {
                framed.send(push).await?;
            }
        }
    }
    Ok(())
}

async fn dispatch_line(
    engine: &Arc<Engine>,
    line: &str,
    push_tx: &mpsc::Sender<String>,
) -> io::Result<String> {
    let frame: RequestFrame = match serde_json::from_str(line) {
        Ok(f) => f,
        Err(e) => {
            let response = ResponseFrame {
                id: 0,
                ok: false,
                data: None,
                error: Some(WireError {
                    code: "validation_error",
                    message: format!("malformed request: {e}"),
                }),
                warning: None,
            };
            return encode(&response);
        }
    };

    let op = observability::op_label(&frame.request);
    let started = Instant::now();
    let (result, warning) = execute(engine, frame.request, push_tx).await;
    metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    let response = match result {
        Ok(data) => {
            metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            ResponseFrame { id: frame.id, ok: true, data: Some(data), error: None, warning }
        }
        Err(e) => {
            metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => "error")
                .increment(1);
            ResponseFrame {
                id: frame.id,
                ok: false,
                data: None,
                error: Some(WireError { code: error_code(&e), message: e.to_string() }),
                warning: None,
            }
        }
    };
    encode(&response)
}

async fn execute(
    engine: &Arc<Engine>,
    request: Request,
    push_tx: &mpsc::Sender<String>,
) -> (Result<serde_json::Value, EngineError>, Option<String>) {
    match request {
        Request::RegisterUser { id, name, tz, admin } => {
            let id = id.unwrap_or_else(Ulid::new);
            let result = engine
                .register_user(id, name, tz, admin.unwrap_or(false))
                .await
                .map(|()| json!({"id": id}));
            (result, None)
        }
        Request::PublishService { id, coach_id, name, duration_min, price, currency, mode } => {
            let id = id.unwrap_or_else(Ulid::new);
            let result = engine
                .publish_service(id, coach_id, name, duration_min, price, currency, mode)
                .await
                .map(|()| json!({"id": id}));
            (result, None)
        }
        Request::UpdateService { id, actor, name, duration_min, price, active } => {
            let result = engine
                .update_service(id, actor, name, duration_min, price, active)
                .await
                .map(|()| json!({"id": id}));
            (result, None)
        }
        Request::ListServices => {
            (Ok(json!({"services": engine.list_services()})), None)
        }
        Request::Slots { service_id, client_id } => {
            let result = engine
                .compute_slots(service_id, client_id)
                .await
                .map(|slots| json!({"slots": slots}));
            (result, None)
        }
        Request::Book { id, client_id, service_id, start, notes, method } => {
            let id = id.unwrap_or_else(Ulid::new);
            match engine
                .book_session(id, client_id, service_id, start, notes.unwrap_or_default(), method)
                .await
            {
                Ok(outcome) => {
                    let view = engine.session_view(outcome.session_id, client_id).await;
                    (view.map(|v| json!({"session": v})), outcome.sync_warning)
                }
                Err(e) => (Err(e), None),
            }
        }
        Request::Reschedule { session_id, actor, start, notes } => {
            let result = match engine.reschedule_session(session_id, actor, start, notes).await {
                Ok(()) => engine.session_view(session_id, actor).await,
                Err(e) => Err(e),
            };
            (result.map(|v| json!({"session": v})), None)
        }
        Request::SetMeetingDetails { session_id, actor, meeting_url, meeting_address } => {
            let result = match engine
                .set_meeting_details(session_id, actor, meeting_url, meeting_address)
                .await
            {
                Ok(()) => engine.session_view(session_id, actor).await,
                Err(e) => Err(e),
            };
            (result.map(|v| json!({"session": v})), None)
        }
        Request::Confirm { session_id, actor } => {
            let result = match engine.confirm_session(session_id, actor).await {
                Ok(()) => engine.session_view(session_id, actor).await,
                Err(e) => Err(e),
            };
            (result.map(|v| json!({"session": v})), None)
        }
        Request::Cancel { session_id, actor } => {
            match engine.cancel_session(session_id, actor).await {
                Ok(outcome) => {
                    let view = engine.session_view(session_id, actor).await;
                    (view.map(|v| json!({"session": v})), outcome.sync_warning)
                }
                Err(e) => (Err(e), None),
            }
        }
        Request::Session { session_id, actor } => {
            let result = engine
                .session_view(session_id, actor)
                .await
                .map(|v| json!({"session": v}));
            (result, None)
        }
        Request::Sessions { actor } => {
            let result = engine
                .list_sessions_for(actor)
                .await
                .map(|views| json!({"sessions": views}));
            (result, None)
        }
        Request::SettlePayment { session_id, actor, external_ref } => {
            let result = match engine.settle_payment(session_id, actor, external_ref).await {
                Ok(()) => engine.payment_of(session_id, actor).await,
                Err(e) => Err(e),
            };
            (result.map(|p| json!({"payment": p})), None)
        }
        Request::Payment { session_id, actor } => {
            let result = engine
                .payment_of(session_id, actor)
                .await
                .map(|p| json!({"payment": p}));
            (result, None)
        }
        Request::LeaveReview { session_id, actor, rating, comment } => {
            let result = engine
                .leave_review(session_id, actor, rating, comment.unwrap_or_default())
                .await
                .map(|()| json!({"review": engine.review_of(&session_id)}));
            (result, None)
        }
        Request::Review { session_id } => {
            (Ok(json!({"review": engine.review_of(&session_id)})), None)
        }
        Request::Subscribe { user_id } => {
            if engine.user_profile(&user_id).is_none() {
                return (Err(EngineError::NotFound(user_id)), None);
            }
            let mut rx = engine.notify.subscribe(user_id);
            let tx = push_tx.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let Ok(frame) = encode(&PushFrame { push: &event, user_id }) else {
                                break;
                            };
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(user = %user_id, skipped, "subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            (Ok(json!({"subscribed": user_id})), None)
        }
    }
}
