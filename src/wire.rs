//! Newline-delimited JSON over TCP.
//!
//! Each line from the client is one request tagged by `op`; each request gets
//! exactly one `ok` or `error` reply line. Room messages for this connection
//! are pushed as `message` lines between replies. A line longer than
//! `MAX_LINE_LEN` gets an error reply and is skipped.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::chat::{ChatError, ChatHub, ConnId, HistoryError, HistoryReader, RoomMessage};
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

pub type WireResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Everything a connection talks to.
#[derive(Clone)]
pub struct Services {
    pub engine: Arc<Engine>,
    pub chat: Arc<ChatHub>,
    pub history: HistoryReader,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Assert the caller's identity for the rest of the connection.
    Identify {
        teacher_id: Option<u64>,
        student_id: Option<u64>,
        email: Option<String>,
    },
    SaveProfile {
        name: Option<String>,
        avatar: Option<String>,
    },
    CreateSlot {
        #[serde(flatten)]
        slot: SlotRequest,
    },
    UpdateSlot {
        id: Ulid,
        #[serde(flatten)]
        slot: SlotRequest,
    },
    BookSlot {
        teacher_id: u64,
        span: Span,
    },
    ReleaseSlot {
        id: Ulid,
    },
    CompleteSlot {
        id: Ulid,
    },
    MarkCommented {
        id: Ulid,
    },
    DeleteSlot {
        id: Ulid,
    },
    ListCreated {
        teacher_id: u64,
    },
    ListTeacherBooked {
        teacher_id: u64,
    },
    ListStudentBooked {
        student_id: u64,
    },
    ListCompleted {
        student_id: u64,
    },
    JoinRoom {
        room: String,
    },
    Message {
        room: String,
        sender_email: Option<String>,
        payload: String,
    },
    History {
        room: String,
    },
}

impl Request {
    /// Short label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Identify { .. } => "identify",
            Request::SaveProfile { .. } => "save_profile",
            Request::CreateSlot { .. } => "create_slot",
            Request::UpdateSlot { .. } => "update_slot",
            Request::BookSlot { .. } => "book_slot",
            Request::ReleaseSlot { .. } => "release_slot",
            Request::CompleteSlot { .. } => "complete_slot",
            Request::MarkCommented { .. } => "mark_commented",
            Request::DeleteSlot { .. } => "delete_slot",
            Request::ListCreated { .. } => "list_created",
            Request::ListTeacherBooked { .. } => "list_teacher_booked",
            Request::ListStudentBooked { .. } => "list_student_booked",
            Request::ListCompleted { .. } => "list_completed",
            Request::JoinRoom { .. } => "join_room",
            Request::Message { .. } => "message",
            Request::History { .. } => "history",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        data: Value,
    },
    Error {
        kind: String,
        status: u16,
        message: String,
    },
    Message {
        room: String,
        sender_email: String,
        payload: String,
    },
}

impl Reply {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind: kind.as_str().to_string(),
            status: kind.status(),
            message: message.into(),
        }
    }
}

impl From<RoomMessage> for Reply {
    fn from(m: RoomMessage) -> Self {
        Reply::Message {
            room: m.room,
            sender_email: m.message.sender_email,
            payload: m.message.payload,
        }
    }
}

/// A failed request, already classified for the reply.
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ChatError> for Failure {
    fn from(e: ChatError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<HistoryError> for Failure {
    fn from(e: HistoryError) -> Self {
        let message = match e.kind() {
            ErrorKind::Store => "chat history unavailable".to_string(),
            _ => e.to_string(),
        };
        Self {
            kind: e.kind(),
            message,
        }
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure {
        kind: ErrorKind::Store,
        message: format!("encode error: {e}"),
    })
}

/// Run one connection to completion, then drop it from every room.
pub async fn process_connection(socket: TcpStream, services: Services) -> WireResult<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (conn, inbox) = services.chat.connect();
    let result = serve(&mut framed, &services, conn, inbox).await;
    services.chat.leave(conn);
    result
}

async fn serve(
    framed: &mut Framed<TcpStream, LinesCodec>,
    services: &Services,
    conn: ConnId,
    mut inbox: mpsc::UnboundedReceiver<RoomMessage>,
) -> WireResult<()> {
    let mut caller = Caller::default();
    // Framed yields one `None` after a decoder error before it resumes reading.
    let mut resume_after_error = false;
    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None if resume_after_error => {
                        resume_after_error = false;
                        continue;
                    }
                    None => return Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(services, conn, &mut caller, &line).await,
                    // The codec discards the rest of the long line.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        resume_after_error = true;
                        Reply::error(ErrorKind::Validation, "request line too long")
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                framed.send(serde_json::to_string(&reply)?).await?;
            }
            Some(pushed) = inbox.recv() => {
                framed.send(serde_json::to_string(&Reply::from(pushed))?).await?;
            }
        }
    }
}

/// Parse, dispatch, and classify one request line.
pub async fn handle_line(
    services: &Services,
    conn: ConnId,
    caller: &mut Caller,
    line: &str,
) -> Reply {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "400")
                .increment(1);
            return Reply::error(ErrorKind::Validation, format!("malformed request: {e}"));
        }
    };

    let op = request.op();
    let started = Instant::now();
    let outcome = dispatch(services, conn, caller, request).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    let reply = match outcome {
        Ok(data) => Reply::Ok { data },
        Err(f) => {
            debug!("{op} rejected: {}", f.message);
            Reply::error(f.kind, f.message)
        }
    };
    let status = match &reply {
        Reply::Error { status, .. } => status.to_string(),
        _ => "200".to_string(),
    };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    reply
}

async fn dispatch(
    services: &Services,
    conn: ConnId,
    caller: &mut Caller,
    request: Request,
) -> Result<Value, Failure> {
    let engine = &services.engine;
    match request {
        Request::Identify {
            teacher_id,
            student_id,
            email,
        } => {
            *caller = Caller {
                teacher_id: teacher_id.map(TeacherId),
                student_id: student_id.map(StudentId),
                email,
            };
            data(&*caller)
        }
        Request::SaveProfile { name, avatar } => {
            engine
                .save_profile(caller, name.as_deref(), avatar.as_deref())
                .await?;
            Ok(Value::Null)
        }
        Request::CreateSlot { slot } => data(engine.create_slot(caller, slot).await?),
        Request::UpdateSlot { id, slot } => data(engine.update_slot(caller, id, slot).await?),
        Request::BookSlot { teacher_id, span } => {
            data(engine.book_slot(caller, TeacherId(teacher_id), span).await?)
        }
        Request::ReleaseSlot { id } => data(engine.release_slot(caller, id).await?),
        Request::CompleteSlot { id } => data(engine.complete_slot(caller, id).await?),
        Request::MarkCommented { id } => data(engine.mark_commented(caller, id).await?),
        Request::DeleteSlot { id } => data(engine.delete_slot(caller, id).await?),
        Request::ListCreated { teacher_id } => {
            data(engine.list_created(TeacherId(teacher_id)).await?)
        }
        Request::ListTeacherBooked { teacher_id } => {
            data(engine.list_teacher_booked(TeacherId(teacher_id)).await?)
        }
        Request::ListStudentBooked { student_id } => {
            data(engine.list_student_booked(StudentId(student_id)).await?)
        }
        Request::ListCompleted { student_id } => {
            data(engine.list_completed(StudentId(student_id)).await?)
        }
        Request::JoinRoom { room } => {
            services.chat.join_room(conn, &room)?;
            Ok(Value::Null)
        }
        Request::Message {
            room,
            sender_email,
            payload,
        } => {
            let sender = sender_email
                .or_else(|| caller.email.clone())
                .ok_or(ChatError::InvalidMessage("sender email is required"))?;
            data(
                services
                    .chat
                    .send_message(conn, &room, &sender, &payload)
                    .await?,
            )
        }
        Request::History { room } => data(services.history.read(&room).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::RingHistory;
    use crate::store::WalStore;
    use crate::timerange::{FixedClock, HOUR_MS};
    use serde_json::json;

    const NOW: Ms = 1_704_067_200_000;

    fn services(name: &str) -> Services {
        let dir = std::env::temp_dir().join("tutorbook_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store, Arc::new(FixedClock::new(NOW)), "http://x/");
        let ring = Arc::new(RingHistory::new(10));
        Services {
            engine: Arc::new(engine),
            chat: Arc::new(ChatHub::new(ring.clone())),
            history: HistoryReader::new(ring),
        }
    }

    async fn call(s: &Services, conn: ConnId, caller: &mut Caller, req: Value) -> Reply {
        handle_line(s, conn, caller, &req.to_string()).await
    }

    fn ok(reply: Reply) -> Value {
        match reply {
            Reply::Ok { data } => data,
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[test]
    fn requests_parse_by_op() {
        let req: Request = serde_json::from_value(json!({
            "op": "create_slot",
            "name": "Algebra",
            "span": { "start": 0, "end": 1000 },
            "category_id": 3
        }))
        .unwrap();
        assert_eq!(req.op(), "create_slot");
        match req {
            Request::CreateSlot { slot } => {
                assert_eq!(slot, SlotRequest::new("Algebra", Span::new(0, 1000)).with_category(3));
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing: Request = serde_json::from_value(json!({ "op": "create_slot" })).unwrap();
        assert!(matches!(missing, Request::CreateSlot { slot } if slot == SlotRequest::default()));
    }

    #[test]
    fn error_reply_shape() {
        let reply = Reply::error(ErrorKind::Auth, "permission denied: teacher role required");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "type": "error",
                "kind": "auth",
                "status": 401,
                "message": "permission denied: teacher role required"
            })
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_ops_are_validation_errors() {
        let s = services("malformed.wal");
        let (conn, _rx) = s.chat.connect();
        let mut caller = Caller::default();

        for line in ["not json", r#"{"op":"teleport"}"#, r#"{"op":"book_slot"}"#] {
            match handle_line(&s, conn, &mut caller, line).await {
                Reply::Error { status, kind, .. } => {
                    assert_eq!(status, 400);
                    assert_eq!(kind, "validation");
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn identify_then_create_and_book() {
        let s = services("identify.wal");
        let (conn, _rx) = s.chat.connect();
        let mut teacher = Caller::default();
        let mut student = Caller::default();

        let anonymous = call(
            &s,
            conn,
            &mut teacher,
            json!({ "op": "create_slot", "name": "Algebra", "span": { "start": NOW, "end": NOW + HOUR_MS } }),
        )
        .await;
        assert!(matches!(anonymous, Reply::Error { status: 401, .. }));

        ok(call(&s, conn, &mut teacher, json!({ "op": "identify", "teacher_id": 1 })).await);
        let created = ok(call(
            &s,
            conn,
            &mut teacher,
            json!({ "op": "create_slot", "name": "Algebra", "span": { "start": NOW, "end": NOW + HOUR_MS } }),
        )
        .await);
        assert_eq!(created["teacher_id"], json!(1));
        assert_eq!(created["student_id"], Value::Null);

        ok(call(&s, conn, &mut student, json!({ "op": "identify", "student_id": 2 })).await);
        let book = json!({ "op": "book_slot", "teacher_id": 1, "span": { "start": NOW, "end": NOW + HOUR_MS } });
        let booked = ok(call(&s, conn, &mut student, book.clone()).await);
        assert_eq!(booked["student_id"], json!(2));

        match call(&s, conn, &mut student, book).await {
            Reply::Error {
                kind,
                status,
                message,
            } => {
                assert_eq!(kind, "conflict");
                assert_eq!(status, 400);
                assert!(message.contains("already booked"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let listing = ok(call(&s, conn, &mut student, json!({ "op": "list_student_booked", "student_id": 2 })).await);
        assert_eq!(listing["status"], json!("items"));
        let empty = ok(call(&s, conn, &mut student, json!({ "op": "list_completed", "student_id": 2 })).await);
        assert_eq!(empty, json!({ "status": "no_data_yet" }));
    }

    #[tokio::test]
    async fn message_uses_identified_email() {
        let s = services("message_email.wal");
        let (a, _rx_a) = s.chat.connect();
        let (b, mut rx_b) = s.chat.connect();
        let mut caller_a = Caller::default();
        let mut caller_b = Caller::default();

        ok(call(&s, b, &mut caller_b, json!({ "op": "join_room", "room": "R" })).await);

        let nameless = call(&s, a, &mut caller_a, json!({ "op": "message", "room": "R", "payload": "hi" })).await;
        assert!(matches!(nameless, Reply::Error { status: 400, .. }));

        ok(call(&s, a, &mut caller_a, json!({ "op": "identify", "email": "a@x.io" })).await);
        let delivery = ok(call(&s, a, &mut caller_a, json!({ "op": "message", "room": "R", "payload": "hi" })).await);
        assert_eq!(delivery, json!({ "delivered": 1, "persisted": true }));
        assert_eq!(
            Reply::from(rx_b.recv().await.unwrap()),
            Reply::Message {
                room: "R".into(),
                sender_email: "a@x.io".into(),
                payload: "hi".into()
            }
        );

        let history = ok(call(&s, b, &mut caller_b, json!({ "op": "history", "room": "R" })).await);
        assert_eq!(
            history,
            json!({ "status": "items", "items": [{ "sender_email": "a@x.io", "payload": "hi" }] })
        );
        let none = ok(call(&s, b, &mut caller_b, json!({ "op": "history", "room": "quiet" })).await);
        assert_eq!(none, json!({ "status": "no_data_yet" }));
    }
}
