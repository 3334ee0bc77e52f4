use tracing::error;
use ulid::Ulid;

use crate::model::{Span, TeacherId};
use crate::store::StoreError;

/// Coarse error class shared by every layer the transport reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Conflict,
    Store,
}

impl ErrorKind {
    /// HTTP-equivalent status code.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::Conflict => 400,
            ErrorKind::Auth => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Store => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Store => "store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Overlaps a class the caller teaches.
    TeacherSchedule,
    /// Overlaps a class the caller booked as a student.
    StudentSchedule,
    AlreadyBooked,
    AlreadyCompleted,
    NotBooked,
    NotCompleted,
    AlreadyCommented,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictReason::TeacherSchedule => "teacher-schedule",
            ConflictReason::StudentSchedule => "student-schedule",
            ConflictReason::AlreadyBooked => "already-booked",
            ConflictReason::AlreadyCompleted => "already-completed",
            ConflictReason::NotBooked => "not-booked",
            ConflictReason::NotCompleted => "not-completed",
            ConflictReason::AlreadyCommented => "already-commented",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ConflictReason::TeacherSchedule => "conflicts with another class you teach",
            ConflictReason::StudentSchedule => "conflicts with another class you booked as student",
            ConflictReason::AlreadyBooked => "class is already booked",
            ConflictReason::AlreadyCompleted => "class is already completed",
            ConflictReason::NotBooked => "class is not booked",
            ConflictReason::NotCompleted => "class is not completed yet",
            ConflictReason::AlreadyCommented => "class is already commented",
        };
        f.write_str(msg)
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(&'static str),
    Auth(&'static str),
    NotFound(Ulid),
    /// No class at the exact `(teacher, span)` a booking named.
    NoSlotAt {
        teacher_id: TeacherId,
        span: Span,
    },
    Conflict(ConflictReason),
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Auth(_) => ErrorKind::Auth,
            EngineError::NotFound(_) | EngineError::NoSlotAt { .. } => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Store(_) => ErrorKind::Store,
        }
    }

    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            EngineError::Conflict(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Auth(msg) => write!(f, "permission denied: {msg}"),
            EngineError::NotFound(id) => write!(f, "class not found: {id}"),
            EngineError::NoSlotAt { teacher_id, span } => write!(
                f,
                "no class for {teacher_id} at [{}, {})",
                span.start, span.end
            ),
            EngineError::Conflict(reason) => write!(f, "conflict: {reason}"),
            // Persistence details stay in the log.
            EngineError::Store(_) => write!(f, "internal storage error"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Store errors reaching the engine boundary. A record that vanished under a
/// lock is a plain not-found; everything else is logged and surfaced opaquely.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => {
                error!("store failure: {other}");
                EngineError::Store(other)
            }
        }
    }
}
