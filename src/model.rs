use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use crate::timerange::{Ms, Scheduled, Span};

pub type CategoryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeacherId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub u64);

impl fmt::Display for TeacherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teacher:{}", self.0)
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "student:{}", self.0)
    }
}

/// A bookable lesson slot.
///
/// `student_id` is the single source of truth for the booked state: a class is
/// booked iff it has a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: Ulid,
    pub teacher_id: TeacherId,
    pub student_id: Option<StudentId>,
    pub name: String,
    pub category_id: Option<CategoryId>,
    pub span: Span,
    pub is_completed: bool,
    pub is_commented: bool,
    /// Shareable link, assigned once at creation.
    pub link: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Class {
    pub fn is_booked(&self) -> bool {
        self.student_id.is_some()
    }

    pub fn duration_ms(&self) -> Ms {
        self.span.duration_ms()
    }

    /// Chat room name: the token at the end of the shareable link.
    pub fn room_name(&self) -> &str {
        self.link.rsplit('/').next().unwrap_or(&self.link)
    }
}

impl Scheduled for Class {
    fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: TeacherId,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
}

/// Identity asserted for one request. One account may hold both ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub teacher_id: Option<TeacherId>,
    pub student_id: Option<StudentId>,
    pub email: Option<String>,
}

impl Caller {
    pub fn teacher(id: u64) -> Self {
        Self {
            teacher_id: Some(TeacherId(id)),
            ..Self::default()
        }
    }

    pub fn student(id: u64) -> Self {
        Self {
            student_id: Some(StudentId(id)),
            ..Self::default()
        }
    }

    /// Account holding both roles.
    pub fn dual(teacher: u64, student: u64) -> Self {
        Self {
            teacher_id: Some(TeacherId(teacher)),
            student_id: Some(StudentId(student)),
            email: None,
        }
    }
}

/// Fields a teacher supplies when creating or editing a slot. Name and span
/// are optional here so that "missing" is a validation outcome, not a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequest {
    pub name: Option<String>,
    pub span: Option<Span>,
    pub category_id: Option<CategoryId>,
}

impl SlotRequest {
    pub fn new(name: &str, span: Span) -> Self {
        Self {
            name: Some(name.to_string()),
            span: Some(span),
            category_id: None,
        }
    }

    pub fn with_category(mut self, category_id: CategoryId) -> Self {
        self.category_id = Some(category_id);
        self
    }
}

/// Query outcome that keeps "nothing there yet" apart from failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "items", rename_all = "snake_case")]
pub enum Listing<T> {
    NoDataYet,
    Items(Vec<T>),
}

impl<T> Listing<T> {
    pub fn from_vec(items: Vec<T>) -> Self {
        if items.is_empty() {
            Listing::NoDataYet
        } else {
            Listing::Items(items)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Listing::NoDataYet)
    }

    pub fn items(&self) -> &[T] {
        match self {
            Listing::NoDataYet => &[],
            Listing::Items(items) => items,
        }
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Listing::NoDataYet => Vec::new(),
            Listing::Items(items) => items,
        }
    }
}

/// One flat event per store mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TeacherSaved {
        teacher: Teacher,
    },
    StudentSaved {
        student: Student,
    },
    /// Also the compaction snapshot of a live class.
    ClassCreated {
        class: Class,
    },
    ClassUpdated {
        id: Ulid,
        name: String,
        category_id: Option<CategoryId>,
        span: Span,
        at: Ms,
    },
    ClassBooked {
        id: Ulid,
        student_id: StudentId,
        at: Ms,
    },
    ClassReleased {
        id: Ulid,
        at: Ms,
    },
    ClassCompleted {
        id: Ulid,
        at: Ms,
    },
    ClassCommented {
        id: Ulid,
        at: Ms,
    },
    ClassDeleted {
        id: Ulid,
    },
}

impl Event {
    /// Class the event touches, if any.
    pub fn class_id(&self) -> Option<Ulid> {
        match self {
            Event::ClassCreated { class } => Some(class.id),
            Event::ClassUpdated { id, .. }
            | Event::ClassBooked { id, .. }
            | Event::ClassReleased { id, .. }
            | Event::ClassCompleted { id, .. }
            | Event::ClassCommented { id, .. }
            | Event::ClassDeleted { id } => Some(*id),
            Event::TeacherSaved { .. } | Event::StudentSaved { .. } => None,
        }
    }
}

/// Apply a class-level event to a class record. Create/delete are handled by the store.
pub fn apply_to_class(class: &mut Class, event: &Event) {
    match event {
        Event::ClassUpdated {
            name,
            category_id,
            span,
            at,
            ..
        } => {
            class.name = name.clone();
            class.category_id = *category_id;
            class.span = *span;
            class.updated_at = *at;
        }
        Event::ClassBooked { student_id, at, .. } => {
            class.student_id = Some(*student_id);
            class.updated_at = *at;
        }
        Event::ClassReleased { at, .. } => {
            class.student_id = None;
            class.updated_at = *at;
        }
        Event::ClassCompleted { at, .. } => {
            class.is_completed = true;
            class.updated_at = *at;
        }
        Event::ClassCommented { at, .. } => {
            class.is_commented = true;
            class.updated_at = *at;
        }
        Event::ClassCreated { .. }
        | Event::ClassDeleted { .. }
        | Event::TeacherSaved { .. }
        | Event::StudentSaved { .. } => {}
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub teacher_id: TeacherId,
    pub student_id: Option<StudentId>,
    pub name: String,
    pub category_id: Option<CategoryId>,
    pub start: Ms,
    pub end: Ms,
    pub duration_ms: Ms,
    pub is_booked: bool,
    pub is_completed: bool,
    pub is_commented: bool,
    pub link: String,
    /// Chat room for this class, the token at the end of `link`.
    pub room: String,
    pub updated_at: Ms,
}

impl From<&Class> for SlotInfo {
    fn from(c: &Class) -> Self {
        Self {
            id: c.id,
            teacher_id: c.teacher_id,
            student_id: c.student_id,
            name: c.name.clone(),
            category_id: c.category_id,
            start: c.span.start,
            end: c.span.end,
            duration_ms: c.duration_ms(),
            is_booked: c.is_booked(),
            is_completed: c.is_completed,
            is_commented: c.is_commented,
            link: c.link.clone(),
            room: c.room_name().to_string(),
            updated_at: c.updated_at,
        }
    }
}

impl Scheduled for SlotInfo {
    fn span(&self) -> Span {
        Span {
            start: self.start,
            end: self.end,
        }
    }
}

/// A teacher's booked slot, joined with the booking student's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedByStudent {
    #[serde(flatten)]
    pub slot: SlotInfo,
    pub student_name: Option<String>,
}

/// A student's booked slot, joined with the teacher's public identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedWithTeacher {
    #[serde(flatten)]
    pub slot: SlotInfo,
    pub teacher_name: Option<String>,
    pub teacher_avatar: Option<String>,
}

impl Scheduled for BookedByStudent {
    fn span(&self) -> Span {
        self.slot.span()
    }
}

impl Scheduled for BookedWithTeacher {
    fn span(&self) -> Span {
        self.slot.span()
    }
}
