//! Booking store: classes and the people who teach and book them.
//!
//! The engine depends only on [`BookingStore`]. [`WalStore`] is the
//! in-process implementation: memory-resident records, a per-class lock for
//! conditional writes, and a group-commit write-ahead log for durability.

mod error;
mod wal_store;

pub use error::StoreError;
pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

/// Constraint named by `UniqueViolation` for a duplicate `(teacher_id, span)`.
pub const SLOT_KEY: &str = "teacher_id, time range";
/// Constraint named by `UniqueViolation` for a duplicate link.
pub const LINK_KEY: &str = "link";

/// Equality filter over class fields. Unset fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassFilter {
    pub teacher_id: Option<TeacherId>,
    pub student_id: Option<StudentId>,
    pub span: Option<Span>,
    pub booked: Option<bool>,
    pub completed: Option<bool>,
}

impl ClassFilter {
    pub fn taught_by(teacher_id: TeacherId) -> Self {
        Self {
            teacher_id: Some(teacher_id),
            ..Self::default()
        }
    }

    pub fn booked_by(student_id: StudentId) -> Self {
        Self {
            student_id: Some(student_id),
            ..Self::default()
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn booked(mut self, booked: bool) -> Self {
        self.booked = Some(booked);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn matches(&self, c: &Class) -> bool {
        self.teacher_id.is_none_or(|t| c.teacher_id == t)
            && self.student_id.is_none_or(|s| c.student_id == Some(s))
            && self.span.is_none_or(|s| c.span == s)
            && self.booked.is_none_or(|b| c.is_booked() == b)
            && self.completed.is_none_or(|d| c.is_completed == d)
    }
}

/// Guard re-checked under the class lock before a conditional write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Precondition {
    pub teacher_id: Option<TeacherId>,
    pub booked: Option<bool>,
    pub booked_by: Option<StudentId>,
    pub completed: Option<bool>,
    pub commented: Option<bool>,
}

impl Precondition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn owned_by(mut self, teacher_id: TeacherId) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    pub fn booked(mut self, booked: bool) -> Self {
        self.booked = Some(booked);
        self
    }

    pub fn booked_by(mut self, student_id: StudentId) -> Self {
        self.booked_by = Some(student_id);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn commented(mut self, commented: bool) -> Self {
        self.commented = Some(commented);
        self
    }

    pub fn holds(&self, c: &Class) -> bool {
        self.teacher_id.is_none_or(|t| c.teacher_id == t)
            && self.booked.is_none_or(|b| c.is_booked() == b)
            && self.booked_by.is_none_or(|s| c.student_id == Some(s))
            && self.completed.is_none_or(|d| c.is_completed == d)
            && self.commented.is_none_or(|m| c.is_commented == m)
    }
}

/// A class as requested by the engine; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClass {
    pub teacher_id: TeacherId,
    pub name: String,
    pub category_id: Option<CategoryId>,
    pub span: Span,
    pub link: String,
    pub at: Ms,
}

/// One mutation of an existing class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassChange {
    Details {
        name: String,
        category_id: Option<CategoryId>,
        span: Span,
    },
    Book(StudentId),
    Release,
    Complete,
    Comment,
}

impl ClassChange {
    pub(crate) fn into_event(self, id: Ulid, at: Ms) -> Event {
        match self {
            ClassChange::Details {
                name,
                category_id,
                span,
            } => Event::ClassUpdated {
                id,
                name,
                category_id,
                span,
                at,
            },
            ClassChange::Book(student_id) => Event::ClassBooked { id, student_id, at },
            ClassChange::Release => Event::ClassReleased { id, at },
            ClassChange::Complete => Event::ClassCompleted { id, at },
            ClassChange::Comment => Event::ClassCommented { id, at },
        }
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Class>, StoreError>;

    async fn find_all(&self, filter: &ClassFilter) -> Result<Vec<Class>, StoreError>;

    async fn find_one(&self, filter: &ClassFilter) -> Result<Option<Class>, StoreError>;

    /// Insert a class. Rejects a duplicate `(teacher_id, span)` or link.
    async fn create(&self, new: NewClass) -> Result<Class, StoreError>;

    /// Conditional update: applied only if `expect` still holds under the lock.
    async fn update(
        &self,
        id: Ulid,
        expect: Precondition,
        change: ClassChange,
        at: Ms,
    ) -> Result<Class, StoreError>;

    /// Conditional delete; returns the removed record.
    async fn destroy(&self, id: Ulid, expect: Precondition) -> Result<Class, StoreError>;

    async fn find_teacher(&self, id: TeacherId) -> Result<Option<Teacher>, StoreError>;

    async fn find_student(&self, id: StudentId) -> Result<Option<Student>, StoreError>;

    async fn save_teacher(&self, teacher: Teacher) -> Result<(), StoreError>;

    async fn save_student(&self, student: Student) -> Result<(), StoreError>;
}
