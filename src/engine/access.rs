//! Capability checks run before any mutation.

use crate::model::*;

use super::EngineError;

pub(crate) fn require_teacher(caller: &Caller) -> Result<TeacherId, EngineError> {
    caller
        .teacher_id
        .ok_or(EngineError::Auth("teacher role required"))
}

pub(crate) fn require_student(caller: &Caller) -> Result<StudentId, EngineError> {
    caller
        .student_id
        .ok_or(EngineError::Auth("student role required"))
}

pub(crate) fn require_owner(class: &Class, teacher_id: TeacherId) -> Result<(), EngineError> {
    if class.teacher_id != teacher_id {
        return Err(EngineError::Auth("not the owning teacher"));
    }
    Ok(())
}

pub(crate) fn require_booker(class: &Class, student_id: StudentId) -> Result<(), EngineError> {
    if class.student_id != Some(student_id) {
        return Err(EngineError::Auth("not the booking student"));
    }
    Ok(())
}

/// A student id plus a guarantee the caller is not booking their own class.
pub(crate) fn require_booking_rights(
    caller: &Caller,
    teacher_id: TeacherId,
) -> Result<StudentId, EngineError> {
    let student_id = require_student(caller)?;
    if caller.teacher_id == Some(teacher_id) {
        return Err(EngineError::Auth("cannot book your own class"));
    }
    Ok(student_id)
}
