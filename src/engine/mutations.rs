use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{ClassChange, ClassFilter, LINK_KEY, NewClass, Precondition, SLOT_KEY, StoreError};

use super::access::*;
use super::conflict::*;
use super::{ConflictReason, Engine, EngineError};

fn deletable(class: &Class, teacher_id: TeacherId) -> Result<(), EngineError> {
    // Completed classes are undeletable for everyone, owner or not.
    editable(class)?;
    require_owner(class, teacher_id)?;
    if class.is_booked() {
        return Err(EngineError::Conflict(ConflictReason::AlreadyBooked));
    }
    Ok(())
}

impl Engine {
    /// Overlap pre-check against every class the caller's account is tied to.
    async fn check_caller_schedule(
        &self,
        caller: &Caller,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let booked = match caller.student_id {
            Some(s) => self.store.find_all(&ClassFilter::booked_by(s)).await?,
            None => Vec::new(),
        };
        let taught = match caller.teacher_id {
            Some(t) => self.store.find_all(&ClassFilter::taught_by(t)).await?,
            None => Vec::new(),
        };
        check_schedule(span, &taught, &booked, exclude).map_err(|reason| {
            debug!("schedule conflict at [{}, {}): {reason}", span.start, span.end);
            EngineError::Conflict(reason)
        })
    }

    pub async fn create_slot(&self, caller: &Caller, req: SlotRequest) -> Result<Class, EngineError> {
        let teacher_id = require_teacher(caller)?;
        let name = validate_name(req.name.as_deref())?;
        let span = validate_span(req.span)?;
        self.check_caller_schedule(caller, &span, None).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let new = NewClass {
                teacher_id,
                name: name.clone(),
                category_id: req.category_id,
                span,
                link: self.new_link(),
                at: self.now(),
            };
            match self.store.create(new).await {
                Ok(class) => {
                    info!("class {} created by {teacher_id}", class.id);
                    return Ok(class);
                }
                // The overlap scan raced with another create; the index is authoritative.
                Err(StoreError::UniqueViolation(key)) if key == SLOT_KEY => {
                    return Err(EngineError::Conflict(ConflictReason::TeacherSchedule));
                }
                Err(StoreError::UniqueViolation(key))
                    if key == LINK_KEY && attempt < MAX_LINK_ATTEMPTS =>
                {
                    warn!("link collision on attempt {attempt}, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn update_slot(
        &self,
        caller: &Caller,
        id: Ulid,
        req: SlotRequest,
    ) -> Result<Class, EngineError> {
        let teacher_id = require_teacher(caller)?;
        let name = validate_name(req.name.as_deref())?;
        let span = validate_span(req.span)?;

        let guard = |c: &Class| {
            require_owner(c, teacher_id)?;
            editable(c)
        };
        guard(&self.load(id).await?)?;
        self.check_caller_schedule(caller, &span, Some(id)).await?;

        let change = ClassChange::Details {
            name,
            category_id: req.category_id,
            span,
        };
        let expect = Precondition::none().owned_by(teacher_id).completed(false);
        let class = self.commit(id, expect, change, guard).await?;
        info!("class {id} updated by {teacher_id}");
        Ok(class)
    }

    /// Book the class `teacher_id` holds at exactly `span`.
    pub async fn book_slot(
        &self,
        caller: &Caller,
        teacher_id: TeacherId,
        span: Span,
    ) -> Result<Class, EngineError> {
        let student_id = require_booking_rights(caller, teacher_id)?;
        let class = self
            .store
            .find_one(&ClassFilter::taught_by(teacher_id).at(span))
            .await?
            .ok_or(EngineError::NoSlotAt { teacher_id, span })?;
        bookable(&class)?;
        self.check_caller_schedule(caller, &class.span, Some(class.id))
            .await?;

        let expect = Precondition::none().booked(false).completed(false);
        let booked = self
            .commit(class.id, expect, ClassChange::Book(student_id), bookable)
            .await?;
        info!("class {} booked by {student_id}", booked.id);
        Ok(booked)
    }

    pub async fn release_slot(&self, caller: &Caller, id: Ulid) -> Result<Class, EngineError> {
        let student_id = require_student(caller)?;
        let guard = |c: &Class| {
            require_booker(c, student_id)?;
            editable(c)
        };
        guard(&self.load(id).await?)?;

        let expect = Precondition::none().booked_by(student_id).completed(false);
        let class = self.commit(id, expect, ClassChange::Release, guard).await?;
        info!("class {id} released by {student_id}");
        Ok(class)
    }

    pub async fn complete_slot(&self, caller: &Caller, id: Ulid) -> Result<Class, EngineError> {
        let teacher_id = require_teacher(caller)?;
        let guard = |c: &Class| {
            require_owner(c, teacher_id)?;
            completable(c)
        };
        guard(&self.load(id).await?)?;

        let expect = Precondition::none()
            .owned_by(teacher_id)
            .booked(true)
            .completed(false);
        let class = self.commit(id, expect, ClassChange::Complete, guard).await?;
        info!("class {id} completed");
        Ok(class)
    }

    pub async fn mark_commented(&self, caller: &Caller, id: Ulid) -> Result<Class, EngineError> {
        let student_id = require_student(caller)?;
        let guard = |c: &Class| {
            require_booker(c, student_id)?;
            commentable(c)
        };
        guard(&self.load(id).await?)?;

        let expect = Precondition::none()
            .booked_by(student_id)
            .completed(true)
            .commented(false);
        self.commit(id, expect, ClassChange::Comment, guard).await
    }

    /// Remove an unbooked class. Returns the removed record.
    pub async fn delete_slot(&self, caller: &Caller, id: Ulid) -> Result<Class, EngineError> {
        let teacher_id = require_teacher(caller)?;
        deletable(&self.load(id).await?, teacher_id)?;

        let expect = Precondition::none()
            .owned_by(teacher_id)
            .booked(false)
            .completed(false);
        match self.store.destroy(id, expect).await {
            Ok(class) => {
                info!("class {id} deleted by {teacher_id}");
                Ok(class)
            }
            Err(StoreError::PreconditionFailed(current)) => {
                deletable(&current, teacher_id)?;
                Err(StoreError::PreconditionFailed(current).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record display names for whichever roles the caller holds.
    pub async fn save_profile(
        &self,
        caller: &Caller,
        name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<(), EngineError> {
        if caller.teacher_id.is_none() && caller.student_id.is_none() {
            return Err(EngineError::Auth("no role to save a profile for"));
        }
        let name = validate_name(name)?;
        let avatar = validate_avatar(avatar)?;

        if let Some(id) = caller.teacher_id {
            self.store
                .save_teacher(Teacher {
                    id,
                    name: name.clone(),
                    avatar,
                })
                .await?;
        }
        if let Some(id) = caller.student_id {
            self.store.save_student(Student { id, name }).await?;
        }
        Ok(())
    }
}
