use std::collections::HashMap;

use crate::limits::*;
use crate::model::*;
use crate::store::ClassFilter;
use crate::timerange::{chronological_order, within_window};

use super::{Engine, EngineError};

impl Engine {
    fn upcoming(&self, classes: Vec<Class>, weeks: u32) -> Vec<Class> {
        classes
            .into_iter()
            .filter(|c| within_window(&c.span, self.clock.as_ref(), weeks))
            .collect()
    }

    /// Slots `teacher_id` teaches that start within the next two weeks.
    pub async fn list_created(&self, teacher_id: TeacherId) -> Result<Listing<SlotInfo>, EngineError> {
        let classes = self
            .store
            .find_all(&ClassFilter::taught_by(teacher_id))
            .await?;
        let slots = self
            .upcoming(classes, CREATED_WINDOW_WEEKS)
            .iter()
            .map(SlotInfo::from)
            .collect();
        Ok(Listing::from_vec(chronological_order(slots)))
    }

    /// Booked slots `teacher_id` teaches within the next week, with student names.
    pub async fn list_teacher_booked(
        &self,
        teacher_id: TeacherId,
    ) -> Result<Listing<BookedByStudent>, EngineError> {
        let classes = self
            .store
            .find_all(&ClassFilter::taught_by(teacher_id).booked(true))
            .await?;

        let mut names: HashMap<StudentId, Option<String>> = HashMap::new();
        let mut out = Vec::new();
        for class in self.upcoming(classes, BOOKED_WINDOW_WEEKS) {
            let student_name = match class.student_id {
                Some(s) => {
                    if !names.contains_key(&s) {
                        let name = self.store.find_student(s).await?.map(|p| p.name);
                        names.insert(s, name);
                    }
                    names.get(&s).cloned().flatten()
                }
                None => None,
            };
            out.push(BookedByStudent {
                slot: SlotInfo::from(&class),
                student_name,
            });
        }
        Ok(Listing::from_vec(chronological_order(out)))
    }

    /// Slots `student_id` booked that start within the next week, with the teacher's identity.
    pub async fn list_student_booked(
        &self,
        student_id: StudentId,
    ) -> Result<Listing<BookedWithTeacher>, EngineError> {
        let classes = self
            .store
            .find_all(&ClassFilter::booked_by(student_id))
            .await?;
        let out = self
            .with_teachers(self.upcoming(classes, BOOKED_WINDOW_WEEKS))
            .await?;
        Ok(Listing::from_vec(chronological_order(out)))
    }

    /// Completed classes `student_id` attended, most recently updated first.
    pub async fn list_completed(
        &self,
        student_id: StudentId,
    ) -> Result<Listing<BookedWithTeacher>, EngineError> {
        let mut classes = self
            .store
            .find_all(&ClassFilter::booked_by(student_id).completed(true))
            .await?;
        classes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(Listing::from_vec(self.with_teachers(classes).await?))
    }

    async fn with_teachers(&self, classes: Vec<Class>) -> Result<Vec<BookedWithTeacher>, EngineError> {
        let mut teachers: HashMap<TeacherId, Option<Teacher>> = HashMap::new();
        let mut out = Vec::with_capacity(classes.len());
        for class in classes {
            if !teachers.contains_key(&class.teacher_id) {
                let teacher = self.store.find_teacher(class.teacher_id).await?;
                teachers.insert(class.teacher_id, teacher);
            }
            let teacher = teachers.get(&class.teacher_id).cloned().flatten();
            out.push(BookedWithTeacher {
                slot: SlotInfo::from(&class),
                teacher_name: teacher.as_ref().map(|t| t.name.clone()),
                teacher_avatar: teacher.and_then(|t| t.avatar),
            });
        }
        Ok(out)
    }
}
