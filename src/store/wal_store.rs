use std::hash::Hash;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::{Wal, WalMark};

use super::{
    BookingStore, ClassChange, ClassFilter, LINK_KEY, NewClass, Precondition, SLOT_KEY, StoreError,
};

pub type SharedClass = Arc<RwLock<Class>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// committed together with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_command(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = wal.mark().and_then(|mark| write_batch(wal, &batch, mark));

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

/// All or nothing: every caller is told the batch failed, so none of it may
/// stay on disk for replay to pick up.
fn write_batch(wal: &mut Wal, batch: &[(Event, Ack)], mark: WalMark) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &written {
        if let Err(undo) = wal.rollback(mark) {
            error!("WAL rollback after failed batch ({e}) also failed: {undo}");
        }
    }
    written
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

fn reserve<K: Eq + Hash>(
    map: &DashMap<K, Ulid>,
    key: K,
    id: Ulid,
    constraint: &'static str,
) -> Result<(), StoreError> {
    match map.entry(key) {
        Entry::Occupied(_) => Err(StoreError::UniqueViolation(constraint)),
        Entry::Vacant(slot) => {
            slot.insert(id);
            Ok(())
        }
    }
}

fn release<K: Eq + Hash>(map: &DashMap<K, Ulid>, key: &K, id: Ulid) {
    map.remove_if(key, |_, owner| *owner == id);
}

/// Memory-resident booking store made durable by a write-ahead log.
pub struct WalStore {
    classes: DashMap<Ulid, SharedClass>,
    teachers: DashMap<TeacherId, Teacher>,
    students: DashMap<StudentId, Student>,
    by_teacher: DashMap<TeacherId, Vec<Ulid>>,
    by_student: DashMap<StudentId, Vec<Ulid>>,
    slot_keys: DashMap<(TeacherId, Span), Ulid>,
    links: DashMap<String, Ulid>,
    /// Mutations hold it shared from append to apply; compaction holds it
    /// exclusively from snapshot to swap, so no commit lands in the old log
    /// after its record was snapshotted.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay the log at `path` and start the writer task. Needs a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            classes: DashMap::new(),
            teachers: DashMap::new(),
            students: DashMap::new(),
            by_teacher: DashMap::new(),
            by_student: DashMap::new(),
            slot_keys: DashMap::new(),
            links: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
        };
        for event in &events {
            store.replay_event(event);
        }
        info!(
            "booking store opened: {} events, {} classes",
            events.len(),
            store.classes.len()
        );
        Ok(store)
    }

    // We are the only owner of every Arc during replay, so try_write never fails.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::TeacherSaved { teacher } => {
                self.teachers.insert(teacher.id, teacher.clone());
            }
            Event::StudentSaved { student } => {
                self.students.insert(student.id, student.clone());
            }
            Event::ClassCreated { class } => {
                self.index_class(class);
                self.classes
                    .insert(class.id, Arc::new(RwLock::new(class.clone())));
            }
            Event::ClassDeleted { id } => {
                if let Some((_, shared)) = self.classes.remove(id)
                    && let Ok(class) = shared.try_read()
                {
                    self.unindex_class(&class);
                }
            }
            other => {
                let Some(shared) = other.class_id().and_then(|id| self.shared(&id)) else {
                    return;
                };
                if let Ok(mut class) = shared.try_write() {
                    let before = class.clone();
                    apply_to_class(&mut class, other);
                    self.reindex(&before, &class);
                }
            }
        }
    }

    pub(super) fn shared(&self, id: &Ulid) -> Option<SharedClass> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    fn index_class(&self, c: &Class) {
        self.by_teacher.entry(c.teacher_id).or_default().push(c.id);
        if let Some(s) = c.student_id {
            self.by_student.entry(s).or_default().push(c.id);
        }
        self.slot_keys.insert((c.teacher_id, c.span), c.id);
        self.links.insert(c.link.clone(), c.id);
    }

    fn unindex_class(&self, c: &Class) {
        if let Some(mut ids) = self.by_teacher.get_mut(&c.teacher_id) {
            ids.retain(|id| *id != c.id);
        }
        if let Some(s) = c.student_id
            && let Some(mut ids) = self.by_student.get_mut(&s)
        {
            ids.retain(|id| *id != c.id);
        }
        release(&self.slot_keys, &(c.teacher_id, c.span), c.id);
        release(&self.links, &c.link, c.id);
    }

    fn reindex(&self, before: &Class, after: &Class) {
        if before.span != after.span {
            release(&self.slot_keys, &(before.teacher_id, before.span), before.id);
            self.slot_keys.insert((after.teacher_id, after.span), after.id);
        }
        if before.student_id != after.student_id {
            if let Some(s) = before.student_id
                && let Some(mut ids) = self.by_student.get_mut(&s)
            {
                ids.retain(|id| *id != before.id);
            }
            if let Some(s) = after.student_id {
                self.by_student.entry(s).or_default().push(after.id);
            }
        }
    }

    /// Write an event through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Candidate ids for a filter, narrowed by the secondary indexes.
    fn candidates(&self, filter: &ClassFilter) -> Vec<SharedClass> {
        let ids: Vec<Ulid> = match (filter.teacher_id, filter.span, filter.student_id) {
            (Some(t), Some(span), _) => self
                .slot_keys
                .get(&(t, span))
                .map(|e| *e.value())
                .into_iter()
                .collect(),
            (Some(t), None, _) => self
                .by_teacher
                .get(&t)
                .map(|e| e.value().clone())
                .unwrap_or_default(),
            (None, _, Some(s)) => self
                .by_student
                .get(&s)
                .map(|e| e.value().clone())
                .unwrap_or_default(),
            (None, _, None) => self.classes.iter().map(|e| *e.key()).collect(),
        };
        ids.iter().filter_map(|id| self.shared(id)).collect()
    }

    /// Rewrite the log as one snapshot event per live record.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events: Vec<Event> = self
            .teachers
            .iter()
            .map(|e| Event::TeacherSaved {
                teacher: e.value().clone(),
            })
            .collect();
        events.extend(self.students.iter().map(|e| Event::StudentSaved {
            student: e.value().clone(),
        }));

        let shared: Vec<SharedClass> = self.classes.iter().map(|e| e.value().clone()).collect();
        for class in shared {
            events.push(Event::ClassCreated {
                class: class.read().await.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Ids in the order `compact` visits them.
    #[cfg(test)]
    pub(super) fn class_ids(&self) -> Vec<Ulid> {
        self.classes.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Class>, StoreError> {
        match self.shared(&id) {
            Some(shared) => Ok(Some(shared.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn find_all(&self, filter: &ClassFilter) -> Result<Vec<Class>, StoreError> {
        let mut out = Vec::new();
        for shared in self.candidates(filter) {
            let class = shared.read().await;
            if filter.matches(&class) {
                out.push(class.clone());
            }
        }
        Ok(out)
    }

    async fn find_one(&self, filter: &ClassFilter) -> Result<Option<Class>, StoreError> {
        for shared in self.candidates(filter) {
            let class = shared.read().await;
            if filter.matches(&class) {
                return Ok(Some(class.clone()));
            }
        }
        Ok(None)
    }

    async fn create(&self, new: NewClass) -> Result<Class, StoreError> {
        let id = Ulid::new();
        let key = (new.teacher_id, new.span);
        reserve(&self.slot_keys, key, id, SLOT_KEY)?;
        if let Err(e) = reserve(&self.links, new.link.clone(), id, LINK_KEY) {
            release(&self.slot_keys, &key, id);
            return Err(e);
        }

        let class = Class {
            id,
            teacher_id: new.teacher_id,
            student_id: None,
            name: new.name,
            category_id: new.category_id,
            span: new.span,
            is_completed: false,
            is_commented: false,
            link: new.link,
            created_at: new.at,
            updated_at: new.at,
        };
        let event = Event::ClassCreated {
            class: class.clone(),
        };
        let _gate = self.commit_gate.read().await;
        if let Err(e) = self.wal_append(&event).await {
            release(&self.slot_keys, &key, id);
            release(&self.links, &class.link, id);
            return Err(e);
        }

        self.by_teacher.entry(class.teacher_id).or_default().push(id);
        self.classes
            .insert(id, Arc::new(RwLock::new(class.clone())));
        Ok(class)
    }

    async fn update(
        &self,
        id: Ulid,
        expect: Precondition,
        change: ClassChange,
        at: Ms,
    ) -> Result<Class, StoreError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.shared(&id).ok_or(StoreError::NotFound(id))?;
        let mut class = shared.write().await;
        // Destroyed while we waited for the lock.
        if !self.classes.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if !expect.holds(&class) {
            return Err(StoreError::PreconditionFailed(Box::new(class.clone())));
        }

        let event = change.into_event(id, at);
        let moved_to = match &event {
            Event::ClassUpdated { span, .. } if *span != class.span => Some((class.teacher_id, *span)),
            _ => None,
        };
        if let Some(key) = moved_to {
            reserve(&self.slot_keys, key, id, SLOT_KEY)?;
        }
        if let Err(e) = self.wal_append(&event).await {
            if let Some(key) = moved_to {
                release(&self.slot_keys, &key, id);
            }
            return Err(e);
        }

        let before = class.clone();
        apply_to_class(&mut class, &event);
        self.reindex(&before, &class);
        Ok(class.clone())
    }

    async fn destroy(&self, id: Ulid, expect: Precondition) -> Result<Class, StoreError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.shared(&id).ok_or(StoreError::NotFound(id))?;
        let class = shared.write().await;
        if !self.classes.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if !expect.holds(&class) {
            return Err(StoreError::PreconditionFailed(Box::new(class.clone())));
        }

        self.wal_append(&Event::ClassDeleted { id }).await?;
        self.classes.remove(&id);
        self.unindex_class(&class);
        Ok(class.clone())
    }

    async fn find_teacher(&self, id: TeacherId) -> Result<Option<Teacher>, StoreError> {
        Ok(self.teachers.get(&id).map(|e| e.value().clone()))
    }

    async fn find_student(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        Ok(self.students.get(&id).map(|e| e.value().clone()))
    }

    async fn save_teacher(&self, teacher: Teacher) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::TeacherSaved {
            teacher: teacher.clone(),
        })
        .await?;
        self.teachers.insert(teacher.id, teacher);
        Ok(())
    }

    async fn save_student(&self, student: Student) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::StudentSaved {
            student: student.clone(),
        })
        .await?;
        self.students.insert(student.id, student);
        Ok(())
    }
}
