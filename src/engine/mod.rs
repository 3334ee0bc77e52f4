//! Scheduling engine: the slot lifecycle on top of a [`BookingStore`].
//!
//! Every operation runs the same pipeline, short-circuiting on the first
//! failure: capability check, field validation, the pure conflict and state
//! guards against a store snapshot, then one conditional store write. The
//! store's uniqueness index and compare-and-swap are the authoritative guards;
//! the snapshot checks only make the common rejections precise.

mod access;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::{ConflictReason, EngineError, ErrorKind};

use std::sync::Arc;

use ulid::Ulid;

use crate::limits::LINK_TOKEN_LEN;
use crate::model::*;
use crate::store::{BookingStore, ClassChange, Precondition, SLOT_KEY, StoreError};
use crate::timerange::Clock;

pub struct Engine {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    link_base: String,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        link_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            link_base: link_base.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Base URL plus the tail of a fresh ULID: Crockford base32, all random bits.
    fn new_link(&self) -> String {
        let id = Ulid::new().to_string();
        format!("{}{}", self.link_base, &id[id.len() - LINK_TOKEN_LEN..])
    }

    async fn load(&self, id: Ulid) -> Result<Class, EngineError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Conditional write. When the precondition has gone stale, `guard` is
    /// re-run on the record the store saw so the rejection names the cause.
    async fn commit(
        &self,
        id: Ulid,
        expect: Precondition,
        change: ClassChange,
        guard: impl Fn(&Class) -> Result<(), EngineError>,
    ) -> Result<Class, EngineError> {
        match self.store.update(id, expect, change, self.now()).await {
            Ok(class) => Ok(class),
            Err(StoreError::PreconditionFailed(current)) => {
                guard(&current)?;
                Err(StoreError::PreconditionFailed(current).into())
            }
            // Only a span move can hit the slot index.
            Err(StoreError::UniqueViolation(key)) if key == SLOT_KEY => {
                Err(EngineError::Conflict(ConflictReason::TeacherSchedule))
            }
            Err(e) => Err(e.into()),
        }
    }
}
