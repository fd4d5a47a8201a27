//! In-flight operation registry
//!
//! The guard is the only state shared between launchers and pollers. A
//! successful acquisition hands out a [`GuardLease`]; the lease travels into
//! the poller task and gives the entry back when it is released or dropped,
//! so there is no cleanup path that can be forgotten.

use crate::status::{EntityId, OperationKind};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// How wide a single in-flight operation blocks new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardScope {
    /// Any operation on an entity blocks every other kind on it.
    #[default]
    Entity,
    /// Only the same (entity, kind) pair is blocked.
    EntityAndKind,
}

#[derive(Debug)]
struct GuardEntry {
    entity: EntityId,
    kind: OperationKind,
    lease_id: Uuid,
    sequence: u64,
}

#[derive(Clone)]
pub struct OperationGuard {
    scope: GuardScope,
    entries: Arc<Mutex<HashMap<(EntityId, OperationKind), GuardEntry>>>,
    sequence: Arc<AtomicU64>,
}

impl OperationGuard {
    pub fn new(scope: GuardScope) -> Self {
        Self {
            scope,
            entries: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(EntityId, OperationKind), GuardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `entity` for `kind`. Returns `None` without side effects when a
    /// conflicting entry is already held.
    pub fn try_acquire(&self, entity: EntityId, kind: OperationKind) -> Option<GuardLease> {
        let mut entries = self.lock();

        let blocked = match self.scope {
            GuardScope::Entity => entries.keys().any(|(held, _)| *held == entity),
            GuardScope::EntityAndKind => entries.contains_key(&(entity, kind)),
        };
        if blocked {
            debug!("Guard busy for {} ({} requested)", entity, kind);
            return None;
        }

        let lease_id = Uuid::new_v4();
        entries.insert(
            (entity, kind),
            GuardEntry {
                entity,
                kind,
                lease_id,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            },
        );
        debug!("Guard acquired for {} ({})", entity, kind);

        Some(GuardLease {
            guard: self.clone(),
            entity,
            kind,
            lease_id,
            released: false,
        })
    }

    pub fn can_start(&self, entity: EntityId, kind: OperationKind) -> bool {
        let entries = self.lock();
        match self.scope {
            GuardScope::Entity => !entries.keys().any(|(held, _)| *held == entity),
            GuardScope::EntityAndKind => !entries.contains_key(&(entity, kind)),
        }
    }

    /// Drop every entry for `entity`. Releasing an unheld entity is a no-op.
    pub fn release(&self, entity: EntityId) {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(held, _), _| *held != entity);
        if entries.len() != before {
            debug!("Guard released for {}", entity);
        }
    }

    #[cfg(test)]
    pub fn is_held(&self, entity: EntityId) -> bool {
        self.lock().keys().any(|(held, _)| *held == entity)
    }

    /// Kinds currently in flight for `entity`, oldest first.
    pub fn held_kinds(&self, entity: EntityId) -> Vec<OperationKind> {
        let entries = self.lock();
        let mut held: Vec<&GuardEntry> = entries
            .values()
            .filter(|entry| entry.entity == entity)
            .collect();
        held.sort_by_key(|entry| entry.sequence);
        held.into_iter().map(|entry| entry.kind).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Only removes the entry if it still belongs to `lease_id`, so a stale
    /// lease can never free a newer acquisition.
    fn release_lease(&self, entity: EntityId, kind: OperationKind, lease_id: Uuid) -> bool {
        let mut entries = self.lock();
        match entries.get(&(entity, kind)) {
            Some(entry) if entry.lease_id == lease_id => {
                entries.remove(&(entity, kind));
                true
            }
            _ => false,
        }
    }
}

/// Ownership of one guard entry.
pub struct GuardLease {
    guard: OperationGuard,
    entity: EntityId,
    kind: OperationKind,
    lease_id: Uuid,
    released: bool,
}

impl GuardLease {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Give the entry back now. Returns false if it was already gone.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let removed = self
            .guard
            .release_lease(self.entity, self.kind, self.lease_id);
        if removed {
            debug!("Guard lease returned for {} ({})", self.entity, self.kind);
        }
        removed
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for GuardLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardLease")
            .field("entity", &self.entity)
            .field("kind", &self.kind)
            .field("lease_id", &self.lease_id)
            .field("released", &self.released)
            .finish()
    }
}
