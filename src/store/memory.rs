//! In-memory store — used by tests and by the `--memory` process mode.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;

use super::{Canary, CanaryListing, CanaryPatch, ListOptions, Store, matches_listing};

#[derive(Default)]
pub struct MemoryStore {
    canaries: RwLock<HashMap<String, Canary>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Canary>>, StoreError> {
        self.canaries
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned (read)".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Canary>>, StoreError> {
        self.canaries
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned (write)".into()))
    }
}

impl Store for MemoryStore {
    fn create(&self, canary: &Canary) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        if guard.contains_key(&canary.id) {
            return Err(StoreError::Conflict(format!(
                "canary with id {} already exists",
                canary.id
            )));
        }
        if guard.values().any(|c| c.slug == canary.slug) {
            return Err(StoreError::Conflict(format!(
                "canary with slug {} already exists",
                canary.slug
            )));
        }
        guard.insert(canary.id.clone(), canary.clone());
        Ok(())
    }

    fn update(&self, id: &str, patch: &CanaryPatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        let canary = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply_to(canary);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Canary, StoreError> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, opts: &ListOptions<'_>) -> Result<Vec<CanaryListing>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .values()
            .filter(|c| matches_listing(c, opts))
            .map(|c| {
                if opts.verbose {
                    CanaryListing::Full(Box::new(c.clone()))
                } else {
                    CanaryListing::Brief { id: c.id.clone(), name: c.name.clone() }
                }
            })
            .collect())
    }

    fn upcoming_deadlines(&self) -> Result<Vec<Canary>, StoreError> {
        let guard = self.read()?;
        let mut upcoming: Vec<Canary> = guard
            .values()
            .filter(|c| !c.paused && !c.late)
            .cloned()
            .collect();
        upcoming.sort_by_key(|c| c.deadline);
        Ok(upcoming)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.write()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn find_identifier(&self, slug: &str) -> Result<String, StoreError> {
        self.read()?
            .values()
            .find(|c| c.slug == slug)
            .map(|c| c.id.clone())
            .ok_or_else(|| StoreError::NotFound(slug.to_string()))
    }
}
