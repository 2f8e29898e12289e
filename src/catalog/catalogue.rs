//! Catalogue administration
//!
//! The catalogue is the source of truth for (project, queue) -> pool.
//! Entries are created once by the routing layer at first use and are
//! immutable afterwards except through the explicit `update` below. At
//! most one entry exists per (project, queue).

use std::sync::Arc;

use crate::backend::{CatalogEntry, ControlBackend};
use crate::core::error::{StorageError, StorageResult};

pub struct CatalogueController {
    control: Arc<dyn ControlBackend>,
}

impl CatalogueController {
    pub fn new(control: Arc<dyn ControlBackend>) -> Self {
        Self { control }
    }

    pub async fn list(&self, project: Option<&str>) -> StorageResult<Vec<CatalogEntry>> {
        self.control.catalogue_list(project).await
    }

    pub async fn get(&self, project: Option<&str>, queue: &str) -> StorageResult<CatalogEntry> {
        self.control
            .catalogue_get(project, queue)
            .await?
            .ok_or_else(|| StorageError::QueueNotMapped {
                queue: queue.to_string(),
                project: project.map(str::to_string),
            })
    }

    pub async fn exists(&self, project: Option<&str>, queue: &str) -> StorageResult<bool> {
        Ok(self.control.catalogue_get(project, queue).await?.is_some())
    }

    pub async fn insert(
        &self,
        project: Option<&str>,
        queue: &str,
        pool: &str,
    ) -> StorageResult<()> {
        self.control
            .catalogue_insert(CatalogEntry {
                project: project.map(str::to_string),
                queue: queue.to_string(),
                pool: pool.to_string(),
            })
            .await
    }

    pub async fn update(
        &self,
        project: Option<&str>,
        queue: &str,
        pool: &str,
    ) -> StorageResult<()> {
        let updated = self.control.catalogue_update(project, queue, pool).await?;
        if updated {
            Ok(())
        } else {
            Err(StorageError::QueueNotMapped {
                queue: queue.to_string(),
                project: project.map(str::to_string),
            })
        }
    }

    pub async fn delete(&self, project: Option<&str>, queue: &str) -> StorageResult<()> {
        self.control.catalogue_delete(project, queue).await
    }

    pub async fn drop_all(&self) -> StorageResult<()> {
        self.control.catalogue_drop_all().await
    }
}
