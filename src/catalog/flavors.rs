//! Flavor administration
//!
//! A flavor is a named selector over a pool group, used to steer new
//! queues toward pools with specific capabilities. Flavors are
//! project-scoped; the capability list stored on the record is
//! descriptive metadata for clients, while the enforced truth lives with
//! the pools themselves.

use std::sync::Arc;

use crate::backend::{Capability, ControlBackend, FlavorRecord, FlavorUpdate};
use crate::core::error::{StorageError, StorageResult};

pub struct FlavorsController {
    control: Arc<dyn ControlBackend>,
}

impl FlavorsController {
    pub fn new(control: Arc<dyn ControlBackend>) -> Self {
        Self { control }
    }

    pub async fn create(
        &self,
        name: &str,
        project: Option<&str>,
        pool_group: &str,
        capabilities: Vec<Capability>,
    ) -> StorageResult<()> {
        self.control
            .flavor_insert(FlavorRecord {
                name: name.to_string(),
                project: project.map(str::to_string),
                pool_group: pool_group.to_string(),
                capabilities,
            })
            .await
    }

    pub async fn get(&self, name: &str, project: Option<&str>) -> StorageResult<FlavorRecord> {
        self.control
            .flavor_get(name, project)
            .await?
            .ok_or_else(|| StorageError::FlavorDoesNotExist {
                name: name.to_string(),
            })
    }

    pub async fn exists(&self, name: &str, project: Option<&str>) -> StorageResult<bool> {
        Ok(self.control.flavor_get(name, project).await?.is_some())
    }

    pub async fn update(
        &self,
        name: &str,
        project: Option<&str>,
        update: FlavorUpdate,
    ) -> StorageResult<()> {
        let updated = self.control.flavor_update(name, project, update).await?;
        if updated {
            Ok(())
        } else {
            Err(StorageError::FlavorDoesNotExist {
                name: name.to_string(),
            })
        }
    }

    pub async fn delete(&self, name: &str, project: Option<&str>) -> StorageResult<()> {
        self.control.flavor_delete(name, project).await
    }

    pub async fn list(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<FlavorRecord>> {
        self.control.flavor_page(project, marker, limit).await
    }

    pub async fn drop_all(&self) -> StorageResult<()> {
        self.control.flavor_drop_all().await
    }
}
