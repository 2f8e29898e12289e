//! Pool administration
//!
//! Pools are the unit of horizontal scale: one record per independently
//! provisioned backend instance. The invariant enforced here is capability
//! uniformity per flavor group. Since weighted selection may land a queue
//! on any pool of a group, every member must declare the same capability
//! set, and membership changes are checked against a probe of one existing
//! member.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::{Capability, ControlBackend, PoolConnector, PoolRecord, PoolUpdate};
use crate::core::error::{StorageError, StorageResult};

pub struct PoolsController {
    control: Arc<dyn ControlBackend>,
    connector: Arc<dyn PoolConnector>,
}

impl PoolsController {
    pub fn new(control: Arc<dyn ControlBackend>, connector: Arc<dyn PoolConnector>) -> Self {
        Self { control, connector }
    }

    pub async fn list(
        &self,
        marker: Option<&str>,
        limit: usize,
        detailed: bool,
    ) -> StorageResult<Vec<PoolRecord>> {
        let mut page = self.control.pool_page(marker, limit).await?;
        if !detailed {
            for pool in &mut page {
                pool.options = Value::Null;
            }
        }
        Ok(page)
    }

    /// Register a pool. Joining a non-empty flavor group requires the new
    /// pool's driver to declare exactly the capability set the group
    /// already guarantees.
    pub async fn create(
        &self,
        name: &str,
        weight: u32,
        uri: &str,
        group: Option<&str>,
        options: Value,
    ) -> StorageResult<()> {
        if let Some(group) = group {
            if !self.group_accepts(group, uri, &options, None).await? {
                return Err(StorageError::PoolCapabilitiesMismatch);
            }
        }

        self.control
            .pool_insert(PoolRecord {
                name: name.to_string(),
                uri: uri.to_string(),
                weight,
                group: group.map(str::to_string),
                options,
            })
            .await
    }

    pub async fn get(&self, name: &str, detailed: bool) -> StorageResult<PoolRecord> {
        let mut pool = self
            .control
            .pool_get(name)
            .await?
            .ok_or_else(|| StorageError::PoolDoesNotExist {
                name: name.to_string(),
            })?;
        if !detailed {
            pool.options = Value::Null;
        }
        Ok(pool)
    }

    pub async fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.control.pool_get(name).await?.is_some())
    }

    /// Update weight, URI, group or options. A URI change must keep the
    /// pool's declared capabilities identical to what it guaranteed
    /// before; a group change is checked against the target group.
    pub async fn update(&self, name: &str, update: PoolUpdate) -> StorageResult<()> {
        let current =
            self.control
                .pool_get(name)
                .await?
                .ok_or_else(|| StorageError::PoolDoesNotExist {
                    name: name.to_string(),
                })?;

        let uri = update.uri.as_deref().unwrap_or(&current.uri);
        let group = match &update.group {
            Some(group) => group.as_deref(),
            None => current.group.as_deref(),
        };
        let options = update.options.as_ref().unwrap_or(&current.options);

        if update.uri.is_some() {
            let before = self
                .capabilities_of(&current.uri, &current.options)
                .await?;
            let after = self.capabilities_of(uri, options).await?;
            if before != after {
                return Err(StorageError::PoolCapabilitiesMismatch);
            }
        }

        if let Some(group) = group {
            if !self.group_accepts(group, uri, options, Some(name)).await? {
                return Err(StorageError::PoolCapabilitiesMismatch);
            }
        }

        let updated = self.control.pool_update(name, update).await?;
        if updated {
            Ok(())
        } else {
            Err(StorageError::PoolDoesNotExist {
                name: name.to_string(),
            })
        }
    }

    /// Remove a pool. Refused while the pool is the sole member of a group
    /// some flavor still selects; deleting it would leave the flavor with
    /// nowhere to place queues. Absent pools delete silently.
    pub async fn delete(&self, name: &str) -> StorageResult<()> {
        let pool = match self.control.pool_get(name).await? {
            Some(pool) => pool,
            None => return Ok(()),
        };

        if let Some(group) = &pool.group {
            let flavors = self.control.flavors_using_group(group).await?;
            if let Some(flavor) = flavors.first() {
                let members = self.control.pools_in_group(Some(group)).await?;
                if members.len() == 1 {
                    return Err(StorageError::PoolInUseByFlavor {
                        pool: name.to_string(),
                        flavor: flavor.name.clone(),
                    });
                }
            }
        }

        self.control.pool_delete(name).await
    }

    pub async fn drop_all(&self) -> StorageResult<()> {
        self.control.pool_drop_all().await
    }

    /// Probe the capability set a URI's driver declares.
    pub(crate) async fn capabilities_of(
        &self,
        uri: &str,
        options: &Value,
    ) -> StorageResult<HashSet<Capability>> {
        let backend = self.connector.connect(uri, options).await?;
        Ok(backend.capabilities().iter().copied().collect())
    }

    /// Whether `uri` may join `group`. All members are assumed identical,
    /// so probing one of them establishes the group's capability set.
    async fn group_accepts(
        &self,
        group: &str,
        uri: &str,
        options: &Value,
        exclude: Option<&str>,
    ) -> StorageResult<bool> {
        let members = self.control.pools_in_group(Some(group)).await?;
        let probe = members
            .iter()
            .find(|member| Some(member.name.as_str()) != exclude);
        let member = match probe {
            Some(member) => member,
            None => return Ok(true),
        };

        let group_caps = self
            .capabilities_of(&member.uri, &member.options)
            .await?;
        let new_caps = self.capabilities_of(uri, options).await?;
        Ok(group_caps == new_caps)
    }
}
