//! Storage Error Taxonomy
//!
//! One error type covers the whole engine so that controllers, backends and
//! the routing layer speak the same language. Variants carry structured
//! context (queue, project, ids) rather than pre-formatted strings, and the
//! family predicates group them the way callers react to them: absent
//! resources, authorization-style rejections, conflicts, and transport
//! failures.

fn fmt_project(project: &Option<String>) -> &str {
    project.as_deref().unwrap_or("<global>")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Queue {name} does not exist for project {}", fmt_project(project))]
    QueueDoesNotExist { name: String, project: Option<String> },

    #[error("Queue {name} in project {} is empty", fmt_project(project))]
    QueueIsEmpty { name: String, project: Option<String> },

    #[error("Message {id} does not exist in queue {queue} for project {}", fmt_project(project))]
    MessageDoesNotExist {
        id: String,
        queue: String,
        project: Option<String>,
    },

    #[error("Claim {id} does not exist in queue {queue} for project {}", fmt_project(project))]
    ClaimDoesNotExist {
        id: String,
        queue: String,
        project: Option<String>,
    },

    #[error("Message {id} is claimed")]
    MessageIsClaimed { id: String },

    #[error("Message {id} is no longer claimed")]
    MessageNotClaimed { id: String },

    #[error("Message {id} is not claimed by {claim}")]
    MessageNotClaimedBy { id: String, claim: String },

    /// Raised once the posting retry budget is exhausted. `succeeded_ids`
    /// lists messages that became visible before the conflict so the caller
    /// can avoid double-posting them.
    #[error("Messages could not be enqueued due to a marker conflict in queue {queue} for project {}", fmt_project(project))]
    MessageConflict {
        queue: String,
        project: Option<String>,
        succeeded_ids: Vec<String>,
    },

    #[error("Messages could not be claimed due to a parallel claim in queue {queue} for project {}", fmt_project(project))]
    ClaimConflict { queue: String, project: Option<String> },

    #[error("Pool {name} does not exist")]
    PoolDoesNotExist { name: String },

    #[error("The pool name or URI is in use by another pool")]
    PoolAlreadyExists,

    #[error("Pool {pool} is in use by flavor {flavor}")]
    PoolInUseByFlavor { pool: String, flavor: String },

    #[error("The pool being added does not match the capabilities of its group")]
    PoolCapabilitiesMismatch,

    #[error("Flavor {name} does not exist")]
    FlavorDoesNotExist { name: String },

    #[error("No pool found for queue {queue} for project {}", fmt_project(project))]
    QueueNotMapped { queue: String, project: Option<String> },

    #[error("No pools registered")]
    NoPoolFound,

    #[error("Connection with the backend was lost: {message}")]
    Connection { message: String },
}

impl StorageError {
    /// Absent-resource family: surfaced to the caller, never retried.
    pub fn is_does_not_exist(&self) -> bool {
        matches!(
            self,
            StorageError::QueueDoesNotExist { .. }
                | StorageError::MessageDoesNotExist { .. }
                | StorageError::ClaimDoesNotExist { .. }
                | StorageError::PoolDoesNotExist { .. }
                | StorageError::FlavorDoesNotExist { .. }
                | StorageError::QueueNotMapped { .. }
                | StorageError::NoPoolFound
        )
    }

    /// Authorization-style rejections from the claim/delete interaction.
    pub fn is_not_permitted(&self) -> bool {
        matches!(
            self,
            StorageError::MessageIsClaimed { .. }
                | StorageError::MessageNotClaimed { .. }
                | StorageError::MessageNotClaimedBy { .. }
                | StorageError::PoolInUseByFlavor { .. }
        )
    }

    /// Raised after internal retries are exhausted or a uniqueness
    /// constraint cannot be satisfied by policy.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::MessageConflict { .. }
                | StorageError::ClaimConflict { .. }
                | StorageError::PoolAlreadyExists
                | StorageError::PoolCapabilitiesMismatch
        )
    }

    /// Transport failures; transient instances are absorbed by the retry
    /// wrappers before this escapes to the caller.
    pub fn is_connection(&self) -> bool {
        matches!(self, StorageError::Connection { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
