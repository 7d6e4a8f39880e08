//! Which tasks a particular dequeue is allowed to claim.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::model::TaskId;

type Predicate = Arc<dyn Fn(&TaskId, Option<&serde_json::Value>) -> bool + Send + Sync>;

/// Admission rule for [`TaskQueue::dequeue_matching`](super::TaskQueue::dequeue_matching).
#[derive(Clone, Default)]
pub enum TaskFilter {
    #[default]
    AllowAll,
    /// Only these task ids.
    Ids(HashSet<TaskId>),
    /// Task ids starting with this prefix.
    Prefix(String),
    /// Arbitrary test over id and metadata.
    Predicate(Predicate),
}

impl TaskFilter {
    pub fn ids(ids: impl IntoIterator<Item = impl Into<TaskId>>) -> Self {
        TaskFilter::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        TaskFilter::Prefix(prefix.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&TaskId, Option<&serde_json::Value>) -> bool + Send + Sync + 'static,
    {
        TaskFilter::Predicate(Arc::new(f))
    }

    pub fn contains(&self, id: &TaskId, metadata: Option<&serde_json::Value>) -> bool {
        match self {
            TaskFilter::AllowAll => true,
            TaskFilter::Ids(ids) => ids.contains(id),
            TaskFilter::Prefix(prefix) => id.as_str().starts_with(prefix.as_str()),
            TaskFilter::Predicate(f) => f(id, metadata),
        }
    }
}

impl fmt::Debug for TaskFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFilter::AllowAll => f.write_str("AllowAll"),
            TaskFilter::Ids(ids) => f.debug_tuple("Ids").field(&ids.len()).finish(),
            TaskFilter::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            TaskFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
