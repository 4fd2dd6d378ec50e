//! Retention that respects replication duties.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use eddy_log::{Entry, TrimFilter, TrimOptions};

use crate::shared_log::Inner;

/// Keeps entries the local peer leads, or that have no mature leader yet.
///
/// A filter already present on the retention options is consulted as well;
/// both must agree before an entry goes.
pub(crate) struct ReplicationTrimFilter {
    inner: Weak<Inner>,
    user: Option<Arc<dyn TrimFilter>>,
}

impl ReplicationTrimFilter {
    /// `trim` with its filter wrapped in a replication check.
    pub(crate) fn wrap(inner: Weak<Inner>, trim: TrimOptions) -> TrimOptions {
        let filter = Self {
            inner,
            user: trim.filter,
        };
        TrimOptions {
            condition: trim.condition,
            filter: Some(Arc::new(filter)),
        }
    }
}

#[async_trait]
impl TrimFilter for ReplicationTrimFilter {
    async fn can_trim(&self, entry: &Entry) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        if !inner.safe_to_trim(entry) {
            return false;
        }
        match &self.user {
            Some(user) => user.can_trim(entry).await,
            None => true,
        }
    }

    /// Changes with every replication index update and every maturity, so a
    /// resumed pass never trusts verdicts taken under other leaders.
    fn cache_id(&self) -> Option<String> {
        let epoch = self.inner.upgrade()?.retention_epoch();
        Some(match self.user.as_ref().and_then(|u| u.cache_id()) {
            Some(user) => format!("{epoch}:{user}"),
            None => epoch,
        })
    }
}
