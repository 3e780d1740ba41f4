//! Finalizer bookkeeping for the kinds whose deletion needs cleanup first
//!
//! Finalizers are added and removed with a full replace carrying the object's
//! resourceVersion, so a stale read surfaces as a conflict and is retried.

use kube::ResourceExt;
use tracing::debug;

use crate::controller::Result;
use crate::resources::FINALIZER;
use crate::store::{Object, Repository};

pub fn has_finalizer<K: ResourceExt>(object: &K) -> bool {
    object.finalizers().iter().any(|f| f == FINALIZER)
}

pub fn is_deleting<K: ResourceExt>(object: &K) -> bool {
    object.meta().deletion_timestamp.is_some()
}

/// Add the finalizer; returns the object as stored afterwards
pub async fn add_finalizer<K: Object>(repo: &dyn Repository<K>, ns: &str, object: &K) -> Result<K> {
    if has_finalizer(object) {
        return Ok(object.clone());
    }
    let mut updated = object.clone();
    updated.finalizers_mut().push(FINALIZER.to_string());
    let stored = repo.replace(ns, &updated).await?;
    debug!(namespace = ns, name = %object.name_any(), "Added finalizer");
    Ok(stored)
}

/// Remove the finalizer, letting a pending deletion complete
pub async fn remove_finalizer<K: Object>(repo: &dyn Repository<K>, ns: &str, object: &K) -> Result<()> {
    if !has_finalizer(object) {
        return Ok(());
    }
    let mut updated = object.clone();
    updated.finalizers_mut().retain(|f| f != FINALIZER);
    repo.replace(ns, &updated).await?;
    debug!(namespace = ns, name = %object.name_any(), "Removed finalizer");
    Ok(())
}
