//! Common utilities for Kubernetes resource generation
//!
//! Shared label, annotation and ownership helpers used by every generator,
//! plus the hash-guarded create-or-replace used to keep reconciles write-free
//! when nothing changed.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::controller::Result;
use crate::store::{Object, Repository, Selector};

/// Operator field manager name and managed-by label value
pub const FIELD_MANAGER: &str = "mysql-operator";

/// Finalizer placed on databases, dormant databases and snapshots
pub const FINALIZER: &str = "kubedb.com";

pub const LABEL_DATABASE_KIND: &str = "kubedb.com/kind";
pub const LABEL_DATABASE_NAME: &str = "kubedb.com/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Set once a snapshot or restore-session init finished; never re-run after
pub const ANNOTATION_INITIALIZED: &str = "kubedb.com/initialized";

/// sha256 of the desired object last written by the operator
pub const ANNOTATION_DESIRED_HASH: &str = "mysql.kubedb.com/desired-hash";

pub const KIND_MYSQL: &str = "MySQL";
pub const KIND_PROXYSQL: &str = "ProxySQL";

/// Generate a controller owner reference pointing at `owner`
///
/// Child resources carrying this reference are garbage collected once the
/// owner disappears.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels that select everything belonging to one database
pub fn database_selector(kind: &str, name: &str) -> Selector {
    BTreeMap::from([
        (LABEL_DATABASE_KIND.to_string(), kind.to_string()),
        (LABEL_DATABASE_NAME.to_string(), name.to_string()),
    ])
}

/// Selector labels plus the managed-by marker
pub fn standard_labels(kind: &str, name: &str) -> BTreeMap<String, String> {
    let mut labels = database_selector(kind, name);
    labels.insert(LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Standard labels merged over user-supplied pod labels
///
/// User labels cannot override the selector labels.
pub fn merged_labels(
    kind: &str,
    name: &str,
    user: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = user.clone();
    labels.extend(standard_labels(kind, name));
    labels
}

/// Whether an object carries the operator's managed-by label
pub fn is_operator_managed<K: ResourceExt>(object: &K) -> bool {
    object
        .labels()
        .get(LABEL_MANAGED_BY)
        .is_some_and(|v| v == FIELD_MANAGER)
}

/// Hex sha256 of the serialized object
pub fn desired_hash<K: serde::Serialize>(object: &K) -> Result<String> {
    let bytes = serde_json::to_vec(object)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Outcome of [`ensure_object`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Create `desired` or bring the live object in line with it
///
/// The desired object is stamped with its hash. When the live object carries
/// the same hash nothing is written.
pub async fn ensure_object<K: Object>(
    repo: &dyn Repository<K>,
    namespace: &str,
    mut desired: K,
) -> Result<Applied> {
    let hash = desired_hash(&desired)?;
    desired
        .annotations_mut()
        .insert(ANNOTATION_DESIRED_HASH.to_string(), hash.clone());
    let name = desired.name_any();

    let Some(live) = repo.get(namespace, &name).await? else {
        return match repo.create(namespace, &desired).await {
            Ok(_) => {
                debug!(namespace, name = %name, kind = %K::kind(&()), "created");
                Ok(Applied::Created)
            }
            // Cache lagging behind our own earlier create
            Err(e) if e.is_already_exists() => Ok(Applied::Unchanged),
            Err(e) => Err(e),
        };
    };

    if live.annotations().get(ANNOTATION_DESIRED_HASH) == Some(&hash) {
        return Ok(Applied::Unchanged);
    }

    desired.meta_mut().resource_version = live.meta().resource_version.clone();
    repo.replace(namespace, &desired).await?;
    debug!(namespace, name = %name, kind = %K::kind(&()), "updated");
    Ok(Applied::Updated)
}

/// Create `desired` unless an object with its name already exists
pub async fn ensure_absent_created<K: Object>(
    repo: &dyn Repository<K>,
    namespace: &str,
    desired: &K,
) -> Result<bool> {
    if repo.get(namespace, &desired.name_any()).await?.is_some() {
        return Ok(false);
    }
    match repo.create(namespace, desired).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}
