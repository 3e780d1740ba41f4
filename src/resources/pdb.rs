//! PodDisruptionBudget generation for MySQL databases
//!
//! Voluntary evictions (node drains, upgrades) must never take a group below
//! quorum. A standalone server has no replica to fail over to, so its budget
//! allows the eviction and accepts the downtime.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::MySQL;
use crate::resources::common::{KIND_MYSQL, database_selector, owner_reference, standard_labels};

/// Pods that must stay up for `replicas` members
///
/// - 1 replica: 0 (eviction allowed, causes downtime)
/// - n replicas: a majority, so the group keeps quorum
pub fn min_available(replicas: i32) -> i32 {
    match replicas {
        n if n <= 1 => 0,
        n => n / 2 + 1,
    }
}

/// Generate the PodDisruptionBudget covering the database's pods
pub fn generate_pdb(mysql: &MySQL) -> PodDisruptionBudget {
    let name = mysql.name_any();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: mysql.namespace(),
            labels: Some(standard_labels(KIND_MYSQL, &name)),
            owner_references: Some(vec![owner_reference(mysql)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available(mysql.spec.replicas))),
            selector: Some(LabelSelector {
                match_labels: Some(database_selector(KIND_MYSQL, &name)),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
