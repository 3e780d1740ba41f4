//! Service generation for MySQL and ProxySQL
//!
//! Every database gets a primary service for clients and a headless governing
//! service that gives StatefulSet pods stable DNS names.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{MySQL, ProxySQL};
use crate::resources::common::{
    KIND_MYSQL, KIND_PROXYSQL, database_selector, owner_reference, standard_labels,
};

pub const MYSQL_PORT: i32 = 3306;
pub const PROXYSQL_PORT: i32 = 6033;
pub const PROXYSQL_ADMIN_PORT: i32 = 6032;

/// Name of the headless service backing a database's pod DNS
pub fn governing_service_name(db_name: &str) -> String {
    format!("{db_name}-gvr")
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the primary service clients connect to
pub fn generate_primary_service(mysql: &MySQL) -> Service {
    let name = mysql.name_any();
    let template = mysql.spec.service_template.clone().unwrap_or_default();

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: mysql.namespace(),
            labels: Some(standard_labels(KIND_MYSQL, &name)),
            annotations: (!template.annotations.is_empty()).then_some(template.annotations),
            owner_references: Some(vec![owner_reference(mysql)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(database_selector(KIND_MYSQL, &name)),
            ports: Some(vec![port("db", MYSQL_PORT)]),
            type_: Some(template.type_.unwrap_or_else(|| "ClusterIP".to_string())),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the headless governing service
pub fn generate_governing_service(mysql: &MySQL) -> Service {
    let name = mysql.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(governing_service_name(&name)),
            namespace: mysql.namespace(),
            labels: Some(standard_labels(KIND_MYSQL, &name)),
            owner_references: Some(vec![owner_reference(mysql)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(database_selector(KIND_MYSQL, &name)),
            ports: Some(vec![port("db", MYSQL_PORT)]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the ProxySQL client service
pub fn generate_proxysql_service(proxysql: &ProxySQL) -> Service {
    let name = proxysql.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: proxysql.namespace(),
            labels: Some(standard_labels(KIND_PROXYSQL, &name)),
            owner_references: Some(vec![owner_reference(proxysql)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(database_selector(KIND_PROXYSQL, &name)),
            ports: Some(vec![
                port("mysql", PROXYSQL_PORT),
                port("admin", PROXYSQL_ADMIN_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
