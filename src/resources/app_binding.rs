use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{AppBinding, AppBindingSpec, ClientConfig, LocalObjectReference, MySQL, ServiceReference};
use crate::resources::common::{KIND_MYSQL, owner_reference, standard_labels};
use crate::resources::service::MYSQL_PORT;

/// Generate the AppBinding exposing a database's connection coordinates
pub fn generate_app_binding(mysql: &MySQL) -> AppBinding {
    let name = mysql.name_any();
    let mut binding = AppBinding::new(
        &name,
        AppBindingSpec {
            type_: "kubedb.com/mysql".to_string(),
            version: Some(mysql.spec.version.clone()),
            client_config: ClientConfig {
                service: Some(ServiceReference {
                    scheme: "mysql".to_string(),
                    name: name.clone(),
                    port: MYSQL_PORT,
                }),
            },
            secret: Some(LocalObjectReference {
                name: mysql.secret_name(),
            }),
        },
    );
    binding.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: mysql.namespace(),
        labels: Some(standard_labels(KIND_MYSQL, &name)),
        owner_references: Some(vec![owner_reference(mysql)]),
        ..Default::default()
    };
    binding
}
