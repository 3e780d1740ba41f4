use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::{MySQL, ProxySQL};
use crate::resources::common::{KIND_MYSQL, KIND_PROXYSQL, standard_labels};

pub const KEY_USERNAME: &str = "username";
pub const KEY_PASSWORD: &str = "password";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn credentials(
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    username: &str,
) -> Secret {
    let string_data = BTreeMap::from([
        (KEY_USERNAME.to_string(), username.to_string()),
        (KEY_PASSWORD.to_string(), generate_password(16)),
    ]);

    // Labelled but not owned: the secret must outlive the database object
    // under the Pause and Delete termination policies.
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace,
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Generate the root credentials Secret for a database without a user-supplied one
pub fn generate_database_secret(mysql: &MySQL) -> Secret {
    credentials(
        mysql.secret_name(),
        mysql.namespace(),
        standard_labels(KIND_MYSQL, &mysql.name_any()),
        "root",
    )
}

/// Generate the admin credentials Secret for a ProxySQL tier
pub fn generate_proxysql_secret(proxysql: &ProxySQL) -> Secret {
    credentials(
        proxysql.secret_name(),
        proxysql.namespace(),
        standard_labels(KIND_PROXYSQL, &proxysql.name_any()),
        "proxysql",
    )
}
