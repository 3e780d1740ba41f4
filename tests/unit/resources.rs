//! Child object generation

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use mysql_operator::crd::StorageType;
use mysql_operator::resources::app_binding::generate_app_binding;
use mysql_operator::resources::common::{
    LABEL_DATABASE_KIND, LABEL_DATABASE_NAME, LABEL_MANAGED_BY, is_operator_managed,
};
use mysql_operator::resources::job::{
    LABEL_JOB_TYPE, LABEL_SNAPSHOT, generate_backup_job, generate_restore_job,
};
use mysql_operator::resources::pdb::generate_pdb;
use mysql_operator::resources::secret::generate_proxysql_secret;
use mysql_operator::resources::service::{
    MYSQL_PORT, generate_governing_service, generate_primary_service,
};
use mysql_operator::resources::statefulset::{
    DATA_VOLUME, INIT_SCRIPTS_DIR, generate_mysql_statefulset, generate_proxysql_statefulset,
};

use crate::common::*;

const REGISTRY: &str = "kubedb";
const TASK_IMAGE: &str = "kubedb/mysql-tools:8.0.21";

fn container(sts: &StatefulSet) -> Container {
    sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0].clone()
}

fn env_value(container: &Container, name: &str) -> Option<String> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_durable_database_claims_storage() {
        let sts = generate_mysql_statefulset(&MySQLBuilder::new("quick", "demo").build(), REGISTRY);
        let spec = sts.spec.as_ref().unwrap();

        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name.as_deref(), Some("quick-gvr"));
        let claims = spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(claims[0].metadata.name.as_deref(), Some(DATA_VOLUME));
        assert_eq!(claims[0].labels().get(LABEL_DATABASE_NAME), Some(&"quick".to_string()));
        assert_eq!(
            container(&sts).image.as_deref(),
            Some("kubedb/mysql:8.0.21")
        );
        assert!(sts.owner_references().iter().any(|o| o.kind == "MySQL"));
    }

    #[test]
    fn test_ephemeral_database_uses_empty_dir() {
        let mysql = MySQLBuilder::new("quick", "demo").ephemeral().build();
        let sts = generate_mysql_statefulset(&mysql, REGISTRY);
        let spec = sts.spec.unwrap();

        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == DATA_VOLUME).unwrap();
        assert!(data.empty_dir.is_some());
    }

    #[test]
    fn test_group_members_get_identity_env() {
        let mysql = MySQLBuilder::group("cluster", "demo", 3).build();
        let sts = generate_mysql_statefulset(&mysql, REGISTRY);
        let main = container(&sts);

        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
        assert_eq!(
            env_value(&main, "GROUP_NAME").as_deref(),
            Some("dc002fc3-c412-4d18-b1d4-66c1fbfbbc9b")
        );
        assert_eq!(env_value(&main, "BASE_SERVER_ID").as_deref(), Some("100"));
        assert_eq!(env_value(&main, "GOV_SVC").as_deref(), Some("cluster-gvr"));
    }

    #[test]
    fn test_standalone_has_no_group_env() {
        let sts = generate_mysql_statefulset(&MySQLBuilder::new("quick", "demo").build(), REGISTRY);
        assert!(env_value(&container(&sts), "GROUP_NAME").is_none());
    }

    #[test]
    fn test_root_credentials_come_from_secret() {
        let mysql = MySQLBuilder::new("quick", "demo").with_secret("custom").build();
        let sts = generate_mysql_statefulset(&mysql, REGISTRY);
        let env = container(&sts).env.unwrap();
        let password = env.iter().find(|e| e.name == "MYSQL_ROOT_PASSWORD").unwrap();
        let selector = password
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(selector.name, "custom");
        assert!(password.value.is_none());
    }

    #[test]
    fn test_user_env_is_appended() {
        let mysql = MySQLBuilder::new("quick", "demo")
            .with_env("MYSQL_DATABASE", "app")
            .build();
        let sts = generate_mysql_statefulset(&mysql, REGISTRY);
        assert_eq!(
            env_value(&container(&sts), "MYSQL_DATABASE").as_deref(),
            Some("app")
        );
    }

    #[test]
    fn test_script_init_mounts_entrypoint_dir() {
        let mysql = MySQLBuilder::new("quick", "demo")
            .with_script_init("init-sql")
            .build();
        let sts = generate_mysql_statefulset(&mysql, REGISTRY);
        let mounts = container(&sts).volume_mounts.unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == INIT_SCRIPTS_DIR));

        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let scripts = volumes
            .iter()
            .find_map(|v| v.config_map.as_ref())
            .unwrap();
        assert_eq!(scripts.name, "init-sql");
    }

    #[test]
    fn test_version_change_changes_image() {
        let old = generate_mysql_statefulset(&MySQLBuilder::new("quick", "demo").build(), REGISTRY);
        let new = generate_mysql_statefulset(
            &MySQLBuilder::new("quick", "demo").with_version("8.0.23").build(),
            REGISTRY,
        );
        assert_ne!(container(&old).image, container(&new).image);
    }

    #[test]
    fn test_proxysql_points_at_backend() {
        let proxy = proxysql("router", "demo", "cluster");
        let sts = generate_proxysql_statefulset(&proxy, "cluster", REGISTRY);
        let main = container(&sts);

        assert_eq!(main.image.as_deref(), Some("kubedb/proxysql:2.0.4"));
        assert_eq!(env_value(&main, "MYSQL_SERVICE").as_deref(), Some("cluster"));
        assert_eq!(env_value(&main, "MYSQL_REPLICAS").as_deref(), Some("3"));
        assert_eq!(
            sts.labels().get(LABEL_DATABASE_KIND),
            Some(&"ProxySQL".to_string())
        );
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_primary_service_selects_pods() {
        let svc = generate_primary_service(&MySQLBuilder::new("quick", "demo").build());
        assert_eq!(svc.metadata.name.as_deref(), Some("quick"));
        let spec = svc.spec.unwrap();
        let selector = spec.selector.unwrap();
        assert_eq!(selector.get(LABEL_DATABASE_NAME), Some(&"quick".to_string()));
        assert_eq!(selector.get(LABEL_DATABASE_KIND), Some(&"MySQL".to_string()));
        assert!(!selector.contains_key(LABEL_MANAGED_BY));
        assert_eq!(spec.ports.unwrap()[0].port, MYSQL_PORT);
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn test_governing_service_is_headless() {
        let svc = generate_governing_service(&MySQLBuilder::new("quick", "demo").build());
        assert_eq!(svc.metadata.name.as_deref(), Some("quick-gvr"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }
}

mod pdb_tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    #[test]
    fn test_standalone_pdb_allows_eviction() {
        let pdb = generate_pdb(&MySQLBuilder::new("quick", "demo").build());
        assert_eq!(pdb.metadata.name.as_deref(), Some("quick"));
        let owner = &pdb.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "MySQL");
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(0)));
        let selector = spec.selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.get(LABEL_DATABASE_NAME), Some(&"quick".to_string()));
        assert!(!selector.contains_key(LABEL_MANAGED_BY));
    }

    #[test]
    fn test_group_pdb_keeps_quorum() {
        let pdb = generate_pdb(&MySQLBuilder::group("cluster", "demo", 5).build());
        assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(3)));

        let pdb = generate_pdb(&MySQLBuilder::group("cluster", "demo", 3).build());
        assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(2)));
    }
}

mod binding_tests {
    use super::*;

    #[test]
    fn test_app_binding_uses_generated_secret() {
        let binding = generate_app_binding(&MySQLBuilder::new("quick", "demo").build());
        assert_eq!(binding.spec.secret.as_ref().unwrap().name, "quick-auth");
        assert_eq!(binding.spec.version.as_deref(), Some("8.0.21"));
        assert!(is_operator_managed(&binding));
    }

    #[test]
    fn test_proxysql_secret_is_labelled() {
        let secret = generate_proxysql_secret(&proxysql("router", "demo", "cluster"));
        assert_eq!(secret.metadata.name.as_deref(), Some("router-auth"));
        assert!(is_operator_managed(&secret));
        assert_eq!(
            secret.labels().get(LABEL_DATABASE_KIND),
            Some(&"ProxySQL".to_string())
        );
    }
}

mod job_tests {
    use super::*;

    #[test]
    fn test_backup_job_targets_database() {
        let mysql = MySQLBuilder::new("quick", "demo").build();
        let snap = snapshot("snap-1", "demo", "quick");
        let job = generate_backup_job(&snap, &mysql, TASK_IMAGE).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("snap-1-backup"));
        assert_eq!(job.labels().get(LABEL_SNAPSHOT), Some(&"snap-1".to_string()));
        assert_eq!(job.labels().get(LABEL_JOB_TYPE), Some(&"backup".to_string()));
        assert!(job.owner_references().iter().any(|o| o.kind == "Snapshot"));

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let main = &pod.containers[0];
        assert_eq!(main.image.as_deref(), Some(TASK_IMAGE));
        assert_eq!(env_value(main, "DB_HOST").as_deref(), Some("quick"));
        assert_eq!(
            env_value(main, "REPOSITORY").as_deref(),
            Some("gs:kubedb-backups/demo")
        );
        assert!(main.env_from.is_some());
    }

    #[test]
    fn test_backup_job_scratch_follows_database_storage() {
        let durable = MySQLBuilder::new("quick", "demo").durable("5Gi").build();
        let snap = snapshot("snap-1", "demo", "quick");
        let job = generate_backup_job(&snap, &durable, TASK_IMAGE).unwrap();
        let volumes = job.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].ephemeral.is_some());

        let ephemeral = MySQLBuilder::new("quick", "demo").ephemeral().build();
        let job = generate_backup_job(&snap, &ephemeral, TASK_IMAGE).unwrap();
        let volumes = job.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn test_durable_snapshot_without_claim_is_rejected() {
        let mysql = MySQLBuilder::new("quick", "demo").ephemeral().build();
        let mut snap = snapshot("snap-1", "demo", "quick");
        snap.spec.storage_type = Some(StorageType::Durable);
        assert!(generate_backup_job(&snap, &mysql, TASK_IMAGE).is_err());
    }

    #[test]
    fn test_restore_job_is_owned_by_database() {
        let mysql = MySQLBuilder::new("restored", "demo")
            .with_snapshot_init("snap-1")
            .build();
        let snap = snapshot("snap-1", "demo", "quick");
        let job = generate_restore_job(&mysql, &snap, TASK_IMAGE).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("restored-restore"));
        assert!(job.owner_references().iter().any(|o| o.kind == "MySQL"));
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].args.as_ref().unwrap()[0], "restore");
        assert_eq!(
            env_value(&pod.containers[0], "DB_HOST").as_deref(),
            Some("restored")
        );
    }
}
