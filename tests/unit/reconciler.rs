//! MySQL reconcile passes against the in-memory store

use kube::ResourceExt;
use mysql_operator::crd::{
    DatabasePhase, RestorePhase, RestoreSession, RestoreSessionSpec, RestoreSessionStatus,
    SnapshotPhase, SnapshotStatus,
};
use mysql_operator::resources::FINALIZER;
use mysql_operator::resources::common::{ANNOTATION_INITIALIZED, LABEL_MANAGED_BY};
use mysql_operator::resources::job::restore_job_name;
use mysql_operator::resources::service::governing_service_name;
use mysql_operator::store::Repository;

use crate::common::*;

/// Store a snapshot that already succeeded, recorded against `secret`
async fn succeeded_snapshot(tc: &TestCluster, name: &str, db: &str, secret: &str) {
    tc.cluster
        .snapshots
        .create("demo", &snapshot(name, "demo", db))
        .await
        .unwrap();
    let status = SnapshotStatus {
        phase: Some(SnapshotPhase::Succeeded),
        database_secret_name: Some(secret.to_string()),
        ..Default::default()
    };
    tc.cluster
        .snapshots
        .replace_status("demo", name, serde_json::to_value(status).unwrap())
        .await
        .unwrap();
}

fn restore_session(name: &str) -> RestoreSession {
    let mut session = RestoreSession::new(name, RestoreSessionSpec::default());
    session.metadata.namespace = Some("demo".to_string());
    session
}

async fn set_restore_phase(tc: &TestCluster, name: &str, phase: RestorePhase) {
    let status = RestoreSessionStatus { phase: Some(phase) };
    tc.cluster
        .restore_sessions
        .replace_status("demo", name, serde_json::to_value(status).unwrap())
        .await
        .unwrap();
}

mod provisioning_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_pass_creates_children() {
        let tc = TestCluster::new();
        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.reconcile(&key).await;

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert!(mysql.finalizers().iter().any(|f| f == FINALIZER));
        assert_eq!(mysql.phase(), Some(DatabasePhase::Provisioning));

        let secret = tc.cluster.secrets.get("demo", "quick-auth").await.unwrap().unwrap();
        assert_eq!(
            secret.labels().get(LABEL_MANAGED_BY).map(String::as_str),
            Some("mysql-operator")
        );
        assert!(tc.cluster.services.get("demo", "quick").await.unwrap().is_some());
        assert!(
            tc.cluster
                .services
                .get("demo", &governing_service_name("quick"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(tc.statefulset("demo", "quick").await.is_some());
        assert!(tc.cluster.app_bindings.get("demo", "quick").await.unwrap().is_some());
        assert!(tc.cluster.pdbs.get("demo", "quick").await.unwrap().is_some());
        assert!(tc.events.has_reason("SuccessfulCreate"));
        assert!(tc.events.has_reason("Provisioning"));
    }

    #[tokio::test]
    async fn test_running_once_workload_ready() {
        let tc = TestCluster::new();
        tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        let status = mysql.status.unwrap();
        assert_eq!(status.observed_generation, mysql.metadata.generation);
        assert!(
            status
                .conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        );
        assert!(tc.events.has_reason("Ready"));
    }

    #[tokio::test]
    async fn test_settled_database_is_not_rewritten() {
        let tc = TestCluster::new();
        let key = tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;

        assert_eq!(tc.reconcile(&key).await, 0);
        assert_eq!(tc.reconcile(&key).await, 0);
    }

    #[tokio::test]
    async fn test_partial_readiness_stays_provisioning() {
        let tc = TestCluster::new();
        let key = tc
            .create_mysql(&MySQLBuilder::group("cluster", "demo", 3).build())
            .await;
        tc.reconcile(&key).await;

        tc.cluster
            .statefulsets
            .replace_status(
                "demo",
                "cluster",
                serde_json::json!({ "replicas": 3, "readyReplicas": 2 }),
            )
            .await
            .unwrap();
        tc.reconcile(&key).await;

        let mysql = tc.mysql("demo", "cluster").await.unwrap();
        assert_eq!(mysql.phase(), Some(DatabasePhase::Provisioning));
        assert_eq!(
            mysql.status.unwrap().reason.as_deref(),
            Some("2/3 replicas ready")
        );
    }

    #[tokio::test]
    async fn test_conflict_on_retry_converges() {
        let tc = TestCluster::new();
        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.cluster.inject_conflicts(2);
        tc.reconcile(&key).await;

        // Conflicts requeue immediately, so the drain finishes the pass.
        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert!(mysql.finalizers().iter().any(|f| f == FINALIZER));
        assert_eq!(mysql.phase(), Some(DatabasePhase::Provisioning));
    }

    #[tokio::test]
    async fn test_spec_change_updates_workload() {
        let tc = TestCluster::new();
        let key = tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;

        let mut mysql = tc.mysql("demo", "quick").await.unwrap();
        mysql.spec.version = "8.0.27".to_string();
        tc.cluster.mysqls.replace("demo", &mysql).await.unwrap();
        tc.reconcile(&key).await;

        let sts = tc.statefulset("demo", "quick").await.unwrap();
        let image = sts.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone()
            .unwrap();
        assert!(image.ends_with("8.0.27"), "unexpected image {image}");
        assert!(tc.events.has_reason("SuccessfulUpdate"));

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert_eq!(
            mysql.status.unwrap().observed_generation,
            mysql.metadata.generation
        );
    }
}

mod secret_tests {
    use super::*;

    #[tokio::test]
    async fn test_user_secret_is_used_not_generated() {
        let tc = TestCluster::new();
        tc.cluster
            .secrets
            .create("demo", &user_secret("my-auth", "demo"))
            .await
            .unwrap();
        tc.provision(
            &MySQLBuilder::new("quick", "demo")
                .with_secret("my-auth")
                .build(),
        )
        .await;

        assert_eq!(tc.cluster.secrets.len(), 1);
        assert!(tc.cluster.secrets.get("demo", "quick-auth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_user_secret_blocks_workload() {
        let tc = TestCluster::new();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_secret("my-auth")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;

        assert!(tc.statefulset("demo", "quick").await.is_none());
        assert!(tc.cluster.secrets.is_empty());
        assert_eq!(tc.ctx.error_context(&key).consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_generated_secret_survives_reconciles() {
        let tc = TestCluster::new();
        let key = tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;
        let before = tc.cluster.secrets.get("demo", "quick-auth").await.unwrap().unwrap();

        tc.reconcile(&key).await;
        let after = tc.cluster.secrets.get("demo", "quick-auth").await.unwrap().unwrap();
        assert_eq!(before.string_data, after.string_data);
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }
}

mod init_tests {
    use super::*;

    #[tokio::test]
    async fn test_script_init_completes_with_workload() {
        let tc = TestCluster::new();
        tc.provision(
            &MySQLBuilder::new("quick", "demo")
                .with_script_init("init-sql")
                .build(),
        )
        .await;

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert!(
            mysql
                .status
                .unwrap()
                .conditions
                .iter()
                .any(|c| c.type_ == "Initialized" && c.status == "True")
        );
        assert!(tc.cluster.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_init_runs_restore_job_once() {
        let tc = TestCluster::new();
        succeeded_snapshot(&tc, "nightly", "origin", "shared-auth").await;
        tc.cluster
            .secrets
            .create("demo", &user_secret("shared-auth", "demo"))
            .await
            .unwrap();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("restored", "demo")
                    .with_secret("shared-auth")
                    .with_snapshot_init("nightly")
                    .build(),
            )
            .await;

        tc.reconcile(&key).await;
        assert!(tc.cluster.jobs.is_empty(), "restore waits for the workload");

        tc.mark_ready("demo", "restored").await;
        tc.reconcile(&key).await;
        let job_name = restore_job_name("restored");
        assert!(tc.job("demo", &job_name).await.is_some());
        assert_eq!(tc.phase("demo", "restored").await, Some(DatabasePhase::Initializing));

        tc.reconcile(&key).await;
        assert_eq!(tc.cluster.jobs.len(), 1);
        assert_eq!(tc.phase("demo", "restored").await, Some(DatabasePhase::Initializing));

        tc.complete_job("demo", &job_name).await;
        tc.reconcile(&key).await;
        let mysql = tc.mysql("demo", "restored").await.unwrap();
        assert_eq!(mysql.phase(), Some(DatabasePhase::Running));
        assert!(mysql.annotations().contains_key(ANNOTATION_INITIALIZED));
        assert!(tc.events.has_reason("Initialized"));

        // Once initialized the source is never applied again.
        tc.cluster.jobs.delete("demo", &job_name).await.unwrap();
        tc.reconcile(&key).await;
        assert!(tc.cluster.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_job_fails_database() {
        let tc = TestCluster::new();
        succeeded_snapshot(&tc, "nightly", "origin", "shared-auth").await;
        tc.cluster
            .secrets
            .create("demo", &user_secret("shared-auth", "demo"))
            .await
            .unwrap();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("restored", "demo")
                    .with_secret("shared-auth")
                    .with_snapshot_init("nightly")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        tc.mark_ready("demo", "restored").await;
        tc.reconcile(&key).await;

        tc.fail_job("demo", &restore_job_name("restored")).await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "restored").await, Some(DatabasePhase::Failed));
        assert!(tc.events.has_reason("InitFailed"));
    }

    #[tokio::test]
    async fn test_snapshot_secret_mismatch_creates_nothing() {
        let tc = TestCluster::new();
        succeeded_snapshot(&tc, "nightly", "origin", "origin-auth").await;
        tc.cluster
            .secrets
            .create("demo", &user_secret("other-auth", "demo"))
            .await
            .unwrap();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("restored", "demo")
                    .with_secret("other-auth")
                    .with_snapshot_init("nightly")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;

        assert_eq!(tc.phase("demo", "restored").await, Some(DatabasePhase::Failed));
        assert!(tc.statefulset("demo", "restored").await.is_none());
        assert!(tc.cluster.services.is_empty());
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_database() {
        let tc = TestCluster::new();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("restored", "demo")
                    .with_secret("shared-auth")
                    .with_snapshot_init("absent")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "restored").await, Some(DatabasePhase::Failed));
    }

    #[tokio::test]
    async fn test_restore_session_drives_initialization() {
        let tc = TestCluster::new();
        tc.cluster
            .restore_sessions
            .create("demo", &restore_session("restore-quick"))
            .await
            .unwrap();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_restore_session_init("restore-quick")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        tc.mark_ready("demo", "quick").await;

        set_restore_phase(&tc, "restore-quick", RestorePhase::Running).await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Initializing));

        set_restore_phase(&tc, "restore-quick", RestorePhase::Succeeded).await;
        tc.reconcile(&key).await;
        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert_eq!(mysql.phase(), Some(DatabasePhase::Running));
        assert!(mysql.annotations().contains_key(ANNOTATION_INITIALIZED));
    }

    #[tokio::test]
    async fn test_failed_restore_session_fails_database() {
        let tc = TestCluster::new();
        tc.cluster
            .restore_sessions
            .create("demo", &restore_session("restore-quick"))
            .await
            .unwrap();
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_restore_session_init("restore-quick")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        tc.mark_ready("demo", "quick").await;
        set_restore_phase(&tc, "restore-quick", RestorePhase::Failed).await;
        tc.reconcile(&key).await;

        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Failed));
        assert!(tc.events.has_reason("InitFailed"));
    }
}
