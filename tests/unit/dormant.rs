//! Termination policies, pause and resume, and wipe-out

use kube::ResourceExt;
use mysql_operator::controller::{QueueKey, WorkKind};
use mysql_operator::crd::{DatabasePhase, DormantPhase, TerminationPolicy};
use mysql_operator::resources::common::{ANNOTATION_INITIALIZED, KIND_MYSQL, database_selector};
use mysql_operator::store::Repository;

use crate::common::*;

fn dormant_key(name: &str) -> QueueKey {
    QueueKey::new(WorkKind::DormantDatabase, "demo", name)
}

async fn add_pvcs(tc: &TestCluster, db: &str, count: usize) {
    for ordinal in 0..count {
        tc.cluster
            .pvcs
            .create("demo", &data_pvc(db, "demo", ordinal))
            .await
            .unwrap();
    }
}

async fn labelled_pvcs(tc: &TestCluster, db: &str) -> usize {
    tc.cluster
        .pvcs
        .list("demo", &database_selector(KIND_MYSQL, db))
        .await
        .unwrap()
        .len()
}

async fn labelled_secrets(tc: &TestCluster, db: &str) -> usize {
    tc.cluster
        .secrets
        .list("demo", &database_selector(KIND_MYSQL, db))
        .await
        .unwrap()
        .len()
}

async fn snapshots_of(tc: &TestCluster, db: &str) -> usize {
    tc.cluster
        .snapshots
        .all()
        .iter()
        .filter(|s| s.spec.database_name == db)
        .count()
}

/// Provision, delete and pause `name`, then let the dormant database settle
async fn paused(tc: &TestCluster, name: &str) {
    let key = tc.provision(&MySQLBuilder::new(name, "demo").build()).await;
    add_pvcs(tc, name, 1).await;
    tc.delete_mysql("demo", name).await;
    tc.reconcile(&key).await;
    tc.settle(&dormant_key(name)).await;
    assert_eq!(
        tc.dormant("demo", name).await.unwrap().phase(),
        Some(DormantPhase::Paused)
    );
}

mod termination_tests {
    use super::*;

    #[tokio::test]
    async fn test_do_not_terminate_blocks_deletion() {
        let tc = TestCluster::new();
        let key = tc
            .provision(
                &MySQLBuilder::new("keep", "demo")
                    .with_termination_policy(TerminationPolicy::DoNotTerminate)
                    .build(),
            )
            .await;
        add_pvcs(&tc, "keep", 1).await;

        tc.delete_mysql("demo", "keep").await;
        tc.reconcile(&key).await;

        let mysql = tc.mysql("demo", "keep").await.unwrap();
        assert!(mysql.metadata.deletion_timestamp.is_some());
        assert_eq!(mysql.phase(), Some(DatabasePhase::Running));
        assert!(
            mysql
                .status
                .unwrap()
                .reason
                .unwrap()
                .contains("DoNotTerminate")
        );
        assert!(tc.statefulset("demo", "keep").await.is_some());
        assert_eq!(labelled_pvcs(&tc, "keep").await, 1);
        assert!(tc.events.has_reason("DeletionBlocked"));

        // Repeated passes neither write nor re-announce.
        assert_eq!(tc.reconcile(&key).await, 0);
        let blocked = tc
            .events
            .reasons()
            .iter()
            .filter(|r| *r == "DeletionBlocked")
            .count();
        assert_eq!(blocked, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_storage_keeps_secrets_and_snapshots() {
        let tc = TestCluster::new();
        let key = tc
            .provision(
                &MySQLBuilder::new("quick", "demo")
                    .with_termination_policy(TerminationPolicy::Delete)
                    .build(),
            )
            .await;
        add_pvcs(&tc, "quick", 2).await;
        tc.cluster
            .snapshots
            .create("demo", &snapshot("quick-manual", "demo", "quick"))
            .await
            .unwrap();

        tc.delete_mysql("demo", "quick").await;
        tc.settle(&key).await;

        assert!(tc.mysql("demo", "quick").await.is_none());
        assert!(tc.statefulset("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 0);
        assert_eq!(labelled_secrets(&tc, "quick").await, 1);
        assert_eq!(snapshots_of(&tc, "quick").await, 1);
        assert!(tc.dormant("demo", "quick").await.is_none());
        assert!(tc.events.has_reason("Deleting"));
    }

    #[tokio::test]
    async fn test_wipe_out_removes_everything_it_owns() {
        let tc = TestCluster::new();
        let key = tc
            .provision(
                &MySQLBuilder::new("quick", "demo")
                    .with_termination_policy(TerminationPolicy::WipeOut)
                    .build(),
            )
            .await;
        add_pvcs(&tc, "quick", 1).await;
        for name in ["quick-a", "quick-b"] {
            tc.cluster
                .snapshots
                .create("demo", &snapshot(name, "demo", "quick"))
                .await
                .unwrap();
        }
        tc.cluster
            .snapshots
            .create("demo", &snapshot("other-a", "demo", "other"))
            .await
            .unwrap();

        tc.delete_mysql("demo", "quick").await;
        tc.settle(&key).await;

        assert!(tc.mysql("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 0);
        assert_eq!(labelled_secrets(&tc, "quick").await, 0);
        assert_eq!(snapshots_of(&tc, "quick").await, 0);
        assert_eq!(snapshots_of(&tc, "other").await, 1);
        assert!(tc.dormant("demo", "quick").await.is_none());
        assert!(tc.events.has_reason("WipingOut"));
    }

    #[tokio::test]
    async fn test_wipe_out_leaves_user_secret() {
        let tc = TestCluster::new();
        tc.cluster
            .secrets
            .create("demo", &user_secret("my-auth", "demo"))
            .await
            .unwrap();
        let key = tc
            .provision(
                &MySQLBuilder::new("quick", "demo")
                    .with_secret("my-auth")
                    .with_termination_policy(TerminationPolicy::WipeOut)
                    .build(),
            )
            .await;

        tc.delete_mysql("demo", "quick").await;
        tc.settle(&key).await;

        assert!(tc.mysql("demo", "quick").await.is_none());
        assert!(tc.cluster.secrets.get("demo", "my-auth").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wipe_out_waits_for_snapshot_removal() {
        let tc = TestCluster::new();
        let key = tc
            .provision(
                &MySQLBuilder::new("quick", "demo")
                    .with_termination_policy(TerminationPolicy::WipeOut)
                    .build(),
            )
            .await;
        let mut held = snapshot("quick-held", "demo", "quick");
        held.finalizers_mut().push("example.com/hold".to_string());
        tc.cluster.snapshots.create("demo", &held).await.unwrap();

        tc.delete_mysql("demo", "quick").await;
        tc.reconcile(&key).await;
        tc.reconcile(&key).await;

        // The snapshot can't go away, so neither storage nor the object may.
        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert_eq!(mysql.phase(), Some(DatabasePhase::Terminating));
        assert!(tc.statefulset("demo", "quick").await.is_some());
    }
}

mod pause_tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_archives_and_keeps_storage() {
        let tc = TestCluster::new();
        let key = tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;
        add_pvcs(&tc, "quick", 1).await;

        tc.delete_mysql("demo", "quick").await;
        tc.reconcile(&key).await;

        assert!(tc.mysql("demo", "quick").await.is_none());
        assert!(tc.statefulset("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 1);
        assert_eq!(labelled_secrets(&tc, "quick").await, 1);

        let dormant = tc.dormant("demo", "quick").await.unwrap();
        assert_eq!(dormant.spec.origin.metadata.name, "quick");
        assert_eq!(dormant.spec.origin.spec.mysql.version, "8.0.21");
        assert!(!dormant.spec.wipe_out);
        assert!(tc.events.has_reason("Paused"));

        tc.settle(&dormant_key("quick")).await;
        let dormant = tc.dormant("demo", "quick").await.unwrap();
        assert_eq!(dormant.phase(), Some(DormantPhase::Paused));
        assert!(dormant.status.unwrap().pausing_time.is_some());
    }

    #[tokio::test]
    async fn test_resume_reuses_storage_and_drops_dormant() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;
        let secret_version = tc
            .cluster
            .secrets
            .get("demo", "quick-auth")
            .await
            .unwrap()
            .unwrap()
            .metadata
            .resource_version;

        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Resuming));
        assert_eq!(
            tc.dormant("demo", "quick").await.unwrap().phase(),
            Some(DormantPhase::Resuming)
        );
        assert!(tc.events.has_reason("Resuming"));

        tc.mark_ready("demo", "quick").await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Running));
        assert!(tc.events.has_reason("Resumed"));

        tc.settle(&dormant_key("quick")).await;
        assert!(tc.dormant("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 1);
        let secret = tc.cluster.secrets.get("demo", "quick-auth").await.unwrap().unwrap();
        assert_eq!(secret.metadata.resource_version, secret_version);
    }

    #[tokio::test]
    async fn test_resume_carries_initialized_marker() {
        let tc = TestCluster::new();
        let original = MySQLBuilder::new("quick", "demo")
            .with_restore_session_init("restore-quick")
            .with_annotation(ANNOTATION_INITIALIZED, "true")
            .build();
        let key = tc.provision(&original).await;
        tc.delete_mysql("demo", "quick").await;
        tc.reconcile(&key).await;
        tc.settle(&dormant_key("quick")).await;

        // Same init source, no marker: resuming must not restore again.
        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_restore_session_init("restore-quick")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        tc.mark_ready("demo", "quick").await;
        tc.reconcile(&key).await;

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert!(mysql.annotations().contains_key(ANNOTATION_INITIALIZED));
        assert_eq!(mysql.phase(), Some(DatabasePhase::Running));
    }

    #[tokio::test]
    async fn test_resume_from_snapshot_init_without_source_snapshot() {
        let tc = TestCluster::new();
        tc.cluster
            .secrets
            .create("demo", &user_secret("quick-auth", "demo"))
            .await
            .unwrap();
        // Restored long ago; the source snapshot no longer exists.
        let original = MySQLBuilder::new("quick", "demo")
            .with_secret("quick-auth")
            .with_snapshot_init("nightly")
            .with_annotation(ANNOTATION_INITIALIZED, "true")
            .build();
        let key = tc.provision(&original).await;
        add_pvcs(&tc, "quick", 1).await;
        tc.delete_mysql("demo", "quick").await;
        tc.reconcile(&key).await;
        tc.settle(&dormant_key("quick")).await;
        assert_eq!(
            tc.dormant("demo", "quick").await.unwrap().phase(),
            Some(DormantPhase::Paused)
        );

        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_secret("quick-auth")
                    .with_snapshot_init("nightly")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Resuming));

        tc.reconcile(&key).await;
        tc.mark_ready("demo", "quick").await;
        tc.reconcile(&key).await;

        let mysql = tc.mysql("demo", "quick").await.unwrap();
        assert_eq!(mysql.phase(), Some(DatabasePhase::Running));
        assert!(mysql.annotations().contains_key(ANNOTATION_INITIALIZED));
        assert!(tc.cluster.jobs.is_empty());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 1);
    }

    #[tokio::test]
    async fn test_resume_with_different_secret_fails() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;
        tc.cluster
            .secrets
            .create("demo", &user_secret("other-auth", "demo"))
            .await
            .unwrap();

        let key = tc
            .create_mysql(
                &MySQLBuilder::new("quick", "demo")
                    .with_secret("other-auth")
                    .build(),
            )
            .await;
        tc.reconcile(&key).await;

        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Failed));
        assert!(tc.statefulset("demo", "quick").await.is_none());
        assert_eq!(
            tc.dormant("demo", "quick").await.unwrap().phase(),
            Some(DormantPhase::Paused)
        );
    }

    #[tokio::test]
    async fn test_new_database_waits_while_dormant_is_pausing() {
        let tc = TestCluster::new();
        let key = tc.provision(&MySQLBuilder::new("quick", "demo").build()).await;
        tc.delete_mysql("demo", "quick").await;
        tc.reconcile(&key).await;
        assert_eq!(
            tc.dormant("demo", "quick").await.unwrap().phase(),
            Some(DormantPhase::Pausing)
        );

        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, None);
        assert!(tc.statefulset("demo", "quick").await.is_none());
    }

    #[tokio::test]
    async fn test_resuming_dormant_falls_back_when_database_vanishes() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;
        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.reconcile(&key).await;

        // Force-removed before resuming finished.
        let mut mysql = tc.mysql("demo", "quick").await.unwrap();
        mysql.finalizers_mut().clear();
        tc.cluster.mysqls.replace("demo", &mysql).await.unwrap();
        tc.delete_mysql("demo", "quick").await;

        tc.settle(&dormant_key("quick")).await;
        assert_eq!(
            tc.dormant("demo", "quick").await.unwrap().phase(),
            Some(DormantPhase::Paused)
        );
    }
}

mod wipe_out_tests {
    use super::*;

    #[tokio::test]
    async fn test_dormant_wipe_out_removes_storage_then_itself() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;
        tc.cluster
            .snapshots
            .create("demo", &snapshot("quick-a", "demo", "quick"))
            .await
            .unwrap();

        let mut dormant = tc.dormant("demo", "quick").await.unwrap();
        dormant.spec.wipe_out = true;
        tc.cluster
            .dormant_databases
            .replace("demo", &dormant)
            .await
            .unwrap();
        tc.settle(&dormant_key("quick")).await;

        assert!(tc.dormant("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 0);
        assert_eq!(labelled_secrets(&tc, "quick").await, 0);
        assert_eq!(snapshots_of(&tc, "quick").await, 0);
        assert!(tc.events.has_reason("WipedOut"));
    }

    #[tokio::test]
    async fn test_deleting_dormant_without_wipe_out_keeps_storage() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;

        tc.cluster
            .dormant_databases
            .delete("demo", "quick")
            .await
            .unwrap();
        tc.settle(&dormant_key("quick")).await;

        assert!(tc.dormant("demo", "quick").await.is_none());
        assert_eq!(labelled_pvcs(&tc, "quick").await, 1);
        assert_eq!(labelled_secrets(&tc, "quick").await, 1);
    }

    #[tokio::test]
    async fn test_wiped_out_dormant_rejects_new_database() {
        let tc = TestCluster::new();
        paused(&tc, "quick").await;

        tc.cluster
            .dormant_databases
            .replace_status("demo", "quick", serde_json::json!({ "phase": "WipedOut" }))
            .await
            .unwrap();

        let key = tc
            .create_mysql(&MySQLBuilder::new("quick", "demo").build())
            .await;
        tc.reconcile(&key).await;
        assert_eq!(tc.phase("demo", "quick").await, Some(DatabasePhase::Failed));
    }
}
