//! Admission decisions for MySQL, Snapshot and DormantDatabase
//!
//! Policy tests go through `validate_all` with a hand-built context; review
//! tests go through the request handlers backed by an in-memory cluster.

use mysql_operator::controller::dormant::dormant_from;
use mysql_operator::crd::{DormantPhase, SnapshotPhase, SnapshotStatus, TerminationPolicy};
use mysql_operator::resources::common::ANNOTATION_INITIALIZED;
use mysql_operator::store::{MemoryCluster, Repository};
use mysql_operator::webhooks::policies::validate_all;
use mysql_operator::webhooks::{
    AdmissionRequest, ValidationContext, ValidationResult, create_response, review_dormant,
    review_mysql, review_snapshot,
};
use serde::Serialize;

use crate::common::*;

fn assert_denied(result: &ValidationResult, reason: &str) {
    assert!(!result.allowed, "expected denial with {reason}");
    assert_eq!(result.reason.as_deref(), Some(reason));
}

fn request<K: Serialize>(operation: &str, object: Option<&K>, old: Option<&K>) -> AdmissionRequest {
    AdmissionRequest {
        uid: "req-1".to_string(),
        operation: operation.to_string(),
        namespace: Some("demo".to_string()),
        name: None,
        object: object.map(|o| serde_json::to_value(o).unwrap()),
        old_object: old.map(|o| serde_json::to_value(o).unwrap()),
    }
}

fn finished_snapshot(name: &str, db: &str, secret: &str) -> mysql_operator::Snapshot {
    let mut snap = snapshot(name, "demo", db);
    snap.status = Some(SnapshotStatus {
        phase: Some(SnapshotPhase::Succeeded),
        database_secret_name: Some(secret.to_string()),
        ..Default::default()
    });
    snap
}

mod policy_tests {
    use super::*;

    #[test]
    fn test_plain_create_allowed() {
        let mysql = MySQLBuilder::new("db", "demo").build();
        assert!(validate_all(&ValidationContext::new(&mysql, None)).allowed);
    }

    #[test]
    fn test_ephemeral_pause_denied() {
        let mysql = MySQLBuilder::new("db", "demo").ephemeral().build();
        let result = validate_all(&ValidationContext::new(&mysql, None));
        assert_denied(&result, "PauseRequiresDurableStorage");
    }

    #[test]
    fn test_root_password_env_denied() {
        let mysql = MySQLBuilder::new("db", "demo")
            .with_env("MYSQL_ROOT_PASSWORD", "hunter2")
            .build();
        let result = validate_all(&ValidationContext::new(&mysql, None));
        assert_denied(&result, "ForbiddenEnvVar");
        assert!(result.message.unwrap().contains("MYSQL_ROOT_PASSWORD"));
    }

    #[test]
    fn test_empty_init_denied() {
        let mysql = MySQLBuilder::new("db", "demo")
            .with_init(Default::default())
            .build();
        let result = validate_all(&ValidationContext::new(&mysql, None));
        assert_denied(&result, "InvalidInitSource");
    }

    #[test]
    fn test_bad_replicas_is_invalid_spec() {
        let mysql = MySQLBuilder::new("db", "demo").with_replicas(3).build();
        let result = validate_all(&ValidationContext::new(&mysql, None));
        assert_denied(&result, "InvalidSpec");
    }

    #[test]
    fn test_update_of_storage_denied() {
        let old = MySQLBuilder::new("db", "demo").build();
        let new = MySQLBuilder::new("db", "demo").durable("10Gi").build();
        let result = validate_all(&ValidationContext::new(&new, Some(&old)));
        assert_denied(&result, "ImmutableField");
    }

    #[test]
    fn test_first_failure_wins() {
        let old = MySQLBuilder::new("db", "demo").build();
        let new = MySQLBuilder::new("db", "demo")
            .ephemeral()
            .with_env("MYSQL_ROOT_PASSWORD", "x")
            .build();
        let result = validate_all(&ValidationContext::new(&new, Some(&old)));
        assert_denied(&result, "PauseRequiresDurableStorage");
    }

    mod snapshot_init {
        use super::*;

        fn restoring(secret: Option<&str>) -> mysql_operator::MySQL {
            let builder = MySQLBuilder::new("restored", "demo").with_snapshot_init("snap");
            match secret {
                Some(secret) => builder.with_secret(secret).build(),
                None => builder.build(),
            }
        }

        #[test]
        fn test_missing_snapshot_denied() {
            let mysql = restoring(Some("db-auth"));
            let result = validate_all(&ValidationContext::new(&mysql, None));
            assert_denied(&result, "SnapshotNotFound");
        }

        #[test]
        fn test_failed_snapshot_denied() {
            let mysql = restoring(Some("db-auth"));
            let mut snap = finished_snapshot("snap", "db", "db-auth");
            if let Some(status) = snap.status.as_mut() {
                status.phase = Some(SnapshotPhase::Failed);
            }
            let ctx = ValidationContext::new(&mysql, None).with_source_snapshot(Some(&snap));
            assert_denied(&validate_all(&ctx), "SnapshotFailed");
        }

        #[test]
        fn test_secret_must_match_snapshot() {
            let snap = finished_snapshot("snap", "db", "db-auth");

            let mysql = restoring(Some("db-auth"));
            let ctx = ValidationContext::new(&mysql, None).with_source_snapshot(Some(&snap));
            assert!(validate_all(&ctx).allowed);

            let mysql = restoring(Some("other-auth"));
            let ctx = ValidationContext::new(&mysql, None).with_source_snapshot(Some(&snap));
            assert_denied(&validate_all(&ctx), "SnapshotSecretMismatch");

            let mysql = restoring(None);
            let ctx = ValidationContext::new(&mysql, None).with_source_snapshot(Some(&snap));
            assert_denied(&validate_all(&ctx), "SnapshotSecretMismatch");
        }

        #[test]
        fn test_resuming_initialized_data_needs_no_snapshot() {
            let origin = MySQLBuilder::new("restored", "demo")
                .with_secret("db-auth")
                .with_snapshot_init("snap")
                .with_annotation(ANNOTATION_INITIALIZED, "true")
                .build();
            let dormant = dormant_from(&origin);
            let mysql = restoring(Some("db-auth"));
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&dormant));
            assert!(validate_all(&ctx).allowed);
        }

        #[test]
        fn test_uninitialized_dormant_still_needs_snapshot() {
            let dormant = dormant_from(&restoring(Some("db-auth")));
            let mysql = restoring(Some("db-auth"));
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&dormant));
            assert_denied(&validate_all(&ctx), "SnapshotNotFound");
        }

        #[test]
        fn test_snapshot_checks_skipped_on_update() {
            let mysql = restoring(Some("db-auth"));
            let ctx = ValidationContext::new(&mysql, Some(&mysql));
            assert!(validate_all(&ctx).allowed);
        }
    }

    mod resume {
        use super::*;

        #[test]
        fn test_matching_secret_resumes() {
            let dormant = dormant_from(&MySQLBuilder::new("db", "demo").build());
            let mysql = MySQLBuilder::new("db", "demo").build();
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&dormant));
            assert!(validate_all(&ctx).allowed);
        }

        #[test]
        fn test_credential_drift_denied() {
            let dormant = dormant_from(&MySQLBuilder::new("db", "demo").build());
            let mysql = MySQLBuilder::new("db", "demo").with_secret("new-auth").build();
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&dormant));
            assert_denied(&validate_all(&ctx), "CredentialDrift");
        }

        #[test]
        fn test_wiped_dormant_denied() {
            let mysql = MySQLBuilder::new("db", "demo").build();

            let mut wiping = dormant_from(&mysql);
            wiping.spec.wipe_out = true;
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&wiping));
            assert_denied(&validate_all(&ctx), "DormantWipedOut");

            let mut wiped = dormant_from(&mysql);
            wiped.status = Some(mysql_operator::crd::DormantDatabaseStatus {
                phase: Some(DormantPhase::WipedOut),
                ..Default::default()
            });
            let ctx = ValidationContext::new(&mysql, None).with_dormant(Some(&wiped));
            assert_denied(&validate_all(&ctx), "DormantWipedOut");
        }
    }
}

mod review_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_do_not_terminate_denied() {
        let cluster = MemoryCluster::new();
        let mysql = MySQLBuilder::new("db", "demo")
            .with_termination_policy(TerminationPolicy::DoNotTerminate)
            .build();
        let result = review_mysql(&cluster.repositories(), request("DELETE", None, Some(&mysql))).await;
        assert_denied(&result, "DeletionBlocked");
    }

    #[tokio::test]
    async fn test_delete_allowed_for_other_policies() {
        let cluster = MemoryCluster::new();
        let mysql = MySQLBuilder::new("db", "demo").build();
        let result = review_mysql(&cluster.repositories(), request("DELETE", None, Some(&mysql))).await;
        assert!(result.allowed);

        let bare = review_mysql(
            &cluster.repositories(),
            request::<mysql_operator::MySQL>("DELETE", None, None),
        )
        .await;
        assert!(bare.allowed);
    }

    #[tokio::test]
    async fn test_create_looks_up_dormant() {
        let cluster = MemoryCluster::new();
        let dormant = dormant_from(&MySQLBuilder::new("db", "demo").build());
        cluster.dormant_databases.create("demo", &dormant).await.unwrap();

        let drifted = MySQLBuilder::new("db", "demo").with_secret("new-auth").build();
        let result = review_mysql(&cluster.repositories(), request("CREATE", Some(&drifted), None)).await;
        assert_denied(&result, "CredentialDrift");

        let same = MySQLBuilder::new("db", "demo").build();
        let result = review_mysql(&cluster.repositories(), request("CREATE", Some(&same), None)).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_create_looks_up_source_snapshot() {
        let cluster = MemoryCluster::new();
        let mysql = MySQLBuilder::new("restored", "demo")
            .with_snapshot_init("snap")
            .with_secret("db-auth")
            .build();

        let result = review_mysql(&cluster.repositories(), request("CREATE", Some(&mysql), None)).await;
        assert_denied(&result, "SnapshotNotFound");

        cluster
            .snapshots
            .create("demo", &finished_snapshot("snap", "db", "db-auth"))
            .await
            .unwrap();
        let result = review_mysql(&cluster.repositories(), request("CREATE", Some(&mysql), None)).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_unparseable_object_denied() {
        let cluster = MemoryCluster::new();
        let mut req = request::<mysql_operator::MySQL>("CREATE", None, None);
        req.object = Some(serde_json::json!({"spec": {"replicas": "three"}}));
        let result = review_mysql(&cluster.repositories(), req).await;
        assert_denied(&result, "InvalidObject");
    }

    #[tokio::test]
    async fn test_snapshot_needs_database() {
        let cluster = MemoryCluster::new();
        let snap = snapshot("snap", "demo", "db");
        let result = review_snapshot(&cluster.repositories(), request("CREATE", Some(&snap), None)).await;
        assert_denied(&result, "DatabaseNotFound");

        cluster
            .mysqls
            .create("demo", &MySQLBuilder::new("db", "demo").build())
            .await
            .unwrap();
        let result = review_snapshot(&cluster.repositories(), request("CREATE", Some(&snap), None)).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_invalid_snapshot_denied() {
        let cluster = MemoryCluster::new();
        let mut snap = snapshot("snap", "demo", "db");
        snap.spec.backend = Default::default();
        let result = review_snapshot(&cluster.repositories(), request("CREATE", Some(&snap), None)).await;
        assert_denied(&result, "InvalidSnapshot");
    }

    #[tokio::test]
    async fn test_one_snapshot_in_flight_per_database() {
        let cluster = MemoryCluster::new();
        cluster
            .mysqls
            .create("demo", &MySQLBuilder::new("db", "demo").build())
            .await
            .unwrap();
        cluster
            .snapshots
            .create("demo", &snapshot("running", "demo", "db"))
            .await
            .unwrap();

        let next = snapshot("next", "demo", "db");
        let result = review_snapshot(&cluster.repositories(), request("CREATE", Some(&next), None)).await;
        assert_denied(&result, "SnapshotInProgress");

        cluster
            .snapshots
            .replace_status("demo", "running", serde_json::json!({"phase": "Succeeded"}))
            .await
            .unwrap();
        let result = review_snapshot(&cluster.repositories(), request("CREATE", Some(&next), None)).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_snapshot_spec_immutable() {
        let cluster = MemoryCluster::new();
        let old = snapshot("snap", "demo", "db");
        let mut new = old.clone();
        new.spec.database_name = "other".to_string();
        let result = review_snapshot(&cluster.repositories(), request("UPDATE", Some(&new), Some(&old))).await;
        assert_denied(&result, "ImmutableField");

        let result = review_snapshot(&cluster.repositories(), request("DELETE", None, Some(&old))).await;
        assert!(result.allowed);
    }

    #[test]
    fn test_dormant_wipe_out_cannot_be_unset() {
        let mut old = dormant_from(&MySQLBuilder::new("db", "demo").build());
        old.spec.wipe_out = true;
        let mut new = old.clone();
        new.spec.wipe_out = false;

        assert_denied(
            &review_dormant(request("UPDATE", Some(&new), Some(&old))),
            "ImmutableField",
        );
        assert!(review_dormant(request("UPDATE", Some(&old), Some(&new))).allowed);
        assert!(review_dormant(request("CREATE", Some(&new), None)).allowed);
        assert!(review_dormant(request("DELETE", None, Some(&old))).allowed);
    }

    #[test]
    fn test_create_response_shape() {
        let denied = serde_json::to_value(create_response("uid-1", false, "nope", Some("DeletionBlocked"))).unwrap();
        assert_eq!(denied["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(denied["kind"], "AdmissionReview");
        assert_eq!(denied["response"]["uid"], "uid-1");
        assert_eq!(denied["response"]["allowed"], false);
        assert_eq!(denied["response"]["status"]["message"], "nope");

        let allowed = serde_json::to_value(create_response("uid-2", true, "", None)).unwrap();
        assert_eq!(allowed["response"]["allowed"], true);
        assert!(allowed["response"].get("status").is_none());
    }
}
