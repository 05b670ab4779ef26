//! End-to-end check semantics over the in-memory store.
//!
//! Covers superuser bypass, permission and role hierarchies (including
//! corrupted, cyclic data), resource grant levels and lifecycles, and the
//! reference scenarios for batch and resource checks.

mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use permgate_domain::Operation;
use permgate_server::handlers::batch::{BatchCheckRequest, CheckMode, ResourceCheck};

use common::{codes, Harness};

// ============================================================
// Section 1: Superuser
// ============================================================

#[tokio::test]
async fn test_superuser_allowed_everything_in_every_mode() {
    // Arrange
    let h = Harness::new();
    h.superuser(1).await;

    // Act / Assert: point checks, cold and warm
    assert!(h.service.check_permission(1, "admin:manage").await.unwrap());
    h.wait_until_cached(1).await;
    assert!(h.service.check_permission(1, "never:defined").await.unwrap());

    // Resource checks without any grant
    for op in ["read", "delete", "archive"] {
        let allowed = h
            .service
            .check_resource_operation(1, "project", "42", &Operation::parse(op).unwrap())
            .await
            .unwrap();
        assert!(allowed, "superuser denied {op}");
    }

    // Batch checks in every mode
    for mode in [CheckMode::Fast, CheckMode::Accurate, CheckMode::Balanced] {
        let response = h
            .service
            .batch_check(
                BatchCheckRequest::new(vec![1], codes(&["doc:read", "security:audit"]))
                    .with_resource_checks(vec![ResourceCheck::new(
                        "project",
                        "7",
                        Operation::Delete,
                    )])
                    .with_mode(mode),
            )
            .await
            .unwrap();
        assert_eq!(response.allowed(1, "doc:read"), Some(true));
        assert_eq!(response.allowed(1, "security:audit"), Some(true));
        assert_eq!(
            response.resource_allowed(1, &ResourceCheck::new("project", "7", Operation::Delete)),
            Some(true)
        );
    }
}

// ============================================================
// Section 2: Permission Hierarchy
// ============================================================

#[tokio::test]
async fn test_parent_permission_implies_descendants() {
    let h = Harness::new();
    h.permission(1, "doc:manage", None).await;
    h.permission(2, "doc:update", Some(1)).await;
    h.permission(3, "doc:read", Some(2)).await;
    h.permission(4, "doc:delete", None).await;
    h.subject(10, None, &[1]).await;

    for code in ["doc:manage", "doc:update", "doc:read"] {
        assert!(h.service.check_permission(10, code).await.unwrap(), "{code}");
    }
    assert!(!h.service.check_permission(10, "doc:delete").await.unwrap());
}

#[tokio::test]
async fn test_permission_tree_back_edge_terminates() {
    // Arrange: 1 -> 2 -> 3 -> 1
    let h = Harness::new();
    h.permission(1, "doc:manage", Some(3)).await;
    h.permission(2, "doc:update", Some(1)).await;
    h.permission(3, "doc:read", Some(2)).await;
    h.subject(10, None, &[2]).await;

    // Act
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        h.service.batch_check(
            BatchCheckRequest::new(vec![10], codes(&["doc:manage", "doc:update", "doc:read"]))
                .with_mode(CheckMode::Accurate),
        ),
    )
    .await
    .expect("resolution must terminate")
    .unwrap();

    // Assert: every node on the loop is reachable from any member
    assert_eq!(response.allowed(10, "doc:manage"), Some(true));
    assert_eq!(response.allowed(10, "doc:update"), Some(true));
    assert_eq!(response.allowed(10, "doc:read"), Some(true));
}

// ============================================================
// Section 3: Role Hierarchy
// ============================================================

#[tokio::test]
async fn test_child_role_inherits_parent_permissions() {
    let h = Harness::new();
    h.permission(1, "report:read", None).await;
    h.permission(2, "report:export", None).await;
    h.permission(3, "billing:read", None).await;
    h.role(100, "viewer", None, &[1]).await;
    h.role(101, "analyst", Some(100), &[2]).await;
    h.subject(10, Some(101), &[]).await;

    assert!(h.service.check_permission(10, "report:read").await.unwrap());
    assert!(h.service.check_permission(10, "report:export").await.unwrap());
    assert!(!h.service.check_permission(10, "billing:read").await.unwrap());
}

#[tokio::test]
async fn test_role_cycle_terminates_with_union() {
    // Arrange: 100 -> 101 -> 100
    let h = Harness::new();
    h.permission(1, "report:read", None).await;
    h.permission(2, "report:export", None).await;
    h.role(100, "r1", Some(101), &[1]).await;
    h.role(101, "r2", Some(100), &[2]).await;
    h.subject(10, Some(101), &[]).await;

    // Act
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        h.service.batch_check(
            BatchCheckRequest::new(vec![10], codes(&["report:read", "report:export"]))
                .with_mode(CheckMode::Accurate),
        ),
    )
    .await
    .expect("resolution must terminate")
    .unwrap();

    // Assert
    assert_eq!(response.allowed(10, "report:read"), Some(true));
    assert_eq!(response.allowed(10, "report:export"), Some(true));
}

// ============================================================
// Section 4: Resource Grants
// ============================================================

async fn can(h: &Harness, subject: i64, resource_id: &str, op: &str) -> bool {
    h.service
        .check_resource_operation(subject, "project", resource_id, &Operation::parse(op).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_write_grant_scenario() {
    let h = Harness::new();
    h.subject(10, None, &[]).await;
    h.grant(10, "project", "42", "WRITE", None, true, None).await;

    assert!(can(&h, 10, "42", "update").await);
    assert!(can(&h, 10, "42", "create").await);
    assert!(can(&h, 10, "42", "read").await);
    assert!(!can(&h, 10, "42", "delete").await);
    assert!(!can(&h, 10, "43", "read").await);
}

#[tokio::test]
async fn test_expired_and_inactive_grants_never_allow() {
    let h = Harness::new();
    h.subject(10, None, &[]).await;
    h.grant(
        10,
        "project",
        "1",
        "owner",
        None,
        true,
        Some(Utc::now() - ChronoDuration::hours(1)),
    )
    .await;
    h.grant(10, "project", "2", "owner", None, false, None).await;
    h.grant(
        10,
        "project",
        "3",
        "read",
        None,
        true,
        Some(Utc::now() + ChronoDuration::hours(1)),
    )
    .await;

    for op in ["read", "update", "delete", "manage"] {
        assert!(!can(&h, 10, "1", op).await, "expired grant allowed {op}");
        assert!(!can(&h, 10, "2", op).await, "inactive grant allowed {op}");
    }
    assert!(can(&h, 10, "3", "read").await);
}

#[tokio::test]
async fn test_owner_implies_every_operation_and_read_only_read() {
    let h = Harness::new();
    h.permission(1, "project:archive", None).await;
    h.subject(10, None, &[]).await;
    h.grant(10, "project", "owned", "owner", None, true, None).await;
    h.grant(10, "project", "viewed", "read", None, true, None).await;

    for op in ["create", "read", "update", "delete", "manage", "archive"] {
        assert!(can(&h, 10, "owned", op).await, "owner denied {op}");
    }
    assert!(can(&h, 10, "viewed", "read").await);
    for op in ["create", "update", "delete", "manage", "archive"] {
        assert!(!can(&h, 10, "viewed", op).await, "read allowed {op}");
    }
}

#[tokio::test]
async fn test_operation_allow_list_extends_level() {
    let h = Harness::new();
    h.permission(1, "project:archive", None).await;
    h.subject(10, None, &[]).await;
    h.grant(10, "project", "42", "read", Some(&["archive"]), true, None)
        .await;

    assert!(can(&h, 10, "42", "archive").await);
    assert!(can(&h, 10, "42", "read").await);
    assert!(!can(&h, 10, "42", "delete").await);
}

// ============================================================
// Section 5: Reference Scenarios
// ============================================================

#[tokio::test]
async fn test_report_batch_scenario() {
    // Arrange: direct report:export, role analyst grants report:read
    let h = Harness::new();
    h.permission(1, "report:read", None).await;
    h.permission(2, "report:export", None).await;
    h.permission(3, "report:delete", None).await;
    h.role(100, "analyst", None, &[1]).await;
    h.subject(10, Some(100), &[2]).await;

    // Act
    let response = h
        .service
        .batch_check(BatchCheckRequest::new(
            vec![10],
            codes(&["report:read", "report:export", "report:delete"]),
        ))
        .await
        .unwrap();

    // Assert
    assert!(response.failures.is_empty());
    assert_eq!(response.allowed(10, "report:read"), Some(true));
    assert_eq!(response.allowed(10, "report:export"), Some(true));
    assert_eq!(response.allowed(10, "report:delete"), Some(false));
}

#[tokio::test]
async fn test_unknown_subject_reported_as_failure_not_denial() {
    let h = Harness::new();
    h.subject(10, None, &[]).await;

    let response = h
        .service
        .batch_check(BatchCheckRequest::new(vec![10, 404], codes(&["doc:read"])))
        .await
        .unwrap();
    let point = h.service.check_permission(404, "doc:read").await;

    assert_eq!(response.allowed(10, "doc:read"), Some(false));
    assert_eq!(response.allowed(404, "doc:read"), None);
    assert!(response.failures.contains_key(&404));
    assert!(point.is_err());
}

#[tokio::test]
async fn test_store_outage_surfaces_error() {
    let h = Harness::new();
    h.subject(10, None, &[]).await;
    h.store.set_available(false);

    let result = h.service.check_permission(10, "doc:read").await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("storage error"));
}
