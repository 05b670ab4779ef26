//! Cache behaviour seen through the service: agreement with authoritative
//! resolution, invalidation, and the BALANCED staleness window.

mod common;

use permgate_domain::Operation;
use permgate_server::handlers::batch::{BatchCheckRequest, CheckMode, ResourceCheck};
use permgate_storage::{DataStore, StoredSubject};

use common::{codes, Harness};

const CODES: [&str; 6] = [
    "doc:read",
    "doc:update",
    "doc:delete",
    "admin:manage",
    "report:read",
    "report:export",
];

/// Five subjects with overlapping roles and direct permissions.
async fn populated() -> Harness {
    let h = Harness::new();
    for (id, code) in CODES.iter().enumerate() {
        h.permission(id as i64 + 1, code, None).await;
    }
    h.role(100, "reader", None, &[1, 5]).await;
    h.role(101, "editor", Some(100), &[2]).await;
    h.role(102, "admin", Some(101), &[3, 4]).await;
    h.subject(10, Some(100), &[]).await;
    h.subject(11, Some(101), &[6]).await;
    h.subject(12, Some(102), &[]).await;
    h.subject(13, None, &[6]).await;
    h.subject(14, None, &[]).await;
    h
}

/// Rewrites a subject's direct permissions without telling the cache.
async fn set_direct(h: &Harness, id: i64, role: Option<i64>, direct: &[i64]) {
    h.store
        .upsert_subject(StoredSubject {
            id,
            username: format!("user-{id}"),
            is_superuser: false,
            primary_role_id: role,
            direct_permission_ids: direct.to_vec(),
        })
        .await
        .unwrap();
}

// ============================================================
// Section 1: Cache Consistency
// ============================================================

#[tokio::test]
async fn test_warm_cache_agrees_with_accurate_mode() {
    // Arrange: warm every subject through the FAST path
    let h = populated().await;
    let subjects = vec![10, 11, 12, 13, 14];
    h.service
        .batch_check(BatchCheckRequest::new(subjects.clone(), codes(&CODES)).with_mode(CheckMode::Fast))
        .await
        .unwrap();
    for id in &subjects {
        h.wait_until_cached(*id).await;
    }

    // Act
    let cached = h
        .service
        .batch_check(BatchCheckRequest::new(subjects.clone(), codes(&CODES)).with_mode(CheckMode::Fast))
        .await
        .unwrap();
    let accurate = h
        .service
        .batch_check(
            BatchCheckRequest::new(subjects.clone(), codes(&CODES)).with_mode(CheckMode::Accurate),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(cached.cache_hit_rate, 1.0);
    assert_eq!(cached.permissions, accurate.permissions);
    for id in &subjects {
        for code in CODES {
            let point = h.service.check_permission(*id, code).await.unwrap();
            assert_eq!(Some(point), accurate.allowed(*id, code), "{id} {code}");
        }
    }
}

// ============================================================
// Section 2: Invalidation
// ============================================================

#[tokio::test]
async fn test_invalidate_user_forces_re_resolution() {
    // Arrange
    let h = populated().await;
    assert!(h.service.check_permission(13, "report:export").await.unwrap());
    h.wait_until_cached(13).await;
    let warm = h.resolutions();

    // Act / Assert: warm check does not touch the resolver
    assert!(h.service.check_permission(13, "report:export").await.unwrap());
    assert_eq!(h.resolutions(), warm);

    set_direct(&h, 13, None, &[]).await;
    assert!(h.service.check_permission(13, "report:export").await.unwrap());

    h.service.invalidate_user(13).await;
    assert!(!h.service.cache().contains(13).await);
    assert!(!h.service.check_permission(13, "report:export").await.unwrap());
    assert_eq!(h.resolutions(), warm + 1);
}

#[tokio::test]
async fn test_invalidate_role_refreshes_role_holders() {
    // Arrange
    let h = populated().await;
    assert!(!h.service.check_permission(10, "doc:delete").await.unwrap());
    h.wait_until_cached(10).await;

    // Act: grant doc:delete to the reader role out of band
    h.role(100, "reader", None, &[1, 5, 3]).await;
    let stale = h.service.check_permission(10, "doc:delete").await.unwrap();
    h.service.invalidate_role(100).await;
    let fresh = h.service.check_permission(10, "doc:delete").await.unwrap();

    // Assert
    assert!(!stale);
    assert!(fresh);
}

#[tokio::test]
async fn test_invalidate_all_drops_every_subject() {
    let h = populated().await;
    for id in [10, 11, 12] {
        h.service.check_permission(id, "doc:read").await.unwrap();
        h.wait_until_cached(id).await;
    }

    h.service.invalidate_all().await;

    for id in [10, 11, 12] {
        assert!(!h.service.cache().contains(id).await);
    }
}

#[tokio::test]
async fn test_resource_grant_change_visible_after_invalidation() {
    let h = populated().await;
    let check = ResourceCheck::new("project", "42", Operation::Update);
    h.grant(14, "project", "42", "read", None, true, None).await;
    assert!(!h
        .service
        .check_resource_operation(14, "project", "42", &Operation::Update)
        .await
        .unwrap());

    h.wait_until_cached(14).await;
    for _ in 0..200 {
        if h.service.cache().get_resource_ops(14, "project", "42").await.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    h.grant(14, "project", "42", "write", None, true, None).await;
    h.service.invalidate_user(14).await;

    let response = h
        .service
        .batch_check(
            BatchCheckRequest::new(vec![14], Vec::new()).with_resource_checks(vec![check.clone()]),
        )
        .await
        .unwrap();
    assert_eq!(response.resource_allowed(14, &check), Some(true));
}

// ============================================================
// Section 3: BALANCED Staleness Window
// ============================================================

#[tokio::test]
async fn test_balanced_critical_matches_accurate_non_critical_stays_stale() {
    // Arrange: cache says 13 holds admin:manage and report:export
    let h = populated().await;
    set_direct(&h, 13, None, &[4, 6]).await;
    h.service.check_permission(13, "report:export").await.unwrap();
    h.wait_until_cached(13).await;

    // Store drops both
    set_direct(&h, 13, None, &[]).await;
    let request = || BatchCheckRequest::new(vec![13], codes(&["admin:manage", "report:export"]));

    // Act
    let balanced = h
        .service
        .batch_check(request().with_mode(CheckMode::Balanced))
        .await
        .unwrap();
    let accurate = h
        .service
        .batch_check(request().with_mode(CheckMode::Accurate))
        .await
        .unwrap();

    // Assert
    assert_eq!(balanced.allowed(13, "admin:manage"), Some(false));
    assert_eq!(
        balanced.allowed(13, "admin:manage"),
        accurate.allowed(13, "admin:manage")
    );
    assert_eq!(balanced.allowed(13, "report:export"), Some(true));
    assert_eq!(accurate.allowed(13, "report:export"), Some(false));
}

#[tokio::test]
async fn test_point_check_on_critical_code_is_authoritative() {
    let h = populated().await;
    set_direct(&h, 13, None, &[4]).await;
    assert!(h.service.check_permission(13, "admin:manage").await.unwrap());
    h.wait_until_cached(13).await;

    set_direct(&h, 13, None, &[]).await;

    assert!(!h.service.check_permission(13, "admin:manage").await.unwrap());
}
