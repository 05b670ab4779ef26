//! Shared wiring for integration tests:
//! `MemoryDataStore` -> `DataStorePermissionSource` -> `AuthzService`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use permgate_api::DataStorePermissionSource;
use permgate_server::{AuthzService, ServerConfig};
use permgate_storage::{
    DataStore, MemoryDataStore, StoredPermission, StoredResourceGrant, StoredRole, StoredSubject,
};

pub type Service = AuthzService<DataStorePermissionSource<MemoryDataStore>>;

pub struct Harness {
    pub store: Arc<MemoryDataStore>,
    pub service: Arc<Service>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&ServerConfig::default())
    }

    pub fn with_config(config: &ServerConfig) -> Self {
        Self::with_store(MemoryDataStore::new_shared(), config)
    }

    pub fn with_store(store: Arc<MemoryDataStore>, config: &ServerConfig) -> Self {
        let source = Arc::new(DataStorePermissionSource::new(Arc::clone(&store)));
        let service = Arc::new(AuthzService::new(source, config));
        Self { store, service }
    }

    pub async fn permission(&self, id: i64, code: &str, parent_id: Option<i64>) {
        let (resource_type, operation_type) = code.split_once(':').unwrap();
        self.store
            .upsert_permission(StoredPermission {
                id,
                code: code.to_string(),
                name: code.to_string(),
                resource_type: resource_type.to_string(),
                operation_type: operation_type.to_string(),
                is_active: true,
                parent_id,
            })
            .await
            .unwrap();
    }

    pub async fn role(&self, id: i64, code: &str, parent_id: Option<i64>, permission_ids: &[i64]) {
        self.store
            .upsert_role(StoredRole {
                id,
                code: code.to_string(),
                name: code.to_string(),
                level: 0,
                parent_id,
                permission_ids: permission_ids.to_vec(),
                is_active: true,
            })
            .await
            .unwrap();
    }

    pub async fn subject(&self, id: i64, role_id: Option<i64>, direct_permission_ids: &[i64]) {
        self.store
            .upsert_subject(StoredSubject {
                id,
                username: format!("user-{id}"),
                is_superuser: false,
                primary_role_id: role_id,
                direct_permission_ids: direct_permission_ids.to_vec(),
            })
            .await
            .unwrap();
    }

    pub async fn superuser(&self, id: i64) {
        self.store
            .upsert_subject(StoredSubject {
                id,
                username: "root".to_string(),
                is_superuser: true,
                primary_role_id: None,
                direct_permission_ids: Vec::new(),
            })
            .await
            .unwrap();
    }

    pub async fn grant(
        &self,
        subject_id: i64,
        resource_type: &str,
        resource_id: &str,
        level: &str,
        operations: Option<&[&str]>,
        is_active: bool,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.store
            .grant_resource(StoredResourceGrant {
                subject_id,
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
                permission_level: level.to_string(),
                operations: operations.map(|ops| ops.iter().map(|s| s.to_string()).collect()),
                is_active,
                expires_at,
            })
            .await
            .unwrap();
    }

    /// Resolution write-back is asynchronous; wait for it to land.
    pub async fn wait_until_cached(&self, subject_id: i64) {
        for _ in 0..200 {
            if self.service.cache().contains(subject_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subject {subject_id} never reached the cache");
    }

    pub fn resolutions(&self) -> u64 {
        self.service.resolver().stats().resolutions
    }
}

pub fn codes(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}
