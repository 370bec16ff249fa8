use crate::features::resource_sync::repo::ResourceRepository;
use crate::shared::config::{Endpoints, SyncConfig};
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::http::BackendClient;
use crate::shared::types::{ActionKind, ListQuery, Resource, ResourceDetail, ResourceId};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// The list endpoint answers with either a bare array or a paginated envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListPayload {
    Plain(Vec<Resource>),
    Paginated { results: Vec<Resource> },
}

impl ListPayload {
    fn into_resources(self) -> Vec<Resource> {
        match self {
            ListPayload::Plain(resources) | ListPayload::Paginated { results: resources } => {
                resources
            }
        }
    }
}

pub struct HttpResourceRepository {
    client: BackendClient,
    endpoints: Endpoints,
}

impl HttpResourceRepository {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        Ok(Self::with_client(BackendClient::new(config)?, config.endpoints.clone()))
    }

    pub fn with_client(client: BackendClient, endpoints: Endpoints) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl ResourceRepository for HttpResourceRepository {
    async fn list_resources(&self, query: &ListQuery) -> SyncResult<Vec<Resource>> {
        let payload: ListPayload = self
            .client
            .get_json(&[&self.endpoints.resources], &query.to_pairs())
            .await?;
        let resources = payload.into_resources();
        debug!(count = resources.len(), "Fetched resource list");
        Ok(resources)
    }

    async fn get_resource(&self, id: ResourceId) -> SyncResult<ResourceDetail> {
        let id_segment = id.to_string();
        self.client
            .get_json(&[&self.endpoints.resources, &id_segment], &[])
            .await
            .map_err(|err| match err {
                SyncError::HttpStatus { status: 404, .. } => SyncError::ResourceNotFound(id),
                other => other,
            })
    }

    async fn perform_action(&self, id: ResourceId, action: ActionKind) -> SyncResult<()> {
        let id_segment = id.to_string();
        self.client
            .post_empty(&[&self.endpoints.resources, &id_segment, action.as_str()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::ResourceStatus;

    #[test]
    fn test_list_payload_accepts_plain_array() {
        let payload: ListPayload = serde_json::from_str(
            r#"[{"id": 1, "status": "POWERED_ON"}, {"id": 2, "status": "POWERED_OFF"}]"#,
        )
        .unwrap();
        let resources = payload.into_resources();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].status, ResourceStatus::PoweredOff);
    }

    #[test]
    fn test_list_payload_accepts_paginated_envelope() {
        let payload: ListPayload = serde_json::from_str(
            r#"{"count": 1, "next": null, "results": [{"id": 9, "status": "SUSPENDED", "name": "db"}]}"#,
        )
        .unwrap();
        let resources = payload.into_resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "db");
    }

    #[test]
    fn test_repository_builds_from_config() {
        let repo = HttpResourceRepository::new(&SyncConfig::default()).unwrap();
        assert_eq!(repo.endpoints.resources, "vms");
        assert_eq!(
            repo.client.url(&[&repo.endpoints.resources, "3", ActionKind::Restart.as_str()]),
            "http://127.0.0.1:8000/api/vms/3/restart/"
        );
    }
}
