//! Generic JSON feed provider.
//!
//! Speaks a small, conventional REST shape so a new remote can often be
//! wired up from configuration alone:
//!
//! ```text
//! GET  {endpoint}?limit=N[&cursor=C][&sync_token=T | &updated_since=S]
//!   -> {"items": [record...], "next_cursor": "...", "sync_token": "..."}
//!
//! record = {"id", "etag"?, "deleted"?, "created_at"?, "updated_at"?,
//!           "asset_url"?, "fields": {...}}
//!
//! POST {endpoint}/batch  {"ops": [{"op": "create" | "update" | "delete", ...}]}
//!   -> {"results": [{"local_id"?, "id", "etag"?}]}
//! ```

use crate::provider::{Provider, RawRecord, RemotePage, RequestContext, UploadAck};
use crate::transport::HttpRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sync_core::{ConflictPolicy, ConflictResolver, FetchMode, UploadBatch, UploadOp};
use sync_types::{
    CollectionType, Entity, FieldSet, FieldTag, Page, Payload, RemoteMarker, SyncCursor,
    SyncError, Timestamp,
};

/// Feed provider settings, as found in the `[provider]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSettings {
    /// Name used in logs (default: "feed").
    #[serde(default = "default_name")]
    pub name: String,
    /// Collection served by the endpoint.
    pub collection: CollectionType,
    /// Collection URL.
    pub endpoint: String,
    /// Endpoint returns only changes since the sync marker (default: false).
    #[serde(default)]
    pub incremental: bool,
    /// Records per page (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Endpoint accepts `POST {endpoint}/batch` (default: false).
    #[serde(default)]
    pub writable: bool,
    /// Upload batch size, overriding the engine default.
    #[serde(default)]
    pub upload_batch_size: Option<usize>,
    /// Fields where the local value wins over the remote one.
    #[serde(default)]
    pub prefer_local: Vec<String>,
}

fn default_name() -> String {
    "feed".to_string()
}

fn default_page_size() -> u32 {
    100
}

impl FeedSettings {
    /// Read-only full-fetch settings for `endpoint`.
    pub fn new(collection: CollectionType, endpoint: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            collection,
            endpoint: endpoint.into(),
            incremental: false,
            page_size: default_page_size(),
            writable: false,
            upload_batch_size: None,
            prefer_local: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct WirePage {
    items: Vec<RawRecord>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    sync_token: Option<String>,
}

#[derive(Deserialize)]
struct WireRecord {
    id: String,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    created_at: Option<Timestamp>,
    #[serde(default)]
    updated_at: Option<Timestamp>,
    #[serde(default)]
    asset_url: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireOp<'a> {
    Create {
        local_id: &'a str,
        fields: &'a Payload,
    },
    Update {
        id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        etag: Option<&'a str>,
        fields: &'a Payload,
    },
    Delete {
        id: &'a str,
    },
}

#[derive(Serialize)]
struct WireBatch<'a> {
    ops: Vec<WireOp<'a>>,
}

#[derive(Deserialize)]
struct WireResults {
    results: Vec<WireAck>,
}

#[derive(Deserialize)]
struct WireAck {
    #[serde(default)]
    local_id: Option<String>,
    id: String,
    #[serde(default)]
    etag: Option<String>,
}

/// [`Provider`] for endpoints following the feed convention above.
#[derive(Debug, Clone)]
pub struct JsonFeedProvider {
    settings: FeedSettings,
}

impl JsonFeedProvider {
    /// Provider for the given settings.
    pub fn new(settings: FeedSettings) -> Self {
        Self { settings }
    }

    /// Settings in use.
    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    fn batch_url(&self) -> String {
        format!("{}/batch", self.settings.endpoint.trim_end_matches('/'))
    }
}

impl Provider for JsonFeedProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn collection(&self) -> CollectionType {
        self.settings.collection
    }

    fn fetch_mode(&self) -> FetchMode {
        if self.settings.incremental {
            FetchMode::Incremental
        } else {
            FetchMode::Full
        }
    }

    fn page_request(
        &self,
        ctx: &RequestContext<'_>,
        cursor: Option<&SyncCursor>,
    ) -> Result<HttpRequest, SyncError> {
        let mut params: Vec<(&str, String)> =
            vec![("limit", self.settings.page_size.to_string())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.as_str().to_string()));
        }
        if self.settings.incremental {
            match ctx.since {
                Some(RemoteMarker::Token(token)) => params.push(("sync_token", token.clone())),
                Some(RemoteMarker::Timestamp(ts)) => {
                    params.push(("updated_since", ts.to_string()))
                }
                None => {}
            }
        }

        let endpoint = &self.settings.endpoint;
        let url = reqwest::Url::parse_with_params(endpoint, &params)
            .map_err(|e| SyncError::ProviderData(format!("bad endpoint {endpoint}: {e}")))?;
        Ok(HttpRequest::get(url.as_str()).bearer(ctx.token.as_str()))
    }

    fn parse_page(&self, body: &[u8]) -> Result<RemotePage, SyncError> {
        let wire: WirePage = serde_json::from_slice(body)
            .map_err(|e| SyncError::ProviderData(format!("malformed page: {e}")))?;
        let page = match wire.next_cursor {
            Some(cursor) => Page::with_next(wire.items, cursor),
            None => Page::last(wire.items),
        };
        Ok(RemotePage {
            page,
            sync_token: wire.sync_token,
        })
    }

    fn map_to_entity(&self, raw: &RawRecord) -> Result<Entity, SyncError> {
        let record: WireRecord = serde_json::from_value(raw.clone())
            .map_err(|e| SyncError::ProviderData(format!("malformed record: {e}")))?;
        if record.id.trim().is_empty() {
            return Err(SyncError::ProviderData("record without id".into()));
        }

        let mut entity = Entity::new(record.id);
        entity.version_tag = record.etag.filter(|t| !t.is_empty()).map(Into::into);
        entity.deleted = record.deleted;
        entity.created_at = record.created_at;
        entity.updated_at = record.updated_at;
        entity.payload = record
            .fields
            .into_iter()
            .map(|(k, v)| (FieldTag::from(k), v))
            .collect();
        if let Some(url) = record.asset_url.filter(|u| !u.is_empty()) {
            entity = entity.with_asset_url(url);
        }
        Ok(entity)
    }

    fn supports_upload(&self) -> bool {
        self.settings.writable
    }

    fn upload_batch_size(&self) -> Option<usize> {
        self.settings.upload_batch_size
    }

    fn upload_request(
        &self,
        ctx: &RequestContext<'_>,
        batch: &UploadBatch,
    ) -> Result<HttpRequest, SyncError> {
        if !self.settings.writable {
            return Err(SyncError::ProviderData(format!(
                "feed {} is read-only",
                self.settings.endpoint
            )));
        }
        let mut ops = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            let wire = match op {
                UploadOp::Create(entity) => WireOp::Create {
                    local_id: entity
                        .local_id
                        .as_ref()
                        .map(|id| id.as_str())
                        .ok_or_else(|| SyncError::ProviderData("create without local id".into()))?,
                    fields: &entity.payload,
                },
                UploadOp::Update(entity) => WireOp::Update {
                    id: entity.external_id.as_str(),
                    etag: entity.version_tag.as_ref().map(|v| v.as_str()),
                    fields: &entity.payload,
                },
                UploadOp::Delete(id) => WireOp::Delete { id: id.as_str() },
            };
            ops.push(wire);
        }
        let request = HttpRequest::post_json(self.batch_url(), &WireBatch { ops })?;
        Ok(request.bearer(ctx.token.as_str()))
    }

    fn parse_upload_acks(&self, body: &[u8]) -> Result<Vec<UploadAck>, SyncError> {
        let wire: WireResults = serde_json::from_slice(body)
            .map_err(|e| SyncError::ProviderData(format!("malformed upload response: {e}")))?;
        Ok(wire
            .results
            .into_iter()
            .map(|ack| UploadAck {
                local_id: ack.local_id.map(Into::into),
                external_id: ack.id.into(),
                version_tag: ack.etag.filter(|t| !t.is_empty()).map(Into::into),
            })
            .collect())
    }

    fn conflict_resolver(&self, ignored_fields: FieldSet) -> ConflictResolver {
        let resolver = ConflictResolver::new(ignored_fields);
        if self.settings.prefer_local.is_empty() {
            resolver
        } else {
            let fields = self
                .settings
                .prefer_local
                .iter()
                .map(|f| FieldTag::from(f.as_str()))
                .collect();
            resolver.with_policy(ConflictPolicy::PreferLocal(fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessToken;
    use serde_json::json;
    use sync_types::{AccountId, ExternalId};

    fn provider() -> JsonFeedProvider {
        JsonFeedProvider::new(FeedSettings::new(
            CollectionType::Posts,
            "https://api.example.com/v1/posts",
        ))
    }

    // ===========================================
    // Fetch
    // ===========================================

    #[test]
    fn first_page_request() {
        let account = AccountId::new("42");
        let token = AccessToken::new("tok");
        let ctx = RequestContext {
            account: &account,
            token: &token,
            since: None,
        };

        let req = provider().page_request(&ctx, None).unwrap();

        assert_eq!(req.url, "https://api.example.com/v1/posts?limit=100");
        assert_eq!(req.header("authorization"), Some("Bearer tok"));
    }

    #[test]
    fn incremental_request_carries_cursor_and_token() {
        let mut settings =
            FeedSettings::new(CollectionType::Posts, "https://api.example.com/posts");
        settings.incremental = true;
        settings.page_size = 10;
        let provider = JsonFeedProvider::new(settings);
        let account = AccountId::new("42");
        let token = AccessToken::new("tok");
        let marker = RemoteMarker::Token("s t".into());
        let ctx = RequestContext {
            account: &account,
            token: &token,
            since: Some(&marker),
        };

        let req = provider
            .page_request(&ctx, Some(&SyncCursor::new("page-2")))
            .unwrap();

        assert_eq!(
            req.url,
            "https://api.example.com/posts?limit=10&cursor=page-2&sync_token=s+t"
        );
        assert_eq!(provider.fetch_mode(), FetchMode::Incremental);
    }

    #[test]
    fn full_mode_ignores_marker() {
        let account = AccountId::new("42");
        let token = AccessToken::new("tok");
        let marker = RemoteMarker::Timestamp(1_700_000_000);
        let ctx = RequestContext {
            account: &account,
            token: &token,
            since: Some(&marker),
        };

        let req = provider().page_request(&ctx, None).unwrap();
        assert!(!req.url.contains("updated_since"));
    }

    #[test]
    fn parses_page_with_cursor_and_token() {
        let body = json!({
            "items": [{"id": "p1"}],
            "next_cursor": "c2",
            "sync_token": "t9"
        });

        let page = provider().parse_page(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.page.items.len(), 1);
        assert_eq!(page.page.next_cursor, Some(SyncCursor::new("c2")));
        assert_eq!(page.sync_token.as_deref(), Some("t9"));
    }

    #[test]
    fn malformed_page_is_provider_data() {
        let err = provider().parse_page(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));

        let err = provider().parse_page(br#"{"data": []}"#).unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));
    }

    #[test]
    fn maps_record_to_entity() {
        let raw = json!({
            "id": "p1",
            "etag": "e1",
            "updated_at": 1_700_000_100,
            "asset_url": "https://cdn/p1.jpg",
            "fields": {"text": "hello"}
        });

        let entity = provider().map_to_entity(&raw).unwrap();

        assert_eq!(entity.external_id, ExternalId::new("p1"));
        assert_eq!(entity.version_tag.as_ref().map(|v| v.as_str()), Some("e1"));
        assert_eq!(entity.updated_at, Some(1_700_000_100));
        assert_eq!(entity.asset_url(), Some("https://cdn/p1.jpg"));
        assert_eq!(entity.field("text"), Some(&json!("hello")));
        assert!(!entity.deleted);
    }

    #[test]
    fn record_without_id_is_rejected() {
        assert!(provider().map_to_entity(&json!({"fields": {}})).is_err());
        assert!(provider().map_to_entity(&json!({"id": " "})).is_err());
    }

    #[test]
    fn tombstone_record() {
        let entity = provider()
            .map_to_entity(&json!({"id": "p1", "deleted": true}))
            .unwrap();
        assert!(entity.deleted);
    }

    // ===========================================
    // Upload
    // ===========================================

    #[test]
    fn upload_request_body() {
        let mut settings = FeedSettings::new(CollectionType::Contacts, "https://api/contacts/");
        settings.writable = true;
        let provider = JsonFeedProvider::new(settings);
        let account = AccountId::new("42");
        let token = AccessToken::new("tok");
        let ctx = RequestContext {
            account: &account,
            token: &token,
            since: None,
        };
        let batch = UploadBatch {
            id: 1,
            ops: vec![
                UploadOp::Create(
                    Entity::new(ExternalId::unassigned())
                        .with_local_id("l1")
                        .with_field("name", json!("Ada")),
                ),
                UploadOp::Update(Entity::new("c2").with_version("e2").with_local_id("l2")),
                UploadOp::Delete(ExternalId::new("c3")),
            ],
        };

        let req = provider.upload_request(&ctx, &batch).unwrap();
        let body: serde_json::Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();

        assert_eq!(req.url, "https://api/contacts/batch");
        assert_eq!(
            body,
            json!({"ops": [
                {"op": "create", "local_id": "l1", "fields": {"name": "Ada"}},
                {"op": "update", "id": "c2", "etag": "e2", "fields": {}},
                {"op": "delete", "id": "c3"}
            ]})
        );
    }

    #[test]
    fn read_only_feed_refuses_upload() {
        let account = AccountId::new("42");
        let token = AccessToken::new("tok");
        let ctx = RequestContext {
            account: &account,
            token: &token,
            since: None,
        };
        let provider = provider();
        assert!(!provider.supports_upload());
        let err = provider
            .upload_request(&ctx, &UploadBatch { id: 1, ops: vec![] })
            .unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn parses_upload_acks() {
        let body = json!({"results": [
            {"local_id": "l1", "id": "c9", "etag": "e1"},
            {"id": "c2"}
        ]});

        let acks = provider()
            .parse_upload_acks(body.to_string().as_bytes())
            .unwrap();

        assert_eq!(acks[0].local_id, Some("l1".into()));
        assert_eq!(acks[0].external_id, ExternalId::new("c9"));
        assert_eq!(acks[1].version_tag, None);
    }

    #[test]
    fn prefer_local_fields_set_policy() {
        let mut settings = FeedSettings::new(CollectionType::Contacts, "https://api/contacts");
        settings.prefer_local = vec!["nickname".into()];
        let resolver = JsonFeedProvider::new(settings).conflict_resolver(FieldSet::new());

        assert!(matches!(resolver.policy(), ConflictPolicy::PreferLocal(f) if f.len() == 1));
    }
}
