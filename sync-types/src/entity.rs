//! Remote-sourced records.

use crate::ids::{AccountId, ExternalId, FieldTag, LocalId, NamespacedKey, VersionTag};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// Collection-specific structured fields, ordered by tag so digests are stable.
pub type Payload = BTreeMap<FieldTag, serde_json::Value>;

/// A set of field tags (e.g. device-local fields excluded from sync).
pub type FieldSet = BTreeSet<FieldTag>;

/// Secondary binary asset (avatar, photo) referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Remote URL of the asset.
    pub url: String,
    /// Local file path once downloaded and attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl AssetRef {
    /// Reference to a remote asset that has not been downloaded.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_path: None,
        }
    }
}

/// A contact, post, image, event or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Remote identifier, unique within (account, collection).
    pub external_id: ExternalId,
    /// Local store handle, `None` until first save.
    #[serde(default)]
    pub local_id: Option<LocalId>,
    /// Remote version tag, `None` when the API supplies none.
    #[serde(default)]
    pub version_tag: Option<VersionTag>,
    /// Structured fields.
    #[serde(default)]
    pub payload: Payload,
    /// Remote creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Remote last-modified time.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    /// Tombstone: the remote reports this entity as deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Secondary binary asset.
    #[serde(default)]
    pub asset: Option<AssetRef>,
    /// Fields a local store reports as edited. Empty means unknown.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dirty_fields: FieldSet,
}

impl Entity {
    /// New entity with only an external id.
    pub fn new(external_id: impl Into<ExternalId>) -> Self {
        Self {
            external_id: external_id.into(),
            local_id: None,
            version_tag: None,
            payload: Payload::new(),
            created_at: None,
            updated_at: None,
            deleted: false,
            asset: None,
            dirty_fields: FieldSet::new(),
        }
    }

    /// Tombstone for the given external id.
    pub fn tombstone(external_id: impl Into<ExternalId>) -> Self {
        Self {
            deleted: true,
            ..Self::new(external_id)
        }
    }

    /// Set the version tag.
    pub fn with_version(mut self, tag: impl Into<VersionTag>) -> Self {
        self.version_tag = Some(tag.into());
        self
    }

    /// Set the local id.
    pub fn with_local_id(mut self, id: impl Into<LocalId>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    /// Set one payload field.
    pub fn with_field(mut self, tag: &str, value: serde_json::Value) -> Self {
        self.payload.insert(FieldTag::from(tag), value);
        self
    }

    /// Set the remote last-modified time.
    pub fn with_updated_at(mut self, ts: Timestamp) -> Self {
        self.updated_at = Some(ts);
        self
    }

    /// Reference a remote asset.
    pub fn with_asset_url(mut self, url: impl Into<String>) -> Self {
        self.asset = Some(AssetRef::remote(url));
        self
    }

    /// Look up one payload field.
    pub fn field(&self, tag: &str) -> Option<&serde_json::Value> {
        self.payload.get(&FieldTag::from(tag))
    }

    /// Account-scoped key for this entity.
    pub fn namespaced_key(&self, account: &AccountId) -> NamespacedKey {
        NamespacedKey::new(account, &self.external_id)
    }

    /// Remote asset URL, if any.
    pub fn asset_url(&self) -> Option<&str> {
        self.asset.as_ref().map(|a| a.url.as_str())
    }

    /// SHA-256 over the normalized payload, tombstone flag and asset URL.
    ///
    /// Local-only state (local id, local asset path, dirty fields) does not
    /// contribute, so the digest only moves when the remote content moves.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"socialsync-entity-v1");
        // BTreeMap serialization is key-ordered; nested objects follow serde_json's map order.
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        hasher.update((payload.len() as u64).to_le_bytes());
        hasher.update(&payload);
        hasher.update([self.deleted as u8]);
        if let Some(url) = self.asset_url() {
            hasher.update(url.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Version recorded in the checkpoint: the remote tag, or a payload digest.
    pub fn effective_version(&self) -> VersionTag {
        match &self.version_tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => VersionTag::new(format!("sha256:{}", self.content_digest())),
        }
    }

    /// Copy of this entity with the given fields removed from the payload.
    pub fn without_fields(&self, fields: &FieldSet) -> Self {
        let mut stripped = self.clone();
        stripped.payload.retain(|tag, _| !fields.contains(tag));
        stripped.dirty_fields.clear();
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact() -> Entity {
        Entity::new("c1")
            .with_field("name", json!("Ada"))
            .with_field("email", json!("ada@example.com"))
    }

    #[test]
    fn effective_version_prefers_remote_tag() {
        let entity = contact().with_version("etag-9");
        assert_eq!(entity.effective_version(), VersionTag::new("etag-9"));
    }

    #[test]
    fn effective_version_falls_back_to_digest() {
        let version = contact().effective_version();
        assert!(version.as_str().starts_with("sha256:"));
        assert_eq!(version.as_str().len(), "sha256:".len() + 64);
    }

    #[test]
    fn empty_version_tag_is_treated_as_absent() {
        let entity = contact().with_version("");
        assert!(entity.effective_version().as_str().starts_with("sha256:"));
    }

    #[test]
    fn digest_ignores_field_insertion_order() {
        let a = Entity::new("c1")
            .with_field("name", json!("Ada"))
            .with_field("email", json!("ada@example.com"));
        let b = Entity::new("c1")
            .with_field("email", json!("ada@example.com"))
            .with_field("name", json!("Ada"));
        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn digest_changes_with_payload() {
        let a = contact();
        let b = contact().with_field("name", json!("Grace"));
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn digest_ignores_local_state() {
        let a = contact();
        let mut b = contact().with_local_id("row-1");
        b.asset = None;
        b.dirty_fields.insert(FieldTag::from("name"));
        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn digest_tracks_tombstone_and_asset() {
        let base = contact();
        let mut deleted = contact();
        deleted.deleted = true;
        let with_asset = contact().with_asset_url("https://cdn/a.jpg");

        assert_ne!(base.content_digest(), deleted.content_digest());
        assert_ne!(base.content_digest(), with_asset.content_digest());
    }

    #[test]
    fn without_fields_strips_payload_and_dirty_set() {
        let mut entity = contact().with_field("note", json!("mine"));
        entity.dirty_fields.insert(FieldTag::from("note"));

        let mut ignored = FieldSet::new();
        ignored.insert(FieldTag::from("note"));
        let stripped = entity.without_fields(&ignored);

        assert!(stripped.field("note").is_none());
        assert!(stripped.field("name").is_some());
        assert!(stripped.dirty_fields.is_empty());
    }

    #[test]
    fn entity_json_defaults() {
        let entity: Entity = serde_json::from_str(r#"{"external_id":"p1"}"#).unwrap();
        assert_eq!(entity.external_id, ExternalId::new("p1"));
        assert!(!entity.deleted);
        assert!(entity.payload.is_empty());
    }
}
