//! Conflict resolution between a remote entity and its local counterpart.

use sync_types::{Entity, FieldSet};

/// Which side wins for overlapping fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Whole-entity remote wins.
    #[default]
    RemoteWins,
    /// Remote wins except for these fields, which keep the local value when
    /// the local entity has one.
    PreferLocal(FieldSet),
}

/// Merges remote changes into local entities.
///
/// Fields in `ignored_fields` are device-local: they are never taken from the
/// remote and always copied from the local entity untouched.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    ignored_fields: FieldSet,
}

impl ConflictResolver {
    /// Remote-wins resolver with the given device-local fields.
    pub fn new(ignored_fields: FieldSet) -> Self {
        Self {
            policy: ConflictPolicy::RemoteWins,
            ignored_fields,
        }
    }

    /// Replace the policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Device-local fields.
    pub fn ignored_fields(&self) -> &FieldSet {
        &self.ignored_fields
    }

    /// Current policy.
    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Merge `remote` over `local`.
    ///
    /// The result is the remote entity with the local id, the local values of
    /// ignored fields, and the remote version tag.
    pub fn merge(&self, remote: Entity, local: &Entity) -> Entity {
        let mut merged = remote;
        if local.local_id.is_some() {
            merged.local_id = local.local_id.clone();
        }

        for tag in &self.ignored_fields {
            match local.payload.get(tag) {
                Some(value) => {
                    merged.payload.insert(tag.clone(), value.clone());
                }
                None => {
                    merged.payload.remove(tag);
                }
            }
        }

        if let ConflictPolicy::PreferLocal(fields) = &self.policy {
            for tag in fields {
                if let Some(value) = local.payload.get(tag) {
                    merged.payload.insert(tag.clone(), value.clone());
                }
            }
        }

        // Same URL already on disk: keep the path, skip the re-download.
        if let (Some(remote_asset), Some(local_asset)) =
            (merged.asset.as_mut(), local.asset.as_ref())
        {
            if remote_asset.url == local_asset.url && remote_asset.local_path.is_none() {
                remote_asset.local_path = local_asset.local_path.clone();
            }
        }

        merged.dirty_fields.clear();
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_types::{AssetRef, FieldTag, LocalId, VersionTag};

    fn fields(tags: &[&str]) -> FieldSet {
        tags.iter().map(|t| FieldTag::from(*t)).collect()
    }

    #[test]
    fn ignored_field_keeps_local_value() {
        let resolver = ConflictResolver::new(fields(&["note"]));
        let remote = Entity::new("c1")
            .with_field("name", json!("Ada Lovelace"))
            .with_field("note", json!("local-only"));
        let local = Entity::new("c1")
            .with_local_id("row-1")
            .with_field("name", json!("Ada"))
            .with_field("note", json!("kept"));

        let merged = resolver.merge(remote, &local);

        assert_eq!(merged.field("note"), Some(&json!("kept")));
        assert_eq!(merged.field("name"), Some(&json!("Ada Lovelace")));
    }

    #[test]
    fn ignored_field_absent_locally_is_not_imported() {
        let resolver = ConflictResolver::new(fields(&["note"]));
        let remote = Entity::new("c1").with_field("note", json!("from remote"));
        let local = Entity::new("c1").with_local_id("row-1");

        let merged = resolver.merge(remote, &local);

        assert!(merged.field("note").is_none());
    }

    #[test]
    fn local_id_and_remote_version_are_preserved() {
        let resolver = ConflictResolver::default();
        let remote = Entity::new("c1").with_version("etag-remote");
        let local = Entity::new("c1").with_local_id("row-9").with_version("etag-old");

        let merged = resolver.merge(remote, &local);

        assert_eq!(merged.local_id, Some(LocalId::new("row-9")));
        assert_eq!(merged.version_tag, Some(VersionTag::new("etag-remote")));
    }

    #[test]
    fn remote_wins_drops_local_only_synced_fields() {
        let resolver = ConflictResolver::default();
        let remote = Entity::new("c1").with_field("name", json!("R"));
        let local = Entity::new("c1")
            .with_local_id("row-1")
            .with_field("name", json!("L"))
            .with_field("phone", json!("123"));

        let merged = resolver.merge(remote, &local);

        assert_eq!(merged.field("name"), Some(&json!("R")));
        assert!(merged.field("phone").is_none());
    }

    #[test]
    fn prefer_local_policy_keeps_listed_fields() {
        let resolver = ConflictResolver::default()
            .with_policy(ConflictPolicy::PreferLocal(fields(&["nickname"])));
        let remote = Entity::new("c1")
            .with_field("nickname", json!("remote-nick"))
            .with_field("name", json!("R"));
        let local = Entity::new("c1")
            .with_local_id("row-1")
            .with_field("nickname", json!("my-nick"))
            .with_field("name", json!("L"));

        let merged = resolver.merge(remote, &local);

        assert_eq!(merged.field("nickname"), Some(&json!("my-nick")));
        assert_eq!(merged.field("name"), Some(&json!("R")));
    }

    #[test]
    fn downloaded_asset_path_survives_merge_for_same_url() {
        let resolver = ConflictResolver::default();
        let remote = Entity::new("c1").with_asset_url("https://cdn/a.jpg");
        let mut local = Entity::new("c1").with_local_id("row-1");
        local.asset = Some(AssetRef {
            url: "https://cdn/a.jpg".into(),
            local_path: Some("/assets/a.jpg".into()),
        });

        let merged = resolver.merge(remote, &local);
        assert_eq!(
            merged.asset.and_then(|a| a.local_path),
            Some("/assets/a.jpg".to_string())
        );
    }

    #[test]
    fn changed_asset_url_drops_local_path() {
        let resolver = ConflictResolver::default();
        let remote = Entity::new("c1").with_asset_url("https://cdn/new.jpg");
        let mut local = Entity::new("c1").with_local_id("row-1");
        local.asset = Some(AssetRef {
            url: "https://cdn/old.jpg".into(),
            local_path: Some("/assets/old.jpg".into()),
        });

        let merged = resolver.merge(remote, &local);
        assert_eq!(merged.asset, Some(AssetRef::remote("https://cdn/new.jpg")));
    }
}
