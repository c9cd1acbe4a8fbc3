//! Tag index for group invalidation.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Bidirectional tag ↔ key mapping.
#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    tags: RwLock<HashMap<String, HashSet<String>>>,
    key_tags: RwLock<HashMap<String, HashSet<String>>>,
}

impl TagIndex {
    pub(crate) async fn tag(&self, key: &str, tags: &[String]) {
        if tags.is_empty() {
            return;
        }

        let mut tags_map = self.tags.write().await;
        let mut key_tags_map = self.key_tags.write().await;

        for tag in tags {
            tags_map
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        key_tags_map
            .entry(key.to_string())
            .or_default()
            .extend(tags.iter().cloned());
    }

    pub(crate) async fn untag_key(&self, key: &str) {
        let mut tags_map = self.tags.write().await;
        let mut key_tags_map = self.key_tags.write().await;

        if let Some(tag_set) = key_tags_map.remove(key) {
            for tag in tag_set {
                if let Some(keys) = tags_map.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        tags_map.remove(&tag);
                    }
                }
            }
        }
    }

    pub(crate) async fn keys_for(&self, tag: &str) -> Vec<String> {
        self.tags
            .read()
            .await
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key carrying at least one tag.
    pub(crate) async fn keys(&self) -> Vec<String> {
        self.key_tags.read().await.keys().cloned().collect()
    }

    /// Number of tagged keys.
    pub(crate) async fn len(&self) -> usize {
        self.key_tags.read().await.len()
    }

    pub(crate) async fn clear(&self) {
        self.tags.write().await.clear();
        self.key_tags.write().await.clear();
    }
}
