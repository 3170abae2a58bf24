//! One-time-delivery store for passthrough content.
//!
//! Passthrough payloads never appear in the agent-visible result; they are
//! parked here behind an opaque reference with a 10-minute TTL. Redeeming a
//! reference removes it, so delivery happens at most once. Expired
//! references are swept lazily whenever new content is stored.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use trikgate_manifest::{PassthroughContent, PassthroughDeliveryReceipt, UserContentReference};
use uuid::Uuid;

use crate::now_ms;

pub const CONTENT_REF_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Default)]
pub struct ContentReferenceStore {
    references: Mutex<HashMap<String, UserContentReference>>,
}

impl ContentReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park content and return its reference.
    pub fn store(&self, trik_id: &str, action_name: &str, content: PassthroughContent) -> String {
        let mut references = self.references.lock().expect("content lock poisoned");
        let now = now_ms();
        references.retain(|_, r| r.expires_at >= now);

        let reference = Uuid::new_v4().to_string();
        references.insert(
            reference.clone(),
            UserContentReference {
                r#ref: reference.clone(),
                trik_id: trik_id.to_string(),
                action_name: action_name.to_string(),
                content,
                created_at: now,
                expires_at: now + CONTENT_REF_TTL_MS,
            },
        );
        reference
    }

    /// Redeem a reference. The content is handed out once and the
    /// reference destroyed; unknown and expired refs yield `None`.
    pub fn deliver(&self, reference: &str) -> Option<(PassthroughContent, PassthroughDeliveryReceipt)> {
        let mut references = self.references.lock().expect("content lock poisoned");
        let stored = references.remove(reference)?;
        if stored.expires_at < now_ms() {
            return None;
        }

        let receipt = PassthroughDeliveryReceipt {
            delivered: true,
            content_type: stored.content.content_type.clone(),
            metadata: stored.content.metadata.clone(),
        };
        Some((stored.content, receipt))
    }

    /// Whether a reference exists and has not expired.
    pub fn contains(&self, reference: &str) -> bool {
        let mut references = self.references.lock().expect("content lock poisoned");
        match references.get(reference) {
            Some(stored) if stored.expires_at < now_ms() => {
                references.remove(reference);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Content type and metadata of a live reference, without redeeming it.
    pub fn info(&self, reference: &str) -> Option<(String, Option<Value>)> {
        let references = self.references.lock().expect("content lock poisoned");
        let stored = references.get(reference)?;
        if stored.expires_at < now_ms() {
            return None;
        }
        Some((stored.content.content_type.clone(), stored.content.metadata.clone()))
    }

    pub fn len(&self) -> usize {
        self.references.lock().expect("content lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content() -> PassthroughContent {
        PassthroughContent {
            content_type: "text/markdown".to_string(),
            content: "# Article".to_string(),
            metadata: Some(json!({"title": "Article"})),
        }
    }

    #[test]
    fn test_delivery_is_one_time() {
        let store = ContentReferenceStore::new();
        let reference = store.store("@demo/articles", "read", content());

        let (delivered, receipt) = store.deliver(&reference).unwrap();
        assert_eq!(delivered.content, "# Article");
        assert!(receipt.delivered);
        assert_eq!(receipt.content_type, "text/markdown");

        // Second redemption fails.
        assert!(store.deliver(&reference).is_none());
        assert!(!store.contains(&reference));
    }

    #[test]
    fn test_unknown_ref_yields_none() {
        let store = ContentReferenceStore::new();
        assert!(store.deliver("not-a-ref").is_none());
        assert!(store.info("not-a-ref").is_none());
    }

    #[test]
    fn test_info_does_not_consume() {
        let store = ContentReferenceStore::new();
        let reference = store.store("@demo/articles", "read", content());

        let (content_type, metadata) = store.info(&reference).unwrap();
        assert_eq!(content_type, "text/markdown");
        assert_eq!(metadata, Some(json!({"title": "Article"})));
        assert!(store.contains(&reference));
        assert!(store.deliver(&reference).is_some());
    }

    #[test]
    fn test_store_sweeps_expired_refs() {
        let store = ContentReferenceStore::new();
        let reference = store.store("@demo/articles", "read", content());

        // Force the stored ref into the past.
        {
            let mut references = store.references.lock().unwrap();
            references.get_mut(&reference).unwrap().expires_at = now_ms() - 1;
        }

        // Storing new content sweeps the expired one.
        let _other = store.store("@demo/articles", "read", content());
        assert_eq!(store.len(), 1);
        assert!(!store.contains(&reference));
    }
}
