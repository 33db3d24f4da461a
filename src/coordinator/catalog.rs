//! Live action catalog, mirrored from retained broker announcements.
//!
//! One subscription to `tinpot/actions/+` feeds this map: a non-empty
//! payload upserts the named action, an empty payload withdraws it. The
//! broker's single retained slot per topic makes it the source of truth —
//! after (re)connecting, replaying the retained messages rebuilds the
//! catalog with no explicit resynchronization.
//!
//! Single writer (the subscription handler on the broker event loop), many
//! readers (HTTP handlers).

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::RwLock;

use crate::protocol::{parse_announce_topic, ActionAnnouncement};

/// Name → announcement mapping.
#[derive(Debug, Default)]
pub struct ActionCatalog {
    actions: RwLock<HashMap<String, ActionAnnouncement>>,
}

impl ActionCatalog {
    /// Apply one announcement message.
    ///
    /// Malformed topics and payloads are logged and dropped; re-delivery of
    /// an identical announcement is a no-op upsert (QoS 1 handlers must be
    /// idempotent).
    pub fn apply(&self, topic: &str, payload: &[u8]) {
        let Some(name) = parse_announce_topic(topic) else {
            log::debug!("[coordinator] ignoring announcement on unexpected topic {topic}");
            return;
        };

        if payload.is_empty() {
            let removed = self
                .actions
                .write()
                .map(|mut map| map.remove(name).is_some())
                .unwrap_or(false);
            if removed {
                log::info!("[coordinator] action withdrawn: {name}");
            }
            return;
        }

        match serde_json::from_slice::<ActionAnnouncement>(payload) {
            Ok(announcement) => {
                if let Ok(mut map) = self.actions.write() {
                    let replaced = map.insert(name.to_string(), announcement).is_some();
                    if replaced {
                        log::debug!("[coordinator] action updated: {name}");
                    } else {
                        log::info!("[coordinator] action registered: {name}");
                    }
                }
            }
            Err(e) => {
                log::warn!("[coordinator] dropping malformed announcement for {name}: {e}");
            }
        }
    }

    /// Snapshot of the whole catalog.
    pub fn list(&self) -> HashMap<String, ActionAnnouncement> {
        self.actions.read().map(|map| map.clone()).unwrap_or_default()
    }

    /// Look up one action by name.
    pub fn lookup(&self, name: &str) -> Option<ActionAnnouncement> {
        self.actions.read().ok().and_then(|map| map.get(name).cloned())
    }

    pub fn len(&self) -> usize {
        self.actions.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{announce_topic, trigger_topic};

    fn announcement(name: &str) -> Vec<u8> {
        serde_json::to_vec(&ActionAnnouncement {
            description: format!("{name} description"),
            group: "test".to_string(),
            parameters: Default::default(),
            trigger_topic: trigger_topic(name),
        })
        .expect("encode announcement")
    }

    #[test]
    fn announce_then_lookup() {
        let catalog = ActionCatalog::default();
        catalog.apply(&announce_topic("clean_cache"), &announcement("clean_cache"));

        let found = catalog.lookup("clean_cache").expect("action should be listed");
        assert_eq!(found.trigger_topic, "tinpot/actions/clean_cache/trigger");
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn repeated_announcements_are_idempotent() {
        let catalog = ActionCatalog::default();
        for _ in 0..3 {
            catalog.apply(&announce_topic("clean_cache"), &announcement("clean_cache"));
        }
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn later_announcement_replaces_earlier() {
        let catalog = ActionCatalog::default();
        catalog.apply(&announce_topic("x"), &announcement("x"));

        let updated = serde_json::to_vec(&ActionAnnouncement {
            description: "new description".to_string(),
            group: "other".to_string(),
            parameters: Default::default(),
            trigger_topic: trigger_topic("x"),
        })
        .expect("encode");
        catalog.apply(&announce_topic("x"), &updated);

        assert_eq!(catalog.lookup("x").expect("listed").group, "other");
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn empty_payload_withdraws() {
        let catalog = ActionCatalog::default();
        catalog.apply(&announce_topic("x"), &announcement("x"));
        catalog.apply(&announce_topic("x"), b"");
        assert!(catalog.lookup("x").is_none());
        assert!(catalog.is_empty());
    }

    #[test]
    fn withdrawal_of_unknown_action_is_a_no_op() {
        let catalog = ActionCatalog::default();
        catalog.apply(&announce_topic("ghost"), b"");
        assert!(catalog.is_empty());
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let catalog = ActionCatalog::default();
        catalog.apply(&announce_topic("x"), b"not json at all");
        assert!(catalog.lookup("x").is_none());
    }

    #[test]
    fn trigger_topics_are_not_catalog_entries() {
        let catalog = ActionCatalog::default();
        // One level too deep for tinpot/actions/{name}; must be skipped even
        // though the payload is valid.
        catalog.apply("tinpot/actions/x/trigger", &announcement("x"));
        assert!(catalog.is_empty());
    }
}
