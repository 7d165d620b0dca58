//! Origin-tagging loop guard.
//!
//! Every merge the provider performs is tagged with its own origin. The
//! guard recognises those tags on the way back out so received changes
//! are never persisted or re-broadcast.

use yrs::Origin;

use crate::document::{DocumentUpdate, OriginTag};
use crate::presence::PresenceChange;

#[derive(Debug, Clone)]
pub struct LoopGuard {
    origin: OriginTag,
    yrs_origin: Origin,
}

impl LoopGuard {
    pub fn new(origin: OriginTag) -> Self {
        let yrs_origin = origin.to_origin();
        Self { origin, yrs_origin }
    }

    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    /// The update came from a merge this provider made.
    pub fn is_echo(&self, update: &DocumentUpdate) -> bool {
        update.origin.as_ref() == Some(&self.yrs_origin)
    }

    /// The presence change came from a merge this provider made.
    pub fn is_own(&self, change: &PresenceChange) -> bool {
        change.origin == self.origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SharedDocument;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_classifies_document_updates() {
        let guard = LoopGuard::new(OriginTag::new("provider-a"));
        let doc = SharedDocument::with_replica_id(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc.observe(move |u| sink.lock().unwrap().push(u)).unwrap();

        doc.push_text("content", "typed locally");

        let remote = SharedDocument::with_replica_id(2);
        remote.push_text("content", "from a peer");
        doc.apply_encoded_update(&remote.encode_full_state(), guard.origin())
            .unwrap();

        let other = SharedDocument::with_replica_id(3);
        other.push_text("content", "!");
        doc.apply_encoded_update(&other.encode_full_state(), &OriginTag::new("provider-b"))
            .unwrap();

        let seen = seen.lock().unwrap();
        let echoes: Vec<bool> = seen.iter().map(|u| guard.is_echo(u)).collect();
        assert_eq!(echoes, vec![false, true, false]);
    }

    #[test]
    fn test_classifies_presence_changes() {
        let guard = LoopGuard::new(OriginTag::new("provider-a"));
        let own = PresenceChange {
            added: vec![2],
            updated: vec![],
            removed: vec![],
            origin: OriginTag::new("provider-a"),
        };
        let local = PresenceChange {
            origin: OriginTag::local(),
            ..own.clone()
        };
        assert!(guard.is_own(&own));
        assert!(!guard.is_own(&local));
    }
}
