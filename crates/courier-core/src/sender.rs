//! Metadata describing the context on the other end of a channel.

use serde::{Deserialize, Serialize};

use crate::ids::OwnerId;

/// Who opened a channel.
///
/// The broker only reads `owner_id` and `frame_id` (to decide whether the
/// channel is the root channel of its owner). Everything else is passed
/// through to handlers untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    /// Logical owner (tab) this context belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    /// Frame within the owner; `0` is the top-level frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    /// Document URL of the context, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SenderInfo {
    /// Metadata for the top-level context of `owner`.
    #[must_use]
    pub fn root(owner: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: Some(owner.into()),
            frame_id: Some(0),
            url: None,
        }
    }

    /// Metadata for a nested context (`frame_id != 0`) of `owner`.
    #[must_use]
    pub fn frame(owner: impl Into<OwnerId>, frame_id: u64) -> Self {
        Self {
            owner_id: Some(owner.into()),
            frame_id: Some(frame_id),
            url: None,
        }
    }

    /// Attach a document URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Whether this is the top-level context of some owner.
    pub fn is_root(&self) -> bool {
        self.owner_id.is_some() && self.frame_id == Some(0)
    }

    /// Whether this is the top-level context of `owner`.
    ///
    /// Behind-the-scene owners never have a root channel.
    pub fn is_root_of(&self, owner: &OwnerId) -> bool {
        !owner.is_behind_the_scene() && self.is_root() && self.owner_id.as_ref() == Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sender_is_root_of_its_owner() {
        let s = SenderInfo::root("5");
        assert!(s.is_root());
        assert!(s.is_root_of(&OwnerId::new("5")));
        assert!(!s.is_root_of(&OwnerId::new("6")));
    }

    #[test]
    fn frame_sender_is_not_root() {
        let s = SenderInfo::frame("5", 3);
        assert!(!s.is_root());
        assert!(!s.is_root_of(&OwnerId::new("5")));
    }

    #[test]
    fn ownerless_sender_is_never_root() {
        let s = SenderInfo {
            owner_id: None,
            frame_id: Some(0),
            url: None,
        };
        assert!(!s.is_root());
    }

    #[test]
    fn behind_the_scene_owner_has_no_root() {
        let s = SenderInfo::root(OwnerId::behind_the_scene());
        assert!(s.is_root());
        assert!(!s.is_root_of(&OwnerId::behind_the_scene()));
    }

    #[test]
    fn serde_uses_camel_case_and_skips_empty() {
        let s = SenderInfo::root("12").with_url("https://example.org/");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["ownerId"], "12");
        assert_eq!(v["frameId"], 0);
        assert_eq!(v["url"], "https://example.org/");

        let bare = serde_json::to_value(SenderInfo::default()).unwrap();
        assert_eq!(bare, serde_json::json!({}));
    }
}
