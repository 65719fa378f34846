//! Cognitive memory layer
//!
//! A thin, stateful schema on top of the vector store:
//!
//! - `patterns` - typed reasoning patterns with rolling statistics
//! - `experiences` - scored task executions
//! - `optimizer` - collapse of old history into centroid summary nodes
//! - `context` - parallel multi-source retrieval with confidence scoring
//!
//! Every cognitive row owns an embedding row in `vectors` (tagged by
//! kind) and refers to it by id — ids, never pointers, cross component
//! boundaries.

pub mod context;
pub mod experiences;
pub mod optimizer;
pub mod patterns;

use crate::store::StoreError;

/// Shared JSON helpers for TEXT columns holding string lists.
pub(crate) fn tags_to_json(tags: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(tags).map_err(|e| StoreError::Runtime(e.to_string()))
}

pub(crate) fn tags_from_json(text: Option<&str>) -> Vec<String> {
    let Some(text) = text else {
        return Vec::new();
    };
    serde_json::from_str(text).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Stored tag list is not valid JSON");
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        let tags = vec!["planning".to_string(), "retry".to_string()];
        let json = tags_to_json(&tags).unwrap();
        assert_eq!(tags_from_json(Some(&json)), tags);
    }

    #[test]
    fn test_tags_from_missing_or_bad_json() {
        assert!(tags_from_json(None).is_empty());
        assert!(tags_from_json(Some("not json")).is_empty());
    }
}
