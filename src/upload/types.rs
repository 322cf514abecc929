use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One article as stored on disk. Every field is untrusted text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    pub link: String,
    #[serde(default, rename = "published_date")]
    pub publish_date: String,
    #[serde(default)]
    pub updated_date: String,
}

/// Metadata sent alongside the HTML. Key names are part of the endpoint contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemMetadata {
    pub creation_date: String,
    pub source_url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedItem {
    pub html: String,
    pub metadata: ItemMetadata,
}

/// Grouping attached to every upload of a run; only positive ids are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CollectionId(pub i64);

impl CollectionId {
    pub fn from_flag(v: i64) -> Option<Self> {
        (v > 0).then_some(CollectionId(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub item: PathBuf,
    pub collection: Option<CollectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Failure { reason: String, retryable: bool },
}

impl UploadOutcome {
    /// Recorded for items the run gave up on after cancellation.
    pub fn cancelled() -> Self {
        UploadOutcome::Failure { reason: "cancelled".to_string(), retryable: true }
    }

    pub fn is_success(&self) -> bool { matches!(self, UploadOutcome::Success) }
}

// Plan/result envelope types
#[derive(Serialize)]
pub struct UploadPlan {
    pub items: usize,
    pub source: String,
    pub workers: usize,
    pub backoff_ms: u64,
    pub max_conns: usize,
    pub collection: Option<CollectionId>,
    pub sample_items: Vec<String>,
}

#[derive(Serialize)]
pub struct UploadResult {
    pub succeeded: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures_file: Option<String>,
    pub failures_saved: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_decodes_with_optional_fields_missing() {
        let a: ArticleRecord = serde_json::from_str(
            r#"{"title":"T","content":"<p>c</p>","link":"https://x.test/a","extra":1}"#,
        )
        .unwrap();
        assert_eq!(a.title, "T");
        assert_eq!(a.excerpt, "");
        assert_eq!(a.publish_date, "");
        assert_eq!(a.updated_date, "");
    }

    #[test]
    fn article_requires_title_content_link() {
        let err = serde_json::from_str::<ArticleRecord>(r#"{"title":"T","content":"c"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn article_reads_published_date_key() {
        let a: ArticleRecord = serde_json::from_str(
            r#"{"title":"T","content":"c","link":"l","published_date":"2024-01-02","updated_date":"2024-01-03"}"#,
        )
        .unwrap();
        assert_eq!(a.publish_date, "2024-01-02");
        assert_eq!(a.updated_date, "2024-01-03");
    }

    #[test]
    fn collection_flag_zero_or_negative_is_unset() {
        assert_eq!(CollectionId::from_flag(0), None);
        assert_eq!(CollectionId::from_flag(-4), None);
        assert_eq!(CollectionId::from_flag(7), Some(CollectionId(7)));
    }

    #[test]
    fn metadata_serializes_compact_with_contract_keys() {
        let m = ItemMetadata {
            creation_date: "d".into(),
            source_url: "u".into(),
            title: "t".into(),
        };
        assert_eq!(
            serde_json::to_string(&m).unwrap(),
            r#"{"creation_date":"d","source_url":"u","title":"t"}"#
        );
    }
}
