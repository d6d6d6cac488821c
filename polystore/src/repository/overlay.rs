//! Timestamp and soft-delete overlays
//!
//! Overlays are transparent transforms layered onto read and write paths. They
//! are pure: the caller supplies the instant, which keeps them testable and lets
//! a single operation stamp every record with the same time.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::filter::{Filter, FilterOperator};
use super::Document;

/// Render an instant the way overlays store it (RFC 3339, UTC, milliseconds)
pub fn timestamp(now: DateTime<Utc>) -> Value {
    Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Stamps creation and update instants onto payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampOverlay {
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl TimestampOverlay {
    pub fn new(enabled: bool, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        Self {
            enabled,
            created_at: created_at.into(),
            updated_at: updated_at.into(),
        }
    }

    /// Overlay that never touches payloads
    pub fn disabled() -> Self {
        Self::new(false, "created_at", "updated_at")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Field names this overlay writes
    pub fn fields(&self) -> [&str; 2] {
        [&self.created_at, &self.updated_at]
    }

    /// Set created-at and updated-at on a new record
    ///
    /// Values already present in the payload are overwritten.
    pub fn decorate_create(&self, mut payload: Document, now: DateTime<Utc>) -> Document {
        if self.enabled {
            let stamp = timestamp(now);
            payload.insert(self.created_at.clone(), stamp.clone());
            payload.insert(self.updated_at.clone(), stamp);
        }
        payload
    }

    /// Set updated-at on an update patch
    pub fn decorate_update(&self, mut payload: Document, now: DateTime<Utc>) -> Document {
        if self.enabled {
            payload.insert(self.updated_at.clone(), timestamp(now));
        }
        payload
    }
}

/// Which records a read path may see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Records whose soft-delete field is null
    #[default]
    Active,
    /// Every record
    All,
    /// Records whose soft-delete field is set
    DeletedOnly,
}

/// Rewrites deletes into timestamp updates and hides deleted records from reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftDeleteOverlay {
    field: String,
}

impl SoftDeleteOverlay {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// The soft-delete field name
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Lowest-precedence filter layer for a visibility
    pub fn visibility_filter(&self, visibility: Visibility) -> Filter {
        match visibility {
            Visibility::Active => Filter::new().eq(self.field.as_str(), Value::Null),
            Visibility::All => Filter::new(),
            Visibility::DeletedOnly => {
                Filter::new().op(self.field.as_str(), FilterOperator::IsNotNull, true)
            }
        }
    }

    /// Patch that marks records deleted at `now`
    pub fn mark_patch(&self, now: DateTime<Utc>) -> Document {
        let mut patch = Document::new();
        patch.insert(self.field.clone(), timestamp(now));
        patch
    }

    /// Patch that clears the deletion mark
    pub fn clear_patch(&self) -> Document {
        let mut patch = Document::new();
        patch.insert(self.field.clone(), json!(null));
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FieldFilter;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(timestamp(instant()), json!("2024-05-01T12:30:00.000Z"));
    }

    #[test]
    fn test_decorate_create_sets_both_fields() {
        let overlay = TimestampOverlay::new(true, "created_at", "updated_at");
        let mut payload = Document::new();
        payload.insert("name".into(), json!("Ann"));
        payload.insert("created_at".into(), json!("hook-written"));

        let decorated = overlay.decorate_create(payload, instant());
        assert_eq!(decorated["created_at"], json!("2024-05-01T12:30:00.000Z"));
        assert_eq!(decorated["updated_at"], json!("2024-05-01T12:30:00.000Z"));
        assert_eq!(decorated["name"], json!("Ann"));
    }

    #[test]
    fn test_decorate_update_only_touches_updated_at() {
        let overlay = TimestampOverlay::new(true, "createdAt", "updatedAt");
        let decorated = overlay.decorate_update(Document::new(), instant());
        assert!(decorated.contains_key("updatedAt"));
        assert!(!decorated.contains_key("createdAt"));
    }

    #[test]
    fn test_disabled_overlay_is_identity() {
        let overlay = TimestampOverlay::disabled();
        assert!(overlay.decorate_create(Document::new(), instant()).is_empty());
        assert!(overlay.decorate_update(Document::new(), instant()).is_empty());
    }

    #[test]
    fn test_visibility_filters() {
        let overlay = SoftDeleteOverlay::new("deleted_at");
        assert_eq!(
            overlay.visibility_filter(Visibility::Active).get("deleted_at"),
            Some(&FieldFilter::Equals(Value::Null))
        );
        assert!(overlay.visibility_filter(Visibility::All).is_empty());

        let deleted = overlay.visibility_filter(Visibility::DeletedOnly);
        let conditions = deleted.conditions(true).unwrap();
        assert_eq!(
            conditions,
            vec![crate::repository::FilterCondition::is_not_null("deleted_at")]
        );
    }

    #[test]
    fn test_patches() {
        let overlay = SoftDeleteOverlay::new("removed_at");
        assert_eq!(
            overlay.mark_patch(instant())["removed_at"],
            json!("2024-05-01T12:30:00.000Z")
        );
        assert_eq!(overlay.clear_patch()["removed_at"], Value::Null);
    }
}
