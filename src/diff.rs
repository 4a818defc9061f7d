//! Diff results and their wire translation.
//!
//! Backends report a coarse [`DiffChanges`] signal, the keys that changed,
//! the keys that force replacement and, optionally, a per-path
//! [`PropertyDiff`]. [`translate_diff`] turns that into a wire
//! `DiffResponse` whose summary always agrees with its detail:
//!
//! - a non-empty detailed diff always reports `DIFF_SOME`;
//! - `*_REPLACE` kinds are reported as their plain kind (`UPDATE_REPLACE`
//!   as `UPDATE`, and so on) while their path is added to `replaces`.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_bridge::diff::{translate_diff, DiffKind, DiffResult, PropertyDiff};
//! use hemmer_provider_bridge::generated::diff_response::DiffChanges;
//!
//! let diff = DiffResult::none()
//!     .with_detailed_diff("name", PropertyDiff::new(DiffKind::UpdateReplace));
//!
//! let wire = translate_diff(diff);
//! assert_eq!(wire.changes, DiffChanges::DiffSome as i32);
//! assert_eq!(wire.replaces, vec!["name".to_string()]);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::generated::diff_response::DiffChanges as WireDiffChanges;
use crate::generated::property_diff::Kind as WireDiffKind;

/// Coarse signal for whether anything changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiffChanges {
    /// The backend could not tell.
    #[default]
    Unknown,
    /// Nothing changed.
    None,
    /// Something changed.
    Some,
}

/// The kind of change at a single property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// The property was added.
    Add,
    /// The property was added and this forces replacement.
    AddReplace,
    /// The property was removed.
    Delete,
    /// The property was removed and this forces replacement.
    DeleteReplace,
    /// The property changed.
    Update,
    /// The property changed and this forces replacement.
    UpdateReplace,
}

impl DiffKind {
    /// Returns `true` for the `*_REPLACE` kinds.
    pub fn is_replace(self) -> bool {
        matches!(
            self,
            DiffKind::AddReplace | DiffKind::DeleteReplace | DiffKind::UpdateReplace
        )
    }

    /// The kind reported on the wire. Replacement is signalled through the
    /// replace list instead, so `*_REPLACE` kinds narrow to their base kind.
    pub fn wire_kind(self) -> WireDiffKind {
        match self {
            DiffKind::Add | DiffKind::AddReplace => WireDiffKind::Add,
            DiffKind::Delete | DiffKind::DeleteReplace => WireDiffKind::Delete,
            DiffKind::Update | DiffKind::UpdateReplace => WireDiffKind::Update,
        }
    }
}

/// The change at a single property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDiff {
    /// What kind of change.
    pub kind: DiffKind,
    /// Whether the change was computed against the old inputs rather than
    /// the old state.
    pub input_diff: bool,
}

impl PropertyDiff {
    /// A change computed against the old state.
    pub fn new(kind: DiffKind) -> Self {
        Self {
            kind,
            input_diff: false,
        }
    }

    /// A change computed against the old inputs.
    pub fn input(kind: DiffKind) -> Self {
        Self {
            kind,
            input_diff: true,
        }
    }
}

/// The result of a Diff or DiffConfig call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiffResult {
    /// Coarse change signal.
    pub changes: DiffChanges,
    /// Top-level keys that changed.
    pub changed_keys: Vec<String>,
    /// Top-level keys whose change forces replacement.
    pub replace_keys: Vec<String>,
    /// Whether a replacement must delete the old resource first.
    pub delete_before_replace: bool,
    /// Per-path detail, keyed by dotted/indexed property path.
    pub detailed_diff: BTreeMap<String, PropertyDiff>,
}

impl DiffResult {
    /// A result reporting no changes.
    pub fn none() -> Self {
        Self {
            changes: DiffChanges::None,
            ..Default::default()
        }
    }

    /// A result reporting that the backend could not tell.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A result reporting changes to the given keys.
    pub fn some<I, S>(changed_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            changes: DiffChanges::Some,
            changed_keys: changed_keys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Mark keys as forcing replacement.
    pub fn with_replace_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replace_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Require delete-before-replace.
    pub fn with_delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }

    /// Add per-path detail.
    pub fn with_detailed_diff(mut self, path: impl Into<String>, diff: PropertyDiff) -> Self {
        self.detailed_diff.insert(path.into(), diff);
        self
    }

    /// Returns `true` if this diff would lead to a replacement.
    pub fn requires_replace(&self) -> bool {
        !self.replace_keys.is_empty() || self.detailed_diff.values().any(|d| d.kind.is_replace())
    }
}

/// Translate a diff result into its wire message.
pub fn translate_diff(diff: DiffResult) -> crate::generated::DiffResponse {
    let mut response = crate::generated::DiffResponse {
        delete_before_replace: diff.delete_before_replace,
        ..Default::default()
    };

    if diff.detailed_diff.is_empty() {
        response.changes = wire_changes(diff.changes) as i32;
        response.diffs = diff.changed_keys;
        response.replaces = diff.replace_keys;
        return response;
    }

    response.changes = WireDiffChanges::DiffSome as i32;
    response.has_detailed_diff = true;
    for (path, property_diff) in diff.detailed_diff {
        if property_diff.kind.is_replace() {
            response.replaces.push(path.clone());
        }
        response.diffs.push(path.clone());
        response.detailed_diff.insert(
            path,
            crate::generated::PropertyDiff {
                kind: property_diff.kind.wire_kind() as i32,
                input_diff: property_diff.input_diff,
            },
        );
    }
    response
}

fn wire_changes(changes: DiffChanges) -> WireDiffChanges {
    match changes {
        DiffChanges::Unknown => WireDiffChanges::DiffUnknown,
        DiffChanges::None => WireDiffChanges::DiffNone,
        DiffChanges::Some => WireDiffChanges::DiffSome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coarse_diff_passes_through() {
        let diff = DiffResult::some(["name", "size"]).with_replace_keys(["size"]);

        let wire = translate_diff(diff);
        assert_eq!(wire.changes, WireDiffChanges::DiffSome as i32);
        assert_eq!(wire.diffs, vec!["name", "size"]);
        assert_eq!(wire.replaces, vec!["size"]);
        assert!(!wire.has_detailed_diff);
        assert!(wire.detailed_diff.is_empty());
    }

    #[test]
    fn test_coarse_change_signals() {
        assert_eq!(
            translate_diff(DiffResult::none()).changes,
            WireDiffChanges::DiffNone as i32
        );
        assert_eq!(
            translate_diff(DiffResult::unknown()).changes,
            WireDiffChanges::DiffUnknown as i32
        );
    }

    #[test]
    fn test_detailed_diff_forces_some() {
        for changes in [DiffChanges::None, DiffChanges::Unknown, DiffChanges::Some] {
            let diff = DiffResult {
                changes,
                ..Default::default()
            }
            .with_detailed_diff("tags.env", PropertyDiff::new(DiffKind::Add));

            let wire = translate_diff(diff);
            assert_eq!(wire.changes, WireDiffChanges::DiffSome as i32);
            assert!(wire.has_detailed_diff);
            assert!(wire.replaces.is_empty());
        }
    }

    #[test]
    fn test_update_replace_narrows_and_replaces() {
        let diff = DiffResult::none().with_detailed_diff("p", PropertyDiff::new(DiffKind::UpdateReplace));

        let wire = translate_diff(diff);
        assert_eq!(wire.diffs, vec!["p"]);
        assert_eq!(wire.replaces, vec!["p"]);
        assert_eq!(
            wire.detailed_diff["p"].kind,
            WireDiffKind::Update as i32
        );
    }

    #[test]
    fn test_replace_keys_derived_only_from_detail() {
        let diff = DiffResult::some(["ignored"])
            .with_replace_keys(["ignored"])
            .with_detailed_diff("a", PropertyDiff::new(DiffKind::AddReplace))
            .with_detailed_diff("b", PropertyDiff::new(DiffKind::Delete))
            .with_detailed_diff("c", PropertyDiff::input(DiffKind::DeleteReplace))
            .with_detailed_diff("d", PropertyDiff::new(DiffKind::Update))
            .with_delete_before_replace();

        let wire = translate_diff(diff);
        assert_eq!(wire.diffs, vec!["a", "b", "c", "d"]);
        assert_eq!(wire.replaces, vec!["a", "c"]);
        assert!(wire.delete_before_replace);

        assert_eq!(wire.detailed_diff["a"].kind, WireDiffKind::Add as i32);
        assert_eq!(wire.detailed_diff["b"].kind, WireDiffKind::Delete as i32);
        assert_eq!(wire.detailed_diff["c"].kind, WireDiffKind::Delete as i32);
        assert!(wire.detailed_diff["c"].input_diff);
        assert_eq!(wire.detailed_diff["d"].kind, WireDiffKind::Update as i32);
    }

    #[test]
    fn test_requires_replace() {
        assert!(!DiffResult::some(["a"]).requires_replace());
        assert!(DiffResult::some(["a"]).with_replace_keys(["a"]).requires_replace());
        assert!(DiffResult::none()
            .with_detailed_diff("a", PropertyDiff::new(DiffKind::UpdateReplace))
            .requires_replace());
    }
}
