//! Character model description consumed from the model collaborator.
//!
//! The core never assumes a particular shape or joint exists. Everything it
//! writes is checked against the [`ShapeSet`] and joint map discovered when
//! the model was loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The set of expression shape labels a loaded model supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeSet(BTreeSet<String>);

impl ShapeSet {
    /// Create an empty set (no model loaded).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `label` is provided by the model.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    /// Iterate labels in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ShapeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Local transform of a named joint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Joint {
    /// Euler rotation in radians (x, y, z).
    pub rotation: [f32; 3],
    /// Local position (x, y, z).
    pub position: [f32; 3],
}

/// A loaded character: available shapes plus the current joint pose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterModel {
    /// Supported expression shape labels.
    pub shapes: ShapeSet,
    /// Named joints and their current local transforms.
    pub joints: BTreeMap<String, Joint>,
}

impl CharacterModel {
    /// Build a model from shape labels and joints.
    pub fn new(
        shapes: impl IntoIterator<Item = impl Into<String>>,
        joints: impl IntoIterator<Item = (String, Joint)>,
    ) -> Self {
        Self {
            shapes: shapes.into_iter().collect(),
            joints: joints.into_iter().collect(),
        }
    }

    /// Parse a model manifest of the form
    /// `{"shapes": ["aa", ...], "joints": {"chest": {"rotation": [..], "position": [..]}}}`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Protocol`] if the manifest is not valid JSON
    /// of that shape.
    pub fn from_manifest(value: serde_json::Value) -> crate::Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| crate::SyncError::Protocol(format!("invalid model manifest: {e}")))
    }

    /// Look up a joint by name.
    #[must_use]
    pub fn joint(&self, name: &str) -> Option<&Joint> {
        self.joints.get(name)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn shape_set_membership() {
        let shapes: ShapeSet = ["aa", "oh", "happy"].into_iter().collect();
        assert!(shapes.contains("aa"));
        assert!(!shapes.contains("ee"));
        assert_eq!(shapes.len(), 3);
        assert_eq!(shapes.iter().collect::<Vec<_>>(), vec!["aa", "happy", "oh"]);
    }

    #[test]
    fn manifest_parses_shapes_and_joints() {
        let model = CharacterModel::from_manifest(serde_json::json!({
            "shapes": ["aa", "blink"],
            "joints": {"chest": {"position": [0.0, 1.2, 0.0]}}
        }))
        .unwrap();
        assert!(model.shapes.contains("blink"));
        let chest = model.joint("chest").unwrap();
        assert_eq!(chest.position, [0.0, 1.2, 0.0]);
        assert_eq!(chest.rotation, [0.0; 3]);
    }

    #[test]
    fn manifest_missing_fields_defaults_to_empty() {
        let model = CharacterModel::from_manifest(serde_json::json!({})).unwrap();
        assert!(model.shapes.is_empty());
        assert!(model.joints.is_empty());
    }

    #[test]
    fn manifest_wrong_type_is_protocol_error() {
        let err = CharacterModel::from_manifest(serde_json::json!({"shapes": 3})).unwrap_err();
        assert!(matches!(err, crate::SyncError::Protocol(_)));
    }
}
