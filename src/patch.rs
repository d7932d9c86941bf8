//! JSON Patch redaction of observed bodies.
//!
//! A [`BodyPatch`] edits the *decoded copy* of a body that taps get to see.
//! The bytes exchanged with the client and the upstream are never touched.

use json_patch::{Patch, PatchError};
use serde_json::Value;

/// A decoded RFC 6902 patch document.
#[derive(Clone, Debug)]
pub struct BodyPatch(Patch);

impl BodyPatch {
    /// Decodes a patch document such as
    /// `[{"op":"remove","path":"/password"}]`.
    pub fn from_slice(doc: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(doc).map(Self)
    }

    pub fn from_value(doc: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc).map(Self)
    }

    /// Applies every operation in order. On failure `target` is left as it
    /// was before the call.
    pub fn apply(&self, target: &mut Value) -> Result<(), PatchError> {
        json_patch::patch(target, &self.0.0)
    }

    pub fn len(&self) -> usize {
        self.0.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.0.is_empty()
    }
}
