use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;

use crate::error::Error;

/// Diffs the mutated pod against the pod as it arrived.
///
/// The original is round-tripped through [`Pod`] first so that both sides are
/// serialized the same way. Fields the model does not know are dropped on
/// both sides and therefore never show up as removals. Returns `None` when
/// nothing changed.
pub fn build_patch(original: &Value, mutated: &Pod) -> Result<Option<Patch>, Error> {
    let normalized: Pod = serde_json::from_value(original.clone()).map_err(Error::Decode)?;
    let before = serde_json::to_value(&normalized).map_err(Error::Encode)?;
    let after = serde_json::to_value(mutated).map_err(Error::Encode)?;

    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}
