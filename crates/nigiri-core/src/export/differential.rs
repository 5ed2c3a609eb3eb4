//! Snapshot/differential bookkeeping
//!
//! After the element tree is derived from the parent (and before any rule is
//! applied), every element captures a copy of its own content. The
//! differential is then exactly the elements whose content has diverged from
//! that copy, plus elements created by rules (slices, added elements), which
//! have no original at all.

use crate::export::fhir_types::{StructureDefinition, StructureDefinitionDifferential};
use tracing::debug;

/// Capture the pre-rule-application state of every snapshot element
pub fn capture_originals(sd: &mut StructureDefinition) {
    for element in sd.elements_mut() {
        element.capture_original();
    }
}

/// Build the differential from the elements modified since their originals
/// were captured.
pub fn generate_differential(sd: &StructureDefinition) -> StructureDefinitionDifferential {
    let element: Vec<_> = sd
        .elements()
        .iter()
        .filter(|e| e.is_modified())
        .map(|e| {
            let mut copy = e.clone();
            copy.original = None;
            copy
        })
        .collect();
    debug!(
        "Differential for {} has {} of {} elements",
        sd.name,
        element.len(),
        sd.elements().len()
    );
    StructureDefinitionDifferential { element }
}
