//! Slice declaration machinery for contains rules
//!
//! Pure element-tree manipulation: the exporter resolves extension types
//! through fishing first, then calls in here to install slicing descriptors
//! and slice nodes. Two shapes are supported:
//!
//! - extension-valued elements get the standard value+url discriminator and
//!   per-slice extension profiles (or inline slices whose `url` child is
//!   fixed to the slice name)
//! - plain repeating elements get empty named slices

use crate::export::fhir_types::{
    ElementDefinition, ElementDefinitionDiscriminator, ElementDefinitionSlicing,
    ElementDefinitionType, StructureDefinition,
};
use crate::semantic::path_resolver::{end_of_subtree, find_by_id, materialize_slice};
use serde_json::json;
use tracing::debug;

/// Result of declaring one slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    Created,
    /// The slice already existed with the same content: harmless
    ReDeclaredIdentical,
    /// The slice already existed with a different extension profile
    ConflictingProfile { existing: String },
}

/// Install the value+url slicing discriminator on an extension-valued
/// element, once. An existing discriminator is left untouched.
pub fn ensure_extension_slicing(element: &mut ElementDefinition) {
    let has_discriminator = element
        .slicing
        .as_ref()
        .is_some_and(|s| s.discriminator.as_ref().is_some_and(|d| !d.is_empty()));
    if has_discriminator {
        return;
    }
    element.slicing = Some(ElementDefinitionSlicing {
        discriminator: Some(vec![ElementDefinitionDiscriminator {
            type_: "value".to_string(),
            path: "url".to_string(),
        }]),
        description: Some("Extensions are always sliced by (at least) url".to_string()),
        ordered: Some(false),
        rules: "open".to_string(),
    });
}

/// Declare a slice on an extension-valued element.
///
/// With a profile URL the slice's Extension type is profiled; without one an
/// inline slice is created whose `url` sub-element is fixed to the slice
/// name.
pub fn declare_extension_slice(
    sd: &mut StructureDefinition,
    base_id: &str,
    name: &str,
    profile_url: Option<&str>,
) -> SliceOutcome {
    let slice_id = format!("{base_id}:{name}");

    if let Some(existing_idx) = find_by_id(sd, &slice_id) {
        let existing_profile = sd.elements()[existing_idx]
            .type_
            .as_ref()
            .and_then(|types| types.first())
            .and_then(|t| t.profile.as_ref())
            .and_then(|p| p.first())
            .cloned();
        return match (existing_profile.as_deref(), profile_url) {
            (Some(existing), Some(declared)) if existing != declared => {
                SliceOutcome::ConflictingProfile {
                    existing: existing.to_string(),
                }
            }
            _ => SliceOutcome::ReDeclaredIdentical,
        };
    }

    if let Some(base_idx) = find_by_id(sd, base_id) {
        ensure_extension_slicing(&mut sd.elements_mut()[base_idx]);
    }

    let slice_idx = materialize_slice(sd, base_id, name);
    {
        let slice = &mut sd.elements_mut()[slice_idx];
        let mut extension_type = ElementDefinitionType::new("Extension");
        if let Some(url) = profile_url {
            extension_type.profile = Some(vec![url.to_string()]);
        }
        slice.type_ = Some(vec![extension_type]);
    }

    if profile_url.is_none() {
        fix_inline_extension_url(sd, &slice_id, name);
    }
    debug!("Declared extension slice {}", slice_id);
    SliceOutcome::Created
}

/// Declare an empty named slice on a plain repeating element.
pub fn declare_plain_slice(sd: &mut StructureDefinition, base_id: &str, name: &str) -> SliceOutcome {
    let slice_id = format!("{base_id}:{name}");
    if find_by_id(sd, &slice_id).is_some() {
        return SliceOutcome::ReDeclaredIdentical;
    }
    materialize_slice(sd, base_id, name);
    debug!("Declared slice {}", slice_id);
    SliceOutcome::Created
}

/// Create the `url` child of an inline extension slice, fixed to the slice
/// name. The child is created directly: base snapshots do not expand the
/// children of extension elements.
fn fix_inline_extension_url(sd: &mut StructureDefinition, slice_id: &str, name: &str) {
    let Some(slice_idx) = find_by_id(sd, slice_id) else {
        return;
    };
    let slice_path = sd.elements()[slice_idx].path.clone();
    let insert_at = end_of_subtree(sd, slice_idx, slice_id);

    let mut url_child = ElementDefinition::new(format!("{slice_path}.url"));
    url_child.id = Some(format!("{slice_id}.url"));
    url_child.min = Some(1);
    url_child.max = Some("1".to_string());
    url_child.type_ = Some(vec![ElementDefinitionType::new("uri")]);
    url_child.extra.insert("fixedUri".to_string(), json!(name));
    sd.elements_mut().insert(insert_at, url_child);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fhir_types::{StructureDefinitionKind, StructureDefinitionSnapshot};

    fn extension_host() -> StructureDefinition {
        let mut sd = StructureDefinition::new(
            "http://example.org/StructureDefinition/host".to_string(),
            "Host".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        let mut root = ElementDefinition::new("Patient");
        root.max = Some("*".to_string());
        let mut extension = ElementDefinition::new("Patient.extension");
        extension.min = Some(0);
        extension.max = Some("*".to_string());
        extension.type_ = Some(vec![ElementDefinitionType::new("Extension")]);
        sd.snapshot = Some(StructureDefinitionSnapshot {
            element: vec![root, extension],
        });
        sd
    }

    #[test]
    fn test_ensure_extension_slicing_installs_once() {
        let mut elem = ElementDefinition::new("Patient.extension");
        ensure_extension_slicing(&mut elem);
        let slicing = elem.slicing.clone().unwrap();
        let discriminator = slicing.discriminator.clone().unwrap();
        assert_eq!(discriminator[0].type_, "value");
        assert_eq!(discriminator[0].path, "url");

        // A second call leaves the descriptor unchanged
        ensure_extension_slicing(&mut elem);
        assert_eq!(elem.slicing.unwrap(), slicing);
    }

    #[test]
    fn test_declare_profiled_extension_slice() {
        let mut sd = extension_host();
        let outcome = declare_extension_slice(
            &mut sd,
            "Patient.extension",
            "race",
            Some("http://example.org/StructureDefinition/race"),
        );
        assert_eq!(outcome, SliceOutcome::Created);

        let slice_idx = find_by_id(&sd, "Patient.extension:race").unwrap();
        let slice = &sd.elements()[slice_idx];
        assert_eq!(slice.slice_name.as_deref(), Some("race"));
        let types = slice.type_.as_ref().unwrap();
        assert_eq!(types[0].code, "Extension");
        assert_eq!(
            types[0].profile.as_ref().unwrap()[0],
            "http://example.org/StructureDefinition/race"
        );

        // Base got the value+url discriminator
        let base = sd.find_element("Patient.extension").unwrap();
        let discriminator = base.slicing.as_ref().unwrap().discriminator.as_ref().unwrap();
        assert_eq!(discriminator[0].path, "url");
    }

    #[test]
    fn test_redeclare_identical_is_harmless() {
        let mut sd = extension_host();
        let url = Some("http://example.org/StructureDefinition/race");
        declare_extension_slice(&mut sd, "Patient.extension", "race", url);
        let outcome = declare_extension_slice(&mut sd, "Patient.extension", "race", url);
        assert_eq!(outcome, SliceOutcome::ReDeclaredIdentical);
    }

    #[test]
    fn test_redeclare_with_conflicting_profile() {
        let mut sd = extension_host();
        declare_extension_slice(
            &mut sd,
            "Patient.extension",
            "race",
            Some("http://example.org/StructureDefinition/race"),
        );
        let outcome = declare_extension_slice(
            &mut sd,
            "Patient.extension",
            "race",
            Some("http://example.org/StructureDefinition/other"),
        );
        assert_eq!(
            outcome,
            SliceOutcome::ConflictingProfile {
                existing: "http://example.org/StructureDefinition/race".to_string()
            }
        );
    }

    #[test]
    fn test_inline_slice_fixes_url_child() {
        let mut sd = extension_host();
        let outcome = declare_extension_slice(&mut sd, "Patient.extension", "birthsex", None);
        assert_eq!(outcome, SliceOutcome::Created);

        let url_idx = find_by_id(&sd, "Patient.extension:birthsex.url").unwrap();
        let url_child = &sd.elements()[url_idx];
        assert_eq!(url_child.path, "Patient.extension.url");
        assert_eq!(url_child.extra.get("fixedUri"), Some(&json!("birthsex")));
        assert_eq!(url_child.min, Some(1));
    }

    #[test]
    fn test_declare_plain_slice() {
        let mut sd = extension_host();
        // Reuse the extension element as a generic repeating target
        let outcome = declare_plain_slice(&mut sd, "Patient.extension", "first");
        assert_eq!(outcome, SliceOutcome::Created);
        assert_eq!(
            declare_plain_slice(&mut sd, "Patient.extension", "first"),
            SliceOutcome::ReDeclaredIdentical
        );
    }
}
