//! Fishing: uniform artifact resolution by id, name, or canonical URL
//!
//! "Fishing" is the cross-source lookup protocol every component speaks: the
//! output package (already-compiled artifacts), the base definition store
//! (the loaded FHIR core library), and the composed export-session dispatcher
//! all implement [`Fishable`]. The dispatcher tries its backends in a fixed
//! priority order and compiles source definitions on demand when a lookup
//! lands in the tank, which is what lets rules reference types defined later
//! in the source collection or referencing each other circularly.

use crate::export::fhir_types::{
    CodeSystemResource, ExportedInstance, StructureDefinition, StructureDefinitionKind,
    ValueSetResource,
};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;

/// Artifact kind filter for fishing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FhirType {
    /// StructureDefinition with derivation=constraint (not an extension)
    Profile,
    /// StructureDefinition constraining or specializing Extension
    Extension,
    /// StructureDefinition with kind=logical
    Logical,
    /// StructureDefinition with kind=resource (not a constraint)
    Resource,
    /// Base complex or primitive type
    Type,
    ValueSet,
    CodeSystem,
    /// A resource instance, not a definition
    Instance,
}

/// The fixed order searched when a lookup passes no kind filter
pub const DEFAULT_FISHING_ORDER: &[FhirType] = &[
    FhirType::Profile,
    FhirType::Extension,
    FhirType::Logical,
    FhirType::Resource,
    FhirType::Type,
    FhirType::ValueSet,
    FhirType::CodeSystem,
    FhirType::Instance,
];

impl FhirType {
    /// Whether artifacts of this kind can originate from a source definition
    /// in the tank, making on-demand compilation applicable. Instances are
    /// excluded: references to not-yet-compiled instances go through the
    /// deferred-rule queue instead.
    pub fn is_definitional(&self) -> bool {
        matches!(
            self,
            FhirType::Profile
                | FhirType::Extension
                | FhirType::Logical
                | FhirType::Resource
                | FhirType::ValueSet
                | FhirType::CodeSystem
        )
    }

    /// Check whether a resource with the given metadata matches this filter
    pub fn matches(&self, metadata: &FishableMetadata) -> bool {
        let is_sd = metadata.resource_type == "StructureDefinition";
        let is_extension = metadata.type_field.as_deref() == Some("Extension");
        match self {
            FhirType::Profile => {
                is_sd && metadata.derivation.as_deref() == Some("constraint") && !is_extension
            }
            FhirType::Extension => is_sd && is_extension,
            FhirType::Logical => is_sd && metadata.kind == Some(StructureDefinitionKind::Logical),
            FhirType::Resource => {
                is_sd
                    && metadata.kind == Some(StructureDefinitionKind::Resource)
                    && metadata.derivation.as_deref() != Some("constraint")
            }
            FhirType::Type => {
                is_sd
                    && matches!(
                        metadata.kind,
                        Some(StructureDefinitionKind::ComplexType)
                            | Some(StructureDefinitionKind::PrimitiveType)
                    )
                    && metadata.derivation.as_deref() != Some("constraint")
                    && !is_extension
            }
            FhirType::ValueSet => metadata.resource_type == "ValueSet",
            FhirType::CodeSystem => metadata.resource_type == "CodeSystem",
            FhirType::Instance => !matches!(
                metadata.resource_type.as_str(),
                "StructureDefinition" | "ValueSet" | "CodeSystem"
            ),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FhirType::Profile => "Profile",
            FhirType::Extension => "Extension",
            FhirType::Logical => "Logical",
            FhirType::Resource => "Resource",
            FhirType::Type => "Type",
            FhirType::ValueSet => "ValueSet",
            FhirType::CodeSystem => "CodeSystem",
            FhirType::Instance => "Instance",
        }
    }
}

/// Lightweight summary of a fished artifact
#[derive(Debug, Clone)]
pub struct FishableMetadata {
    /// FHIR resourceType ("StructureDefinition", "ValueSet", ...)
    pub resource_type: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub version: Option<String>,
    /// StructureDefinition.kind
    pub kind: Option<StructureDefinitionKind>,
    /// StructureDefinition.derivation
    pub derivation: Option<String>,
    /// StructureDefinition.type
    pub type_field: Option<String>,
    /// StructureDefinition.baseDefinition: the parent's canonical URL
    pub base_definition: Option<String>,
}

impl FishableMetadata {
    pub fn from_structure(sd: &StructureDefinition) -> Self {
        Self {
            resource_type: sd.resource_type.clone(),
            id: sd.id.clone(),
            name: Some(sd.name.clone()),
            url: Some(sd.url.clone()),
            version: sd.version.clone(),
            kind: Some(sd.kind),
            derivation: sd.derivation.clone(),
            type_field: Some(sd.type_field.clone()),
            base_definition: sd.base_definition.clone(),
        }
    }

    /// Extract from raw StructureDefinition/ValueSet/CodeSystem JSON
    pub fn from_json(resource: &JsonValue) -> Option<Self> {
        let get = |key: &str| resource.get(key).and_then(|v| v.as_str()).map(String::from);
        let resource_type = get("resourceType")?;
        let kind = resource
            .get("kind")
            .cloned()
            .and_then(|k| serde_json::from_value(k).ok());
        Some(Self {
            resource_type,
            id: get("id"),
            name: get("name"),
            url: get("url"),
            version: get("version"),
            kind,
            derivation: get("derivation"),
            type_field: get("type"),
            base_definition: get("baseDefinition"),
        })
    }

    /// Whether this metadata matches any of the given filters (empty = all)
    pub fn matches_types(&self, types: &[FhirType]) -> bool {
        if types.is_empty() {
            return true;
        }
        types.iter().any(|t| t.matches(self))
    }
}

/// A successfully fished artifact.
///
/// Structure/value-set/code-system handles returned from the package alias
/// the package's own arena slot, so an under-construction artifact completed
/// later is visible to earlier readers.
#[derive(Debug, Clone)]
pub enum FishedArtifact {
    Structure(Rc<RefCell<StructureDefinition>>),
    ValueSet(Rc<RefCell<ValueSetResource>>),
    CodeSystem(Rc<RefCell<CodeSystemResource>>),
    Instance(Rc<RefCell<ExportedInstance>>),
}

impl FishedArtifact {
    pub fn metadata(&self) -> FishableMetadata {
        match self {
            FishedArtifact::Structure(sd) => FishableMetadata::from_structure(&sd.borrow()),
            FishedArtifact::ValueSet(vs) => {
                let vs = vs.borrow();
                FishableMetadata {
                    resource_type: vs.resource_type.clone(),
                    id: vs.id.clone(),
                    name: Some(vs.name.clone()),
                    url: Some(vs.url.clone()),
                    version: vs.version.clone(),
                    kind: None,
                    derivation: None,
                    type_field: None,
                    base_definition: None,
                }
            }
            FishedArtifact::CodeSystem(cs) => {
                let cs = cs.borrow();
                FishableMetadata {
                    resource_type: cs.resource_type.clone(),
                    id: cs.id.clone(),
                    name: Some(cs.name.clone()),
                    url: Some(cs.url.clone()),
                    version: cs.version.clone(),
                    kind: None,
                    derivation: None,
                    type_field: None,
                    base_definition: None,
                }
            }
            FishedArtifact::Instance(instance) => {
                let instance = instance.borrow();
                FishableMetadata {
                    resource_type: instance.resource_type().unwrap_or("Unknown").to_string(),
                    id: instance.id().map(String::from),
                    name: Some(instance.name.clone()),
                    url: None,
                    version: None,
                    kind: None,
                    derivation: None,
                    type_field: None,
                    base_definition: None,
                }
            }
        }
    }

    /// The structure handle, when this artifact is a StructureDefinition
    pub fn as_structure(&self) -> Option<Rc<RefCell<StructureDefinition>>> {
        match self {
            FishedArtifact::Structure(sd) => Some(Rc::clone(sd)),
            _ => None,
        }
    }

    /// Serialize the artifact to JSON
    pub fn to_json(&self) -> JsonValue {
        match self {
            FishedArtifact::Structure(sd) => {
                serde_json::to_value(&*sd.borrow()).unwrap_or(JsonValue::Null)
            }
            FishedArtifact::ValueSet(vs) => {
                serde_json::to_value(&*vs.borrow()).unwrap_or(JsonValue::Null)
            }
            FishedArtifact::CodeSystem(cs) => {
                serde_json::to_value(&*cs.borrow()).unwrap_or(JsonValue::Null)
            }
            FishedArtifact::Instance(instance) => instance.borrow().resource.clone(),
        }
    }
}

/// Uniform lookup capability implemented by every resolution backend
pub trait Fishable {
    /// Fish for an artifact by id, name, or canonical URL, optionally
    /// `|version`-suffixed (exact version match required). An empty kind
    /// filter searches all kinds in [`DEFAULT_FISHING_ORDER`].
    fn fish(&self, item: &str, types: &[FhirType]) -> Option<FishedArtifact>;

    /// Fish for a lightweight summary only
    fn fish_metadata(&self, item: &str, types: &[FhirType]) -> Option<FishableMetadata> {
        self.fish(item, types).map(|artifact| artifact.metadata())
    }
}

/// Split an identity into its base form and optional `|version` suffix
pub fn parse_identity(item: &str) -> (&str, Option<&str>) {
    match item.split_once('|') {
        Some((base, version)) if !version.is_empty() => (base, Some(version)),
        _ => (item, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sd_metadata(kind: StructureDefinitionKind, derivation: &str, type_field: &str) -> FishableMetadata {
        FishableMetadata {
            resource_type: "StructureDefinition".to_string(),
            id: Some("x".to_string()),
            name: Some("X".to_string()),
            url: Some("http://example.org/StructureDefinition/x".to_string()),
            version: None,
            kind: Some(kind),
            derivation: Some(derivation.to_string()),
            type_field: Some(type_field.to_string()),
            base_definition: None,
        }
    }

    #[test]
    fn test_profile_matching() {
        let profile = sd_metadata(StructureDefinitionKind::Resource, "constraint", "Patient");
        assert!(FhirType::Profile.matches(&profile));
        assert!(!FhirType::Resource.matches(&profile));
        assert!(!FhirType::Extension.matches(&profile));
    }

    #[test]
    fn test_extension_matching() {
        let extension = sd_metadata(StructureDefinitionKind::ComplexType, "constraint", "Extension");
        assert!(FhirType::Extension.matches(&extension));
        assert!(!FhirType::Profile.matches(&extension));
        assert!(!FhirType::Type.matches(&extension));
    }

    #[test]
    fn test_base_resource_matching() {
        let resource = sd_metadata(StructureDefinitionKind::Resource, "specialization", "Patient");
        assert!(FhirType::Resource.matches(&resource));
        assert!(!FhirType::Profile.matches(&resource));
    }

    #[test]
    fn test_type_matching() {
        let quantity = sd_metadata(StructureDefinitionKind::ComplexType, "specialization", "Quantity");
        assert!(FhirType::Type.matches(&quantity));
        assert!(!FhirType::Resource.matches(&quantity));
    }

    #[test]
    fn test_vocabulary_matching() {
        let vs = FishableMetadata {
            resource_type: "ValueSet".to_string(),
            id: None,
            name: None,
            url: None,
            version: None,
            kind: None,
            derivation: None,
            type_field: None,
            base_definition: None,
        };
        assert!(FhirType::ValueSet.matches(&vs));
        assert!(!FhirType::CodeSystem.matches(&vs));
        assert!(vs.matches_types(&[]));
        assert!(vs.matches_types(&[FhirType::CodeSystem, FhirType::ValueSet]));
    }

    #[test]
    fn test_instance_matching() {
        let patient = FishableMetadata {
            resource_type: "Patient".to_string(),
            id: Some("example".to_string()),
            name: None,
            url: None,
            version: None,
            kind: None,
            derivation: None,
            type_field: None,
            base_definition: None,
        };
        assert!(FhirType::Instance.matches(&patient));
        assert!(!FhirType::Profile.matches(&patient));
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(parse_identity("Patient"), ("Patient", None));
        assert_eq!(parse_identity("Patient|4.0.1"), ("Patient", Some("4.0.1")));
        assert_eq!(parse_identity("Patient|"), ("Patient|", None));
    }

    #[test]
    fn test_instance_is_not_definitional() {
        assert!(!FhirType::Instance.is_definitional());
        assert!(FhirType::Profile.is_definitional());
        assert!(FhirType::ValueSet.is_definitional());
        assert!(!FhirType::Type.is_definitional());
    }
}
