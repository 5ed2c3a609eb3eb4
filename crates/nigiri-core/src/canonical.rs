//! In-memory base FHIR definition library
//!
//! The read-only store of loaded base FHIR definitions (core resources,
//! data types, extensions, terminology). How the JSON gets here: package
//! download, disk cache: is the embedder's concern; the engine only sees
//! the [`Fishable`] lookup surface.

use crate::export::fhir_types::{CodeSystemResource, StructureDefinition, ValueSetResource};
use crate::semantic::fishing::{
    parse_identity, FhirType, Fishable, FishableMetadata, FishedArtifact, DEFAULT_FISHING_ORDER,
};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};

/// Resource names surfaced for forward compatibility but not part of the
/// supported FHIR release. They are treated as "not found" so a definition
/// cannot accidentally parent itself on a future-version resource.
const FUTURE_RESOURCES: &[&str] = &[
    "ActorDefinition",
    "Requirements",
    "SubscriptionTopic",
    "TestPlan",
];

/// Errors loading definitions into the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Resource is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported resource type: {0}")]
    UnsupportedResourceType(String),
}

/// Read-only store of base FHIR definitions, indexed by canonical URL with
/// id and name lookups on the side.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    by_url: IndexMap<String, JsonValue>,
    id_index: IndexMap<String, String>,
    name_index: IndexMap<String, String>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a definition (StructureDefinition, ValueSet, or CodeSystem JSON)
    pub fn load(&mut self, resource: JsonValue) -> Result<(), StoreError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .ok_or(StoreError::MissingField("resourceType"))?;
        if !matches!(resource_type, "StructureDefinition" | "ValueSet" | "CodeSystem") {
            return Err(StoreError::UnsupportedResourceType(resource_type.to_string()));
        }
        let url = resource
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or(StoreError::MissingField("url"))?
            .to_string();

        if let Some(id) = resource.get("id").and_then(|v| v.as_str()) {
            self.id_index.insert(id.to_string(), url.clone());
        }
        if let Some(name) = resource.get("name").and_then(|v| v.as_str()) {
            self.name_index.insert(name.to_string(), url.clone());
        }
        trace!("Loaded base definition {}", url);
        self.by_url.insert(url, resource);
        Ok(())
    }

    /// Number of loaded definitions
    pub fn len(&self) -> usize {
        self.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }

    fn lookup(&self, identifier: &str) -> Option<&JsonValue> {
        if let Some(resource) = self.by_url.get(identifier) {
            return Some(resource);
        }
        if let Some(url) = self.id_index.get(identifier) {
            return self.by_url.get(url);
        }
        if let Some(url) = self.name_index.get(identifier) {
            return self.by_url.get(url);
        }
        None
    }

    fn is_future_resource(&self, identifier: &str) -> bool {
        FUTURE_RESOURCES.contains(&identifier)
            || FUTURE_RESOURCES.iter().any(|name| {
                identifier
                    .rsplit('/')
                    .next()
                    .is_some_and(|last| last == *name)
            })
    }
}

impl Fishable for DefinitionStore {
    fn fish(&self, item: &str, types: &[FhirType]) -> Option<FishedArtifact> {
        let (identifier, version) = parse_identity(item);

        if self.is_future_resource(identifier) {
            debug!("'{}' is a future-version resource; treating as not found", identifier);
            return None;
        }

        let resource = self.lookup(identifier)?;
        let metadata = FishableMetadata::from_json(resource)?;

        if let Some(required) = version
            && metadata.version.as_deref() != Some(required)
        {
            return None;
        }

        let effective = if types.is_empty() { DEFAULT_FISHING_ORDER } else { types };
        if !effective.iter().any(|t| t.matches(&metadata)) {
            return None;
        }

        match metadata.resource_type.as_str() {
            "StructureDefinition" => {
                let sd: StructureDefinition = serde_json::from_value(resource.clone()).ok()?;
                Some(FishedArtifact::Structure(Rc::new(RefCell::new(sd))))
            }
            "ValueSet" => {
                let vs: ValueSetResource = serde_json::from_value(resource.clone()).ok()?;
                Some(FishedArtifact::ValueSet(Rc::new(RefCell::new(vs))))
            }
            "CodeSystem" => {
                let cs: CodeSystemResource = serde_json::from_value(resource.clone()).ok()?;
                Some(FishedArtifact::CodeSystem(Rc::new(RefCell::new(cs))))
            }
            _ => None,
        }
    }

    fn fish_metadata(&self, item: &str, types: &[FhirType]) -> Option<FishableMetadata> {
        let (identifier, version) = parse_identity(item);
        if self.is_future_resource(identifier) {
            return None;
        }
        let metadata = FishableMetadata::from_json(self.lookup(identifier)?)?;
        if let Some(required) = version
            && metadata.version.as_deref() != Some(required)
        {
            return None;
        }
        metadata.matches_types(types).then_some(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_patient() -> DefinitionStore {
        let mut store = DefinitionStore::new();
        store
            .load(json!({
                "resourceType": "StructureDefinition",
                "id": "Patient",
                "url": "http://hl7.org/fhir/StructureDefinition/Patient",
                "version": "4.0.1",
                "name": "Patient",
                "kind": "resource",
                "abstract": false,
                "type": "Patient",
                "derivation": "specialization"
            }))
            .unwrap();
        store
    }

    #[test]
    fn test_fish_by_url_id_and_name() {
        let store = store_with_patient();
        for identity in [
            "Patient",
            "http://hl7.org/fhir/StructureDefinition/Patient",
        ] {
            let artifact = store.fish(identity, &[FhirType::Resource]);
            assert!(artifact.is_some(), "expected hit for {identity}");
        }
    }

    #[test]
    fn test_fish_version_suffix() {
        let store = store_with_patient();
        assert!(store.fish("Patient|4.0.1", &[]).is_some());
        assert!(store.fish("Patient|5.0.0", &[]).is_none());
    }

    #[test]
    fn test_fish_kind_filter() {
        let store = store_with_patient();
        assert!(store.fish("Patient", &[FhirType::ValueSet]).is_none());
        assert!(store.fish("Patient", &[]).is_some());
    }

    #[test]
    fn test_future_resources_not_found() {
        let mut store = DefinitionStore::new();
        store
            .load(json!({
                "resourceType": "StructureDefinition",
                "id": "Requirements",
                "url": "http://hl7.org/fhir/StructureDefinition/Requirements",
                "name": "Requirements",
                "kind": "resource",
                "type": "Requirements",
                "derivation": "specialization"
            }))
            .unwrap();

        assert!(store.fish("Requirements", &[]).is_none());
        assert!(store
            .fish("http://hl7.org/fhir/StructureDefinition/Requirements", &[])
            .is_none());
    }

    #[test]
    fn test_load_rejects_non_definition() {
        let mut store = DefinitionStore::new();
        let err = store
            .load(json!({"resourceType": "Patient", "id": "example"}))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedResourceType(_)));
    }
}
