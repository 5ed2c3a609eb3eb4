//! Output package: the accumulator of compiled artifacts
//!
//! Compiled artifacts are grouped by category and stored as
//! `Rc<RefCell<…>>` arena slots. A lookup returns a handle aliasing the
//! slot, never a copy, so an artifact registered while under construction is
//! observed in its completed form by anyone who kept the handle. The package
//! itself implements [`Fishable`], which is how already-compiled artifacts
//! become visible to later rule resolution.

use crate::export::fhir_types::{
    CodeSystemResource, ExportedInstance, StructureDefinition, ValueSetResource,
};
use crate::semantic::fishing::{
    parse_identity, FhirType, Fishable, FishedArtifact, DEFAULT_FISHING_ORDER,
};
use crate::tank::DefinitionKind;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Accumulator of compiled artifacts, grouped by category
#[derive(Debug, Default)]
pub struct Package {
    profiles: Vec<Rc<RefCell<StructureDefinition>>>,
    extensions: Vec<Rc<RefCell<StructureDefinition>>>,
    logicals: Vec<Rc<RefCell<StructureDefinition>>>,
    resources: Vec<Rc<RefCell<StructureDefinition>>>,
    instances: Vec<Rc<RefCell<ExportedInstance>>>,
    value_sets: Vec<Rc<RefCell<ValueSetResource>>>,
    code_systems: Vec<Rc<RefCell<CodeSystemResource>>>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled (possibly still under construction) structure
    pub fn add_structure(
        &mut self,
        kind: DefinitionKind,
        artifact: Rc<RefCell<StructureDefinition>>,
    ) {
        trace!("Registering {} '{}'", kind.display_name(), artifact.borrow().name);
        self.list_for_mut(kind).push(artifact);
    }

    pub fn add_instance(&mut self, instance: Rc<RefCell<ExportedInstance>>) {
        self.instances.push(instance);
    }

    pub fn add_value_set(&mut self, value_set: Rc<RefCell<ValueSetResource>>) {
        self.value_sets.push(value_set);
    }

    pub fn add_code_system(&mut self, code_system: Rc<RefCell<CodeSystemResource>>) {
        self.code_systems.push(code_system);
    }

    fn list_for_mut(&mut self, kind: DefinitionKind) -> &mut Vec<Rc<RefCell<StructureDefinition>>> {
        match kind {
            DefinitionKind::Profile => &mut self.profiles,
            DefinitionKind::Extension => &mut self.extensions,
            DefinitionKind::Logical => &mut self.logicals,
            DefinitionKind::Resource => &mut self.resources,
        }
    }

    /// Compiled profiles, in registration order
    pub fn profiles(&self) -> &[Rc<RefCell<StructureDefinition>>] {
        &self.profiles
    }

    pub fn extensions(&self) -> &[Rc<RefCell<StructureDefinition>>] {
        &self.extensions
    }

    pub fn logicals(&self) -> &[Rc<RefCell<StructureDefinition>>] {
        &self.logicals
    }

    pub fn resources(&self) -> &[Rc<RefCell<StructureDefinition>>] {
        &self.resources
    }

    pub fn instances(&self) -> &[Rc<RefCell<ExportedInstance>>] {
        &self.instances
    }

    pub fn value_sets(&self) -> &[Rc<RefCell<ValueSetResource>>] {
        &self.value_sets
    }

    pub fn code_systems(&self) -> &[Rc<RefCell<CodeSystemResource>>] {
        &self.code_systems
    }

    /// All structure artifacts across categories
    pub fn all_structures(&self) -> impl Iterator<Item = &Rc<RefCell<StructureDefinition>>> {
        self.profiles
            .iter()
            .chain(&self.extensions)
            .chain(&self.logicals)
            .chain(&self.resources)
    }

    /// Find a structure by id, name, or url: completed or in progress
    pub fn find_structure(&self, identifier: &str) -> Option<Rc<RefCell<StructureDefinition>>> {
        let (identity, version) = parse_identity(identifier);
        self.all_structures()
            .find(|sd| sd.borrow().matches_identity(identity, version))
            .map(Rc::clone)
    }

    /// Whether an artifact other than `artifact` already uses the given id
    /// among the definitional categories.
    pub fn has_conflicting_id(&self, id: &str, artifact: &Rc<RefCell<StructureDefinition>>) -> bool {
        let structure_conflict = self
            .all_structures()
            .any(|sd| !Rc::ptr_eq(sd, artifact) && sd.borrow().id.as_deref() == Some(id));
        let vocabulary_conflict = self
            .value_sets
            .iter()
            .any(|vs| vs.borrow().id.as_deref() == Some(id))
            || self
                .code_systems
                .iter()
                .any(|cs| cs.borrow().id.as_deref() == Some(id));
        structure_conflict || vocabulary_conflict
    }

    pub fn total_artifacts(&self) -> usize {
        self.profiles.len()
            + self.extensions.len()
            + self.logicals.len()
            + self.resources.len()
            + self.instances.len()
            + self.value_sets.len()
            + self.code_systems.len()
    }

    fn fish_structures(
        &self,
        list: &[Rc<RefCell<StructureDefinition>>],
        identity: &str,
        version: Option<&str>,
    ) -> Option<FishedArtifact> {
        list.iter()
            .find(|sd| sd.borrow().matches_identity(identity, version))
            .map(|sd| FishedArtifact::Structure(Rc::clone(sd)))
    }
}

impl Fishable for Package {
    fn fish(&self, item: &str, types: &[FhirType]) -> Option<FishedArtifact> {
        let (identity, version) = parse_identity(item);
        let effective = if types.is_empty() { DEFAULT_FISHING_ORDER } else { types };

        for fhir_type in effective {
            let hit = match fhir_type {
                FhirType::Profile => self.fish_structures(&self.profiles, identity, version),
                FhirType::Extension => self.fish_structures(&self.extensions, identity, version),
                FhirType::Logical => self.fish_structures(&self.logicals, identity, version),
                FhirType::Resource => self.fish_structures(&self.resources, identity, version),
                // Base types never originate from FSH definitions
                FhirType::Type => None,
                FhirType::ValueSet => self
                    .value_sets
                    .iter()
                    .find(|vs| vs.borrow().matches_identity(identity, version))
                    .map(|vs| FishedArtifact::ValueSet(Rc::clone(vs))),
                FhirType::CodeSystem => self
                    .code_systems
                    .iter()
                    .find(|cs| cs.borrow().matches_identity(identity, version))
                    .map(|cs| FishedArtifact::CodeSystem(Rc::clone(cs))),
                FhirType::Instance => self
                    .instances
                    .iter()
                    .find(|instance| instance.borrow().matches_identity(identity))
                    .map(|instance| FishedArtifact::Instance(Rc::clone(instance))),
            };
            if hit.is_some() {
                trace!("Found '{}' in package as {}", item, fhir_type.display_name());
                return hit;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fhir_types::StructureDefinitionKind;

    fn profile(name: &str, id: &str) -> Rc<RefCell<StructureDefinition>> {
        let mut sd = StructureDefinition::new(
            format!("http://example.org/StructureDefinition/{id}"),
            name.to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        sd.id = Some(id.to_string());
        Rc::new(RefCell::new(sd))
    }

    #[test]
    fn test_find_structure_across_categories() {
        let mut package = Package::new();
        package.add_structure(DefinitionKind::Profile, profile("MyPatient", "my-patient"));

        assert!(package.find_structure("MyPatient").is_some());
        assert!(package.find_structure("my-patient").is_some());
        assert!(package
            .find_structure("http://example.org/StructureDefinition/my-patient")
            .is_some());
        assert!(package.find_structure("Other").is_none());
    }

    #[test]
    fn test_lookup_returns_handle_into_arena() {
        let mut package = Package::new();
        let handle = profile("MyPatient", "my-patient");
        package.add_structure(DefinitionKind::Profile, Rc::clone(&handle));

        // Mutations through the original handle are visible to later lookups
        handle.borrow_mut().title = Some("A patient profile".to_string());
        let fished = package.find_structure("MyPatient").unwrap();
        assert_eq!(fished.borrow().title.as_deref(), Some("A patient profile"));
        assert!(Rc::ptr_eq(&fished, &handle));
    }

    #[test]
    fn test_fish_respects_kind_filter() {
        let mut package = Package::new();
        package.add_structure(DefinitionKind::Profile, profile("MyPatient", "my-patient"));

        assert!(package.fish("MyPatient", &[FhirType::Profile]).is_some());
        assert!(package.fish("MyPatient", &[FhirType::Extension]).is_none());
        assert!(package.fish("MyPatient", &[]).is_some());
    }

    #[test]
    fn test_conflicting_id_detection() {
        let mut package = Package::new();
        let first = profile("FirstPatient", "shared-id");
        let second = profile("SecondPatient", "shared-id");
        package.add_structure(DefinitionKind::Profile, Rc::clone(&first));

        assert!(!package.has_conflicting_id("shared-id", &first));
        package.add_structure(DefinitionKind::Profile, Rc::clone(&second));
        assert!(package.has_conflicting_id("shared-id", &second));
    }
}
