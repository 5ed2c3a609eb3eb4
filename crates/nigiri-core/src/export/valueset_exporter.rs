//! ValueSet exporter
//!
//! Builds FHIR ValueSet resources from FSH value set definitions: include
//! and exclude components with listed concepts and filters, code system and
//! value set references resolved through fishing, caret rules applied as
//! property assignments.

use crate::diagnostics::codes;
use crate::export::assignment::{assign_checked, fsh_value_to_json};
use crate::export::build::ExportSession;
use crate::export::fhir_types::{
    ValueSetCompose, ValueSetConcept, ValueSetFilter, ValueSetInclude, ValueSetResource,
};
use crate::semantic::fishing::{FhirType, Fishable};
use crate::tank::{Rule, ValueSetComponent, ValueSetDefinition};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Properties assignable on a ValueSet through caret paths
const VALUE_SET_PROPERTIES: &[&str] = &[
    "id",
    "meta",
    "extension",
    "url",
    "identifier",
    "version",
    "name",
    "title",
    "status",
    "experimental",
    "date",
    "publisher",
    "contact",
    "description",
    "useContext",
    "jurisdiction",
    "immutable",
    "purpose",
    "copyright",
    "compose",
];

/// Exports FSH value set definitions to ValueSet resources
pub struct ValueSetExporter<'a> {
    session: &'a ExportSession,
}

impl<'a> ValueSetExporter<'a> {
    pub fn new(session: &'a ExportSession) -> Self {
        Self { session }
    }

    pub fn export(&self, def: &ValueSetDefinition) -> Rc<RefCell<ValueSetResource>> {
        // Idempotence per name.
        let existing = {
            let package = self.session.package().borrow();
            package.fish(&def.name, &[FhirType::ValueSet])
        };
        if let Some(crate::semantic::fishing::FishedArtifact::ValueSet(value_set)) = existing {
            return value_set;
        }

        debug!("Exporting value set {}", def.name);
        let config = self.session.config();

        let mut value_set = ValueSetResource::new(config.value_set_url(&def.id), def.name.clone());
        value_set.id = Some(def.id.clone());
        value_set.version = config.version.clone();
        value_set.title = def.title.clone();
        value_set.description = def.description.clone();

        if !def.components.is_empty() {
            let mut compose = ValueSetCompose::default();
            for component in &def.components {
                let include = self.build_component(component);
                if component.include {
                    compose.add_include(include);
                } else {
                    compose.add_exclude(include);
                }
            }
            value_set.compose = Some(compose);
        }

        let handle = Rc::new(RefCell::new(value_set));
        self.session.package().borrow_mut().add_value_set(Rc::clone(&handle));

        for rule in &def.rules {
            self.apply_rule(def, &handle, rule);
        }

        handle
    }

    fn build_component(&self, component: &ValueSetComponent) -> ValueSetInclude {
        let mut include = ValueSetInclude::default();

        if let Some(system) = &component.system {
            include.system = Some(self.resolve_system(system));
        }
        if !component.value_sets.is_empty() {
            include.value_set = Some(
                component
                    .value_sets
                    .iter()
                    .map(|vs| self.resolve_value_set(vs))
                    .collect(),
            );
        }
        if !component.concepts.is_empty() {
            include.concept = Some(
                component
                    .concepts
                    .iter()
                    .map(|code| ValueSetConcept {
                        code: code.code.clone(),
                        display: code.display.clone(),
                    })
                    .collect(),
            );
        }
        if !component.filters.is_empty() {
            include.filter = Some(
                component
                    .filters
                    .iter()
                    .map(|f| ValueSetFilter {
                        property: f.property.clone(),
                        op: f.op.clone(),
                        value: f.value.clone(),
                    })
                    .collect(),
            );
        }
        include
    }

    /// Resolve a code system reference to its canonical URL; an unknown
    /// reference is kept verbatim (it may live in an external package).
    fn resolve_system(&self, system: &str) -> String {
        self.session
            .fish_metadata(system, &[FhirType::CodeSystem])
            .and_then(|meta| meta.url)
            .unwrap_or_else(|| system.to_string())
    }

    fn resolve_value_set(&self, value_set: &str) -> String {
        self.session
            .fish_metadata(value_set, &[FhirType::ValueSet])
            .and_then(|meta| meta.url)
            .unwrap_or_else(|| value_set.to_string())
    }

    fn apply_rule(&self, def: &ValueSetDefinition, handle: &Rc<RefCell<ValueSetResource>>, rule: &Rule) {
        let Rule::CaretValue(caret) = rule else {
            self.session.warn(
                codes::RULE_NOT_APPLICABLE,
                format!("Rule on '{}' does not apply to value set {}", rule.path(), def.name),
                rule.location().clone(),
            );
            return;
        };
        if !caret.path.is_empty() {
            self.session.warn(
                codes::RULE_NOT_APPLICABLE,
                format!("Concept-path caret rules are not applied to value set {}", def.name),
                caret.location.clone(),
            );
            return;
        }

        let value = fsh_value_to_json(&caret.value);
        let mut value_set = handle.borrow_mut();
        if let Err(e) = assign_checked(
            &mut *value_set,
            &caret.caret_path,
            value,
            VALUE_SET_PROPERTIES,
            "ValueSet",
        ) {
            drop(value_set);
            self.session.error(
                codes::INVALID_PROPERTY_PATH,
                format!("Cannot assign ^{} on {}: {}", caret.caret_path, def.name, e),
                caret.location.clone(),
            );
        }
    }
}
