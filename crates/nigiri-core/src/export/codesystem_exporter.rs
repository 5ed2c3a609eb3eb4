//! CodeSystem exporter
//!
//! Builds FHIR CodeSystem resources from FSH code system definitions:
//! nested concepts, the maintained concept count, and caret rules applied
//! as property assignments.

use crate::diagnostics::codes;
use crate::export::assignment::{assign_checked, fsh_value_to_json};
use crate::export::build::ExportSession;
use crate::export::fhir_types::{CodeSystemConcept, CodeSystemResource};
use crate::semantic::fishing::{FhirType, Fishable};
use crate::tank::{CodeSystemDefinition, ConceptDefinition, Rule};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Properties assignable on a CodeSystem through caret paths
const CODE_SYSTEM_PROPERTIES: &[&str] = &[
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
    "purpose",
    "copyright",
    "caseSensitive",
    "valueSet",
    "hierarchyMeaning",
    "compositional",
    "versionNeeded",
    "content",
    "supplements",
    "count",
    "property",
];

/// Exports FSH code system definitions to CodeSystem resources
pub struct CodeSystemExporter<'a> {
    session: &'a ExportSession,
}

impl<'a> CodeSystemExporter<'a> {
    pub fn new(session: &'a ExportSession) -> Self {
        Self { session }
    }

    pub fn export(&self, def: &CodeSystemDefinition) -> Rc<RefCell<CodeSystemResource>> {
        // Idempotence per name.
        let existing = {
            let package = self.session.package().borrow();
            package.fish(&def.name, &[FhirType::CodeSystem])
        };
        if let Some(crate::semantic::fishing::FishedArtifact::CodeSystem(code_system)) = existing {
            return code_system;
        }

        debug!("Exporting code system {}", def.name);
        let config = self.session.config();

        let mut code_system =
            CodeSystemResource::new(config.code_system_url(&def.id), def.name.clone());
        code_system.id = Some(def.id.clone());
        code_system.version = config.version.clone();
        code_system.title = def.title.clone();
        code_system.description = def.description.clone();

        for concept in &def.concepts {
            code_system.add_concept(convert_concept(concept));
        }
        code_system.update_count();

        let handle = Rc::new(RefCell::new(code_system));
        self.session.package().borrow_mut().add_code_system(Rc::clone(&handle));

        for rule in &def.rules {
            self.apply_rule(def, &handle, rule);
        }
        handle.borrow_mut().update_count();

        handle
    }

    fn apply_rule(
        &self,
        def: &CodeSystemDefinition,
        handle: &Rc<RefCell<CodeSystemResource>>,
        rule: &Rule,
    ) {
        let Rule::CaretValue(caret) = rule else {
            self.session.warn(
                codes::RULE_NOT_APPLICABLE,
                format!("Rule on '{}' does not apply to code system {}", rule.path(), def.name),
                rule.location().clone(),
            );
            return;
        };
        if !caret.path.is_empty() {
            self.session.warn(
                codes::RULE_NOT_APPLICABLE,
                format!("Concept-path caret rules are not applied to code system {}", def.name),
                caret.location.clone(),
            );
            return;
        }

        let value = fsh_value_to_json(&caret.value);
        let mut code_system = handle.borrow_mut();
        if let Err(e) = assign_checked(
            &mut *code_system,
            &caret.caret_path,
            value,
            CODE_SYSTEM_PROPERTIES,
            "CodeSystem",
        ) {
            drop(code_system);
            self.session.error(
                codes::INVALID_PROPERTY_PATH,
                format!("Cannot assign ^{} on {}: {}", caret.caret_path, def.name, e),
                caret.location.clone(),
            );
        }
    }
}

fn convert_concept(concept: &ConceptDefinition) -> CodeSystemConcept {
    let mut converted = CodeSystemConcept::new(concept.code.clone());
    converted.display = concept.display.clone();
    converted.definition = concept.definition.clone();
    if !concept.children.is_empty() {
        converted.concept = Some(concept.children.iter().map(convert_concept).collect());
    }
    converted
}
