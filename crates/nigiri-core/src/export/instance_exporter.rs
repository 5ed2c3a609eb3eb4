//! Instance exporter
//!
//! Assembles a FHIR resource instance from an FSH instance definition by
//! resolving what it is an instance of (a profile contributes its base
//! resource type and a meta.profile entry) and applying assignment rules as
//! JSON property assignments.

use crate::diagnostics::codes;
use crate::export::assignment::{fsh_value_to_json, set_json_property};
use crate::export::build::{DeferredRule, DeferredTarget, ExportSession};
use crate::export::fhir_types::{ExportedInstance, StructureDefinitionKind};
use crate::export::structure_exporter::ExportError;
use crate::semantic::fishing::{FhirType, Fishable};
use crate::tank::{FshValue, InstanceDefinition, Rule};
use serde_json::{json, Value as JsonValue};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Exports FSH instance definitions to resource JSON
pub struct InstanceExporter<'a> {
    session: &'a ExportSession,
}

impl<'a> InstanceExporter<'a> {
    pub fn new(session: &'a ExportSession) -> Self {
        Self { session }
    }

    pub fn export(
        &self,
        def: &InstanceDefinition,
    ) -> Result<Rc<RefCell<ExportedInstance>>, ExportError> {
        // Idempotence per name.
        let existing = {
            let package = self.session.package().borrow();
            package.fish(&def.name, &[FhirType::Instance])
        };
        if let Some(crate::semantic::fishing::FishedArtifact::Instance(instance)) = existing {
            return Ok(instance);
        }

        debug!("Exporting instance {}", def.name);

        let meta = self
            .session
            .fish_metadata(
                &def.instance_of,
                &[
                    FhirType::Profile,
                    FhirType::Resource,
                    FhirType::Logical,
                    FhirType::Extension,
                    FhirType::Type,
                ],
            )
            .ok_or_else(|| ExportError::InstanceOfNotDefined {
                definition: def.name.clone(),
                instance_of: def.instance_of.clone(),
            })?;

        let mut resource = json!({});
        let is_resource_shaped = matches!(
            meta.kind,
            Some(StructureDefinitionKind::Resource) | Some(StructureDefinitionKind::Logical)
        );
        if is_resource_shaped {
            let resource_type = meta
                .type_field
                .clone()
                .or_else(|| meta.name.clone())
                .unwrap_or_else(|| def.instance_of.clone());
            resource["resourceType"] = json!(resource_type);
            resource["id"] = json!(def.id);
            // A profile stamps its canonical into meta.profile.
            if meta.derivation.as_deref() == Some("constraint")
                && let Some(url) = &meta.url
            {
                resource["meta"] = json!({ "profile": [url] });
            }
        }

        let handle = Rc::new(RefCell::new(ExportedInstance {
            name: def.name.clone(),
            instance_of: def.instance_of.clone(),
            usage: def.usage.clone(),
            resource,
        }));
        self.session.package().borrow_mut().add_instance(Rc::clone(&handle));

        for rule in &def.rules {
            self.apply_rule(def, &handle, rule);
        }

        Ok(handle)
    }

    fn apply_rule(
        &self,
        def: &InstanceDefinition,
        handle: &Rc<RefCell<ExportedInstance>>,
        rule: &Rule,
    ) {
        let (path, value, location) = match rule {
            Rule::Assignment(r) => (&r.path, &r.value, &r.location),
            // Instance caret rules address metadata the same way.
            Rule::CaretValue(r) if r.path.is_empty() => (&r.caret_path, &r.value, &r.location),
            other => {
                self.session.warn(
                    codes::RULE_NOT_APPLICABLE,
                    format!(
                        "Rule on '{}' does not apply to instance {}",
                        other.path(),
                        def.name
                    ),
                    other.location().clone(),
                );
                return;
            }
        };

        // Resolve values that point at other instances before assigning.
        let json_value: JsonValue = match value {
            FshValue::Reference(target) => {
                let fished = self.session.fish(target, &[FhirType::Instance]);
                match fished {
                    Some(artifact) => reference_to(&artifact),
                    None => {
                        // The referenced instance may appear later in the
                        // source collection; retry after the first pass.
                        self.session.defer(DeferredRule {
                            target: DeferredTarget::Instance(Rc::clone(handle)),
                            definition: def.name.clone(),
                            path: path.clone(),
                            caret_path: None,
                            exactly: false,
                            instance: target.clone(),
                            as_reference: true,
                            suppressed: None,
                            location: location.clone(),
                        });
                        return;
                    }
                }
            }
            FshValue::InstanceRef(name) => {
                let fished = self.session.fish(name, &[FhirType::Instance]);
                match fished {
                    Some(artifact) => artifact.to_json(),
                    None => {
                        self.session.defer(DeferredRule {
                            target: DeferredTarget::Instance(Rc::clone(handle)),
                            definition: def.name.clone(),
                            path: path.clone(),
                            caret_path: None,
                            exactly: false,
                            instance: name.clone(),
                            as_reference: false,
                            suppressed: None,
                            location: location.clone(),
                        });
                        return;
                    }
                }
            }
            other => fsh_value_to_json(other),
        };

        let mut instance = handle.borrow_mut();
        if let Err(e) = set_json_property(&mut instance.resource, path, json_value) {
            drop(instance);
            self.session.error(
                codes::INVALID_PROPERTY_PATH,
                format!("Cannot assign {} on instance {}: {}", path, def.name, e),
                location.clone(),
            );
        }
    }
}

/// Relative reference JSON for a fished artifact
pub(crate) fn reference_to(artifact: &crate::semantic::fishing::FishedArtifact) -> JsonValue {
    let meta = artifact.metadata();
    match meta.id {
        Some(id) => json!({ "reference": format!("{}/{}", meta.resource_type, id) }),
        None => json!({ "reference": meta.resource_type }),
    }
}
