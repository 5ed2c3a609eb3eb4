//! Shared test fixtures: a miniature base FHIR definition library

use crate::canonical::DefinitionStore;
use crate::config::ExportConfiguration;
use serde_json::{json, Value as JsonValue};

pub(crate) fn test_config() -> ExportConfiguration {
    ExportConfiguration {
        canonical: "http://example.org/fhir".to_string(),
        version: Some("0.1.0".to_string()),
        fhir_version: Some("4.0.1".to_string()),
    }
}

fn element(path: &str, min: u32, max: &str, types: &[&str]) -> JsonValue {
    let mut elem = json!({
        "id": path,
        "path": path,
        "min": min,
        "max": max,
        "base": {"path": path, "min": min, "max": max}
    });
    if !types.is_empty() {
        elem["type"] = json!(types.iter().map(|code| json!({"code": code})).collect::<Vec<_>>());
    }
    elem
}

fn structure_definition(
    name: &str,
    kind: &str,
    type_field: &str,
    is_abstract: bool,
    elements: Vec<JsonValue>,
) -> JsonValue {
    json!({
        "resourceType": "StructureDefinition",
        "id": name,
        "url": format!("http://hl7.org/fhir/StructureDefinition/{name}"),
        "version": "4.0.1",
        "name": name,
        "status": "active",
        "kind": kind,
        "abstract": is_abstract,
        "type": type_field,
        "derivation": "specialization",
        "snapshot": {"element": elements}
    })
}

fn patient() -> JsonValue {
    let mut marital_status = element("Patient.maritalStatus", 0, "1", &["CodeableConcept"]);
    marital_status["binding"] = json!({
        "strength": "extensible",
        "valueSet": "http://hl7.org/fhir/ValueSet/marital-status"
    });
    let mut managing_org = element("Patient.managingOrganization", 0, "1", &[]);
    managing_org["type"] = json!([{
        "code": "Reference",
        "targetProfile": ["http://hl7.org/fhir/StructureDefinition/Organization"]
    }]);
    let mut deceased = element("Patient.deceased[x]", 0, "1", &[]);
    deceased["type"] = json!([{"code": "boolean"}, {"code": "dateTime"}]);

    structure_definition(
        "Patient",
        "resource",
        "Patient",
        false,
        vec![
            element("Patient", 0, "*", &[]),
            element("Patient.extension", 0, "*", &["Extension"]),
            element("Patient.identifier", 0, "*", &["Identifier"]),
            element("Patient.identifier.system", 0, "1", &["uri"]),
            element("Patient.identifier.value", 0, "1", &["string"]),
            element("Patient.name", 0, "*", &["HumanName"]),
            element("Patient.gender", 0, "1", &["code"]),
            element("Patient.birthDate", 0, "1", &["date"]),
            deceased,
            marital_status,
            element("Patient.address", 0, "*", &["Address"]),
            element("Patient.address.line", 0, "*", &["string"]),
            managing_org,
        ],
    )
}

fn extension() -> JsonValue {
    let mut value = element("Extension.value[x]", 0, "1", &[]);
    value["type"] = json!([
        {"code": "string"},
        {"code": "boolean"},
        {"code": "integer"},
        {"code": "code"},
        {"code": "CodeableConcept"},
        {"code": "Quantity"},
        {"code": "Reference"}
    ]);
    structure_definition(
        "Extension",
        "complex-type",
        "Extension",
        false,
        vec![
            element("Extension", 0, "*", &[]),
            element("Extension.id", 0, "1", &["string"]),
            element("Extension.extension", 0, "*", &["Extension"]),
            element("Extension.url", 1, "1", &["uri"]),
            value,
        ],
    )
}

/// A miniature base library: enough of R4 for the engine's tests
pub(crate) fn base_store() -> DefinitionStore {
    let mut store = DefinitionStore::new();
    let definitions = vec![
        patient(),
        extension(),
        structure_definition(
            "Base",
            "complex-type",
            "Base",
            true,
            vec![element("Base", 0, "*", &[])],
        ),
        structure_definition(
            "Resource",
            "resource",
            "Resource",
            true,
            vec![
                element("Resource", 0, "*", &[]),
                element("Resource.id", 0, "1", &["id"]),
                element("Resource.meta", 0, "1", &["Meta"]),
            ],
        ),
        structure_definition(
            "DomainResource",
            "resource",
            "DomainResource",
            true,
            vec![
                element("DomainResource", 0, "*", &[]),
                element("DomainResource.id", 0, "1", &["id"]),
                element("DomainResource.text", 0, "1", &["Narrative"]),
                element("DomainResource.extension", 0, "*", &["Extension"]),
                element("DomainResource.modifierExtension", 0, "*", &["Extension"]),
            ],
        ),
        structure_definition(
            "Organization",
            "resource",
            "Organization",
            false,
            vec![
                element("Organization", 0, "*", &[]),
                element("Organization.name", 0, "1", &["string"]),
            ],
        ),
        structure_definition(
            "ContactDetail",
            "complex-type",
            "ContactDetail",
            false,
            vec![
                element("ContactDetail", 0, "*", &[]),
                element("ContactDetail.name", 0, "1", &["string"]),
                element("ContactDetail.telecom", 0, "*", &["ContactPoint"]),
            ],
        ),
    ];
    for definition in definitions {
        store.load(definition).expect("fixture definitions load");
    }
    store
}
