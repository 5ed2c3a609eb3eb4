//! Property assignment for caret rules and fixed values
//!
//! Caret rules address arbitrary properties by a secondary dotted path
//! rooted at either an element or the artifact itself. Assignment works by
//! serializing the target to JSON, walking (and creating) the path, setting
//! the value, and deserializing back: so a value of the wrong shape for a
//! typed field surfaces as a type mismatch instead of silently corrupting
//! the artifact.

use crate::export::fhir_types::{ElementDefinition, StructureDefinition};
use crate::tank::rules::{FshCode, FshValue};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Assignment errors
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("Invalid property path: {0}")]
    InvalidPath(String),

    #[error("Unknown property '{property}' on {target}")]
    UnknownProperty { property: String, target: &'static str },

    #[error("Type mismatch assigning to '{path}': {detail}")]
    TypeMismatch { path: String, detail: String },

    #[error("Value is not compatible with any allowed type: {0}")]
    IncompatibleValue(String),
}

/// Properties assignable on a StructureDefinition through caret paths
const STRUCTURE_PROPERTIES: &[&str] = &[
    "id",
    "meta",
    "implicitRules",
    "language",
    "text",
    "extension",
    "modifierExtension",
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
    "keyword",
    "fhirVersion",
    "mapping",
    "kind",
    "abstract",
    "context",
    "contextInvariant",
    "type",
    "baseDefinition",
    "derivation",
];

/// Properties assignable on an ElementDefinition through caret paths
const ELEMENT_PROPERTIES: &[&str] = &[
    "id",
    "extension",
    "modifierExtension",
    "representation",
    "sliceName",
    "sliceIsConstraining",
    "label",
    "code",
    "slicing",
    "short",
    "definition",
    "comment",
    "requirements",
    "alias",
    "min",
    "max",
    "base",
    "contentReference",
    "type",
    "meaningWhenMissing",
    "orderMeaning",
    "example",
    "maxLength",
    "condition",
    "constraint",
    "mustSupport",
    "isModifier",
    "isModifierReason",
    "isSummary",
    "binding",
    "mapping",
];

/// Property-name prefixes whose full name carries a type suffix
/// (`fixedString`, `patternCodeableConcept`, `minValueDate`, ...)
const CHOICE_PROPERTY_PREFIXES: &[&str] =
    &["fixed", "pattern", "defaultValue", "minValue", "maxValue"];

fn is_known_property(name: &str, known: &[&str]) -> bool {
    known.contains(&name)
        || CHOICE_PROPERTY_PREFIXES.iter().any(|prefix| {
            name.strip_prefix(prefix)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_uppercase())
        })
}

/// One parsed caret-path segment: a property name with optional indices
#[derive(Debug, Clone, PartialEq, Eq)]
struct PropertySegment {
    name: String,
    indices: Vec<usize>,
}

fn parse_property_path(path: &str) -> Result<Vec<PropertySegment>, AssignmentError> {
    if path.is_empty() {
        return Err(AssignmentError::InvalidPath("empty caret path".to_string()));
    }
    let mut segments = Vec::new();
    for raw in path.split('.') {
        let mut name = String::new();
        let mut indices = Vec::new();
        let mut chars = raw.chars();
        while let Some(ch) = chars.next() {
            if ch == '[' {
                let mut digits = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    digits.push(inner);
                }
                if !closed || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(AssignmentError::InvalidPath(format!(
                        "bad index in caret path '{path}'"
                    )));
                }
                indices.push(digits.parse().unwrap_or(0));
            } else {
                name.push(ch);
            }
        }
        if name.is_empty() {
            return Err(AssignmentError::InvalidPath(format!(
                "empty segment in caret path '{path}'"
            )));
        }
        segments.push(PropertySegment { name, indices });
    }
    Ok(segments)
}

/// Set a value at a dotted property path inside a JSON object, creating
/// intermediate objects and array entries as needed.
pub fn set_json_property(
    target: &mut JsonValue,
    path: &str,
    value: JsonValue,
) -> Result<(), AssignmentError> {
    let segments = parse_property_path(path)?;
    let mut current = target;

    for (position, segment) in segments.iter().enumerate() {
        let last = position == segments.len() - 1;

        if !current.is_object() {
            return Err(AssignmentError::TypeMismatch {
                path: path.to_string(),
                detail: format!("'{}' is not addressable as an object", segment.name),
            });
        }
        let object = current.as_object_mut().expect("checked above");

        let needs_array = !segment.indices.is_empty();
        let slot = object
            .entry(segment.name.clone())
            .or_insert_with(|| if needs_array { JsonValue::Array(Vec::new()) } else { JsonValue::Null });

        let mut cursor = slot;
        for (depth, &index) in segment.indices.iter().enumerate() {
            if cursor.is_null() {
                *cursor = JsonValue::Array(Vec::new());
            }
            let array = cursor.as_array_mut().ok_or_else(|| AssignmentError::TypeMismatch {
                path: path.to_string(),
                detail: format!("'{}' is not an array", segment.name),
            })?;
            while array.len() <= index {
                array.push(JsonValue::Null);
            }
            cursor = &mut array[index];
            let innermost = depth == segment.indices.len() - 1;
            if !last && innermost && cursor.is_null() {
                *cursor = JsonValue::Object(serde_json::Map::new());
            }
        }

        if last {
            *cursor = value;
            return Ok(());
        }
        if cursor.is_null() {
            *cursor = JsonValue::Object(serde_json::Map::new());
        }
        current = cursor;
    }
    Ok(())
}

/// Assign a property by caret path after validating the first segment
/// against a known-property list.
pub fn assign_checked<T>(
    target: &mut T,
    caret_path: &str,
    value: JsonValue,
    properties: &[&str],
    target_name: &'static str,
) -> Result<(), AssignmentError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let segments = parse_property_path(caret_path)?;
    if !is_known_property(&segments[0].name, properties) {
        return Err(AssignmentError::UnknownProperty {
            property: segments[0].name.clone(),
            target: target_name,
        });
    }
    round_trip(target, caret_path, value)
}

/// Assign a property on a StructureDefinition by caret path.
///
/// The snapshot and differential are detached during the round trip so the
/// element originals (which serde skips) survive the assignment.
pub fn assign_on_structure(
    sd: &mut StructureDefinition,
    caret_path: &str,
    value: JsonValue,
) -> Result<(), AssignmentError> {
    let snapshot = sd.snapshot.take();
    let differential = sd.differential.take();
    let in_progress = sd.in_progress;

    let result = assign_checked(sd, caret_path, value, STRUCTURE_PROPERTIES, "StructureDefinition");

    sd.snapshot = snapshot;
    sd.differential = differential;
    sd.in_progress = in_progress;
    result
}

/// Assign a property on an ElementDefinition by caret path.
pub fn assign_on_element(
    element: &mut ElementDefinition,
    caret_path: &str,
    value: JsonValue,
) -> Result<(), AssignmentError> {
    let original = element.original.take();
    let result = assign_checked(element, caret_path, value, ELEMENT_PROPERTIES, "ElementDefinition");
    element.original = original;
    result
}

fn round_trip<T>(target: &mut T, caret_path: &str, value: JsonValue) -> Result<(), AssignmentError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut json = serde_json::to_value(&*target).map_err(|e| AssignmentError::TypeMismatch {
        path: caret_path.to_string(),
        detail: e.to_string(),
    })?;
    set_json_property(&mut json, caret_path, value)?;
    *target = serde_json::from_value(json).map_err(|e| AssignmentError::TypeMismatch {
        path: caret_path.to_string(),
        detail: e.to_string(),
    })?;
    Ok(())
}

// ============================================================================
// FSH value conversion and type checking
// ============================================================================

/// FHIR primitive types an FSH string may be assigned to
const STRING_TYPES: &[&str] = &[
    "string", "markdown", "id", "uri", "url", "canonical", "oid", "uuid", "base64Binary", "date",
    "dateTime", "instant", "time", "code", "xhtml",
];

/// FHIR primitive types an FSH integer may be assigned to
const INTEGER_TYPES: &[&str] = &["integer", "integer64", "unsignedInt", "positiveInt", "decimal"];

/// Context-free JSON rendering of an FSH value (used for caret paths, where
/// the target type is unknown). Codes without a system render as the bare
/// code string; with a system they render as a Coding.
pub fn fsh_value_to_json(value: &FshValue) -> JsonValue {
    match value {
        FshValue::Boolean(b) => JsonValue::Bool(*b),
        FshValue::Integer(i) => JsonValue::from(*i),
        FshValue::Decimal(d) => JsonValue::from(*d),
        FshValue::String(s) => JsonValue::String(s.clone()),
        FshValue::Code(code) => {
            if code.system.is_none() && code.display.is_none() {
                JsonValue::String(code.code.clone())
            } else {
                code.to_coding()
            }
        }
        FshValue::Reference(reference) => serde_json::json!({ "reference": reference }),
        FshValue::InstanceRef(name) => JsonValue::String(name.clone()),
    }
}

/// Render an FSH value for assignment to an element of the given type, or
/// None when the value cannot inhabit that type.
pub fn value_for_type(value: &FshValue, type_code: &str) -> Option<JsonValue> {
    match value {
        FshValue::Boolean(b) => (type_code == "boolean").then(|| JsonValue::Bool(*b)),
        FshValue::Integer(i) => {
            INTEGER_TYPES.contains(&type_code).then(|| JsonValue::from(*i))
        }
        FshValue::Decimal(d) => (type_code == "decimal").then(|| JsonValue::from(*d)),
        FshValue::String(s) => {
            STRING_TYPES.contains(&type_code).then(|| JsonValue::String(s.clone()))
        }
        FshValue::Code(code) => code_for_type(code, type_code),
        FshValue::Reference(_) | FshValue::InstanceRef(_) => None,
    }
}

fn code_for_type(code: &FshCode, type_code: &str) -> Option<JsonValue> {
    match type_code {
        "code" | "string" | "uri" => Some(JsonValue::String(code.code.clone())),
        "Coding" => Some(code.to_coding()),
        "CodeableConcept" => Some(serde_json::json!({ "coding": [code.to_coding()] })),
        "Quantity" | "Age" | "Duration" | "Count" | "Distance" => {
            let mut quantity = serde_json::Map::new();
            if let Some(system) = &code.system {
                quantity.insert("system".into(), JsonValue::String(system.clone()));
            }
            quantity.insert("code".into(), JsonValue::String(code.code.clone()));
            if let Some(display) = &code.display {
                quantity.insert("unit".into(), JsonValue::String(display.clone()));
            }
            Some(JsonValue::Object(quantity))
        }
        _ => None,
    }
}

/// The fixed[x]/pattern[x] key for a type code: "fixed" + "CodeableConcept"
/// → "fixedCodeableConcept", "pattern" + "code" → "patternCode".
pub fn assignment_key(prefix: &str, type_code: &str) -> String {
    let mut chars = type_code.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fhir_types::StructureDefinitionKind;
    use serde_json::json;

    #[test]
    fn test_set_json_property_nested() {
        let mut target = json!({});
        set_json_property(&mut target, "slicing.discriminator[0].type", json!("value")).unwrap();
        set_json_property(&mut target, "slicing.discriminator[0].path", json!("url")).unwrap();
        set_json_property(&mut target, "slicing.rules", json!("open")).unwrap();

        assert_eq!(
            target,
            json!({
                "slicing": {
                    "discriminator": [{"type": "value", "path": "url"}],
                    "rules": "open"
                }
            })
        );
    }

    #[test]
    fn test_set_json_property_extends_arrays() {
        let mut target = json!({});
        set_json_property(&mut target, "line[2]", json!("third")).unwrap();
        assert_eq!(target, json!({"line": [null, null, "third"]}));
    }

    #[test]
    fn test_set_json_property_rejects_bad_paths() {
        let mut target = json!({});
        assert!(set_json_property(&mut target, "", json!(1)).is_err());
        assert!(set_json_property(&mut target, "a[x]", json!(1)).is_err());
        assert!(set_json_property(&mut target, "a..b", json!(1)).is_err());
    }

    #[test]
    fn test_assign_on_structure() {
        let mut sd = StructureDefinition::new(
            "http://example.org/StructureDefinition/x".to_string(),
            "X".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        assign_on_structure(&mut sd, "status", json!("active")).unwrap();
        assert_eq!(sd.status.as_deref(), Some("active"));

        // Unknown properties are rejected
        let err = assign_on_structure(&mut sd, "nonsense", json!(1)).unwrap_err();
        assert!(matches!(err, AssignmentError::UnknownProperty { .. }));

        // Type mismatches are rejected and leave the artifact intact
        let err = assign_on_structure(&mut sd, "status", json!({"bad": true})).unwrap_err();
        assert!(matches!(err, AssignmentError::TypeMismatch { .. }));
        assert_eq!(sd.status.as_deref(), Some("active"));
    }

    #[test]
    fn test_assign_on_structure_preserves_snapshot() {
        let mut sd = StructureDefinition::new(
            "http://example.org/StructureDefinition/x".to_string(),
            "X".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        let mut root = ElementDefinition::new("Patient");
        root.capture_original();
        sd.elements_mut().push(root);

        assign_on_structure(&mut sd, "publisher", json!("Example Org")).unwrap();
        assert_eq!(sd.publisher.as_deref(), Some("Example Org"));
        assert!(sd.elements()[0].original.is_some());
    }

    #[test]
    fn test_assign_on_element_preserves_original() {
        let mut elem = ElementDefinition::new("Patient.name");
        elem.capture_original();
        assign_on_element(&mut elem, "short", json!("A name")).unwrap();
        assert_eq!(elem.short.as_deref(), Some("A name"));
        assert!(elem.original.is_some());
        assert!(elem.is_modified());
    }

    #[test]
    fn test_assign_on_element_choice_suffixed_property() {
        let mut elem = ElementDefinition::new("Patient.gender");
        assign_on_element(&mut elem, "fixedCode", json!("male")).unwrap();
        assert_eq!(elem.assigned_value().unwrap().0, "fixedCode");
    }

    #[test]
    fn test_value_for_type() {
        assert_eq!(
            value_for_type(&FshValue::Boolean(true), "boolean"),
            Some(json!(true))
        );
        assert!(value_for_type(&FshValue::Boolean(true), "string").is_none());
        assert_eq!(
            value_for_type(&FshValue::Integer(3), "positiveInt"),
            Some(json!(3))
        );
        assert_eq!(
            value_for_type(&FshValue::String("hello".into()), "markdown"),
            Some(json!("hello"))
        );
        assert!(value_for_type(&FshValue::String("hello".into()), "boolean").is_none());
    }

    #[test]
    fn test_code_value_for_types() {
        let code = FshValue::Code(FshCode::with_system("http://loinc.org", "1234-5"));
        assert_eq!(value_for_type(&code, "code"), Some(json!("1234-5")));
        assert_eq!(
            value_for_type(&code, "CodeableConcept"),
            Some(json!({"coding": [{"system": "http://loinc.org", "code": "1234-5"}]}))
        );
        assert!(value_for_type(&code, "boolean").is_none());
    }

    #[test]
    fn test_assignment_key() {
        assert_eq!(assignment_key("fixed", "code"), "fixedCode");
        assert_eq!(assignment_key("pattern", "CodeableConcept"), "patternCodeableConcept");
    }
}
