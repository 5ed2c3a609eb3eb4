//! Parsed FSH rule model
//!
//! The closed set of rule variants the export engine dispatches over. These
//! mirror the rule kinds of the FSH grammar; the parser producing them is an
//! external collaborator. Rules are immutable once parsed: the engine never
//! mutates a source rule, it only splices synthesized caret rules when
//! expanding an obeys rule.

use crate::diagnostics::Location;
use crate::export::fhir_types::BindingStrength;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parsed FSH value, as it appears on the right-hand side of an assignment
/// or caret rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FshValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    /// `SYSTEM#code "display"`: system and display optional
    Code(FshCode),
    /// `Reference(instance-or-id)`
    Reference(String),
    /// A bare name referring to an instance defined in FSH
    InstanceRef(String),
}

impl FshValue {
    /// Whether this value could plausibly have been meant as an instance id.
    ///
    /// FSH instance ids may be purely numeric or `true`/`false`, so a
    /// number or boolean that fails type checking is retried as a deferred
    /// instance lookup before the rule is failed.
    pub fn could_be_instance_id(&self) -> bool {
        matches!(
            self,
            FshValue::Boolean(_) | FshValue::Integer(_) | FshValue::Decimal(_)
        )
    }

    /// The identifier to use when retrying this value as an instance lookup
    pub fn as_instance_id(&self) -> Option<String> {
        match self {
            FshValue::Boolean(b) => Some(b.to_string()),
            FshValue::Integer(i) => Some(i.to_string()),
            FshValue::Decimal(d) => Some(d.to_string()),
            FshValue::InstanceRef(name) => Some(name.clone()),
            _ => None,
        }
    }
}

/// A coded value: optional system (alias already resolved by the parser),
/// required code, optional display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FshCode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl FshCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            system: None,
            code: code.into(),
            display: None,
        }
    }

    pub fn with_system(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: code.into(),
            display: None,
        }
    }

    /// JSON Coding object for this code
    pub fn to_coding(&self) -> JsonValue {
        let mut coding = serde_json::Map::new();
        if let Some(system) = &self.system {
            coding.insert("system".into(), JsonValue::String(system.clone()));
        }
        coding.insert("code".into(), JsonValue::String(self.code.clone()));
        if let Some(display) = &self.display {
            coding.insert("display".into(), JsonValue::String(display.clone()));
        }
        JsonValue::Object(coding)
    }
}

/// Cardinality constraint: `* name 1..1` (either bound may be open)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardRule {
    pub path: String,
    /// New minimum, absent when the FSH rule left it open (`..1`)
    pub min: Option<u32>,
    /// New maximum ("*" for unbounded), absent when left open (`1..`)
    pub max: Option<String>,
    #[serde(default)]
    pub location: Location,
}

/// Flag constraint: `* name MS SU ?!` plus the standards-status flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagRule {
    pub path: String,
    pub must_support: Option<bool>,
    pub summary: Option<bool>,
    pub modifier: Option<bool>,
    pub trial_use: Option<bool>,
    pub normative: Option<bool>,
    pub draft: Option<bool>,
    #[serde(default)]
    pub location: Location,
}

/// Terminology binding: `* code from MyValueSet (required)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRule {
    pub path: String,
    /// Value set reference: name, id, or canonical URL
    pub value_set: String,
    pub strength: BindingStrength,
    #[serde(default)]
    pub location: Location,
}

/// Type constraint: `* value[x] only Quantity or CodeableConcept`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlyRule {
    pub path: String,
    pub types: Vec<OnlyRuleType>,
    #[serde(default)]
    pub location: Location,
}

/// One permitted type in an only rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlyRuleType {
    /// Type name, profile name/id, or canonical URL
    #[serde(rename = "type")]
    pub type_: String,
    /// `only Reference(X)`
    #[serde(default)]
    pub reference: bool,
    /// `only Canonical(X)`
    #[serde(default)]
    pub canonical: bool,
}

impl OnlyRuleType {
    pub fn plain(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            ..Self::default()
        }
    }

    pub fn reference(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            reference: true,
            canonical: false,
        }
    }
}

/// Slice declaration: `* component contains systolic 1..1 and diastolic 1..1`
///
/// Cardinalities attached to contains items in FSH arrive as separate card
/// rules on the slice paths, so items carry only name and optional type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainsRule {
    pub path: String,
    pub items: Vec<ContainsItem>,
    #[serde(default)]
    pub location: Location,
}

/// One declared slice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainsItem {
    /// Slice name
    pub name: String,
    /// `contains TypeName named sliceName`: the extension or profile to apply
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Arbitrary property assignment: `* status ^short = "..."` or `* ^url = ...`
///
/// An empty rule path roots the caret path at the artifact itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaretValueRule {
    /// Element path, empty when the artifact itself is the target
    #[serde(default)]
    pub path: String,
    /// Secondary path below the element (or artifact)
    pub caret_path: String,
    pub value: FshValue,
    #[serde(default)]
    pub location: Location,
}

/// Invariant attachment: `* name obeys inv-1 and inv-2`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObeysRule {
    /// Element path, empty to attach to the root element
    #[serde(default)]
    pub path: String,
    pub invariants: Vec<String>,
    #[serde(default)]
    pub location: Location,
}

/// Fixed or pattern value: `* status = #final (exactly)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub path: String,
    pub value: FshValue,
    /// true → fixed[x]; false → pattern[x]
    #[serde(default)]
    pub exactly: bool,
    #[serde(default)]
    pub location: Location,
}

/// New element declaration (logical models and resources only):
/// `* subject 1..1 Reference(Patient) "the subject"`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddElementRule {
    pub path: String,
    pub min: u32,
    pub max: String,
    pub types: Vec<OnlyRuleType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default)]
    pub location: Location,
}

/// The closed set of FSH rule variants.
///
/// The dispatch engine is an exhaustive match over this enum, so an unhandled
/// rule kind is a compile error rather than a silent fall-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Rule {
    Card(CardRule),
    Flag(FlagRule),
    Binding(BindingRule),
    Only(OnlyRule),
    Contains(ContainsRule),
    CaretValue(CaretValueRule),
    Obeys(ObeysRule),
    Assignment(AssignmentRule),
    AddElement(AddElementRule),
}

impl Rule {
    /// The target path of the rule (empty means "the artifact itself")
    pub fn path(&self) -> &str {
        match self {
            Rule::Card(r) => &r.path,
            Rule::Flag(r) => &r.path,
            Rule::Binding(r) => &r.path,
            Rule::Only(r) => &r.path,
            Rule::Contains(r) => &r.path,
            Rule::CaretValue(r) => &r.path,
            Rule::Obeys(r) => &r.path,
            Rule::Assignment(r) => &r.path,
            Rule::AddElement(r) => &r.path,
        }
    }

    /// Source location of the rule
    pub fn location(&self) -> &Location {
        match self {
            Rule::Card(r) => &r.location,
            Rule::Flag(r) => &r.location,
            Rule::Binding(r) => &r.location,
            Rule::Only(r) => &r.location,
            Rule::Contains(r) => &r.location,
            Rule::CaretValue(r) => &r.location,
            Rule::Obeys(r) => &r.location,
            Rule::Assignment(r) => &r.location,
            Rule::AddElement(r) => &r.location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsh_code_to_coding() {
        let code = FshCode::with_system("http://loinc.org", "1234-5");
        let coding = code.to_coding();
        assert_eq!(coding["system"], "http://loinc.org");
        assert_eq!(coding["code"], "1234-5");
        assert!(coding.get("display").is_none());
    }

    #[test]
    fn test_could_be_instance_id() {
        assert!(FshValue::Integer(123).could_be_instance_id());
        assert!(FshValue::Boolean(true).could_be_instance_id());
        assert!(!FshValue::String("abc".into()).could_be_instance_id());
        assert_eq!(FshValue::Integer(123).as_instance_id().as_deref(), Some("123"));
    }

    #[test]
    fn test_rule_path_accessor() {
        let rule = Rule::Card(CardRule {
            path: "identifier".into(),
            min: Some(1),
            max: Some("1".into()),
            location: Location::default(),
        });
        assert_eq!(rule.path(), "identifier");
    }
}
