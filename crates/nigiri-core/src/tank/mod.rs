//! FSH tank: the parsed, not-yet-compiled source definitions
//!
//! The tank is the in-memory collection of everything the parser produced,
//! in source order. It is read-only to the export engine: the engine fishes
//! definitions out of it and compiles them, but never mutates it.

pub mod rules;

use crate::diagnostics::Location;
use crate::semantic::fishing::FhirType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub use rules::{
    AddElementRule, AssignmentRule, BindingRule, CardRule, CaretValueRule, ContainsItem,
    ContainsRule, FlagRule, FshCode, FshValue, ObeysRule, OnlyRule, OnlyRuleType, Rule,
};

/// The kind of a structure-defining source definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Profile,
    Extension,
    Logical,
    Resource,
}

impl DefinitionKind {
    pub fn as_fhir_type(&self) -> FhirType {
        match self {
            DefinitionKind::Profile => FhirType::Profile,
            DefinitionKind::Extension => FhirType::Extension,
            DefinitionKind::Logical => FhirType::Logical,
            DefinitionKind::Resource => FhirType::Resource,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DefinitionKind::Profile => "Profile",
            DefinitionKind::Extension => "Extension",
            DefinitionKind::Logical => "Logical",
            DefinitionKind::Resource => "Resource",
        }
    }
}

/// A structure-defining FSH definition (Profile, Extension, Logical, Resource)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub kind: DefinitionKind,
    pub name: String,
    pub id: String,
    /// Declared parent reference (name, id, or url). Absent is an error for
    /// profiles; the other kinds have built-in defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub location: Location,
}

impl SourceDefinition {
    pub fn new(kind: DefinitionKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let id = name.clone();
        Self {
            kind,
            name,
            id,
            parent: None,
            title: None,
            description: None,
            rules: Vec::new(),
            location: Location::default(),
        }
    }

    /// Whether the given identifier names this definition
    pub fn matches_identity(&self, identifier: &str) -> bool {
        self.name == identifier || self.id == identifier
    }
}

/// A parsed FSH instance definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDefinition {
    pub name: String,
    pub id: String,
    /// The resource, profile, or type this instance conforms to
    pub instance_of: String,
    /// #example | #definition | #inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub location: Location,
}

impl InstanceDefinition {
    pub fn new(name: impl Into<String>, instance_of: impl Into<String>) -> Self {
        let name = name.into();
        let id = name.clone();
        Self {
            name,
            id,
            instance_of: instance_of.into(),
            usage: None,
            title: None,
            description: None,
            rules: Vec::new(),
            location: Location::default(),
        }
    }

    pub fn matches_identity(&self, identifier: &str) -> bool {
        self.name == identifier || self.id == identifier
    }
}

/// One include or exclude component of a value set definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueSetComponent {
    /// true → include, false → exclude
    pub include: bool,
    /// Code system reference (name, id, or url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Source value sets (`include codes from valueset X`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_sets: Vec<String>,
    /// Individually listed concepts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concepts: Vec<FshCode>,
    /// Filters (`where concept is-a #something`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ValueSetFilterComponent>,
}

/// A value set filter component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSetFilterComponent {
    pub property: String,
    pub op: String,
    pub value: String,
}

/// A parsed FSH value set definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSetDefinition {
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub components: Vec<ValueSetComponent>,
    /// Caret rules on the value set itself
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub location: Location,
}

impl ValueSetDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = name.clone();
        Self {
            name,
            id,
            title: None,
            description: None,
            components: Vec::new(),
            rules: Vec::new(),
            location: Location::default(),
        }
    }

    pub fn matches_identity(&self, identifier: &str) -> bool {
        self.name == identifier || self.id == identifier
    }
}

/// A concept in a code system definition, possibly with children
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptDefinition {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConceptDefinition>,
}

impl ConceptDefinition {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display: None,
            definition: None,
            children: Vec::new(),
        }
    }
}

/// A parsed FSH code system definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSystemDefinition {
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub concepts: Vec<ConceptDefinition>,
    /// Caret rules on the code system itself
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub location: Location,
}

impl CodeSystemDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = name.clone();
        Self {
            name,
            id,
            title: None,
            description: None,
            concepts: Vec::new(),
            rules: Vec::new(),
            location: Location::default(),
        }
    }

    pub fn matches_identity(&self, identifier: &str) -> bool {
        self.name == identifier || self.id == identifier
    }
}

/// A named structural constraint, attached to elements via obeys rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invariant {
    pub name: String,
    pub description: String,
    /// error | warning
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    /// Caret-path rules populating additional constraint metadata
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<InvariantRule>,
    #[serde(default)]
    pub location: Location,
}

impl Invariant {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity: "error".to_string(),
            expression: None,
            xpath: None,
            rules: Vec::new(),
            location: Location::default(),
        }
    }
}

/// A caret-path rule inside an invariant definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantRule {
    pub caret_path: String,
    pub value: FshValue,
}

/// One entry of the tank, in source order
#[derive(Debug, Clone)]
pub enum TankItem {
    Structure(SourceDefinition),
    Instance(InstanceDefinition),
    ValueSet(ValueSetDefinition),
    CodeSystem(CodeSystemDefinition),
}

impl TankItem {
    pub fn name(&self) -> &str {
        match self {
            TankItem::Structure(d) => &d.name,
            TankItem::Instance(d) => &d.name,
            TankItem::ValueSet(d) => &d.name,
            TankItem::CodeSystem(d) => &d.name,
        }
    }
}

/// In-memory collection of parsed FSH definitions
///
/// Definitions are matched by declared name or id; canonical-url lookups are
/// answered by the accumulator and the base library, which know the derived
/// URLs. A `|version` suffix never matches a tank entry: versions are
/// assigned at export time.
#[derive(Debug, Clone, Default)]
pub struct FshTank {
    items: Vec<TankItem>,
    invariants: IndexMap<String, Invariant>,
}

impl FshTank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_structure(&mut self, definition: SourceDefinition) {
        self.items.push(TankItem::Structure(definition));
    }

    pub fn add_instance(&mut self, definition: InstanceDefinition) {
        self.items.push(TankItem::Instance(definition));
    }

    pub fn add_value_set(&mut self, definition: ValueSetDefinition) {
        self.items.push(TankItem::ValueSet(definition));
    }

    pub fn add_code_system(&mut self, definition: CodeSystemDefinition) {
        self.items.push(TankItem::CodeSystem(definition));
    }

    pub fn add_invariant(&mut self, invariant: Invariant) {
        self.invariants.insert(invariant.name.clone(), invariant);
    }

    /// All items in source order
    pub fn items(&self) -> &[TankItem] {
        &self.items
    }

    /// Look up an invariant by name
    pub fn invariant(&self, name: &str) -> Option<&Invariant> {
        self.invariants.get(name)
    }

    /// Fish a source definition by declared name or id, with a kind filter
    pub fn fish_by_identity(&self, identifier: &str, types: &[FhirType]) -> Option<&TankItem> {
        trace!("Tank lookup for '{}' (types: {:?})", identifier, types);
        self.items.iter().find(|item| {
            let (matches, kind) = match item {
                TankItem::Structure(d) => (d.matches_identity(identifier), d.kind.as_fhir_type()),
                TankItem::Instance(d) => (d.matches_identity(identifier), FhirType::Instance),
                TankItem::ValueSet(d) => (d.matches_identity(identifier), FhirType::ValueSet),
                TankItem::CodeSystem(d) => (d.matches_identity(identifier), FhirType::CodeSystem),
            };
            matches && (types.is_empty() || types.contains(&kind))
        })
    }

    /// All structure definitions, in source order
    pub fn structures(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.items.iter().filter_map(|item| match item {
            TankItem::Structure(d) => Some(d),
            _ => None,
        })
    }

    /// All instance definitions, in source order
    pub fn instances(&self) -> impl Iterator<Item = &InstanceDefinition> {
        self.items.iter().filter_map(|item| match item {
            TankItem::Instance(d) => Some(d),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fish_by_identity_and_kind() {
        let mut tank = FshTank::new();
        let mut profile = SourceDefinition::new(DefinitionKind::Profile, "MyPatient");
        profile.id = "my-patient".to_string();
        tank.add_structure(profile);
        tank.add_value_set(ValueSetDefinition::new("MyCodes"));

        assert!(tank.fish_by_identity("MyPatient", &[]).is_some());
        assert!(tank.fish_by_identity("my-patient", &[FhirType::Profile]).is_some());
        assert!(tank.fish_by_identity("MyPatient", &[FhirType::ValueSet]).is_none());
        assert!(tank.fish_by_identity("MyCodes", &[FhirType::ValueSet]).is_some());
        assert!(tank.fish_by_identity("Nothing", &[]).is_none());
    }

    #[test]
    fn test_items_preserve_source_order() {
        let mut tank = FshTank::new();
        tank.add_value_set(ValueSetDefinition::new("First"));
        tank.add_structure(SourceDefinition::new(DefinitionKind::Extension, "Second"));
        tank.add_instance(InstanceDefinition::new("Third", "Patient"));

        let names: Vec<_> = tank.items().iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);
    }

    #[test]
    fn test_invariant_lookup() {
        let mut tank = FshTank::new();
        tank.add_invariant(Invariant::new("inv-1", "must have a name"));

        assert!(tank.invariant("inv-1").is_some());
        assert!(tank.invariant("inv-2").is_none());
    }
}
