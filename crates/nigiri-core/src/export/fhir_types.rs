//! FHIR artifact types for export
//!
//! The compiled-artifact model: StructureDefinition with its element tree,
//! plus the ValueSet and CodeSystem resources and exported instances held by
//! the package. Fields the engine manipulates are typed; everything else a
//! base definition carries (mapping, example, condition, ...) is retained in
//! an order-preserving flattened map so round-tripping a real definition
//! loses nothing.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Extension URL carrying the trial-use / normative / draft flag
pub const STANDARDS_STATUS_URL: &str =
    "http://hl7.org/fhir/StructureDefinition/structuredefinition-standards-status";

// ============================================================================
// StructureDefinition
// ============================================================================

/// FHIR StructureDefinition resource
///
/// Represents a compiled Profile, Extension, Logical model, or Resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureDefinition {
    /// Resource type (always "StructureDefinition")
    pub resource_type: String,

    /// Logical id of this artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Canonical identifier for this structure definition
    pub url: String,

    /// Business version of the structure definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Name for this structure definition (computer friendly)
    pub name: String,

    /// Name for this structure definition (human friendly)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// draft | active | retired | unknown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Date last changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Name of the publisher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Natural language description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// For testing purposes, not real usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<bool>,

    /// FHIR version this StructureDefinition targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,

    /// primitive-type | complex-type | resource | logical
    pub kind: StructureDefinitionKind,

    /// Whether the structure is abstract
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,

    /// Type defined or constrained by this structure
    #[serde(rename = "type")]
    pub type_field: String,

    /// Definition that this type is constrained/specialized from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_definition: Option<String>,

    /// specialization | constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation: Option<String>,

    /// Extension context (for extensions only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<StructureDefinitionContext>>,

    /// Snapshot view of the structure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<StructureDefinitionSnapshot>,

    /// Differential view of the structure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub differential: Option<StructureDefinitionDifferential>,

    /// Properties the engine does not interpret (contact, mapping, ...)
    #[serde(flatten, default)]
    pub extra: IndexMap<String, JsonValue>,

    /// Under-construction marker: set while rules are still being applied,
    /// cleared when the export completes. Cyclic lookups observe it.
    #[serde(skip, default)]
    pub in_progress: bool,
}

impl StructureDefinition {
    /// Create a new StructureDefinition with required fields
    pub fn new(
        url: String,
        name: String,
        type_field: String,
        kind: StructureDefinitionKind,
    ) -> Self {
        Self {
            resource_type: "StructureDefinition".to_string(),
            id: None,
            url,
            version: None,
            name,
            title: None,
            status: None,
            date: None,
            publisher: None,
            description: None,
            experimental: None,
            fhir_version: None,
            kind,
            is_abstract: false,
            type_field,
            base_definition: None,
            derivation: Some("constraint".to_string()),
            context: None,
            snapshot: None,
            differential: None,
            extra: IndexMap::new(),
            in_progress: false,
        }
    }

    /// Snapshot elements (empty slice when no snapshot is present)
    pub fn elements(&self) -> &[ElementDefinition] {
        self.snapshot.as_ref().map(|s| s.element.as_slice()).unwrap_or(&[])
    }

    /// Mutable snapshot elements, creating the snapshot when absent
    pub fn elements_mut(&mut self) -> &mut Vec<ElementDefinition> {
        &mut self
            .snapshot
            .get_or_insert_with(|| StructureDefinitionSnapshot { element: Vec::new() })
            .element
    }

    /// Find an element by exact path (the unsliced element)
    pub fn find_element(&self, path: &str) -> Option<&ElementDefinition> {
        self.elements()
            .iter()
            .find(|e| e.path == path && e.slice_name.is_none())
    }

    /// Position of the element with the given id
    pub fn position_by_id(&self, id: &str) -> Option<usize> {
        self.elements().iter().position(|e| e.id_or_path() == id)
    }

    /// The root element's path (equals the type name by construction)
    pub fn root_path(&self) -> Option<&str> {
        self.elements().first().map(|e| e.path.as_str())
    }

    /// Whether the given identity (id, name, or url) refers to this artifact,
    /// honoring an optional exact-version requirement.
    pub fn matches_identity(&self, identifier: &str, version: Option<&str>) -> bool {
        let identity_matches = self.url == identifier
            || self.name == identifier
            || self.id.as_deref() == Some(identifier);
        match version {
            Some(v) => identity_matches && self.version.as_deref() == Some(v),
            None => identity_matches,
        }
    }

    /// Whether this artifact constrains or specializes Extension
    pub fn is_extension(&self) -> bool {
        self.type_field == "Extension"
    }
}

/// Kind of structure definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureDefinitionKind {
    PrimitiveType,
    ComplexType,
    Resource,
    Logical,
}

impl StructureDefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureDefinitionKind::PrimitiveType => "primitive-type",
            StructureDefinitionKind::ComplexType => "complex-type",
            StructureDefinitionKind::Resource => "resource",
            StructureDefinitionKind::Logical => "logical",
        }
    }
}

/// Snapshot view of structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureDefinitionSnapshot {
    pub element: Vec<ElementDefinition>,
}

/// Differential view of structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureDefinitionDifferential {
    pub element: Vec<ElementDefinition>,
}

/// Context where an extension can be used
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StructureDefinitionContext {
    /// element | extension | fhirpath
    #[serde(rename = "type")]
    pub type_: String,

    /// Where the extension can be used
    pub expression: String,
}

impl StructureDefinitionContext {
    pub fn element(expression: impl Into<String>) -> Self {
        Self {
            type_: "element".to_string(),
            expression: expression.into(),
        }
    }
}

// ============================================================================
// ElementDefinition
// ============================================================================

/// Definition of one node in the element tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    /// Unique id within the tree ("Patient.identifier:mrn.system")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Path of the element in the hierarchy of elements
    pub path: String,

    /// Name of this slice, when the element is a slice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_name: Option<String>,

    /// Slicing descriptor, when this element's repetitions are sliced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slicing: Option<ElementDefinitionSlicing>,

    /// Short description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,

    /// Full formal definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,

    /// Comments about the use of the element
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Why this element is needed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,

    /// Minimum cardinality
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,

    /// Maximum cardinality ("*" for unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,

    /// Base definition information for the element
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<ElementDefinitionBase>,

    /// Data type(s) for this element
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<Vec<ElementDefinitionType>>,

    /// Include when support is essential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_support: Option<bool>,

    /// Whether the element modifies the meaning of the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_modifier: Option<bool>,

    /// Include in summaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_summary: Option<bool>,

    /// ValueSet binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<ElementDefinitionBinding>,

    /// Conditions that must evaluate to true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Vec<ElementDefinitionConstraint>>,

    /// Everything else: fixed[x]/pattern[x], mapping, condition, example,
    /// extension, ...: retained verbatim
    #[serde(flatten, default)]
    pub extra: IndexMap<String, JsonValue>,

    /// Pre-rule-application copy of this element, captured when the tree is
    /// derived from the parent. Elements whose content differs from it (or
    /// that have no original at all) form the differential.
    #[serde(skip, default)]
    pub original: Option<Box<ElementDefinition>>,
}

impl ElementDefinition {
    /// Create a new ElementDefinition with just a path
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: Some(path.clone()),
            path,
            slice_name: None,
            slicing: None,
            short: None,
            definition: None,
            comment: None,
            requirements: None,
            min: None,
            max: None,
            base: None,
            type_: None,
            must_support: None,
            is_modifier: None,
            is_summary: None,
            binding: None,
            constraint: None,
            extra: IndexMap::new(),
            original: None,
        }
    }

    /// The element id, falling back to the path when no id is set
    pub fn id_or_path(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.path)
    }

    /// Whether max is "*"
    pub fn max_is_unbounded(&self) -> bool {
        self.max.as_deref() == Some("*")
    }

    /// Numeric max, None when unbounded or unset
    pub fn max_as_number(&self) -> Option<u32> {
        self.max.as_deref().and_then(|m| m.parse().ok())
    }

    /// Whether the element repeats (max > 1 or unbounded)
    pub fn is_repeating(&self) -> bool {
        self.max_is_unbounded() || self.max_as_number().is_some_and(|m| m > 1)
    }

    /// Whether this is a choice element (path ends with "[x]")
    pub fn is_choice(&self) -> bool {
        self.path.ends_with("[x]")
    }

    /// Whether the element's (first) type is Extension
    pub fn is_extension_valued(&self) -> bool {
        self.type_
            .as_ref()
            .and_then(|t| t.first())
            .is_some_and(|t| t.code == "Extension")
    }

    /// The fixed[x] or pattern[x] entry, if any
    pub fn assigned_value(&self) -> Option<(&str, &JsonValue)> {
        self.extra.iter().find_map(|(key, value)| {
            if is_assignment_key(key) {
                Some((key.as_str(), value))
            } else {
                None
            }
        })
    }

    /// Replace any fixed[x]/pattern[x] entry with the given one
    pub fn set_assigned(&mut self, key: impl Into<String>, value: JsonValue) {
        self.extra.retain(|k, _| !is_assignment_key(k));
        self.extra.insert(key.into(), value);
    }

    /// Set the standards-status flag (trial-use | normative | draft) as the
    /// standards-status extension, replacing any previous value.
    pub fn set_standards_status(&mut self, code: &str) {
        let entry = serde_json::json!({
            "url": STANDARDS_STATUS_URL,
            "valueCode": code,
        });
        let extensions = self
            .extra
            .entry("extension".to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let JsonValue::Array(items) = extensions {
            items.retain(|item| item.get("url").and_then(|u| u.as_str()) != Some(STANDARDS_STATUS_URL));
            items.push(entry);
        }
    }

    /// The current standards-status flag, if set
    pub fn standards_status(&self) -> Option<&str> {
        self.extra
            .get("extension")?
            .as_array()?
            .iter()
            .find(|item| item.get("url").and_then(|u| u.as_str()) == Some(STANDARDS_STATUS_URL))?
            .get("valueCode")?
            .as_str()
    }

    /// Capture the current content as the pre-rule-application original
    pub fn capture_original(&mut self) {
        let mut copy = self.clone();
        copy.original = None;
        self.original = Some(Box::new(copy));
    }

    /// Whether this element's content differs from its captured original.
    /// Elements without an original (created by rules) always count as
    /// modified.
    pub fn is_modified(&self) -> bool {
        match &self.original {
            Some(original) => !content_eq(self, original),
            None => true,
        }
    }
}

/// Compare two elements by serialized content, ignoring the captured
/// originals (which serde skips).
pub fn content_eq(a: &ElementDefinition, b: &ElementDefinition) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn is_assignment_key(key: &str) -> bool {
    for prefix in ["fixed", "pattern"] {
        if let Some(rest) = key.strip_prefix(prefix)
            && rest.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        {
            return true;
        }
    }
    false
}

/// Base definition information for an element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionBase {
    pub path: String,
    pub min: u32,
    pub max: String,
}

/// Data type for an element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionType {
    /// Data type or Resource (reference target)
    pub code: String,

    /// Profile (StructureDefinition) on the type itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Vec<String>>,

    /// Profiles for the target of a Reference/canonical
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_profile: Option<Vec<String>>,
}

impl ElementDefinitionType {
    /// Create a simple type with just a code
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            profile: None,
            target_profile: None,
        }
    }
}

/// Slicing descriptor on a repeating element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionSlicing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<Vec<ElementDefinitionDiscriminator>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,

    /// closed | open | openAtEnd
    pub rules: String,
}

/// How repetitions are distinguished into slices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionDiscriminator {
    /// value | exists | pattern | type | profile
    #[serde(rename = "type")]
    pub type_: String,

    pub path: String,
}

/// ValueSet binding for an element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionBinding {
    /// required | extensible | preferred | example
    pub strength: BindingStrength,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source of value set (canonical URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_set: Option<String>,
}

/// Binding strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStrength {
    Required,
    Extensible,
    Preferred,
    Example,
}

impl BindingStrength {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "required" => Some(Self::Required),
            "extensible" => Some(Self::Extensible),
            "preferred" => Some(Self::Preferred),
            "example" => Some(Self::Example),
            _ => None,
        }
    }

    /// Rank for narrowing comparisons: required > extensible > preferred > example
    pub fn rank(&self) -> u8 {
        match self {
            BindingStrength::Required => 3,
            BindingStrength::Extensible => 2,
            BindingStrength::Preferred => 1,
            BindingStrength::Example => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStrength::Required => "required",
            BindingStrength::Extensible => "extensible",
            BindingStrength::Preferred => "preferred",
            BindingStrength::Example => "example",
        }
    }
}

/// Constraint on an element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionConstraint {
    pub key: String,

    /// error | warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Human description of the constraint
    pub human: String,

    /// FHIRPath expression of the constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// XPath expression of the constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,

    #[serde(flatten, default)]
    pub extra: IndexMap<String, JsonValue>,
}

// ============================================================================
// ValueSet
// ============================================================================

/// FHIR ValueSet resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetResource {
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose: Option<ValueSetCompose>,

    #[serde(flatten, default)]
    pub extra: IndexMap<String, JsonValue>,
}

impl ValueSetResource {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: "ValueSet".to_string(),
            id: None,
            url: url.into(),
            version: None,
            name: name.into(),
            title: None,
            status: None,
            description: None,
            compose: None,
            extra: IndexMap::new(),
        }
    }

    pub fn matches_identity(&self, identifier: &str, version: Option<&str>) -> bool {
        let identity_matches = self.url == identifier
            || self.name == identifier
            || self.id.as_deref() == Some(identifier);
        match version {
            Some(v) => identity_matches && self.version.as_deref() == Some(v),
            None => identity_matches,
        }
    }
}

/// Content logical definition of the value set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetCompose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<ValueSetInclude>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<ValueSetInclude>>,
}

impl ValueSetCompose {
    pub fn add_include(&mut self, include: ValueSetInclude) {
        self.include.get_or_insert_with(Vec::new).push(include);
    }

    pub fn add_exclude(&mut self, exclude: ValueSetInclude) {
        self.exclude.get_or_insert_with(Vec::new).push(exclude);
    }
}

/// Include or exclude codes from a code system or value set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetInclude {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<Vec<ValueSetConcept>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<ValueSetFilter>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_set: Option<Vec<String>>,
}

/// A concept listed in a value set component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetConcept {
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Filter to select codes from a code system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetFilter {
    pub property: String,
    pub op: String,
    pub value: String,
}

// ============================================================================
// CodeSystem
// ============================================================================

/// FHIR CodeSystem resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSystemResource {
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// not-present | example | fragment | complete | supplement
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<Vec<CodeSystemConcept>>,

    #[serde(flatten, default)]
    pub extra: IndexMap<String, JsonValue>,
}

impl CodeSystemResource {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: "CodeSystem".to_string(),
            id: None,
            url: url.into(),
            version: None,
            name: name.into(),
            title: None,
            status: None,
            description: None,
            content: "complete".to_string(),
            count: None,
            concept: None,
            extra: IndexMap::new(),
        }
    }

    pub fn matches_identity(&self, identifier: &str, version: Option<&str>) -> bool {
        let identity_matches = self.url == identifier
            || self.name == identifier
            || self.id.as_deref() == Some(identifier);
        match version {
            Some(v) => identity_matches && self.version.as_deref() == Some(v),
            None => identity_matches,
        }
    }

    pub fn add_concept(&mut self, concept: CodeSystemConcept) {
        self.concept.get_or_insert_with(Vec::new).push(concept);
    }

    /// Recount all concepts, including nested children
    pub fn update_count(&mut self) {
        fn count(concepts: &[CodeSystemConcept]) -> u32 {
            concepts
                .iter()
                .map(|c| 1 + c.concept.as_deref().map(count).unwrap_or(0))
                .sum()
        }
        self.count = self.concept.as_deref().map(count);
    }
}

/// A concept defined in the code system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CodeSystemConcept {
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,

    /// Child concepts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<Vec<CodeSystemConcept>>,
}

impl CodeSystemConcept {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display: None,
            definition: None,
            concept: None,
        }
    }
}

// ============================================================================
// Exported instances
// ============================================================================

/// An exported FHIR resource instance, held in the package
#[derive(Debug, Clone)]
pub struct ExportedInstance {
    /// FSH instance name
    pub name: String,
    /// Resource, profile, or type the instance conforms to
    pub instance_of: String,
    /// #example | #definition | #inline
    pub usage: Option<String>,
    /// The assembled resource JSON
    pub resource: JsonValue,
}

impl ExportedInstance {
    pub fn id(&self) -> Option<&str> {
        self.resource.get("id").and_then(|v| v.as_str())
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource.get("resourceType").and_then(|v| v.as_str())
    }

    pub fn matches_identity(&self, identifier: &str) -> bool {
        self.name == identifier || self.id() == Some(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structure_definition_new() {
        let sd = StructureDefinition::new(
            "http://example.org/fhir/StructureDefinition/TestProfile".to_string(),
            "TestProfile".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );

        assert_eq!(sd.resource_type, "StructureDefinition");
        assert_eq!(sd.name, "TestProfile");
        assert_eq!(sd.type_field, "Patient");
        assert_eq!(sd.derivation.as_deref(), Some("constraint"));
        assert!(!sd.in_progress);
    }

    #[test]
    fn test_matches_identity_with_version() {
        let mut sd = StructureDefinition::new(
            "http://example.org/fhir/StructureDefinition/p".to_string(),
            "MyProfile".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        sd.id = Some("p".to_string());
        sd.version = Some("1.0.0".to_string());

        assert!(sd.matches_identity("MyProfile", None));
        assert!(sd.matches_identity("p", Some("1.0.0")));
        assert!(!sd.matches_identity("p", Some("2.0.0")));
        assert!(!sd.matches_identity("other", None));
    }

    #[test]
    fn test_element_assigned_value() {
        let mut elem = ElementDefinition::new("Patient.gender");
        assert!(elem.assigned_value().is_none());

        elem.set_assigned("fixedCode", json!("male"));
        let (key, value) = elem.assigned_value().unwrap();
        assert_eq!(key, "fixedCode");
        assert_eq!(value, &json!("male"));

        // Replacing swaps out the old entry
        elem.set_assigned("patternCode", json!("female"));
        let (key, _) = elem.assigned_value().unwrap();
        assert_eq!(key, "patternCode");
        assert_eq!(elem.extra.len(), 1);
    }

    #[test]
    fn test_assignment_key_detection() {
        let mut elem = ElementDefinition::new("Patient.contact");
        // "fixed" prefix without an uppercase continuation is not an assignment
        elem.extra.insert("fixes".into(), json!(1));
        elem.extra.insert("patterned".into(), json!(1));
        assert!(elem.assigned_value().is_none());
    }

    #[test]
    fn test_standards_status_flag() {
        let mut elem = ElementDefinition::new("Patient.name");
        elem.set_standards_status("trial-use");
        assert_eq!(elem.standards_status(), Some("trial-use"));

        elem.set_standards_status("normative");
        assert_eq!(elem.standards_status(), Some("normative"));
        let extensions = elem.extra.get("extension").unwrap().as_array().unwrap();
        assert_eq!(extensions.len(), 1);
    }

    #[test]
    fn test_capture_original_and_is_modified() {
        let mut elem = ElementDefinition::new("Patient.name");
        elem.min = Some(0);
        elem.max = Some("*".to_string());
        elem.capture_original();
        assert!(!elem.is_modified());

        elem.min = Some(1);
        assert!(elem.is_modified());
    }

    #[test]
    fn test_new_element_is_always_modified() {
        let elem = ElementDefinition::new("Patient.extension");
        assert!(elem.is_modified());
    }

    #[test]
    fn test_binding_strength_rank() {
        assert!(BindingStrength::Required.rank() > BindingStrength::Extensible.rank());
        assert!(BindingStrength::Extensible.rank() > BindingStrength::Preferred.rank());
        assert!(BindingStrength::Preferred.rank() > BindingStrength::Example.rank());
    }

    #[test]
    fn test_serde_retains_unknown_properties() {
        let source = json!({
            "path": "Patient.identifier",
            "min": 0,
            "max": "*",
            "mapping": [{"identity": "v2", "map": "PID-3"}],
            "fixedString": "abc"
        });
        let elem: ElementDefinition = serde_json::from_value(source.clone()).unwrap();
        assert_eq!(elem.min, Some(0));
        assert!(elem.extra.contains_key("mapping"));
        assert_eq!(elem.assigned_value().unwrap().0, "fixedString");

        let round_tripped = serde_json::to_value(&elem).unwrap();
        assert_eq!(round_tripped["mapping"], source["mapping"]);
    }

    #[test]
    fn test_code_system_count() {
        let mut cs = CodeSystemResource::new("http://example.org/cs", "MyCS");
        let mut parent = CodeSystemConcept::new("a");
        parent.concept = Some(vec![CodeSystemConcept::new("a1"), CodeSystemConcept::new("a2")]);
        cs.add_concept(parent);
        cs.add_concept(CodeSystemConcept::new("b"));
        cs.update_count();
        assert_eq!(cs.count, Some(4));
    }
}
