//! Structure definition exporter
//!
//! Exports one FSH structure definition (Profile, Extension, Logical model,
//! or Resource) to a FHIR StructureDefinition: resolves the parent through
//! fishing (compiling it on demand when it is itself an FSH definition),
//! derives the element tree, resets metadata, and applies the definition's
//! rules in authored order as narrowing transformations.
//!
//! # Algorithm
//!
//! 1. Return the existing artifact when one with this name is already in the
//!    package (completed or in progress): export is idempotent per name
//! 2. Resolve the parent (kind defaults apply; self-parents are fatal)
//! 3. Clone the parent's element tree, rewriting root paths for logical
//!    models and resources
//! 4. Reset metadata from the definition and the configuration
//! 5. Register the artifact, still under construction, so circular lookups
//!    can observe it
//! 6. Preprocess: infer extension value[x]/extension cardinalities, apply
//!    add-element rules
//! 7. Dispatch the remaining rules in authored order; obeys rules splice
//!    their synthesized caret rules immediately after themselves
//! 8. Deferred rules are drained by the orchestrator after the whole
//!    collection's first pass
//!
//! Rule application is two-phase by convention: all fishing (which can
//! re-enter this exporter) completes before the artifact cell is mutably
//! borrowed, so re-entrant compilation never conflicts with a held borrow.

use crate::diagnostics::{codes, Location};
use crate::export::assignment::{
    self, assignment_key, fsh_value_to_json, value_for_type, AssignmentError,
};
use crate::export::build::{DeferredRule, DeferredTarget, ExportSession};
use crate::export::differential;
use crate::export::fhir_types::{
    ElementDefinition, ElementDefinitionBase, ElementDefinitionBinding, ElementDefinitionConstraint,
    ElementDefinitionType, StructureDefinition, StructureDefinitionContext,
    StructureDefinitionKind,
};
use crate::export::slicing::{self, SliceOutcome};
use crate::semantic::fishing::{FhirType, Fishable, FishedArtifact};
use crate::semantic::path_resolver::{end_of_subtree, find_by_id, resolve_element};
use crate::tank::{
    AddElementRule, AssignmentRule, BindingRule, CardRule, CaretValueRule, ContainsRule,
    DefinitionKind, FlagRule, FshValue, ObeysRule, OnlyRule, Rule, SourceDefinition,
};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Metadata properties never inherited from the parent definition
const UNINHERITED_PROPERTIES: &[&str] = &[
    "extension",
    "modifierExtension",
    "text",
    "contact",
    "identifier",
    "keyword",
    "purpose",
    "copyright",
    "useContext",
    "jurisdiction",
    "mapping",
];

static ELEMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+$").expect("valid regex"));

/// Extension carrying a logical model's type characteristics
const TYPE_CHARACTERISTICS_URL: &str =
    "http://hl7.org/fhir/StructureDefinition/structuredefinition-type-characteristics";

/// Codes of the type-characteristics value set
const TYPE_CHARACTERISTICS_CODES: &[&str] = &[
    "has-size",
    "has-range",
    "has-length",
    "can-bind",
    "has-units",
    "is-continuous",
    "can-be-target",
    "do-translations",
];

/// Fatal per-definition export errors. These abort only the current
/// definition; a partial artifact already registered stays in the package.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Parent not provided for {definition}")]
    ParentNotProvided { definition: String },

    #[error("Parent of {definition} declared as self")]
    ParentDeclaredAsSelf { definition: String },

    #[error("Parent {parent} of {definition} is not defined")]
    ParentNotDefined { definition: String, parent: String },

    #[error("Parent {parent} of {definition} is not a valid {kind} parent: {reason}")]
    ParentKindMismatch {
        definition: String,
        parent: String,
        kind: &'static str,
        reason: String,
    },

    #[error("Parent {parent} of {definition} has no snapshot elements")]
    ParentMissingSnapshot { definition: String, parent: String },

    #[error("Invalid element name '{name}' in {definition}: {reason}")]
    InvalidElementName {
        definition: String,
        name: String,
        reason: String,
    },

    #[error("InstanceOf {instance_of} of instance {definition} is not defined")]
    InstanceOfNotDefined {
        definition: String,
        instance_of: String,
    },

    #[error("Circular dependency: {definition} is already being compiled")]
    CircularDependency { definition: String },
}

impl ExportError {
    /// The diagnostic code reported when this error aborts a definition
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::ParentNotProvided { .. } => codes::PARENT_NOT_PROVIDED,
            ExportError::ParentDeclaredAsSelf { .. } => codes::PARENT_DECLARED_AS_SELF,
            ExportError::ParentNotDefined { .. } => codes::PARENT_NOT_DEFINED,
            ExportError::ParentKindMismatch { .. } => codes::PARENT_KIND_MISMATCH,
            ExportError::ParentMissingSnapshot { .. } => codes::PARENT_NOT_DEFINED,
            ExportError::InvalidElementName { .. } => codes::INVALID_ELEMENT_NAME,
            ExportError::InstanceOfNotDefined { .. } => codes::PARENT_NOT_DEFINED,
            ExportError::CircularDependency { .. } => codes::CIRCULAR_DEPENDENCY,
        }
    }
}

/// Built-in default parents for kinds that allow omitting one
fn default_parent(kind: DefinitionKind) -> Option<&'static str> {
    match kind {
        DefinitionKind::Profile => None,
        DefinitionKind::Extension => Some("Extension"),
        DefinitionKind::Logical => Some("Base"),
        DefinitionKind::Resource => Some("DomainResource"),
    }
}

/// Kind filter used when fishing for a definition's parent
fn parent_filter(kind: DefinitionKind) -> &'static [FhirType] {
    match kind {
        DefinitionKind::Profile => &[
            FhirType::Resource,
            FhirType::Type,
            FhirType::Profile,
            FhirType::Extension,
            FhirType::Logical,
        ],
        DefinitionKind::Extension => &[FhirType::Extension],
        DefinitionKind::Logical => &[FhirType::Logical, FhirType::Resource, FhirType::Type],
        DefinitionKind::Resource => &[FhirType::Resource],
    }
}

/// Exports structure-defining FSH definitions to StructureDefinitions
pub struct StructureDefinitionExporter<'a> {
    session: &'a ExportSession,
}

impl<'a> StructureDefinitionExporter<'a> {
    pub fn new(session: &'a ExportSession) -> Self {
        Self { session }
    }

    /// Export a definition, returning a handle into the package arena.
    pub fn export(
        &self,
        def: &SourceDefinition,
    ) -> Result<Rc<RefCell<StructureDefinition>>, ExportError> {
        // Idempotence: a completed or in-progress artifact wins.
        if let Some(existing) = self.find_registered(def) {
            trace!("'{}' already exported; reusing", def.name);
            return Ok(existing);
        }

        // A parent chain that loops back here before anything is registered
        // can never resolve; bail out instead of recursing forever.
        let _guard = self.session.enter_export(&def.name)?;

        debug!("Exporting {} {}", def.kind.display_name(), def.name);

        let parent_ref = match &def.parent {
            Some(parent) => parent.clone(),
            None => default_parent(def.kind)
                .ok_or_else(|| ExportError::ParentNotProvided {
                    definition: def.name.clone(),
                })?
                .to_string(),
        };

        // Guards against an otherwise-undetectable infinite resolution loop.
        if parent_ref == def.name || parent_ref == def.id {
            return Err(ExportError::ParentDeclaredAsSelf {
                definition: def.name.clone(),
            });
        }

        let parent = self
            .session
            .fish(&parent_ref, parent_filter(def.kind))
            .and_then(|artifact| artifact.as_structure())
            .ok_or_else(|| ExportError::ParentNotDefined {
                definition: def.name.clone(),
                parent: parent_ref.clone(),
            })?;

        let sd = {
            let parent = parent.borrow();
            if parent.in_progress {
                self.session.warn(
                    codes::CIRCULAR_DEPENDENCY,
                    format!(
                        "Parent {} of {} is still being compiled; the result may be structurally incomplete",
                        parent.name, def.name
                    ),
                    def.location.clone(),
                );
            }
            self.check_parent_kind(def, &parent_ref, &parent)?;
            if parent.elements().is_empty() {
                return Err(ExportError::ParentMissingSnapshot {
                    definition: def.name.clone(),
                    parent: parent_ref.clone(),
                });
            }
            self.derive(def, &parent)
        };

        if matches!(def.title.as_deref(), Some("")) || matches!(def.description.as_deref(), Some(""))
        {
            self.session.warn(
                codes::EMPTY_METADATA,
                format!("{} has an empty title or description", def.name),
                def.location.clone(),
            );
        }
        if def.kind == DefinitionKind::Resource && sd.url.starts_with("http://hl7.org/fhir/") {
            self.session.warn(
                codes::CUSTOM_RESOURCE_NAMESPACE,
                format!(
                    "Custom resource {} claims the core FHIR namespace {}",
                    def.name, sd.url
                ),
                def.location.clone(),
            );
        }

        // Register before rule application, under construction, so
        // self-referential and mutually-circular lookups can see it.
        let handle = Rc::new(RefCell::new(sd));
        differential::capture_originals(&mut handle.borrow_mut());
        self.session
            .package()
            .borrow_mut()
            .add_structure(def.kind, Rc::clone(&handle));

        let queue = self.preprocess(def, &handle)?;
        self.dispatch(def, &handle, queue);
        self.finalize(def, &handle);

        Ok(handle)
    }

    /// The artifact previously generated from this definition, if any.
    /// Matching is by name: two definitions that merely share an id are
    /// distinct (and collide later in the duplicate-id validation).
    fn find_registered(&self, def: &SourceDefinition) -> Option<Rc<RefCell<StructureDefinition>>> {
        let package = self.session.package().borrow();
        package
            .all_structures()
            .find(|sd| sd.borrow().name == def.name)
            .map(Rc::clone)
    }

    fn check_parent_kind(
        &self,
        def: &SourceDefinition,
        parent_ref: &str,
        parent: &StructureDefinition,
    ) -> Result<(), ExportError> {
        let mismatch = |kind: &'static str, reason: String| ExportError::ParentKindMismatch {
            definition: def.name.clone(),
            parent: parent_ref.to_string(),
            kind,
            reason,
        };
        match def.kind {
            DefinitionKind::Profile => Ok(()),
            DefinitionKind::Extension => {
                if parent.is_extension() {
                    Ok(())
                } else {
                    Err(mismatch(
                        "extension",
                        format!("{} does not constrain Extension", parent.name),
                    ))
                }
            }
            DefinitionKind::Logical => match parent.kind {
                StructureDefinitionKind::Logical
                | StructureDefinitionKind::Resource
                | StructureDefinitionKind::ComplexType => Ok(()),
                StructureDefinitionKind::PrimitiveType => Err(mismatch(
                    "logical",
                    format!("{} is a primitive type", parent.name),
                )),
            },
            DefinitionKind::Resource => {
                if matches!(parent.name.as_str(), "Resource" | "DomainResource") {
                    Ok(())
                } else {
                    Err(mismatch(
                        "resource",
                        format!("{} is not Resource or DomainResource", parent.name),
                    ))
                }
            }
        }
    }

    /// Clone the parent's tree and apply the metadata reset table.
    fn derive(&self, def: &SourceDefinition, parent: &StructureDefinition) -> StructureDefinition {
        let config = self.session.config();
        let mut sd = parent.clone();
        sd.in_progress = true;

        // Identity always comes from the definition.
        sd.id = Some(def.id.clone());
        sd.name = def.name.clone();
        sd.url = config.structure_definition_url(&def.id);

        // Free-text metadata comes from the definition or is cleared.
        sd.title = def.title.clone();
        sd.description = def.description.clone();

        // Publication fields are cleared for downstream tooling; version is
        // the one exception, supplied by the compilation configuration.
        sd.status = None;
        sd.date = None;
        sd.publisher = None;
        sd.experimental = None;
        sd.version = config.version.clone();
        sd.fhir_version = config.fhir_version.clone();
        for property in UNINHERITED_PROPERTIES {
            sd.extra.shift_remove(*property);
        }

        sd.base_definition = Some(parent.url.clone());
        sd.derivation = Some(
            match def.kind {
                DefinitionKind::Logical | DefinitionKind::Resource => "specialization",
                DefinitionKind::Profile | DefinitionKind::Extension => "constraint",
            }
            .to_string(),
        );
        sd.differential = None;

        match def.kind {
            DefinitionKind::Logical => {
                sd.kind = StructureDefinitionKind::Logical;
                rename_root(&mut sd, &def.name);
                sd.type_field = def.name.clone();
            }
            DefinitionKind::Resource => {
                sd.kind = StructureDefinitionKind::Resource;
                rename_root(&mut sd, &def.name);
                sd.type_field = def.name.clone();
            }
            DefinitionKind::Profile => {}
            DefinitionKind::Extension => {
                // Applies everywhere unless rules override it.
                sd.context = Some(vec![StructureDefinitionContext::element("Element")]);
            }
        }
        sd
    }

    // ------------------------------------------------------------------
    // Preprocessing
    // ------------------------------------------------------------------

    /// Infer complementary cardinalities for extensions, then apply
    /// add-new-element rules so later rules can target the new paths.
    /// Returns the remaining rules as the dispatch queue.
    fn preprocess(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
    ) -> Result<VecDeque<Rule>, ExportError> {
        let inferred = self.infer_extension_cards(def);

        let mut queue = VecDeque::new();
        for rule in &def.rules {
            match rule {
                Rule::AddElement(add) => self.apply_add_element(def, handle, add)?,
                other => queue.push_back(other.clone()),
            }
        }
        queue.extend(inferred);
        Ok(queue)
    }

    /// Extension elements carry either a value or sub-extensions, never
    /// both: constraining one side implies 0..0 on the other.
    fn infer_extension_cards(&self, def: &SourceDefinition) -> Vec<Rule> {
        #[derive(Default)]
        struct ContextUse {
            value: bool,
            value_zeroed: bool,
            extension: bool,
            extension_zeroed: bool,
            location: Location,
        }

        let mut contexts: BTreeMap<String, ContextUse> = BTreeMap::new();
        for rule in &def.rules {
            let path = rule.path();
            if path.is_empty() {
                continue;
            }
            let (prefix, last) = match path.rfind('.') {
                Some(i) => (&path[..i], &path[i + 1..]),
                None => ("", path),
            };
            let context_is_extension = (prefix.is_empty() && def.kind == DefinitionKind::Extension)
                || prefix
                    .rsplit('.')
                    .next()
                    .is_some_and(|segment| segment == "extension" || segment.starts_with("extension["));
            if !context_is_extension {
                continue;
            }

            let zeroed = matches!(rule, Rule::Card(c) if c.max.as_deref() == Some("0"));
            let usage = match contexts.entry(prefix.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(ContextUse {
                    location: rule.location().clone(),
                    ..ContextUse::default()
                }),
            };
            if last == "value[x]" || last.starts_with("value[x]") {
                usage.value |= !zeroed;
                usage.value_zeroed |= zeroed;
            } else if last == "extension" || last.starts_with("extension[") {
                usage.extension |= !zeroed;
                usage.extension_zeroed |= zeroed;
            }
        }

        let mut synthesized = Vec::new();
        for (context, usage) in contexts {
            let join = |field: &str| {
                if context.is_empty() {
                    field.to_string()
                } else {
                    format!("{context}.{field}")
                }
            };
            if usage.value && usage.extension {
                self.session.error(
                    codes::EXTENSION_VALUE_CONFLICT,
                    format!(
                        "Extension {} cannot have both a value and sub-extensions",
                        if context.is_empty() { &def.name } else { &context }
                    ),
                    usage.location.clone(),
                );
            } else if usage.value && !usage.extension && !usage.extension_zeroed {
                trace!("Inferring {} 0..0 for {}", join("extension"), def.name);
                synthesized.push(Rule::Card(CardRule {
                    path: join("extension"),
                    min: Some(0),
                    max: Some("0".to_string()),
                    location: usage.location.clone(),
                }));
            } else if usage.extension && !usage.value && !usage.value_zeroed {
                trace!("Inferring {} 0..0 for {}", join("value[x]"), def.name);
                synthesized.push(Rule::Card(CardRule {
                    path: join("value[x]"),
                    min: Some(0),
                    max: Some("0".to_string()),
                    location: usage.location.clone(),
                }));
            }
        }
        synthesized
    }

    fn apply_add_element(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &AddElementRule,
    ) -> Result<(), ExportError> {
        if !matches!(def.kind, DefinitionKind::Logical | DefinitionKind::Resource) {
            self.session.error(
                codes::ADD_ELEMENT_NOT_ALLOWED,
                format!(
                    "Cannot add element '{}' to {} {}: only logical models and resources define new elements",
                    rule.path,
                    def.kind.display_name(),
                    def.name
                ),
                rule.location.clone(),
            );
            return Ok(());
        }

        let last = rule.path.rsplit('.').next().unwrap_or(&rule.path);
        let token = last.strip_suffix("[x]").unwrap_or(last);
        if token.is_empty() || token.len() > 64 || !ELEMENT_NAME.is_match(token) {
            return Err(ExportError::InvalidElementName {
                definition: def.name.clone(),
                name: last.to_string(),
                reason: if token.len() > 64 {
                    "name exceeds 64 characters".to_string()
                } else {
                    "name must be a simple alphanumeric token".to_string()
                },
            });
        }

        // Resolve reference targets before borrowing the artifact.
        let types = self.build_element_types(&rule.types);

        let mut sd = handle.borrow_mut();
        let parent_path = match rule.path.rfind('.') {
            Some(i) => &rule.path[..i],
            None => "",
        };
        let parent_idx = match resolve_element(&mut sd, parent_path) {
            Ok(idx) => idx,
            Err(e) => {
                drop(sd);
                self.session
                    .error(codes::NO_ELEMENT_AT_PATH, e.to_string(), rule.location.clone());
                return Ok(());
            }
        };

        let parent_id = sd.elements()[parent_idx].id_or_path().to_string();
        let parent_elem_path = sd.elements()[parent_idx].path.clone();
        let new_id = format!("{parent_id}.{last}");
        let new_path = format!("{parent_elem_path}.{last}");

        if find_by_id(&sd, &new_id).is_some() {
            drop(sd);
            self.session.error(
                codes::INVALID_ELEMENT_NAME,
                format!("Element {} already exists in {}", new_path, def.name),
                rule.location.clone(),
            );
            return Ok(());
        }

        let insert_at = end_of_subtree(&sd, parent_idx, &parent_id);
        let mut element = ElementDefinition::new(new_path.clone());
        element.id = Some(new_id);
        element.min = Some(rule.min);
        element.max = Some(rule.max.clone());
        element.base = Some(ElementDefinitionBase {
            path: new_path,
            min: rule.min,
            max: rule.max.clone(),
        });
        element.type_ = Some(types);
        element.short = rule.short.clone();
        element.definition = rule.definition.clone().or_else(|| rule.short.clone());
        sd.elements_mut().insert(insert_at, element);
        Ok(())
    }

    /// Build element types from only-rule items, merging reference and
    /// canonical targets into single Reference/canonical entries.
    fn build_element_types(&self, items: &[crate::tank::OnlyRuleType]) -> Vec<ElementDefinitionType> {
        let mut types = Vec::new();
        let mut reference_targets = Vec::new();
        let mut canonical_targets = Vec::new();
        for item in items {
            if item.reference {
                reference_targets.push(self.resolve_type_url(&item.type_));
            } else if item.canonical {
                canonical_targets.push(self.resolve_type_url(&item.type_));
            } else {
                types.push(ElementDefinitionType::new(item.type_.clone()));
            }
        }
        if !reference_targets.is_empty() {
            let mut reference = ElementDefinitionType::new("Reference");
            reference.target_profile = Some(reference_targets);
            types.push(reference);
        }
        if !canonical_targets.is_empty() {
            let mut canonical = ElementDefinitionType::new("canonical");
            canonical.target_profile = Some(canonical_targets);
            types.push(canonical);
        }
        types
    }

    /// Canonical URL for a type reference, falling back to the FHIR core
    /// pattern when nothing is fishable under that name.
    fn resolve_type_url(&self, name: &str) -> String {
        self.session
            .fish_metadata(
                name,
                &[
                    FhirType::Resource,
                    FhirType::Type,
                    FhirType::Profile,
                    FhirType::Logical,
                ],
            )
            .and_then(|meta| meta.url)
            .unwrap_or_else(|| format!("http://hl7.org/fhir/StructureDefinition/{name}"))
    }

    // ------------------------------------------------------------------
    // Rule dispatch
    // ------------------------------------------------------------------

    fn dispatch(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        mut queue: VecDeque<Rule>,
    ) {
        while let Some(rule) = queue.pop_front() {
            match rule {
                Rule::Card(r) => self.apply_card(def, handle, &r),
                Rule::Flag(r) => self.apply_flag(def, handle, &r),
                Rule::Binding(r) => self.apply_binding(def, handle, &r),
                Rule::Only(r) => self.apply_only(def, handle, &r),
                Rule::Contains(r) => self.apply_contains(def, handle, &r),
                Rule::CaretValue(r) => self.apply_caret(def, handle, &r),
                Rule::Obeys(r) => {
                    // Synthesized caret rules are processed before later
                    // unrelated rules, in their original relative order.
                    for spliced in self.apply_obeys(def, handle, &r).into_iter().rev() {
                        queue.push_front(Rule::CaretValue(spliced));
                    }
                }
                Rule::Assignment(r) => self.apply_assignment(def, handle, &r),
                Rule::AddElement(r) => {
                    // Already handled during preprocessing; reaching here
                    // means a synthesized rule misfired.
                    warn!("Unexpected add-element rule for {} in dispatch", r.path);
                }
            }
        }
    }

    /// Resolve a rule path under an active borrow, reporting the standard
    /// per-rule diagnostic on failure.
    fn resolve_or_report(
        &self,
        def: &SourceDefinition,
        sd: &mut StructureDefinition,
        path: &str,
        location: &Location,
    ) -> Option<usize> {
        match resolve_element(sd, path) {
            Ok(idx) => Some(idx),
            Err(e) => {
                self.session.error(
                    codes::NO_ELEMENT_AT_PATH,
                    format!("{} (in {})", e, def.name),
                    location.clone(),
                );
                None
            }
        }
    }

    fn apply_card(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &CardRule,
    ) {
        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };

        let element = &sd.elements()[idx];
        let current_min = element.min.unwrap_or(0);
        let current_max = element.max.clone().unwrap_or_else(|| "*".to_string());
        let new_min = rule.min.unwrap_or(current_min);
        let new_max = rule.max.clone().unwrap_or_else(|| current_max.clone());

        let widens_min = new_min < current_min;
        let widens_max = match (new_max.as_str(), current_max.as_str()) {
            (_, "*") => false,
            ("*", _) => true,
            (new, current) => {
                new.parse::<u32>().unwrap_or(0) > current.parse::<u32>().unwrap_or(0)
            }
        };
        let inverted = new_max != "*" && new_min > new_max.parse::<u32>().unwrap_or(0);

        if widens_min || widens_max || inverted {
            self.session.error(
                codes::CARDINALITY_NOT_NARROWING,
                format!(
                    "Cannot constrain {} from {}..{} to {}..{}",
                    rule.path, current_min, current_max, new_min, new_max
                ),
                rule.location.clone(),
            );
            return;
        }

        let element = &mut sd.elements_mut()[idx];
        element.min = Some(new_min);
        element.max = Some(new_max);
    }

    fn apply_flag(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &FlagRule,
    ) {
        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };
        let element = &mut sd.elements_mut()[idx];
        if let Some(ms) = rule.must_support {
            element.must_support = Some(ms);
        }
        if let Some(summary) = rule.summary {
            element.is_summary = Some(summary);
        }
        if let Some(modifier) = rule.modifier {
            element.is_modifier = Some(modifier);
        }
        if rule.trial_use == Some(true) {
            element.set_standards_status("trial-use");
        }
        if rule.normative == Some(true) {
            element.set_standards_status("normative");
        }
        if rule.draft == Some(true) {
            element.set_standards_status("draft");
        }
    }

    fn apply_binding(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &BindingRule,
    ) {
        // Resolve the value set reference before borrowing the artifact.
        let value_set_url = {
            let fished = self.session.fish_metadata(&rule.value_set, &[FhirType::ValueSet]);
            match fished {
                Some(meta) => meta.url.unwrap_or_else(|| rule.value_set.clone()),
                None => {
                    let as_code_system =
                        self.session.fish_metadata(&rule.value_set, &[FhirType::CodeSystem]);
                    if as_code_system.is_some() {
                        self.session.error(
                            codes::BINDING_KIND_MISMATCH,
                            format!(
                                "{} is a code system; bindings require a value set",
                                rule.value_set
                            ),
                            rule.location.clone(),
                        );
                        return;
                    }
                    // An external canonical the engine has not loaded.
                    rule.value_set.clone()
                }
            }
        };

        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };

        let element = &mut sd.elements_mut()[idx];
        if let Some(existing) = &element.binding
            && rule.strength.rank() < existing.strength.rank()
        {
            self.session.error(
                codes::BINDING_STRENGTH_WIDENED,
                format!(
                    "Cannot weaken binding strength of {} from {} to {}",
                    rule.path,
                    existing.strength.as_str(),
                    rule.strength.as_str()
                ),
                rule.location.clone(),
            );
            return;
        }

        let description = element.binding.as_ref().and_then(|b| b.description.clone());
        element.binding = Some(ElementDefinitionBinding {
            strength: rule.strength,
            description,
            value_set: Some(value_set_url),
        });
    }

    fn apply_only(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &OnlyRule,
    ) {
        // Resolve every named type up front; profiles narrow by
        // profile-of-the-existing-code.
        let resolved: Vec<_> = rule
            .types
            .iter()
            .map(|item| {
                let meta = self.session.fish_metadata(
                    &item.type_,
                    &[
                        FhirType::Profile,
                        FhirType::Extension,
                        FhirType::Logical,
                        FhirType::Resource,
                        FhirType::Type,
                    ],
                );
                (item.clone(), meta)
            })
            .collect();

        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };

        let current_types = sd.elements()[idx].type_.clone().unwrap_or_default();
        let current_codes: Vec<&str> = current_types.iter().map(|t| t.code.as_str()).collect();

        let mut plain_types: Vec<ElementDefinitionType> = Vec::new();
        let mut reference_targets: Vec<String> = Vec::new();
        let mut canonical_targets: Vec<String> = Vec::new();
        let mut narrowed_plain = false;

        for (item, meta) in &resolved {
            if item.reference || item.canonical {
                let url = meta
                    .as_ref()
                    .and_then(|m| m.url.clone())
                    .unwrap_or_else(|| {
                        format!("http://hl7.org/fhir/StructureDefinition/{}", item.type_)
                    });
                if item.reference {
                    reference_targets.push(url);
                } else {
                    canonical_targets.push(url);
                }
                continue;
            }

            narrowed_plain = true;
            if current_codes.contains(&item.type_.as_str()) {
                plain_types.push(ElementDefinitionType::new(item.type_.clone()));
            } else if let Some(meta) = meta
                && let Some(constrained) = &meta.type_field
                && current_codes.contains(&constrained.as_str())
            {
                // A profile of one of the allowed codes.
                let mut profiled = ElementDefinitionType::new(constrained.clone());
                profiled.profile = meta.url.clone().map(|url| vec![url]);
                plain_types.push(profiled);
            } else {
                self.session.error(
                    codes::TYPE_NOT_SUBSET,
                    format!(
                        "Cannot constrain {} to {}: not a subset of the allowed types [{}]",
                        rule.path,
                        item.type_,
                        current_codes.join(", ")
                    ),
                    rule.location.clone(),
                );
                return;
            }
        }

        // Reference and canonical target lists narrow independently.
        let mut narrowed_types = Vec::new();
        for (code, targets) in [("Reference", &reference_targets), ("canonical", &canonical_targets)]
        {
            if targets.is_empty() {
                continue;
            }
            let Some(existing) = current_types.iter().find(|t| t.code == code) else {
                self.session.error(
                    codes::TYPE_NOT_SUBSET,
                    format!("Cannot constrain {}: element has no {} type", rule.path, code),
                    rule.location.clone(),
                );
                return;
            };
            if let Some(existing_targets) = &existing.target_profile {
                let subset = targets.iter().all(|t| {
                    existing_targets.contains(t)
                        || existing_targets
                            .iter()
                            .any(|e| e.ends_with("/Resource") || e.ends_with("/Any"))
                });
                if !subset {
                    self.session.error(
                        codes::TYPE_NOT_SUBSET,
                        format!(
                            "Cannot constrain {} targets of {}: not a subset of the allowed targets",
                            code, rule.path
                        ),
                        rule.location.clone(),
                    );
                    return;
                }
            }
            let mut narrowed = ElementDefinitionType::new(code);
            narrowed.target_profile = Some(targets.clone());
            narrowed_types.push(narrowed);
        }

        // Assemble the new type list: plain replacements (when given),
        // narrowed reference/canonical entries, untouched entries otherwise.
        let mut new_types = plain_types;
        for existing in &current_types {
            match existing.code.as_str() {
                "Reference" | "canonical" => {
                    if let Some(narrowed) = narrowed_types.iter().find(|t| t.code == existing.code) {
                        new_types.push(narrowed.clone());
                    } else if !narrowed_plain {
                        new_types.push(existing.clone());
                    }
                }
                _ if !narrowed_plain => new_types.push(existing.clone()),
                _ => {}
            }
        }

        sd.elements_mut()[idx].type_ = Some(new_types);
    }

    fn apply_contains(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &ContainsRule,
    ) {
        // Resolve declared extension types before borrowing the artifact.
        let resolved: Vec<_> = rule
            .items
            .iter()
            .map(|item| {
                let url = item.type_.as_ref().and_then(|type_ref| {
                    self.session
                        .fish_metadata(type_ref, &[FhirType::Extension])
                        .and_then(|meta| meta.url)
                });
                (item.clone(), url)
            })
            .collect();

        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };

        let base_id = sd.elements()[idx].id_or_path().to_string();
        let extension_valued = sd.elements()[idx].is_extension_valued();
        let sliceable = extension_valued
            || sd.elements()[idx].is_repeating()
            || sd.elements()[idx].is_choice();

        if !sliceable {
            self.session.error(
                codes::INVALID_SLICE_TARGET,
                format!(
                    "Cannot slice {}: element does not repeat and is not a choice",
                    rule.path
                ),
                rule.location.clone(),
            );
            return;
        }

        for (item, url) in resolved {
            if extension_valued {
                if item.type_.is_some() && url.is_none() {
                    self.session.error(
                        codes::SLICE_TYPE_NOT_FOUND,
                        format!(
                            "Extension {} for slice {} of {} is not defined",
                            item.type_.as_deref().unwrap_or(""),
                            item.name,
                            rule.path
                        ),
                        rule.location.clone(),
                    );
                    continue;
                }
                match slicing::declare_extension_slice(&mut sd, &base_id, &item.name, url.as_deref())
                {
                    SliceOutcome::Created => {}
                    SliceOutcome::ReDeclaredIdentical => {
                        self.session.warn(
                            codes::DUPLICATE_SLICE,
                            format!("Slice {} of {} is declared more than once", item.name, rule.path),
                            rule.location.clone(),
                        );
                    }
                    SliceOutcome::ConflictingProfile { existing } => {
                        self.session.error(
                            codes::SLICE_CONFLICT,
                            format!(
                                "Slice {} of {} is already bound to {}",
                                item.name, rule.path, existing
                            ),
                            rule.location.clone(),
                        );
                    }
                }
            } else {
                if item.type_.is_some() {
                    self.session.error(
                        codes::INVALID_SLICE_TARGET,
                        format!(
                            "Slice {} of {} cannot declare a type: {} is not extension-valued",
                            item.name, rule.path, rule.path
                        ),
                        rule.location.clone(),
                    );
                    continue;
                }
                if slicing::declare_plain_slice(&mut sd, &base_id, &item.name)
                    == SliceOutcome::ReDeclaredIdentical
                {
                    self.session.warn(
                        codes::DUPLICATE_SLICE,
                        format!("Slice {} of {} is declared more than once", item.name, rule.path),
                        rule.location.clone(),
                    );
                }
            }
        }
    }

    fn apply_obeys(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &ObeysRule,
    ) -> Vec<CaretValueRule> {
        let mut spliced = Vec::new();
        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return spliced;
        };

        for name in &rule.invariants {
            let Some(invariant) = self.session.tank().invariant(name) else {
                self.session.error(
                    codes::INVARIANT_NOT_FOUND,
                    format!("Invariant {name} is not defined"),
                    rule.location.clone(),
                );
                continue;
            };

            let element = &mut sd.elements_mut()[idx];
            let constraints = element.constraint.get_or_insert_with(Vec::new);
            constraints.push(ElementDefinitionConstraint {
                key: invariant.name.clone(),
                severity: Some(invariant.severity.clone()),
                human: invariant.description.clone(),
                expression: invariant.expression.clone(),
                xpath: invariant.xpath.clone(),
                extra: Default::default(),
            });
            let constraint_index = constraints.len() - 1;

            spliced.extend(invariant.rules.iter().map(|field_rule| CaretValueRule {
                path: rule.path.clone(),
                caret_path: format!("constraint[{constraint_index}].{}", field_rule.caret_path),
                value: field_rule.value.clone(),
                location: rule.location.clone(),
            }));
        }
        spliced
    }

    fn apply_caret(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &CaretValueRule,
    ) {
        // Logical-model characteristics land in the type-characteristics
        // extension rather than a StructureDefinition property.
        if rule.path.is_empty()
            && (rule.caret_path == "characteristics"
                || rule.caret_path.starts_with("characteristics["))
        {
            self.apply_characteristic(def, handle, rule);
            return;
        }

        // Resolve instance-valued assignments first; a not-yet-compiled
        // instance sends the rule to the deferred queue.
        let value = match &rule.value {
            FshValue::InstanceRef(name) => {
                let fished = self.session.fish(name, &[FhirType::Instance]);
                match fished {
                    Some(artifact) => artifact.to_json(),
                    None => {
                        self.session.defer(DeferredRule {
                            as_reference: false,
                            target: DeferredTarget::Structure(Rc::clone(handle)),
                            definition: def.name.clone(),
                            path: rule.path.clone(),
                            caret_path: Some(rule.caret_path.clone()),
                            exactly: false,
                            instance: name.clone(),
                            suppressed: None,
                            location: rule.location.clone(),
                        });
                        return;
                    }
                }
            }
            FshValue::Reference(target) => self.resolve_reference_value(target),
            other => fsh_value_to_json(other),
        };

        if let Err(error) = apply_caret_value(handle, &rule.path, &rule.caret_path, value) {
            // A number or boolean that fails type checking may really be an
            // instance id; retry as a deferred instance lookup.
            if matches!(error, CaretError::Assignment(AssignmentError::TypeMismatch { .. }))
                && rule.value.could_be_instance_id()
            {
                if let Some(instance) = rule.value.as_instance_id() {
                    self.session.defer(DeferredRule {
                        as_reference: false,
                        target: DeferredTarget::Structure(Rc::clone(handle)),
                        definition: def.name.clone(),
                        path: rule.path.clone(),
                        caret_path: Some(rule.caret_path.clone()),
                        exactly: false,
                        instance,
                        suppressed: Some(error.to_string()),
                        location: rule.location.clone(),
                    });
                    return;
                }
            }
            self.report_caret_error(def, &rule.caret_path, error, &rule.location);
        }
    }

    fn apply_characteristic(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &CaretValueRule,
    ) {
        let code = match &rule.value {
            FshValue::Code(code) => code.code.clone(),
            FshValue::String(text) => text.clone(),
            _ => {
                self.session.error(
                    codes::VALUE_TYPE_MISMATCH,
                    format!("Characteristic of {} must be a code", def.name),
                    rule.location.clone(),
                );
                return;
            }
        };
        if !TYPE_CHARACTERISTICS_CODES.contains(&code.as_str()) {
            self.session.warn(
                codes::UNRECOGNIZED_CHARACTERISTIC,
                format!("Unrecognized characteristic code {} on {}", code, def.name),
                rule.location.clone(),
            );
        }

        let mut sd = handle.borrow_mut();
        let entry = serde_json::json!({
            "url": TYPE_CHARACTERISTICS_URL,
            "valueCode": code,
        });
        let extensions = sd
            .extra
            .entry("extension".to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let JsonValue::Array(items) = extensions {
            items.push(entry);
        }
    }

    fn report_caret_error(
        &self,
        def: &SourceDefinition,
        caret_path: &str,
        error: CaretError,
        location: &Location,
    ) {
        let code = match &error {
            CaretError::Path(_) => codes::NO_ELEMENT_AT_PATH,
            CaretError::Assignment(AssignmentError::UnknownProperty { .. })
            | CaretError::Assignment(AssignmentError::InvalidPath(_)) => {
                codes::INVALID_PROPERTY_PATH
            }
            CaretError::Assignment(_) => codes::VALUE_TYPE_MISMATCH,
        };
        self.session.error(
            code,
            format!("Cannot assign ^{} (in {}): {}", caret_path, def.name, error),
            location.clone(),
        );
    }

    /// Resolve a Reference() target: a known instance becomes "Type/id",
    /// anything else is kept as the literal reference.
    fn resolve_reference_value(&self, target: &str) -> JsonValue {
        let fished = self.session.fish(target, &[FhirType::Instance]);
        match fished {
            Some(artifact) => {
                let meta = artifact.metadata();
                match (meta.resource_type.as_str(), meta.id) {
                    (resource_type, Some(id)) if resource_type != "Unknown" => {
                        serde_json::json!({ "reference": format!("{resource_type}/{id}") })
                    }
                    _ => serde_json::json!({ "reference": target }),
                }
            }
            None => serde_json::json!({ "reference": target }),
        }
    }

    fn apply_assignment(
        &self,
        def: &SourceDefinition,
        handle: &Rc<RefCell<StructureDefinition>>,
        rule: &AssignmentRule,
    ) {
        // Phase A: resolve embedded references and instances.
        let prepared = match &rule.value {
            FshValue::Reference(target) => {
                Prepared::Typed("Reference".to_string(), self.resolve_reference_value(target))
            }
            FshValue::InstanceRef(name) => {
                let fished = self.session.fish(name, &[FhirType::Instance]);
                match fished {
                    Some(artifact) => {
                        let type_hint = match &artifact {
                            FishedArtifact::Instance(instance) => {
                                instance.borrow().instance_of.clone()
                            }
                            _ => artifact.metadata().resource_type,
                        };
                        Prepared::Typed(type_hint, artifact.to_json())
                    }
                    None => {
                        self.session.defer(DeferredRule {
                            as_reference: false,
                            target: DeferredTarget::Structure(Rc::clone(handle)),
                            definition: def.name.clone(),
                            path: rule.path.clone(),
                            caret_path: None,
                            exactly: rule.exactly,
                            instance: name.clone(),
                            suppressed: None,
                            location: rule.location.clone(),
                        });
                        return;
                    }
                }
            }
            other => Prepared::Fsh(other.clone()),
        };

        // Phase B: type-check against the element's allowed types and set.
        let mut sd = handle.borrow_mut();
        let Some(idx) = self.resolve_or_report(def, &mut sd, &rule.path, &rule.location) else {
            return;
        };

        let allowed = sd.elements()[idx].type_.clone().unwrap_or_default();
        let matched = match &prepared {
            Prepared::Fsh(value) => allowed.iter().find_map(|t| {
                value_for_type(value, &t.code).map(|json| (t.code.clone(), json))
            }),
            Prepared::Typed(type_hint, json) => allowed
                .iter()
                .find(|t| t.code == *type_hint)
                .map(|t| (t.code.clone(), json.clone())),
        };

        let Some((type_code, json)) = matched else {
            let allowed_codes: Vec<&str> = allowed.iter().map(|t| t.code.as_str()).collect();
            if let Prepared::Fsh(value) = &prepared
                && value.could_be_instance_id()
                && let Some(instance) = value.as_instance_id()
            {
                drop(sd);
                self.session.defer(DeferredRule {
                    as_reference: false,
                    target: DeferredTarget::Structure(Rc::clone(handle)),
                    definition: def.name.clone(),
                    path: rule.path.clone(),
                    caret_path: None,
                    exactly: rule.exactly,
                    instance,
                    suppressed: Some(format!(
                        "Value does not match any allowed type of {} [{}]",
                        rule.path,
                        allowed_codes.join(", ")
                    )),
                    location: rule.location.clone(),
                });
                return;
            }
            self.session.error(
                codes::VALUE_TYPE_MISMATCH,
                format!(
                    "Value does not match any allowed type of {} [{}] (in {})",
                    rule.path,
                    allowed_codes.join(", "),
                    def.name
                ),
                rule.location.clone(),
            );
            return;
        };

        let key = assignment_key(if rule.exactly { "fixed" } else { "pattern" }, &type_code);
        let element = &mut sd.elements_mut()[idx];
        if let Some((existing_key, existing_value)) = element.assigned_value() {
            if existing_value == &json {
                // Same value: a no-op, unless it upgrades a pattern to fixed.
                if existing_key.starts_with("pattern") && rule.exactly {
                    element.set_assigned(key, json);
                }
                return;
            }
            self.session.error(
                codes::CONFLICTING_FIXED_VALUE,
                format!(
                    "Cannot assign {} at {}: already fixed to a different value (in {})",
                    key, rule.path, def.name
                ),
                rule.location.clone(),
            );
            return;
        }
        element.set_assigned(key, json);
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn finalize(&self, def: &SourceDefinition, handle: &Rc<RefCell<StructureDefinition>>) {
        {
            let mut sd = handle.borrow_mut();

            // An extension's url element is fixed automatically unless a
            // rule already set it.
            if def.kind == DefinitionKind::Extension {
                let url = sd.url.clone();
                let root = sd.root_path().unwrap_or("Extension").to_string();
                let url_path = format!("{root}.url");
                if let Some(element) = sd
                    .elements_mut()
                    .iter_mut()
                    .find(|e| e.path == url_path && e.slice_name.is_none())
                    && !element.extra.contains_key("fixedUri")
                {
                    element.extra.insert("fixedUri".to_string(), JsonValue::String(url));
                }
            }

            sd.differential = Some(differential::generate_differential(&sd));
            sd.in_progress = false;
        }

        // The id must be unique across definitional artifacts; a collision
        // is an error but both artifacts remain.
        let id = handle.borrow().id.clone();
        if let Some(id) = id {
            let conflicting = self.session.package().borrow().has_conflicting_id(&id, handle);
            if conflicting {
                self.session.error(
                    codes::DUPLICATE_ARTIFACT_ID,
                    format!("Multiple artifacts share the id {id}"),
                    def.location.clone(),
                );
            }
        }
        debug!("Finished exporting {}", def.name);
    }
}

/// Rewrite every element path's leading segment from the parent's root to
/// the new type name (logical models and resources coin their own root
/// path), and reset the root element's base path to itself.
fn rename_root(sd: &mut StructureDefinition, new_name: &str) {
    let Some(old_root) = sd.root_path().map(String::from) else {
        return;
    };
    let old_prefix = format!("{old_root}.");

    for element in sd.elements_mut() {
        if element.path == old_root {
            element.path = new_name.to_string();
        } else if let Some(rest) = element.path.strip_prefix(&old_prefix) {
            element.path = format!("{new_name}.{rest}");
        }
        if let Some(id) = element.id.clone() {
            if id == old_root {
                element.id = Some(new_name.to_string());
            } else if let Some(rest) = id.strip_prefix(&old_prefix) {
                element.id = Some(format!("{new_name}.{rest}"));
            }
        }
    }

    if let Some(root) = sd.elements_mut().first_mut() {
        let min = root.min.unwrap_or(0);
        let max = root.max.clone().unwrap_or_else(|| "*".to_string());
        root.base = Some(ElementDefinitionBase {
            path: root.path.clone(),
            min,
            max,
        });
    }
}

/// Prepared right-hand side of an assignment rule
enum Prepared {
    /// A plain FSH value, typed against the element's allowed types
    Fsh(FshValue),
    /// A value whose FHIR type is already known (references, instances)
    Typed(String, JsonValue),
}

/// Errors applying a caret value, distinguishing path failures from
/// assignment failures.
#[derive(Debug, Error)]
pub enum CaretError {
    #[error(transparent)]
    Path(#[from] crate::semantic::path_resolver::PathError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),
}

/// Assign a caret value on an artifact (empty path) or one of its elements.
pub fn apply_caret_value(
    handle: &Rc<RefCell<StructureDefinition>>,
    path: &str,
    caret_path: &str,
    value: JsonValue,
) -> Result<(), CaretError> {
    let mut sd = handle.borrow_mut();
    if path.is_empty() {
        assignment::assign_on_structure(&mut sd, caret_path, value)?;
    } else {
        let idx = resolve_element(&mut sd, path)?;
        let element = &mut sd.elements_mut()[idx];
        assignment::assign_on_element(element, caret_path, value)?;
    }
    Ok(())
}

/// Retry one deferred rule after the whole collection's first pass.
///
/// A rule whose instance still cannot be resolved logs the originally
/// suppressed error (or a generic not-found) and is dropped.
pub fn apply_deferred(session: &ExportSession, deferred: DeferredRule) {
    let fished = session.fish(&deferred.instance, &[FhirType::Instance]);
    let Some(artifact) = fished else {
        let message = deferred.suppressed.unwrap_or_else(|| {
            format!("Resource not found: {}", deferred.instance)
        });
        session.error(codes::INSTANCE_NOT_FOUND, message, deferred.location);
        return;
    };

    match &deferred.target {
        DeferredTarget::Structure(handle) => {
            let json = artifact.to_json();
            if let Some(caret_path) = &deferred.caret_path {
                if let Err(error) = apply_caret_value(handle, &deferred.path, caret_path, json) {
                    session.error(
                        codes::VALUE_TYPE_MISMATCH,
                        format!(
                            "Cannot assign deferred ^{} (in {}): {}",
                            caret_path, deferred.definition, error
                        ),
                        deferred.location,
                    );
                }
            } else {
                apply_deferred_fixed(session, handle, &artifact, &deferred);
            }
        }
        DeferredTarget::Instance(handle) => {
            let json = if deferred.as_reference {
                crate::export::instance_exporter::reference_to(&artifact)
            } else {
                artifact.to_json()
            };
            let mut instance = handle.borrow_mut();
            if let Err(error) =
                assignment::set_json_property(&mut instance.resource, &deferred.path, json)
            {
                drop(instance);
                session.error(
                    codes::INVALID_PROPERTY_PATH,
                    format!(
                        "Cannot assign deferred {} on instance {}: {}",
                        deferred.path, deferred.definition, error
                    ),
                    deferred.location,
                );
            }
        }
    }
}

fn apply_deferred_fixed(
    session: &ExportSession,
    handle: &Rc<RefCell<StructureDefinition>>,
    artifact: &FishedArtifact,
    deferred: &DeferredRule,
) {
    let type_hint = match artifact {
        FishedArtifact::Instance(instance) => instance.borrow().instance_of.clone(),
        _ => artifact.metadata().resource_type,
    };
    let json = artifact.to_json();

    let mut sd = handle.borrow_mut();
    let idx = match resolve_element(&mut sd, &deferred.path) {
        Ok(idx) => idx,
        Err(e) => {
            drop(sd);
            session.error(codes::NO_ELEMENT_AT_PATH, e.to_string(), deferred.location.clone());
            return;
        }
    };

    let allowed = sd.elements()[idx].type_.clone().unwrap_or_default();
    let Some(matched) = allowed.iter().find(|t| t.code == type_hint) else {
        drop(sd);
        session.error(
            codes::VALUE_TYPE_MISMATCH,
            format!(
                "Instance {} ({}) does not match any allowed type of {} (in {})",
                deferred.instance, type_hint, deferred.path, deferred.definition
            ),
            deferred.location.clone(),
        );
        return;
    };

    let key = assignment_key(if deferred.exactly { "fixed" } else { "pattern" }, &matched.code);
    let element = &mut sd.elements_mut()[idx];
    if let Some((_, existing_value)) = element.assigned_value() {
        if existing_value == &json {
            return;
        }
        drop(sd);
        session.error(
            codes::CONFLICTING_FIXED_VALUE,
            format!(
                "Cannot assign {} at {}: already fixed to a different value (in {})",
                key, deferred.path, deferred.definition
            ),
            deferred.location.clone(),
        );
        return;
    }
    element.set_assigned(key, json);
}
