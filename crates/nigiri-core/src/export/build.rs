//! Export session and orchestrator
//!
//! [`ExportSession`] holds everything one compilation run shares: the tank
//! of parsed definitions, the base definition store, the output package, the
//! configuration, the diagnostics collector, and the deferred-rule queue.
//! It implements the composed fishing dispatcher: package first, then the
//! base library, then the tank: where a hit triggers on-demand compilation.
//!
//! [`ExportOrchestrator`] drives the two-phase pipeline over a session:
//! phase one exports every source definition in source order (a fatal
//! failure aborts only that definition), phase two drains the deferred-rule
//! queue in FIFO order.

use crate::canonical::DefinitionStore;
use crate::config::ExportConfiguration;
use crate::diagnostics::{Diagnostic, DiagnosticCollector, Location};
use crate::export::codesystem_exporter::CodeSystemExporter;
use crate::export::fhir_types::{ExportedInstance, StructureDefinition};
use crate::export::instance_exporter::InstanceExporter;
use crate::export::package::Package;
use crate::export::structure_exporter::{
    apply_deferred, ExportError, StructureDefinitionExporter,
};
use crate::export::valueset_exporter::ValueSetExporter;
use crate::semantic::fishing::{
    parse_identity, FhirType, Fishable, FishedArtifact, DEFAULT_FISHING_ORDER,
};
use crate::tank::{FshTank, InstanceDefinition, SourceDefinition, TankItem};
use std::cell::{Ref, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// What a deferred rule mutates once its instance resolves
#[derive(Debug, Clone)]
pub enum DeferredTarget {
    Structure(Rc<RefCell<StructureDefinition>>),
    Instance(Rc<RefCell<ExportedInstance>>),
}

/// A rule that named a not-yet-compiled instance, replayed after the whole
/// collection's first pass completes.
#[derive(Debug, Clone)]
pub struct DeferredRule {
    pub target: DeferredTarget,
    /// Name of the definition the rule belongs to (for messages)
    pub definition: String,
    /// Element path (structures) or property path (instances)
    pub path: String,
    /// Caret path when the rule was a caret rule
    pub caret_path: Option<String>,
    /// fixed[x] vs pattern[x] for fixed-value rules
    pub exactly: bool,
    /// The referenced instance name
    pub instance: String,
    /// Emit a relative reference instead of inlining the instance
    pub as_reference: bool,
    /// The error suppressed when the rule was deferred, re-reported if the
    /// instance never resolves
    pub suppressed: Option<String>,
    pub location: Location,
}

/// Shared state of one compilation run
pub struct ExportSession {
    tank: FshTank,
    store: DefinitionStore,
    config: ExportConfiguration,
    package: RefCell<Package>,
    diagnostics: RefCell<DiagnosticCollector>,
    deferred: RefCell<VecDeque<DeferredRule>>,
    /// Names whose export failed fatally; retried lookups skip them
    failed: RefCell<HashSet<String>>,
    /// Export stack for detecting unresolvable parent cycles
    in_flight: RefCell<Vec<String>>,
}

impl ExportSession {
    pub fn new(tank: FshTank, store: DefinitionStore, config: ExportConfiguration) -> Self {
        Self {
            tank,
            store,
            config,
            package: RefCell::new(Package::new()),
            diagnostics: RefCell::new(DiagnosticCollector::new()),
            deferred: RefCell::new(VecDeque::new()),
            failed: RefCell::new(HashSet::new()),
            in_flight: RefCell::new(Vec::new()),
        }
    }

    pub fn tank(&self) -> &FshTank {
        &self.tank
    }

    pub fn store(&self) -> &DefinitionStore {
        &self.store
    }

    pub fn config(&self) -> &ExportConfiguration {
        &self.config
    }

    pub fn package(&self) -> &RefCell<Package> {
        &self.package
    }

    /// The diagnostics collected so far
    pub fn diagnostics(&self) -> Ref<'_, DiagnosticCollector> {
        self.diagnostics.borrow()
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        self.diagnostics.borrow_mut().report(diagnostic);
    }

    pub fn error(&self, code: &str, message: impl Into<String>, location: Location) {
        let message = message.into();
        warn!("{code}: {message}");
        self.diagnostics.borrow_mut().error(code, message, location);
    }

    pub fn warn(&self, code: &str, message: impl Into<String>, location: Location) {
        let message = message.into();
        debug!("{code}: {message}");
        self.diagnostics.borrow_mut().warning(code, message, location);
    }

    /// Queue a rule for replay after the first pass
    pub fn defer(&self, rule: DeferredRule) {
        debug!(
            "Deferring rule on '{}' of {} until instance {} is available",
            rule.path, rule.definition, rule.instance
        );
        self.deferred.borrow_mut().push_back(rule);
    }

    pub(crate) fn take_deferred(&self) -> VecDeque<DeferredRule> {
        std::mem::take(&mut self.deferred.borrow_mut())
    }

    pub(crate) fn has_failed(&self, name: &str) -> bool {
        self.failed.borrow().contains(name)
    }

    fn record_failure(&self, name: &str, id: &str) {
        let mut failed = self.failed.borrow_mut();
        failed.insert(name.to_string());
        failed.insert(id.to_string());
    }

    /// Enter the export of a named definition, failing when the definition
    /// is already on the stack (an unresolvable parent cycle).
    pub(crate) fn enter_export(&self, name: &str) -> Result<FlightGuard<'_>, ExportError> {
        let mut in_flight = self.in_flight.borrow_mut();
        if in_flight.iter().any(|n| n == name) {
            return Err(ExportError::CircularDependency {
                definition: name.to_string(),
            });
        }
        in_flight.push(name.to_string());
        Ok(FlightGuard { session: self })
    }

    /// Export a structure definition, logging a fatal failure as a
    /// diagnostic instead of propagating it.
    pub(crate) fn export_structure_logged(
        &self,
        def: &SourceDefinition,
    ) -> Option<Rc<RefCell<StructureDefinition>>> {
        if self.has_failed(&def.name) {
            return None;
        }
        match StructureDefinitionExporter::new(self).export(def) {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.error(e.code(), e.to_string(), def.location.clone());
                self.record_failure(&def.name, &def.id);
                None
            }
        }
    }

    pub(crate) fn export_instance_logged(
        &self,
        def: &InstanceDefinition,
    ) -> Option<Rc<RefCell<ExportedInstance>>> {
        if self.has_failed(&def.name) {
            return None;
        }
        match InstanceExporter::new(self).export(def) {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.error(e.code(), e.to_string(), def.location.clone());
                self.record_failure(&def.name, &def.id);
                None
            }
        }
    }
}

/// Pops the in-flight stack when an export completes or aborts
pub(crate) struct FlightGuard<'a> {
    session: &'a ExportSession,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.session.in_flight.borrow_mut().pop();
    }
}

impl Fishable for ExportSession {
    /// The composed dispatcher: per kind, the package first, then the base
    /// library; a miss falls through to the tank, compiling the found
    /// source definition on demand before retrying. Instances are never
    /// compiled on demand: references to them go through the deferred
    /// queue instead.
    fn fish(&self, item: &str, types: &[FhirType]) -> Option<FishedArtifact> {
        let effective = if types.is_empty() { DEFAULT_FISHING_ORDER } else { types };

        for fhir_type in effective {
            let filter = std::slice::from_ref(fhir_type);
            let from_package = self.package.borrow().fish(item, filter);
            if from_package.is_some() {
                return from_package;
            }
            let from_store = self.store.fish(item, filter);
            if from_store.is_some() {
                return from_store;
            }
        }

        let definitional: Vec<FhirType> = effective
            .iter()
            .copied()
            .filter(FhirType::is_definitional)
            .collect();
        if definitional.is_empty() {
            return None;
        }

        let (identity, _version) = parse_identity(item);
        if self.has_failed(identity) {
            return None;
        }
        let found = self.tank.fish_by_identity(identity, &definitional)?;
        debug!("'{}' found in the tank; compiling on demand", identity);
        match found {
            TankItem::Structure(def) => {
                self.export_structure_logged(def);
            }
            TankItem::ValueSet(def) => {
                ValueSetExporter::new(self).export(def);
            }
            TankItem::CodeSystem(def) => {
                CodeSystemExporter::new(self).export(def);
            }
            TankItem::Instance(_) => return None,
        }

        let retry = self.package.borrow().fish(item, types);
        retry
    }
}

/// Per-kind artifact counts and diagnostic totals for one run
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub profiles: usize,
    pub extensions: usize,
    pub logicals: usize,
    pub resources: usize,
    pub instances: usize,
    pub value_sets: usize,
    pub code_systems: usize,
    pub errors: usize,
    pub warnings: usize,
}

impl ExportReport {
    pub fn total_artifacts(&self) -> usize {
        self.profiles
            + self.extensions
            + self.logicals
            + self.resources
            + self.instances
            + self.value_sets
            + self.code_systems
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

/// Drives the two-phase export pipeline over a session
pub struct ExportOrchestrator {
    session: ExportSession,
}

impl ExportOrchestrator {
    pub fn new(tank: FshTank, store: DefinitionStore, config: ExportConfiguration) -> Self {
        Self {
            session: ExportSession::new(tank, store, config),
        }
    }

    pub fn session(&self) -> &ExportSession {
        &self.session
    }

    /// Export every definition in source order, then drain the deferred
    /// queue. A fatal failure on one definition does not prevent the rest
    /// from exporting.
    pub fn export_all(&self) -> ExportReport {
        let session = &self.session;
        info!("Exporting {} definitions", session.tank().items().len());

        for item in session.tank().items() {
            match item {
                TankItem::Structure(def) => {
                    session.export_structure_logged(def);
                }
                TankItem::Instance(def) => {
                    session.export_instance_logged(def);
                }
                TankItem::ValueSet(def) => {
                    ValueSetExporter::new(session).export(def);
                }
                TankItem::CodeSystem(def) => {
                    CodeSystemExporter::new(session).export(def);
                }
            }
        }

        let deferred = session.take_deferred();
        if !deferred.is_empty() {
            debug!("Draining {} deferred rules", deferred.len());
        }
        for rule in deferred {
            apply_deferred(session, rule);
        }

        let report = self.report();
        info!(
            "Export finished: {} artifacts, {} errors, {} warnings",
            report.total_artifacts(),
            report.errors,
            report.warnings
        );
        report
    }

    pub fn report(&self) -> ExportReport {
        let package = self.session.package().borrow();
        let diagnostics = self.session.diagnostics();
        ExportReport {
            profiles: package.profiles().len(),
            extensions: package.extensions().len(),
            logicals: package.logicals().len(),
            resources: package.resources().len(),
            instances: package.instances().len(),
            value_sets: package.value_sets().len(),
            code_systems: package.code_systems().len(),
            errors: diagnostics.error_count(),
            warnings: diagnostics.warning_count(),
        }
    }
}
