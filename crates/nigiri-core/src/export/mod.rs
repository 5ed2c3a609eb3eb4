//! FHIR export
//!
//! Transforms parsed FSH definitions into FHIR conformance artifacts:
//! StructureDefinitions (profiles, extensions, logical models, resources),
//! resource instances, value sets, and code systems.
//!
//! ## Modules
//!
//! - `fhir_types`: the artifact model (StructureDefinition, ElementDefinition, ...)
//! - `package`: the accumulator of compiled artifacts
//! - `structure_exporter`: parent resolution, metadata derivation, rule dispatch
//! - `assignment`: caret-path property assignment and value typing
//! - `slicing`: contains-rule slice machinery
//! - `differential`: original capture and differential generation
//! - `instance_exporter`, `valueset_exporter`, `codesystem_exporter`: the
//!   other artifact categories
//! - `build`: the export session and two-phase orchestrator

pub mod assignment;
pub mod build;
pub mod codesystem_exporter;
pub mod differential;
pub mod fhir_types;
pub mod instance_exporter;
pub mod package;
pub mod slicing;
pub mod structure_exporter;
pub mod valueset_exporter;

pub use build::{DeferredRule, DeferredTarget, ExportOrchestrator, ExportReport, ExportSession};
pub use codesystem_exporter::CodeSystemExporter;
pub use fhir_types::*;
pub use instance_exporter::InstanceExporter;
pub use package::Package;
pub use structure_exporter::{ExportError, StructureDefinitionExporter};
pub use valueset_exporter::ValueSetExporter;
