//! NIGIRI core: the FSH-to-FHIR export engine
//!
//! Compiles parsed FHIR Shorthand (FSH) definitions into FHIR conformance
//! artifacts. The engine takes a [`tank::FshTank`] of parsed definitions, a
//! [`canonical::DefinitionStore`] of loaded base FHIR definitions, and an
//! [`config::ExportConfiguration`], and produces a package of
//! StructureDefinitions, instances, value sets, and code systems.
//!
//! ```rust
//! use nigiri_core::canonical::DefinitionStore;
//! use nigiri_core::config::ExportConfiguration;
//! use nigiri_core::export::ExportOrchestrator;
//! use nigiri_core::tank::{DefinitionKind, FshTank, SourceDefinition};
//!
//! let mut tank = FshTank::new();
//! let mut profile = SourceDefinition::new(DefinitionKind::Profile, "MyPatient");
//! profile.parent = Some("Patient".to_string());
//! tank.add_structure(profile);
//!
//! let store = DefinitionStore::new(); // normally seeded from FHIR packages
//! let config = ExportConfiguration::new("http://example.org/fhir");
//!
//! let orchestrator = ExportOrchestrator::new(tank, store, config);
//! let report = orchestrator.export_all();
//! println!("{} artifacts, {} errors", report.total_artifacts(), report.errors);
//! ```
//!
//! Parsing FSH text, downloading FHIR packages, and writing output files are
//! the embedder's concerns; the engine works entirely in memory.

pub mod canonical;
pub mod config;
pub mod diagnostics;
pub mod export;
pub mod semantic;
pub mod tank;

#[cfg(test)]
pub(crate) mod testutil;

pub use canonical::DefinitionStore;
pub use config::ExportConfiguration;
pub use diagnostics::{Diagnostic, DiagnosticCollector, Location, Severity};
pub use export::{ExportOrchestrator, ExportReport, ExportSession, Package};
pub use semantic::{FhirType, Fishable};
pub use tank::FshTank;
