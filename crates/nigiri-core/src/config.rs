//! Export configuration
//!
//! The subset of the project configuration the export engine consumes: the
//! canonical base URL for generated artifacts, the business version stamped
//! onto every compiled artifact, and the FHIR version the output targets.
//! Loading the file from disk and merging CLI overrides is the embedder's
//! concern; this module only parses the YAML shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),
}

/// Project configuration driving artifact metadata derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfiguration {
    /// Canonical base URL for generated artifacts
    pub canonical: String,

    /// Business version applied to every compiled artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// FHIR version the generated artifacts target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,
}

impl Default for ExportConfiguration {
    fn default() -> Self {
        Self {
            canonical: "http://example.org/fhir".to_string(),
            version: None,
            fhir_version: None,
        }
    }
}

impl ExportConfiguration {
    pub fn new(canonical: impl Into<String>) -> Self {
        Self {
            canonical: canonical.into(),
            ..Self::default()
        }
    }

    /// Parse from YAML (the relevant subset of a sushi-config.yaml)
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source)?;
        if config.canonical.is_empty() {
            return Err(ConfigError::MissingField("canonical"));
        }
        Ok(config)
    }

    /// Canonical URL for a StructureDefinition with the given id
    pub fn structure_definition_url(&self, id: &str) -> String {
        format!("{}/StructureDefinition/{}", self.canonical, id)
    }

    /// Canonical URL for a ValueSet with the given id
    pub fn value_set_url(&self, id: &str) -> String {
        format!("{}/ValueSet/{}", self.canonical, id)
    }

    /// Canonical URL for a CodeSystem with the given id
    pub fn code_system_url(&self, id: &str) -> String {
        format!("{}/CodeSystem/{}", self.canonical, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
canonical: http://example.org/our-ig
version: 1.2.0
fhirVersion: 4.0.1
"#;
        let config = ExportConfiguration::from_yaml(yaml).unwrap();
        assert_eq!(config.canonical, "http://example.org/our-ig");
        assert_eq!(config.version.as_deref(), Some("1.2.0"));
        assert_eq!(config.fhir_version.as_deref(), Some("4.0.1"));
    }

    #[test]
    fn test_from_yaml_missing_canonical() {
        let err = ExportConfiguration::from_yaml("version: 1.0.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidYaml(_)));
    }

    #[test]
    fn test_url_derivation() {
        let config = ExportConfiguration::new("http://example.org/fhir");
        assert_eq!(
            config.structure_definition_url("my-patient"),
            "http://example.org/fhir/StructureDefinition/my-patient"
        );
        assert_eq!(
            config.value_set_url("my-codes"),
            "http://example.org/fhir/ValueSet/my-codes"
        );
        assert_eq!(
            config.code_system_url("my-cs"),
            "http://example.org/fhir/CodeSystem/my-cs"
        );
    }
}
