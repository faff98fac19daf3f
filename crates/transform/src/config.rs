//! Engine configuration.
//!
//! [`EngineConfig`] can be built programmatically, from command line
//! arguments, or from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HTS_CANONICAL_VERSION` | R4 | Version resources are persisted in |
//! | `HTS_DETECTION_THRESHOLD` | 0.6 | Minimum detection confidence |
//! | `HTS_DEFAULT_VERSION` | (canonical) | Fallback detection version |
//! | `HTS_DEFAULT_CONFIDENCE` | 0.5 | Confidence of the fallback |
//! | `HTS_LOSSY_POLICY` | warn | `warn` or `reject` lossy drops |
//! | `HTS_VALIDATION_MODE` | lenient | `lenient` or `strict` |
//! | `HTS_REQUIRED_ELEMENTS` | (none) | `Type.element` list the validator enforces |
//! | `HTS_CACHE_TTL` | 5m | Cache entry lifetime |
//! | `HTS_CACHE_MAX_ENTRIES` | 10000 | Cache capacity |
//! | `HTS_MIGRATION_WORKERS` | 4 | Concurrent migration batches |
//! | `HTS_RESOURCE_TIMEOUT` | 5s | Per-resource transformation timeout |
//! | `HTS_RETRY_ATTEMPTS` | 1 | Attempts per resource for transient failures |
//! | `HTS_BATCH_SIZE` | 100 | Default migration batch size |
//! | `HTS_LOG_LEVEL` | info | Log level |
//!
//! # Example
//!
//! ```rust
//! use helios_transform::{EngineConfig, FhirVersion};
//!
//! let config = EngineConfig {
//!     canonical_version: FhirVersion::R5,
//!     cache_ttl: "30s".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.cache_config().unwrap().ttl.as_secs(), 30);
//! ```

use std::time::Duration;

use clap::Parser;

use crate::cache::CacheConfig;
use crate::detect::DetectorConfig;
use crate::engine::{LossyPolicy, TransformOptions};
use crate::error::ConfigError;
use crate::migration::{MigrationOptions, RetryPolicy};
use crate::registry::Registry;
use crate::validation::{RequiredElementsValidator, ValidationMode};
use crate::version::FhirVersion;

/// Configuration for the transformation engine and its collaborators.
#[derive(Debug, Clone, Parser)]
#[command(name = "hfs-transform")]
#[command(about = "Multi-version FHIR transformation engine")]
pub struct EngineConfig {
    /// Version resources are persisted in.
    #[arg(long, env = "HTS_CANONICAL_VERSION", default_value = "R4")]
    pub canonical_version: FhirVersion,

    /// Minimum confidence a detection signal must reach.
    #[arg(long, env = "HTS_DETECTION_THRESHOLD", default_value = "0.6")]
    pub detection_threshold: f64,

    /// Version assumed when no other signal is present.
    #[arg(long, env = "HTS_DEFAULT_VERSION")]
    pub default_version: Option<FhirVersion>,

    /// Confidence of the default version.
    #[arg(long, env = "HTS_DEFAULT_CONFIDENCE", default_value = "0.5")]
    pub default_confidence: f64,

    /// Treatment of declared lossy drops (warn, reject).
    #[arg(long, env = "HTS_LOSSY_POLICY", default_value = "warn")]
    pub lossy_policy: LossyPolicy,

    /// Treatment of validator diagnostics (lenient, strict).
    #[arg(long, env = "HTS_VALIDATION_MODE", default_value = "lenient")]
    pub validation_mode: ValidationMode,

    /// Top-level elements the validator requires, as `Type.element`
    /// (comma separated).
    #[arg(long = "require", env = "HTS_REQUIRED_ELEMENTS", value_delimiter = ',')]
    pub required_elements: Vec<String>,

    /// Cache entry lifetime (e.g. "5m", "30s").
    #[arg(long, env = "HTS_CACHE_TTL", default_value = "5m")]
    pub cache_ttl: String,

    /// Maximum cached transformations.
    #[arg(long, env = "HTS_CACHE_MAX_ENTRIES", default_value = "10000")]
    pub cache_max_entries: usize,

    /// Migration batches processed concurrently.
    #[arg(long, env = "HTS_MIGRATION_WORKERS", default_value = "4")]
    pub migration_workers: usize,

    /// Time allowed for one resource's transformation (e.g. "5s").
    #[arg(long, env = "HTS_RESOURCE_TIMEOUT", default_value = "5s")]
    pub resource_timeout: String,

    /// Attempts per resource for transient migration failures.
    #[arg(long, env = "HTS_RETRY_ATTEMPTS", default_value = "1")]
    pub retry_attempts: u32,

    /// Default migration batch size.
    #[arg(long, env = "HTS_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "HTS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            canonical_version: FhirVersion::R4,
            detection_threshold: 0.6,
            default_version: None,
            default_confidence: 0.5,
            lossy_policy: LossyPolicy::Warn,
            validation_mode: ValidationMode::Lenient,
            required_elements: Vec::new(),
            cache_ttl: "5m".to_string(),
            cache_max_entries: 10_000,
            migration_workers: 4,
            resource_timeout: "5s".to_string(),
            retry_attempts: 1,
            batch_size: 100,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::try_parse_from(["hfs-transform"]).unwrap_or_default()
    }

    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.detection_threshold) {
            errors.push("Detection threshold must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.default_confidence) {
            errors.push("Default confidence must be between 0 and 1".to_string());
        }
        for spec in &self.required_elements {
            if let Err(e) = parse_required_element(spec) {
                errors.push(e.to_string());
            }
        }
        if let Err(e) = humantime::parse_duration(&self.cache_ttl) {
            errors.push(format!("Invalid cache TTL '{}': {}", self.cache_ttl, e));
        }
        if self.cache_max_entries == 0 {
            errors.push("Cache max entries cannot be 0".to_string());
        }
        if self.migration_workers == 0 {
            errors.push("Migration workers cannot be 0".to_string());
        }
        match humantime::parse_duration(&self.resource_timeout) {
            Ok(d) if d.is_zero() => errors.push("Resource timeout cannot be 0".to_string()),
            Ok(_) => {}
            Err(e) => errors.push(format!(
                "Invalid resource timeout '{}': {}",
                self.resource_timeout, e
            )),
        }
        if self.retry_attempts == 0 {
            errors.push("Retry attempts cannot be 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("Batch size cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates a configuration suitable for testing.
    pub fn for_testing() -> Self {
        Self {
            cache_ttl: "1m".to_string(),
            cache_max_entries: 1_000,
            migration_workers: 2,
            resource_timeout: "1s".to_string(),
            batch_size: 10,
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Returns the detector settings.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            threshold: self.detection_threshold,
            default_version: self.default_version,
            default_confidence: self.default_confidence,
        }
    }

    /// Returns the transformation options.
    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            lossy_policy: self.lossy_policy,
        }
    }

    /// Returns the cache settings.
    pub fn cache_config(&self) -> Result<CacheConfig, humantime::DurationError> {
        Ok(CacheConfig {
            ttl: humantime::parse_duration(&self.cache_ttl)?,
            max_entries: self.cache_max_entries,
        })
    }

    /// Returns a validator requiring each configured element at every
    /// version `registry` supports for its resource type.
    pub fn required_elements_validator(
        &self,
        registry: &Registry,
    ) -> Result<RequiredElementsValidator, ConfigError> {
        let mut validator = RequiredElementsValidator::new();
        for spec in &self.required_elements {
            let (resource_type, element) = parse_required_element(spec)?;
            for version in registry.supported_versions(resource_type) {
                validator = validator.require(resource_type, version, [element]);
            }
        }
        Ok(validator)
    }

    /// Returns the migration settings.
    pub fn migration_options(&self) -> Result<MigrationOptions, humantime::DurationError> {
        Ok(MigrationOptions {
            workers: self.migration_workers,
            resource_timeout: self.resource_timeout()?,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
            },
        })
    }

    /// Returns the per-resource timeout.
    pub fn resource_timeout(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.resource_timeout)
    }
}

fn parse_required_element(spec: &str) -> Result<(&str, &str), ConfigError> {
    match spec.trim().split_once('.') {
        Some((resource_type, element))
            if !resource_type.is_empty() && !element.is_empty() && !element.contains('.') =>
        {
            Ok((resource_type, element))
        }
        _ => Err(ConfigError::Invalid {
            setting: "required element",
            value: spec.to_string(),
            message: "expected Type.element".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.canonical_version, FhirVersion::R4);
        assert_eq!(config.lossy_policy, LossyPolicy::Warn);
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_config().unwrap().ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_from_args() {
        let config = EngineConfig::try_parse_from([
            "hfs-transform",
            "--canonical-version",
            "R5",
            "--lossy-policy",
            "reject",
            "--validation-mode",
            "strict",
            "--default-version",
            "4.0",
            "--cache-ttl",
            "90s",
        ])
        .unwrap();
        assert_eq!(config.canonical_version, FhirVersion::R5);
        assert_eq!(config.lossy_policy, LossyPolicy::Reject);
        assert_eq!(config.validation_mode, ValidationMode::Strict);
        assert_eq!(config.default_version, Some(FhirVersion::R4));
        assert_eq!(config.cache_config().unwrap().ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = EngineConfig {
            detection_threshold: 1.5,
            cache_ttl: "soon".to_string(),
            migration_workers: 0,
            resource_timeout: "0s".to_string(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("cache TTL")));
        assert!(errors.iter().any(|e| e.contains("Resource timeout")));
    }

    #[test]
    fn test_required_elements() {
        let config = EngineConfig::try_parse_from([
            "hfs-transform",
            "--require",
            "Observation.status,Patient.name",
        ])
        .unwrap();
        assert_eq!(config.required_elements, vec!["Observation.status", "Patient.name"]);
        assert!(config.validate().is_ok());

        let config = EngineConfig {
            required_elements: vec!["Patient".to_string(), "Patient.contact.name".to_string()],
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("expected Type.element"));
    }

    #[test]
    fn test_for_testing() {
        let config = EngineConfig::for_testing();
        assert!(config.validate().is_ok());
        let options = config.migration_options().unwrap();
        assert_eq!(options.workers, 2);
        assert_eq!(options.resource_timeout, Duration::from_secs(1));
        assert_eq!(options.retry.max_attempts, 1);
    }
}
