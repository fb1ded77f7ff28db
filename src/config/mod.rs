use crate::error::{VigilError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Memory thresholds and pool sizing shared by the master and its workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    /// Hard ceiling on resident memory; crossing it raises a memory alarm
    #[serde(rename = "maxResidentMB", default = "default_max_resident_mb")]
    pub max_resident_mb: u64,

    /// Fraction of the hard ceiling above which memory relief is forced
    #[serde(default = "default_gc_trigger_fraction")]
    pub gc_trigger_fraction: f64,

    /// Fraction of the hard ceiling a relief attempt must reclaim
    #[serde(default = "default_min_recovery_fraction")]
    pub min_recovery_fraction: f64,

    /// Memory sampling period (in milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Time a worker is given to drain before it is forced out (in milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Number of workers; 0 spawns one per available CPU
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_max_resident_mb() -> u64 {
    1740
}

fn default_gc_trigger_fraction() -> f64 {
    0.85
}

fn default_min_recovery_fraction() -> f64 {
    0.05
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    20_000
}

fn default_pool_size() -> usize {
    2
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_resident_mb: default_max_resident_mb(),
            gc_trigger_fraction: default_gc_trigger_fraction(),
            min_recovery_fraction: default_min_recovery_fraction(),
            check_interval_ms: default_check_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl ThresholdConfig {
    /// Validate the thresholds
    pub fn validate(&self) -> Result<()> {
        if self.max_resident_mb == 0 {
            return Err(VigilError::ConfigValidationError(
                "maxResidentMB must be at least 1".to_string(),
            ));
        }

        Self::validate_fraction("gcTriggerFraction", self.gc_trigger_fraction)?;
        Self::validate_fraction("minRecoveryFraction", self.min_recovery_fraction)?;

        if self.check_interval_ms == 0 {
            return Err(VigilError::ConfigValidationError(
                "checkIntervalMs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_fraction(field: &str, value: f64) -> Result<()> {
        if !value.is_finite() || value <= 0.0 || value > 1.0 {
            return Err(VigilError::ConfigValidationError(format!(
                "{} must be within (0, 1], got {}",
                field, value
            )));
        }
        Ok(())
    }

    /// Resident size (MB) above which memory relief is attempted
    pub fn gc_trigger_mb(&self) -> f64 {
        self.max_resident_mb as f64 * self.gc_trigger_fraction
    }

    /// Memory (MB) a relief attempt must free to count as effective
    pub fn min_recovery_mb(&self) -> f64 {
        self.max_resident_mb as f64 * self.min_recovery_fraction
    }

    /// Number of workers to spawn given the number of available CPUs
    pub fn resolve_pool_size(&self, available_cpus: usize) -> usize {
        if self.pool_size == 0 {
            available_cpus.max(1)
        } else {
            self.pool_size
        }
    }

    /// Get check interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_max_resident_mb(mut self, max_resident_mb: u64) -> Self {
        self.max_resident_mb = max_resident_mb;
        self
    }

    pub fn with_gc_trigger_fraction(mut self, fraction: f64) -> Self {
        self.gc_trigger_fraction = fraction;
        self
    }

    pub fn with_min_recovery_fraction(mut self, fraction: f64) -> Self {
        self.min_recovery_fraction = fraction;
        self
    }

    pub fn with_check_interval_ms(mut self, check_interval_ms: u64) -> Self {
        self.check_interval_ms = check_interval_ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, shutdown_grace_ms: u64) -> Self {
        self.shutdown_grace_ms = shutdown_grace_ms;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

/// Cluster configuration: service identity, logging, respawn policy and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Service name, used as the worker title in logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Log filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Initial delay before respawning a dead worker (in milliseconds)
    #[serde(default)]
    pub respawn_delay_ms: u64,

    /// Upper bound of the respawn backoff (in milliseconds)
    #[serde(default = "default_respawn_max_delay_ms")]
    pub respawn_max_delay_ms: u64,

    /// Window in which respawns count towards the backoff (in seconds)
    #[serde(default = "default_respawn_window_secs")]
    pub respawn_window_secs: u64,

    /// Pool sizes keyed by service name, overriding `poolSize`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pool_sizes: HashMap<String, usize>,

    #[serde(flatten)]
    pub thresholds: ThresholdConfig,
}

fn default_name() -> String {
    "vigil".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_respawn_max_delay_ms() -> u64 {
    30_000
}

fn default_respawn_window_secs() -> u64 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_file: None,
            respawn_delay_ms: 0,
            respawn_max_delay_ms: default_respawn_max_delay_ms(),
            respawn_window_secs: default_respawn_window_secs(),
            pool_sizes: HashMap::new(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load the cluster configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<ClusterConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(VigilError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<ClusterConfig> {
        toml::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<ClusterConfig> {
        serde_json::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VigilError::ConfigValidationError(
                "name must not be empty".to_string(),
            ));
        }

        if self.respawn_max_delay_ms < self.respawn_delay_ms {
            return Err(VigilError::ConfigValidationError(format!(
                "respawnMaxDelayMs ({}) must not be lower than respawnDelayMs ({})",
                self.respawn_max_delay_ms, self.respawn_delay_ms
            )));
        }

        self.thresholds.validate()
    }

    /// Expand $VAR and ${VAR} in the log file path
    fn expand_env_vars(&mut self) {
        if let Some(ref path) = self.log_file {
            let mut expanded = path.to_string_lossy().to_string();
            for (key, value) in std::env::vars() {
                expanded = expanded.replace(&format!("${{{}}}", key), &value);
                expanded = expanded.replace(&format!("${}", key), &value);
            }
            self.log_file = Some(PathBuf::from(expanded));
        }
    }

    /// Number of workers for this service given the number of available CPUs
    ///
    /// An entry for `name` in `poolSizes` wins over the global `poolSize`.
    pub fn resolve_pool_size(&self, available_cpus: usize) -> usize {
        match self.pool_sizes.get(&self.name) {
            Some(&0) => available_cpus.max(1),
            Some(&size) => size,
            None => self.thresholds.resolve_pool_size(available_cpus),
        }
    }

    pub fn with_pool_size_for(mut self, name: &str, pool_size: usize) -> Self {
        self.pool_sizes.insert(name.to_string(), pool_size);
        self
    }

    /// Get respawn delay as Duration
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    /// Get maximum respawn delay as Duration
    pub fn respawn_max_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_max_delay_ms)
    }

    /// Get respawn window as Duration
    pub fn respawn_window(&self) -> Duration {
        Duration::from_secs(self.respawn_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_threshold_defaults() {
        let thresholds = ThresholdConfig::default();

        assert_eq!(thresholds.max_resident_mb, 1740);
        assert_eq!(thresholds.gc_trigger_fraction, 0.85);
        assert_eq!(thresholds.min_recovery_fraction, 0.05);
        assert_eq!(thresholds.check_interval_ms, 1000);
        assert_eq!(thresholds.shutdown_grace_ms, 20_000);
        assert_eq!(thresholds.pool_size, 2);
    }

    #[test]
    fn test_derived_thresholds() {
        let thresholds = ThresholdConfig::default();

        assert_eq!(thresholds.gc_trigger_mb().round(), 1479.0);
        assert_eq!(thresholds.min_recovery_mb().round(), 87.0);
        assert_eq!(thresholds.check_interval(), Duration::from_secs(1));
        assert_eq!(thresholds.shutdown_grace(), Duration::from_secs(20));
    }

    #[test]
    fn test_resolve_pool_size() {
        let explicit = ThresholdConfig::default().with_pool_size(3);
        assert_eq!(explicit.resolve_pool_size(16), 3);

        let per_cpu = ThresholdConfig::default().with_pool_size(0);
        assert_eq!(per_cpu.resolve_pool_size(8), 8);
        assert_eq!(per_cpu.resolve_pool_size(0), 1);
    }

    #[test]
    fn test_service_pool_size_overrides_global() {
        let config = ClusterConfig {
            name: "tiles".to_string(),
            thresholds: ThresholdConfig::default().with_pool_size(2),
            ..ClusterConfig::default()
        }
        .with_pool_size_for("geoserver", 6);

        // No entry for this service: global size
        assert_eq!(config.resolve_pool_size(8), 2);

        let config = config.with_pool_size_for("tiles", 5);
        assert_eq!(config.resolve_pool_size(8), 5);

        let config = config.with_pool_size_for("tiles", 0);
        assert_eq!(config.resolve_pool_size(8), 8);
    }

    #[test]
    fn test_parse_toml_pool_sizes() {
        let toml_content = r#"
            name = "geoserver"
            poolSize = 3

            [poolSizes]
            geoserver = 1
            tiles = 0
        "#;

        let config = ClusterConfig::parse_toml(toml_content).unwrap();
        assert_eq!(config.thresholds.pool_size, 3);
        assert_eq!(config.pool_sizes.get("tiles"), Some(&0));
        assert_eq!(config.resolve_pool_size(4), 1);
    }

    #[test]
    fn test_validate_rejects_bad_fractions() {
        let zero = ThresholdConfig::default().with_gc_trigger_fraction(0.0);
        assert!(matches!(
            zero.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));

        let above_one = ThresholdConfig::default().with_min_recovery_fraction(1.5);
        assert!(matches!(
            above_one.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));

        let one = ThresholdConfig::default().with_gc_trigger_fraction(1.0);
        assert!(one.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ThresholdConfig::default().with_check_interval_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_respawn_bounds() {
        let config = ClusterConfig {
            respawn_delay_ms: 5_000,
            respawn_max_delay_ms: 1_000,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_parse_toml_partial() {
        let toml_content = r#"
            name = "geoserver"
            maxResidentMB = 512
            poolSize = 4
        "#;

        let config = ClusterConfig::parse_toml(toml_content).unwrap();
        assert_eq!(config.name, "geoserver");
        assert_eq!(config.thresholds.max_resident_mb, 512);
        assert_eq!(config.thresholds.pool_size, 4);
        assert_eq!(config.thresholds.gc_trigger_fraction, 0.85);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_parse_json_full() {
        let json_content = r#"
            {
                "name": "tiles",
                "logLevel": "debug",
                "maxResidentMB": 1024,
                "gcTriggerFraction": 0.9,
                "minRecoveryFraction": 0.1,
                "checkIntervalMs": 500,
                "shutdownGraceMs": 5000,
                "poolSize": 0
            }
        "#;

        let config = ClusterConfig::parse_json(json_content).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.thresholds.gc_trigger_fraction, 0.9);
        assert_eq!(config.thresholds.min_recovery_fraction, 0.1);
        assert_eq!(config.thresholds.check_interval_ms, 500);
        assert_eq!(config.thresholds.shutdown_grace_ms, 5000);
        assert_eq!(config.thresholds.pool_size, 0);
    }

    #[test]
    fn test_expand_env_vars_in_log_file() {
        std::env::set_var("VIGIL_TEST_LOG_DIR", "/tmp/vigil");

        let mut config = ClusterConfig {
            log_file: Some(PathBuf::from("${VIGIL_TEST_LOG_DIR}/cluster.log")),
            ..ClusterConfig::default()
        };
        config.expand_env_vars();

        assert_eq!(
            config.log_file,
            Some(PathBuf::from("/tmp/vigil/cluster.log"))
        );
    }

    #[test]
    fn test_from_file_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("cluster.toml");

        fs::write(&config_path, "name = \"echo\"\nshutdownGraceMs = 1500\n").unwrap();

        let config = ClusterConfig::from_file(&config_path).unwrap();
        assert_eq!(config.name, "echo");
        assert_eq!(config.thresholds.shutdown_grace_ms, 1500);
    }

    #[test]
    fn test_from_file_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("cluster.json");

        fs::write(&config_path, r#"{ "gcTriggerFraction": 2.0 }"#).unwrap();

        let result = ClusterConfig::from_file(&config_path);
        assert!(matches!(
            result,
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("cluster.properties");

        fs::write(&config_path, "nodejs.cluster.maxrssmemorymb=1740").unwrap();

        let result = ClusterConfig::from_file(&config_path);
        assert!(matches!(result, Err(VigilError::InvalidConfig(_))));
    }
}
