//! Run configuration, read from `tbsched.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// File name looked up by [`TbConfig::discover`].
pub const CONFIG_FILE: &str = "tbsched.toml";

/// Settings for a test run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TbConfig {
    /// Abort the run once simulation time passes this many steps.
    pub time_limit: Option<u64>,
    /// Maximum consecutive advances that don't move simulation time.
    pub max_deltas: u32,
    /// When true, a failing test doesn't stop the tests after it.
    pub isolate_tests: bool,
    /// Seed for [`Sim::rand`](crate::executor::Sim::rand) and friends.
    pub seed: u64,
    /// Where to write a JUnit XML report, if anywhere.
    pub junit: Option<PathBuf>,
    /// Test suite name used in reports.
    pub suite: String,
}

impl Default for TbConfig {
    fn default() -> Self {
        Self {
            time_limit: None,
            max_deltas: 1000,
            isolate_tests: true,
            seed: 0,
            junit: None,
            suite: "tbsched".to_string(),
        }
    }
}

impl TbConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: TbConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `tbsched.toml` from the working directory, or defaults if there is none.
    pub fn discover() -> Result<Self, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_deltas == 0 {
            return Err(ConfigError::Invalid("max_deltas must be at least 1".to_string()));
        }
        if self.suite.is_empty() {
            return Err(ConfigError::Invalid("suite must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(TbConfig::from_toml("").unwrap(), TbConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let config = TbConfig::from_toml(
            r#"
time_limit = 1000000
max_deltas = 50
isolate_tests = false
seed = 42
junit = "out/results.xml"
suite = "axi"
"#,
        )
        .unwrap();
        assert_eq!(config.time_limit, Some(1_000_000));
        assert_eq!(config.max_deltas, 50);
        assert!(!config.isolate_tests);
        assert_eq!(config.seed, 42);
        assert_eq!(config.junit, Some(PathBuf::from("out/results.xml")));
        assert_eq!(config.suite, "axi");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = TbConfig::from_toml("timeout = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_deltas_is_invalid() {
        let err = TbConfig::from_toml("max_deltas = 0").unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: max_deltas must be at least 1");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seed = 7").unwrap();
        let config = TbConfig::load(file.path()).unwrap();
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = TbConfig::load(Path::new("/nonexistent/tbsched.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
