use serde::Deserialize;
use std::path::PathBuf;

/// Knobs of the element tree itself.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Cache generated values until an invalidation reaches the element.
    #[serde(default = "default_value_caching")]
    pub value_caching: bool,
    /// Upper bound on the items an array may materialize.
    #[serde(default = "default_max_array_expansion")]
    pub max_array_expansion: u64,
}

pub fn default_value_caching() -> bool {
    true
}

pub fn default_max_array_expansion() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            value_caching: default_value_caching(),
            max_array_expansion: default_max_array_expansion(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_iterations() -> u64 {
    1_000
}

pub fn default_seed() -> u64 {
    0
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./.strata_out")
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            seed: default_seed(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
}

impl StrataConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: StrataConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax-array-expansion = 64\n\n[fuzzer]\nseed = 7").unwrap();

        let config = StrataConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.engine.max_array_expansion, 64);
        assert!(config.engine.value_caching);
        assert_eq!(config.fuzzer.seed, 7);
        assert_eq!(config.fuzzer.max_iterations, default_iterations());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ncache-everything = true").unwrap();

        let err = StrataConfig::load_from_file(&file.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"), "{err}");
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = StrataConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"), "{err}");
    }
}
