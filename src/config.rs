use crate::auditor::AuditOptions;
use crate::cli::{Cli, OutputFormat};
use crate::fuzzy::FuzzyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const ENV_PREFIX: &str = "XSD_CONCORDANCE_";
const APP_NAME: &str = "xsd-concordance";

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid glob pattern {0}")]
    InvalidPattern(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub audit: AuditConfig,
    pub files: FileConfig,
    pub output: OutputConfig,
}

/// Pipeline execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent worker tasks
    pub threads: Option<usize>,
    /// Show progress indicators
    pub show_progress: bool,
    /// Directory receiving the generated artifacts
    pub output_dir: PathBuf,
    /// Filings per audit task
    pub batch_size: usize,
}

/// Filing audit tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Minimum bigram (Dice) similarity for a name-similarity match
    pub similarity_threshold: f64,
    /// Candidates below this confidence are never reported
    pub min_confidence: f64,
    /// Distinct filings an unknown xpath needs before it becomes a patch
    pub min_filings_for_patch: usize,
    /// Root attribute carrying a filing's schema version
    pub version_attribute: String,
}

/// File processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Schema document extensions
    pub schema_extensions: Vec<String>,
    /// Filing extensions
    pub filing_extensions: Vec<String>,
    /// Include patterns (glob syntax), applied to filings
    pub include_patterns: Vec<String>,
    /// Exclude patterns (glob syntax), applied to filings
    pub exclude_patterns: Vec<String>,
    /// Envelope elements stripped from filing xpaths and never treated as forms
    pub wrapper_elements: Vec<String>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format
    pub format: OutputFormatConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode (errors only)
    pub quiet: bool,
}

/// Output format configuration (serializable version of CLI OutputFormat)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatConfig {
    Human,
    Json,
    Summary,
}

impl From<OutputFormat> for OutputFormatConfig {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => OutputFormatConfig::Human,
            OutputFormat::Json => OutputFormatConfig::Json,
            OutputFormat::Summary => OutputFormatConfig::Summary,
        }
    }
}

impl From<OutputFormatConfig> for OutputFormat {
    fn from(format: OutputFormatConfig) -> Self {
        match format {
            OutputFormatConfig::Human => OutputFormat::Human,
            OutputFormatConfig::Json => OutputFormat::Json,
            OutputFormatConfig::Summary => OutputFormat::Summary,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            show_progress: false,
            output_dir: PathBuf::from("concordance_output"),
            batch_size: 64,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            min_confidence: 0.45,
            min_filings_for_patch: 2,
            version_attribute: "returnVersion".to_string(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            schema_extensions: vec!["xsd".to_string()],
            filing_extensions: vec!["xml".to_string()],
            include_patterns: vec![],
            exclude_patterns: vec![],
            wrapper_elements: vec!["Return".to_string(), "ReturnData".to_string()],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormatConfig::Human,
            verbose: false,
            quiet: false,
        }
    }
}

impl AuditConfig {
    pub fn audit_options(&self) -> AuditOptions {
        AuditOptions {
            fuzzy: FuzzyConfig {
                bigram_threshold: self.similarity_threshold,
                min_confidence: self.min_confidence,
                ..FuzzyConfig::default()
            },
            min_filings_for_patch: self.min_filings_for_patch,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::Environment(format!("Invalid {}{} value: {}", ENV_PREFIX, name, value))
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        let mut config = Config::default();

        if let Some(config_path) = &cli.config {
            config = Self::load_from_file(config_path).await?;
        } else if let Some(found_config) = Self::find_config_file().await? {
            config = found_config;
        }

        config = Self::apply_environment_overrides(config)?;
        config = Self::merge_with_cli(config, cli);

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON); missing keys keep their defaults
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                // Try to parse as TOML first, then JSON
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            format!("{}.toml", APP_NAME),
            format!("{}.json", APP_NAME),
            format!(".{}.toml", APP_NAME),
            format!(".{}.json", APP_NAME),
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join(APP_NAME);
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        let var = |name: &str| env.get(&format!("{}{}", ENV_PREFIX, name));

        if let Some(threads) = var("THREADS") {
            config.pipeline.threads = Some(parse_env("THREADS", &threads)?);
        }
        if let Some(output_dir) = var("OUTPUT_DIR") {
            config.pipeline.output_dir = PathBuf::from(output_dir);
        }

        if let Some(threshold) = var("SIMILARITY_THRESHOLD") {
            config.audit.similarity_threshold = parse_env("SIMILARITY_THRESHOLD", &threshold)?;
        }
        if let Some(min_filings) = var("MIN_FILINGS") {
            config.audit.min_filings_for_patch = parse_env("MIN_FILINGS", &min_filings)?;
        }
        if let Some(attribute) = var("VERSION_ATTRIBUTE") {
            config.audit.version_attribute = attribute.trim().to_string();
        }

        if let Some(verbose) = var("VERBOSE") {
            config.output.verbose = parse_env("VERBOSE", &verbose)?;
        }
        if let Some(quiet) = var("QUIET") {
            config.output.quiet = parse_env("QUIET", &quiet)?;
        }
        if let Some(format) = var("FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormatConfig::Human,
                "json" => OutputFormatConfig::Json,
                "summary" => OutputFormatConfig::Summary,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid {}FORMAT value: {}",
                        ENV_PREFIX, format
                    )));
                }
            };
        }

        if let Some(extensions) = var("FILING_EXTENSIONS") {
            config.files.filing_extensions = split_list(&extensions);
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if cli.threads.is_some() {
            config.pipeline.threads = cli.threads;
        }
        if cli.progress {
            config.pipeline.show_progress = true;
        }
        if let Some(output_dir) = &cli.output_dir {
            config.pipeline.output_dir = output_dir.clone();
        }

        if let Some(threshold) = cli.similarity_threshold {
            config.audit.similarity_threshold = threshold;
        }
        if let Some(min_filings) = cli.min_filings {
            config.audit.min_filings_for_patch = min_filings;
        }
        if let Some(attribute) = &cli.version_attribute {
            config.audit.version_attribute = attribute.clone();
        }

        if let Some(format) = cli.output_format {
            config.output.format = format.into();
        }
        if cli.verbose {
            config.output.verbose = true;
            config.output.quiet = false;
        }
        if cli.quiet {
            config.output.quiet = true;
            config.output.verbose = false;
        }

        if let Some(extensions) = cli.get_filing_extensions() {
            config.files.filing_extensions = extensions;
        }
        if !cli.include_patterns.is_empty() {
            config.files.include_patterns = cli.include_patterns.clone();
        }
        if !cli.exclude_patterns.is_empty() {
            config.files.exclude_patterns = cli.exclude_patterns.clone();
        }

        config
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if let Some(threads) = config.pipeline.threads {
            if threads == 0 {
                return Err(ConfigError::Validation(
                    "Number of threads must be greater than 0".to_string(),
                ));
            }
            if threads > 1000 {
                return Err(ConfigError::Validation(
                    "Number of threads cannot exceed 1000".to_string(),
                ));
            }
        }
        if config.pipeline.batch_size == 0 {
            return Err(ConfigError::Validation(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("Similarity threshold", config.audit.similarity_threshold),
            ("Minimum confidence", config.audit.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if config.audit.min_filings_for_patch == 0 {
            return Err(ConfigError::Validation(
                "Minimum filings for a patch must be greater than 0".to_string(),
            ));
        }
        if config.audit.version_attribute.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Version attribute cannot be empty".to_string(),
            ));
        }

        if config.output.verbose && config.output.quiet {
            return Err(ConfigError::Validation(
                "Cannot enable both verbose and quiet modes".to_string(),
            ));
        }

        for (label, extensions) in [
            ("schema", &config.files.schema_extensions),
            ("filing", &config.files.filing_extensions),
        ] {
            if extensions.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "At least one {} file extension must be specified",
                    label
                )));
            }
            for ext in extensions {
                if ext.contains('/') || ext.contains('\\') || ext.contains('.') {
                    return Err(ConfigError::Validation(format!(
                        "Invalid file extension: {}",
                        ext
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get the effective thread count
    pub fn get_thread_count(config: &Config) -> usize {
        config.pipeline.threads.unwrap_or_else(num_cpus::get)
    }
}
