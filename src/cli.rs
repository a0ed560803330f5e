use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show critical errors
    Quiet,
    /// Show standard information
    #[default]
    Normal,
    /// Show detailed information
    Verbose,
    /// Show all available debugging information
    Debug,
}

/// Format of the run summary printed to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Summary,
}

/// Build a cross-version field concordance from XSD schemas and audit it against real filings
#[derive(Parser, Debug, Clone)]
#[command(name = "xsd-concordance")]
#[command(
    about = "Reconcile field identity across versioned XML schemas and audit the result against real documents"
)]
#[command(version)]
pub struct Cli {
    /// Root directory with one subdirectory per schema version
    #[arg(help = "Schema root directory (one subdirectory per version)")]
    pub schema_dir: PathBuf,

    /// Directory of real documents to audit
    #[arg(short = 'f', long = "filings")]
    pub filings: Option<PathBuf>,

    /// Audit a previously written concordance.json instead of rebuilding it
    #[arg(long = "concordance")]
    pub concordance: Option<PathBuf>,

    /// Directory receiving the generated artifacts
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Number of concurrent worker tasks
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Minimum bigram (Dice) similarity for a name-similarity match
    #[arg(long = "similarity-threshold")]
    pub similarity_threshold: Option<f64>,

    /// Distinct filings an unknown xpath needs before it becomes a patch
    #[arg(long = "min-filings")]
    pub min_filings: Option<usize>,

    /// Root attribute carrying a filing's schema version
    #[arg(long = "version-attribute")]
    pub version_attribute: Option<String>,

    /// Filing file extensions (comma-separated)
    #[arg(
        short = 'e',
        long = "filing-extensions",
        help = "Filing file extensions to process (e.g., 'xml')"
    )]
    pub filing_extensions: Option<String>,

    /// Include file patterns (glob syntax)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Exclude file patterns (glob syntax)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Summary format
    #[arg(long = "format", value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(
        short = 'q',
        long = "quiet",
        help = "Quiet mode",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,

    /// Show progress indicators
    #[arg(long = "progress")]
    pub progress: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn get_filing_extensions(&self) -> Option<Vec<String>> {
        self.filing_extensions.as_ref().map(|raw| {
            raw.split(',')
                .map(|s| s.trim().trim_start_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.schema_dir.is_dir() {
            return Err(format!(
                "Schema directory does not exist: {}",
                self.schema_dir.display()
            ));
        }
        if let Some(filings) = &self.filings
            && !filings.exists()
        {
            return Err(format!("Filings path does not exist: {}", filings.display()));
        }
        if let Some(concordance) = &self.concordance
            && !concordance.is_file()
        {
            return Err(format!(
                "Concordance file does not exist: {}",
                concordance.display()
            ));
        }
        if let Some(threads) = self.threads
            && threads == 0
        {
            return Err("Number of threads must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}
