use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Main application error type that encompasses all fatal failure modes
#[derive(Error, Debug)]
pub enum ConcordanceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Schema load error: {0}")]
    Load(#[from] LoadError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("File system traversal error: {path} - {reason}")]
    FileSystemTraversal { path: PathBuf, reason: String },

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

/// Failure to load one schema version's document set
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Unresolvable include in {document}: {location}")]
    UnresolvableInclude { document: PathBuf, location: String },

    #[error("Malformed schema document {path}: {details}")]
    MalformedDocument { path: PathBuf, details: String },

    #[error("Cannot read {path}: {details}")]
    Io { path: PathBuf, details: String },

    #[error("No schema documents found for version {version}")]
    NoDocuments { version: String },
}

/// Failure to expand one top-level form
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Cyclic type extension chain: {}", chain.join(" -> "))]
    CyclicExtension { chain: Vec<String> },

    #[error("Cyclic group reference chain: {}", chain.join(" -> "))]
    CyclicGroup { chain: Vec<String> },

    #[error("Recursive element typing: {}", chain.join(" -> "))]
    RecursiveElement { chain: Vec<String> },

    #[error("Reference to undefined group: {name}")]
    UnknownGroup { name: String },

    #[error("Reference to undefined top-level element: {name}")]
    UnknownElementRef { name: String },
}

/// Violation of the concordance invariants. Always fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error(
        "xpath index is not injective: ({version}, {xpath}) claimed by both {first} and {second}"
    )]
    NonInjectiveIndex {
        version: String,
        xpath: String,
        first: String,
        second: String,
    },

    #[error(
        "field {field} spans {start}..{end} but its xpaths cover {first}..{last}"
    )]
    VersionRangeMismatch {
        field: String,
        start: String,
        end: String,
        first: String,
        last: String,
    },

    #[error("No version catalogs supplied to the reconciler")]
    NoCatalogs,
}

/// Failure to read one real document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilingError {
    #[error("Cannot read filing {path}: {details}")]
    Io { path: PathBuf, details: String },

    #[error("Malformed filing {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Filing {path} carries no {attribute} attribute")]
    MissingVersion { path: PathBuf, attribute: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConcordanceError>;

/// Schema loading result type alias
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Form resolution result type alias
pub type ResolutionResult<T> = std::result::Result<T, ResolutionError>;

/// Reconciliation result type alias
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
