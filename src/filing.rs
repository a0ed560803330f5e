//! Real-document parsing: observed xpaths, per-xpath counts and sample
//! values, bound to a schema version through the root element's version
//! attribute.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;

use crate::error::FilingError;
use crate::schema_loader::predefined_entity;

const SAMPLE_MAX_CHARS: usize = 100;

/// Header element whose subtree is metadata, never observed data
pub const DEFAULT_HEADER_ELEMENT: &str = "ReturnHeader";

const TAX_PERIOD_ELEMENTS: [&str; 4] = ["TaxPeriodEndDt", "TaxPeriodEndDate", "TaxYr", "TaxYear"];

static INTEGER_REGEX: OnceLock<Regex> = OnceLock::new();
static DECIMAL_REGEX: OnceLock<Regex> = OnceLock::new();
static DATE_REGEX: OnceLock<Regex> = OnceLock::new();
static EIN_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_integer_regex() -> &'static Regex {
    INTEGER_REGEX.get_or_init(|| Regex::new(r"^-?\d+$").expect("Failed to compile integer regex"))
}

fn get_decimal_regex() -> &'static Regex {
    DECIMAL_REGEX
        .get_or_init(|| Regex::new(r"^-?\d+\.\d+$").expect("Failed to compile decimal regex"))
}

fn get_date_regex() -> &'static Regex {
    DATE_REGEX.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("Failed to compile date regex"))
}

fn get_ein_regex() -> &'static Regex {
    EIN_REGEX.get_or_init(|| Regex::new(r"^\d{2}-\d{7}$").expect("Failed to compile EIN regex"))
}

/// Counts and first sample for one xpath within one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct XpathObservation {
    pub occurrences: usize,
    pub sample: Option<String>,
}

/// Everything observed in one filing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilingObservation {
    pub path: PathBuf,
    pub version: String,
    /// First-level element names below the wrappers, in document order
    pub form_types: Vec<String>,
    pub ein: Option<String>,
    pub tax_period: Option<String>,
    pub organization_name: Option<String>,
    pub total_elements: usize,
    pub xpaths: BTreeMap<String, XpathObservation>,
}

impl FilingObservation {
    pub fn distinct_xpaths(&self) -> usize {
        self.xpaths.len()
    }
}

/// Per-document failure recorded by the auditor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilingFailure {
    pub path: PathBuf,
    pub reason: String,
}

impl FilingFailure {
    pub fn from_error(path: &Path, error: &FilingError) -> Self {
        Self {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug)]
enum FrameKind {
    Wrapper,
    Header(Vec<String>),
    Observed(String),
}

#[derive(Debug)]
struct Frame {
    name: String,
    kind: FrameKind,
    text: String,
}

/// Streaming filing parser
#[derive(Debug, Clone)]
pub struct FilingParser {
    version_attribute: String,
    wrappers: Vec<String>,
    header_element: String,
}

impl FilingParser {
    pub fn new(version_attribute: impl Into<String>, wrappers: Vec<String>) -> Self {
        Self {
            version_attribute: version_attribute.into(),
            wrappers,
            header_element: DEFAULT_HEADER_ELEMENT.to_string(),
        }
    }

    pub fn with_header_element(mut self, name: impl Into<String>) -> Self {
        self.header_element = name.into();
        self
    }

    pub fn version_attribute(&self) -> &str {
        &self.version_attribute
    }

    /// Read and parse one filing from disk
    pub async fn parse_file(&self, path: &Path) -> Result<FilingObservation, FilingError> {
        let bytes = fs::read(path).await.map_err(|e| FilingError::Io {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        self.parse(path, &String::from_utf8_lossy(&bytes))
    }

    pub fn parse(&self, path: &Path, text: &str) -> Result<FilingObservation, FilingError> {
        let malformed = |details: String| FilingError::Malformed {
            path: path.to_path_buf(),
            details,
        };

        let mut reader = Reader::from_str(text);
        let mut buf = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();
        let mut version: Option<String> = None;
        let mut seen_root = false;
        let mut observation = FilingObservation {
            path: path.to_path_buf(),
            version: String::new(),
            form_types: Vec::new(),
            ein: None,
            tax_period: None,
            organization_name: None,
            total_elements: 0,
            xpaths: BTreeMap::new(),
        };
        let mut tax_period_rank = usize::MAX;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if stack.is_empty() {
                        if seen_root {
                            return Err(malformed("multiple root elements".to_string()));
                        }
                        seen_root = true;
                        version = self.root_version(e);
                    }
                    let frame = self.open(e, &stack, &mut observation);
                    stack.push(frame);
                }
                Ok(Event::Empty(ref e)) => {
                    if stack.is_empty() {
                        if seen_root {
                            return Err(malformed("multiple root elements".to_string()));
                        }
                        seen_root = true;
                        version = self.root_version(e);
                    }
                    let frame = self.open(e, &stack, &mut observation);
                    Self::close(frame, &mut observation, &mut tax_period_rank);
                }
                Ok(Event::End(_)) => {
                    let Some(frame) = stack.pop() else {
                        return Err(malformed("unbalanced end tag".to_string()));
                    };
                    Self::close(frame, &mut observation, &mut tax_period_rank);
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Ok(Event::CData(ref e)) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Ok(Event::GeneralRef(ref e)) => {
                    if let Some(frame) = stack.last_mut() {
                        if let Some(ch) = predefined_entity(e.as_ref()) {
                            frame.text.push(ch);
                        } else if let Ok(Some(ch)) = e.resolve_char_ref() {
                            frame.text.push(ch);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(malformed(format!(
                        "{} at byte {}",
                        e,
                        reader.error_position()
                    )));
                }
            }
            buf.clear();
        }

        if let Some(open) = stack.last() {
            return Err(malformed(format!(
                "unexpected end of document inside <{}>",
                open.name
            )));
        }
        if !seen_root {
            return Err(malformed("document has no root element".to_string()));
        }

        observation.version = version.ok_or_else(|| FilingError::MissingVersion {
            path: path.to_path_buf(),
            attribute: self.version_attribute.clone(),
        })?;
        Ok(observation)
    }

    fn root_version(&self, e: &BytesStart<'_>) -> Option<String> {
        e.attributes().flatten().find_map(|attr| {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            if key == self.version_attribute {
                let value = String::from_utf8_lossy(&attr.value).trim().to_string();
                (!value.is_empty()).then_some(value)
            } else {
                None
            }
        })
    }

    fn open(
        &self,
        e: &BytesStart<'_>,
        stack: &[Frame],
        observation: &mut FilingObservation,
    ) -> Frame {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

        let kind = match stack.last().map(|f| &f.kind) {
            None | Some(FrameKind::Wrapper) if self.wrappers.contains(&name) => FrameKind::Wrapper,
            None | Some(FrameKind::Wrapper) if name == self.header_element => {
                FrameKind::Header(Vec::new())
            }
            None | Some(FrameKind::Wrapper) => {
                if !observation.form_types.contains(&name) {
                    observation.form_types.push(name.clone());
                }
                FrameKind::Observed(format!("/{}", name))
            }
            Some(FrameKind::Header(path)) => {
                let mut path = path.clone();
                path.push(name.clone());
                FrameKind::Header(path)
            }
            Some(FrameKind::Observed(parent)) => FrameKind::Observed(format!("{}/{}", parent, name)),
        };

        if let FrameKind::Observed(xpath) = &kind {
            observation.total_elements += 1;
            observation.xpaths.entry(xpath.clone()).or_default().occurrences += 1;
        }

        Frame {
            name,
            kind,
            text: String::new(),
        }
    }

    fn close(frame: Frame, observation: &mut FilingObservation, tax_period_rank: &mut usize) {
        let value = frame.text.trim();
        if value.is_empty() {
            return;
        }

        match frame.kind {
            FrameKind::Observed(xpath) => {
                if let Some(entry) = observation.xpaths.get_mut(&xpath)
                    && entry.sample.is_none()
                {
                    entry.sample = Some(value.chars().take(SAMPLE_MAX_CHARS).collect());
                }
            }
            FrameKind::Header(path) => {
                let segments: Vec<&str> = path.iter().map(String::as_str).collect();
                match segments.as_slice() {
                    [single] => {
                        if let Some(rank) = TAX_PERIOD_ELEMENTS.iter().position(|n| n == single)
                            && rank < *tax_period_rank
                        {
                            *tax_period_rank = rank;
                            observation.tax_period = Some(value.to_string());
                        }
                    }
                    ["Filer", "EIN"] => {
                        observation.ein.get_or_insert_with(|| value.to_string());
                    }
                    ["Filer", "BusinessName" | "Name", "BusinessNameLine1Txt" | "BusinessNameLine1"] => {
                        observation
                            .organization_name
                            .get_or_insert_with(|| value.to_string());
                    }
                    _ => {}
                }
            }
            FrameKind::Wrapper => {}
        }
    }
}

/// Coarse type of an observed value
pub fn guess_data_type(sample: Option<&str>) -> &'static str {
    let Some(value) = sample.map(str::trim).filter(|v| !v.is_empty()) else {
        return "unknown";
    };

    if matches!(
        value.to_lowercase().as_str(),
        "true" | "false" | "0" | "1" | "x"
    ) {
        "boolean"
    } else if get_integer_regex().is_match(value) {
        "integer"
    } else if get_decimal_regex().is_match(value) {
        "decimal"
    } else if get_date_regex().is_match(value) {
        "date"
    } else if get_ein_regex().is_match(value) {
        "ein"
    } else if value.chars().count() > 50 {
        "text_long"
    } else {
        "text"
    }
}
