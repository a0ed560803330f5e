//! Naming helpers: PascalCase tokenizing, abbreviation expansion,
//! human-readable labels and friendly type names.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Abbreviations used in element names, with their display expansion
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("addr", "Address"),
    ("addrss", "Address"),
    ("amt", "Amount"),
    ("bnft", "Benefit"),
    ("bnfts", "Benefits"),
    ("bns", "Bonus"),
    ("boy", "Beginning Of Year"),
    ("bs", "Base"),
    ("bsnss", "Business"),
    ("cd", "Code"),
    ("cmps", "Compensation"),
    ("cmpnst", "Compensation"),
    ("cmpnstn", "Compensation"),
    ("cnt", "Count"),
    ("cntrbtn", "Contribution"),
    ("cntrbtns", "Contributions"),
    ("cy", "Current Year"),
    ("desc", "Description"),
    ("dfrd", "Deferred"),
    ("dfrrd", "Deferred"),
    ("dsqlfyng", "Disqualifying"),
    ("dsrgrd", "Disregarded"),
    ("dt", "Date"),
    ("empl", "Employee"),
    ("eoy", "End Of Year"),
    ("expns", "Expenses"),
    ("expnss", "Expenses"),
    ("flng", "Filing"),
    ("fndrsng", "Fundraising"),
    ("frgn", "Foreign"),
    ("gvrnng", "Governing"),
    ("grnt", "Grant"),
    ("grnts", "Grants"),
    ("grp", "Group"),
    ("id", "Identification"),
    ("ind", "Indicator"),
    ("intrstd", "Interested"),
    ("invst", "Investment"),
    ("mmbr", "Member"),
    ("nm", "Name"),
    ("nntxbl", "Nontaxable"),
    ("num", "Number"),
    ("nzn", "Organization"),
    ("nztn", "Organization"),
    ("offcr", "Officer"),
    ("org", "Organization"),
    ("orgn", "Organization"),
    ("orgnztn", "Organization"),
    ("pblc", "Public"),
    ("prgrm", "Program"),
    ("prsn", "Person"),
    ("prtcl", "Protocol"),
    ("prtnr", "Partner"),
    ("prty", "Party"),
    ("py", "Prior Year"),
    ("pymnt", "Payment"),
    ("rltd", "Related"),
    ("rpt", "Report"),
    ("rptbl", "Reportable"),
    ("rt", "Rate"),
    ("rvn", "Revenue"),
    ("rvns", "Revenues"),
    ("schdl", "Schedule"),
    ("shr", "Share"),
    ("shrhld", "Shareholder"),
    ("sprt", "Support"),
    ("srvcs", "Services"),
    ("strt", "Street"),
    ("svrnc", "Severance"),
    ("trnsctn", "Transaction"),
    ("trst", "Trust"),
    ("ttl", "Total"),
    ("txt", "Text"),
    ("xcs", "Excess"),
    ("yr", "Year"),
];

static ABBREVIATION_MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();

fn abbreviation_map() -> &'static HashMap<&'static str, &'static str> {
    ABBREVIATION_MAP.get_or_init(|| ABBREVIATIONS.iter().copied().collect())
}

/// Display expansion of a single token, if it is a known abbreviation
pub fn expand_token(token: &str) -> Option<&'static str> {
    abbreviation_map()
        .get(token.to_ascii_lowercase().as_str())
        .copied()
}

static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_token_regex() -> &'static Regex {
    TOKEN_REGEX.get_or_init(|| {
        Regex::new(r"(?P<upper>\p{Lu}+)(?P<lower>\p{Ll}*)|\p{Ll}+|[0-9]+")
            .expect("Failed to compile token regex")
    })
}

/// Split a PascalCase identifier into words.
///
/// Acronym runs stay together (`EOYAmt` -> `EOY`, `Amt`), digits form their
/// own tokens and any other character separates words.
pub fn tokenize(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    for caps in get_token_regex().captures_iter(name) {
        let (Some(upper), Some(lower)) = (caps.name("upper"), caps.name("lower")) else {
            tokens.push(caps[0].to_string());
            continue;
        };
        let upper = upper.as_str();
        let lower = lower.as_str();

        // the last capital of an acronym run starts the following word
        match upper.char_indices().last() {
            Some((split, _)) if split > 0 && !lower.is_empty() => {
                tokens.push(upper[..split].to_string());
                tokens.push(format!("{}{}", &upper[split..], lower));
            }
            _ => tokens.push(caps[0].to_string()),
        }
    }

    tokens
}

/// Lowercase, abbreviation-expanded form used to compare renamed elements
pub fn normalize_name(name: &str) -> String {
    let tokens = tokenize(name);
    if tokens.is_empty() {
        return name.to_lowercase();
    }
    tokens
        .iter()
        .map(|t| match expand_token(t) {
            Some(expansion) => expansion.to_lowercase().replace(' ', ""),
            None => t.to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `TotalRevenueAmt` -> `Total Revenue Amount`
pub fn human_label(name: &str) -> String {
    tokenize(name)
        .iter()
        .map(|t| expand_token(t).map(str::to_string).unwrap_or_else(|| t.clone()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Words of an identifier without abbreviation expansion
pub fn split_words(name: &str) -> String {
    tokenize(name).join(" ")
}

/// Fallback description when a field carries no documentation
pub fn infer_description(xpath: &str) -> String {
    let segments: Vec<&str> = xpath.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        [.., parent, leaf] => format!("{} (within {})", split_words(leaf), split_words(parent)),
        [leaf] => split_words(leaf),
        [] => String::new(),
    }
}

/// Key used to compare documentation text
pub fn normalize_description(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_lowercase()
}

/// Friendly name for a raw schema type
pub fn friendly_type(raw: &str) -> String {
    let friendly = match raw {
        "BooleanType" | "boolean" => "Yes/No",
        "CheckboxType" => "Checkbox (X if checked)",
        "USAmountType" => "Dollar amount (USD)",
        "USAmountNNType" => "Dollar amount, non-negative (USD)",
        "IntegerType" | "integer" | "int" | "long" => "Whole number",
        "IntegerNNType" | "nonNegativeInteger" => "Whole number, non-negative",
        "LargeRatioType" | "RatioType" => "Ratio / percentage",
        "DecimalType" | "decimal" => "Decimal number",
        "LineExplanationType" | "ExplanationType" => "Free-text explanation",
        "ShortExplanationType" => "Short free-text explanation",
        "ShortDescriptionType" => "Short description",
        "PersonNameType" => "Person name",
        "BusinessNameType" => "Organization name",
        "BusinessNameLine1Type" | "BusinessNameLine1Txt" => "Organization name (line 1)",
        "BusinessNameLine2Type" => "Organization name (line 2)",
        "EINType" => "Employer Identification Number",
        "SSNType" => "Social Security Number",
        "YearType" | "gYear" => "Four-digit year",
        "DateType" | "date" => "Date",
        "TimestampType" | "dateTime" => "Date and time",
        "PhoneNumberType" => "Phone number",
        "ZIPCodeType" => "ZIP code",
        "StateType" => "US state abbreviation",
        "CountryType" => "Country code",
        "StringType" | "string" | "normalizedString" | "token" => "Text",
        "StreetAddressType" => "Street address",
        "CityType" => "City name",
        "CountType" => "Count (whole number)",
        _ => raw,
    };
    friendly.to_string()
}

/// Stable identifier derived from an xpath: `/IRS990ScheduleJ/Grp/Amt` -> `IRS990ScheduleJ_Grp_Amt`
pub fn xpath_slug(schedule: &str, xpath: &str) -> String {
    let segments: Vec<&str> = xpath
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let rest = match segments.split_first() {
        Some((first, rest)) if *first == schedule => rest,
        _ => segments.as_slice(),
    };
    if rest.is_empty() {
        schedule.to_string()
    } else {
        format!("{}_{}", schedule, rest.join("_"))
    }
}
