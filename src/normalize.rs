use std::sync::OnceLock;

use regex::Regex;

/// Label suffix some upstream records append to facility names.
pub const NOISE_SUFFIX: &str = "PROFIS";

const ALL_SENTINELS: [&str; 3] = ["todos", "todas", "all"];

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static whitespace pattern"))
}

fn noise_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\s*{NOISE_SUFFIX}\s*$")).expect("static suffix pattern")
    })
}

/// Drops commas, turns hyphens into spaces and collapses whitespace runs.
pub fn clean_unit_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .filter(|c| *c != ',')
        .map(|c| if c == '-' { ' ' } else { c })
        .collect();
    whitespace_re().replace_all(&replaced, " ").trim().to_string()
}

pub fn strip_noise_suffix(value: &str) -> String {
    noise_suffix_re().replace(value, "").trim().to_string()
}

/// Full normalization: cleaned and with the noise suffix removed.
pub fn normalize_unit_name(raw: &str) -> String {
    strip_noise_suffix(&clean_unit_name(raw))
}

/// Treats empty selectors and "all" sentinels as no filter.
pub fn normalize_select(value: Option<&str>) -> Option<String> {
    let value = value?;
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() || ALL_SENTINELS.contains(&lowered.as_str()) {
        return None;
    }
    Some(value.trim().to_string())
}
