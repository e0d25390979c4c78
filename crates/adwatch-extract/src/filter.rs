use std::collections::HashMap;

use serde_yaml::Value;
use thiserror::Error;

/// Problems found while normalizing a raw policy. None of them are fatal: the
/// offending part simply stops constraining titles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyWarning {
    #[error("filter policy is not a mapping of level name to keyword list; treating as unconstrained")]
    NotAMapping,
    #[error("ignoring filter key `{0}`: expected `level<N>` with N >= 1")]
    UnrecognizedLevel(String),
    #[error("level{0} is not a keyword list; skipping level")]
    NotAList(u32),
    #[error("level{0} contains a non-string or empty keyword; dropping it")]
    InvalidKeyword(u32),
    #[error("level{0} has no usable keywords; skipping level")]
    EmptyLevel(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLevel {
    pub number: u32,
    /// Lowercased, non-empty.
    pub keywords: Vec<String>,
}

impl FilterLevel {
    fn matches(&self, lowered_title: &str) -> bool {
        self.keywords.iter().any(|kw| lowered_title.contains(kw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// First level (in ascending order) with no matching keyword.
    Reject { level: u32 },
}

/// Leveled keyword policy for one source. A title passes when every level
/// has at least one keyword that is a case-insensitive substring of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    levels: Vec<FilterLevel>,
}

/// `level<N>` with `N` written as plain decimal digits, `N >= 1`.
fn level_number(key: &str) -> Option<u32> {
    let digits = key.strip_prefix("level")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

impl FilterPolicy {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn from_levels<I, K, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = (u32, K)>,
        K: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for (number, keywords) in levels {
            let keywords: Vec<String> = keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if number > 0 && !keywords.is_empty() {
                out.push(FilterLevel { number, keywords });
            }
        }
        out.sort_by_key(|l| l.number);
        Self { levels: out }
    }

    /// Normalizes a raw configuration value once, at load time.
    pub fn from_value(value: &Value) -> (Self, Vec<PolicyWarning>) {
        let mut warnings = Vec::new();
        let mapping = match value {
            Value::Null => return (Self::unconstrained(), warnings),
            Value::Mapping(m) => m,
            _ => {
                warnings.push(PolicyWarning::NotAMapping);
                return (Self::unconstrained(), warnings);
            }
        };

        let mut levels = Vec::new();
        for (key, raw) in mapping {
            let Some(number) = key.as_str().and_then(level_number) else {
                let shown = match key.as_str() {
                    Some(s) => s.to_string(),
                    None => format!("{key:?}"),
                };
                warnings.push(PolicyWarning::UnrecognizedLevel(shown));
                continue;
            };
            let Value::Sequence(items) = raw else {
                warnings.push(PolicyWarning::NotAList(number));
                continue;
            };

            let mut keywords = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(kw) if !kw.is_empty() => keywords.push(kw.to_string()),
                    _ => warnings.push(PolicyWarning::InvalidKeyword(number)),
                }
            }
            if keywords.is_empty() {
                warnings.push(PolicyWarning::EmptyLevel(number));
                continue;
            }
            levels.push((number, keywords));
        }

        (Self::from_levels(levels), warnings)
    }

    pub fn levels(&self) -> &[FilterLevel] {
        &self.levels
    }

    pub fn is_unconstrained(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn evaluate(&self, title: &str) -> Verdict {
        let lowered = title.to_lowercase();
        self.levels
            .iter()
            .find(|level| !level.matches(&lowered))
            .map_or(Verdict::Pass, |level| Verdict::Reject {
                level: level.number,
            })
    }

    pub fn passes(&self, title: &str) -> bool {
        self.evaluate(title) == Verdict::Pass
    }
}

/// Policies keyed by source URL. Sources without an entry always pass.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    policies: HashMap<String, FilterPolicy>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_url: impl Into<String>, policy: FilterPolicy) {
        self.policies.insert(source_url.into(), policy);
    }

    pub fn policy(&self, source_url: &str) -> Option<&FilterPolicy> {
        self.policies.get(source_url)
    }

    pub fn evaluate(&self, source_url: &str, title: &str) -> Verdict {
        self.policy(source_url)
            .map_or(Verdict::Pass, |policy| policy.evaluate(title))
    }

    pub fn passes(&self, source_url: &str, title: &str) -> bool {
        self.evaluate(source_url, title) == Verdict::Pass
    }
}
