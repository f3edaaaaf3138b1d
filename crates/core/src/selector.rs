//! Label and field selectors in the API server's textual syntax.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

use crate::{CacheError, CacheResult};

static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
        .expect("label key pattern")
});
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("label value pattern"));
static SET_TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^\s!=(),]+)\s+(in|notin)\s*\((.*)\)$").expect("set term pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    DoubleEquals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Operator {
    pub fn is_equality(self) -> bool {
        matches!(self, Operator::Equals | Operator::DoubleEquals)
    }
}

/// One label requirement, e.g. `tier in (web,api)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub op: Operator,
    pub values: SmallVec<[String; 2]>,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let got = labels.get(&self.key);
        match self.op {
            Operator::Equals | Operator::DoubleEquals => got.map(|v| self.values.iter().any(|w| w == v)).unwrap_or(false),
            Operator::NotEquals => got.map(|v| self.values.iter().all(|w| w != v)).unwrap_or(true),
            Operator::In => got.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => got.map(|v| !self.values.contains(v)).unwrap_or(true),
            Operator::Exists => got.is_some(),
            Operator::DoesNotExist => got.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.values.first().map(String::as_str).unwrap_or("");
        match self.op {
            Operator::Equals => write!(f, "{}={}", self.key, first),
            Operator::DoubleEquals => write!(f, "{}=={}", self.key, first),
            Operator::NotEquals => write!(f, "{}!={}", self.key, first),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring every `(key, value)` pair to be present.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let reqs = pairs
            .into_iter()
            .map(|(k, v)| Requirement { key: k.to_string(), op: Operator::Equals, values: SmallVec::from_elem(v.to_string(), 1) })
            .collect();
        Self { reqs }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.reqs
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    /// Matches against optional object labels (absent labels match like an empty map).
    pub fn matches_opt(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(l) => self.matches(l),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl FromStr for LabelSelector {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }
        let reqs = split_top_level(s)?.into_iter().map(parse_label_term).collect::<CacheResult<Vec<_>>>()?;
        Ok(Self { reqs })
    }
}

fn split_top_level(s: &str) -> CacheResult<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(CacheError::InvalidSelector(format!("unbalanced ')' in {:?}", s)));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CacheError::InvalidSelector(format!("unbalanced '(' in {:?}", s)));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn check_key(key: &str) -> CacheResult<String> {
    if LABEL_KEY.is_match(key) {
        Ok(key.to_string())
    } else {
        Err(CacheError::InvalidSelector(format!("invalid label key {:?}", key)))
    }
}

fn check_value(value: &str) -> CacheResult<String> {
    if LABEL_VALUE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(CacheError::InvalidSelector(format!("invalid label value {:?}", value)))
    }
}

fn parse_label_term(raw: &str) -> CacheResult<Requirement> {
    let term = raw.trim();
    if term.is_empty() {
        return Err(CacheError::InvalidSelector("empty label requirement".into()));
    }
    if let Some(caps) = SET_TERM.captures(term) {
        let op = if &caps[2] == "in" { Operator::In } else { Operator::NotIn };
        let values = caps[3]
            .split(',')
            .map(|v| check_value(v.trim()))
            .collect::<CacheResult<SmallVec<[String; 2]>>>()?;
        if values.iter().all(|v| v.is_empty()) {
            return Err(CacheError::InvalidSelector(format!("empty value set in {:?}", term)));
        }
        return Ok(Requirement { key: check_key(&caps[1])?, op, values });
    }
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement { key: check_key(rest.trim())?, op: Operator::DoesNotExist, values: SmallVec::new() });
    }
    let (key, op, value) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals, v)
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::DoubleEquals, v)
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals, v)
    } else {
        return Ok(Requirement { key: check_key(term)?, op: Operator::Exists, values: SmallVec::new() });
    };
    Ok(Requirement { key: check_key(key.trim())?, op, values: SmallVec::from_elem(check_value(value.trim())?, 1) })
}

/// One field requirement, e.g. `spec.color==red`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequirement {
    pub field: String,
    pub op: Operator,
    pub value: String,
}

/// Conjunction of field requirements (`=`, `==`, `!=`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    reqs: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn one_term_equal(field: &str, value: &str) -> Self {
        Self { reqs: vec![FieldRequirement { field: field.to_string(), op: Operator::Equals, value: value.to_string() }] }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn requirements(&self) -> &[FieldRequirement] {
        &self.reqs
    }

    /// `(field, value)` when the selector is exactly one `field=value` or
    /// `field==value` requirement.
    pub fn requires_exact_match(&self) -> Option<(&str, &str)> {
        match self.reqs.as_slice() {
            [r] if r.op.is_equality() => Some((r.field.as_str(), r.value.as_str())),
            _ => None,
        }
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let op = match r.op {
                Operator::DoubleEquals => "==",
                Operator::NotEquals => "!=",
                _ => "=",
            };
            write!(f, "{}{}{}", r.field, op, r.value)?;
        }
        Ok(())
    }
}

impl FromStr for FieldSelector {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }
        let mut reqs = Vec::new();
        for raw in s.split(',') {
            let term = raw.trim();
            let (field, op, value) = if let Some((k, v)) = term.split_once("!=") {
                (k, Operator::NotEquals, v)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, Operator::DoubleEquals, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, Operator::Equals, v)
            } else {
                return Err(CacheError::InvalidSelector(format!("field requirement {:?} has no operator", term)));
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(CacheError::InvalidSelector(format!("field requirement {:?} has no field", term)));
            }
            reqs.push(FieldRequirement { field: field.to_string(), op, value: value.trim().to_string() });
        }
        Ok(Self { reqs })
    }
}
