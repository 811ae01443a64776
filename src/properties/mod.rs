//! Layered property store
//!
//! A flat namespace of named values merged from identity seeds and
//! `name=value` files, with `${name}` reference expansion applied to
//! strings, whole files, and configuration documents.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Upper bound on expansion steps for a single `resolve` call.
///
/// A reference cycle (`a -> ${b}`, `b -> ${a}`) would otherwise loop
/// forever; hitting the bound fails with `ExpansionOverflow`.
pub const MAX_EXPANSION_STEPS: usize = 256;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^$}]+)\}").unwrap())
}

/// Errors raised by property storage and resolution
#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("cannot override '{name}' with '{attempted}' (already set to '{existing}')")]
    Conflict {
        name: String,
        existing: String,
        attempted: String,
    },

    #[error("unresolved reference '${{{name}}}'")]
    UnresolvedReference { name: String },

    #[error("expansion of '{input}' exceeded {MAX_EXPANSION_STEPS} steps (reference cycle?)")]
    ExpansionOverflow { input: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A property value: plain text or an integer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        PropertyValue::Number(i64::from(value))
    }
}

/// Merge behavior for `save` and `merge_with`, bitset semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePolicy(u8);

impl SavePolicy {
    /// Write only if the name is absent
    pub const INSERT: SavePolicy = SavePolicy(0b001);

    /// Write only if the name is present
    pub const UPDATE: SavePolicy = SavePolicy(0b010);

    /// Insert or update unconditionally
    pub const UPSERT: SavePolicy = SavePolicy(0b011);

    /// Reject an existing name with a conflict error; inserts otherwise.
    /// Checked before the insert/update bits and does not combine with them.
    pub const RAISE_ON_EXISTING: SavePolicy = SavePolicy(0b100);

    fn allows_insert(self) -> bool {
        self.0 & Self::INSERT.0 != 0
    }

    fn allows_update(self) -> bool {
        self.0 & Self::UPDATE.0 != 0
    }

    fn raises_on_existing(self) -> bool {
        self.0 & Self::RAISE_ON_EXISTING.0 != 0
    }
}

/// A flat name -> value mapping with layered merge and reference expansion
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    entries: HashMap<String, PropertyValue>,
}

impl PropertyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a `name=value` file.
    ///
    /// The first `=` on each line is the delimiter; name and value are
    /// trimmed. Lines without `=` or with an empty name are skipped.
    pub fn from_file(path: &Path, policy: SavePolicy) -> Result<Self, PropertyError> {
        let mut store = Self::new();
        store.load_file(path, policy)?;
        Ok(store)
    }

    /// Merge a `name=value` file into this store
    pub fn load_file(&mut self, path: &Path, policy: SavePolicy) -> Result<&mut Self, PropertyError> {
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            if let Some((name, value)) = parse_name_value(line) {
                self.save(name, value, policy)?;
            }
        }
        Ok(self)
    }

    /// Number of properties held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the store holds no properties
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a property
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    /// Look up a property, failing if absent
    pub fn require(&self, name: &str) -> Result<&PropertyValue, PropertyError> {
        self.entries
            .get(name)
            .ok_or_else(|| PropertyError::UnresolvedReference {
                name: name.to_string(),
            })
    }

    /// Save one property under the given policy.
    ///
    /// `RAISE_ON_EXISTING` fails if the name is already set and inserts
    /// otherwise. For the remaining policies the existing value is left
    /// untouched unless the policy carries `UPDATE`, and new names are
    /// written only when it carries `INSERT`.
    pub fn save(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
        policy: SavePolicy,
    ) -> Result<&mut Self, PropertyError> {
        let name = name.into();
        let value = value.into();
        let exists = self.entries.contains_key(&name);

        let policy = if policy.raises_on_existing() {
            if exists {
                let existing = self
                    .entries
                    .get(&name)
                    .map(PropertyValue::to_string)
                    .unwrap_or_default();
                return Err(PropertyError::Conflict {
                    name,
                    existing,
                    attempted: value.to_string(),
                });
            }
            SavePolicy::INSERT
        } else {
            policy
        };

        if (!exists && policy.allows_insert()) || (exists && policy.allows_update()) {
            self.entries.insert(name, value);
        }
        Ok(self)
    }

    /// Merge every entry of `other` into this store under the given policy.
    ///
    /// Entries are independent; merge order is unspecified.
    pub fn merge_with(
        &mut self,
        other: &PropertyStore,
        policy: SavePolicy,
    ) -> Result<&mut Self, PropertyError> {
        for (name, value) in &other.entries {
            self.save(name.clone(), value.clone(), policy)?;
        }
        Ok(self)
    }

    /// Expand every `${name}` reference in `value` against this store.
    ///
    /// Expansion repeats on the produced text until no reference remains,
    /// so property values may themselves contain references. A name is
    /// trimmed before lookup. Unknown names fail with
    /// `UnresolvedReference`; runaway expansion fails with
    /// `ExpansionOverflow` after `MAX_EXPANSION_STEPS` steps.
    pub fn resolve(&self, value: &str) -> Result<String, PropertyError> {
        let pattern = reference_pattern();
        let mut current = value.to_string();
        for _ in 0..MAX_EXPANSION_STEPS {
            let Some(captures) = pattern.captures(&current) else {
                return Ok(current);
            };
            let whole = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let name = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let replacement = self.require(name)?.to_string();
            current.replace_range(whole.0..whole.1, &replacement);
        }
        Err(PropertyError::ExpansionOverflow {
            input: value.to_string(),
        })
    }

    /// Rewrite a template file in place with every line resolved.
    ///
    /// The expanded content is written to a sibling temp file and renamed
    /// over the original, so a resolution or write failure leaves the
    /// template untouched.
    pub fn apply_to_file(&self, path: &Path) -> Result<(), PropertyError> {
        let contents = fs::read_to_string(path)?;
        let mut expanded = String::with_capacity(contents.len());
        for line in contents.split_inclusive('\n') {
            expanded.push_str(&self.resolve(line)?);
        }

        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".expanding");
        let tmp = Path::new(&tmp);
        fs::write(tmp, expanded)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn parse_name_value(line: &str) -> Option<(String, String)> {
    let delimiter = line.find('=')?;
    if delimiter == 0 {
        return None;
    }
    let name = line[..delimiter].trim();
    if name.is_empty() {
        return None;
    }
    let value = line[delimiter + 1..].trim();
    Some((name.to_string(), value.to_string()))
}
