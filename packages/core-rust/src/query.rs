//! Query vocabulary at the REST boundary: options and sub-query operators.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::types::{Map, Value};

/// A where-clause: field name or `$or`/`$and` to constraint.
pub type Where = Map;

/// Fields every projection keeps.
pub const ALWAYS_SELECTED_KEYS: [&str; 3] = ["objectId", "createdAt", "updatedAt"];

/// Operators that need a nested query executed before the outer query can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubqueryOp {
    Select,
    DontSelect,
    InQuery,
    NotInQuery,
}

impl SubqueryOp {
    pub const ALL: [SubqueryOp; 4] = [
        SubqueryOp::Select,
        SubqueryOp::DontSelect,
        SubqueryOp::InQuery,
        SubqueryOp::NotInQuery,
    ];

    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Select => "$select",
            Self::DontSelect => "$dontSelect",
            Self::InQuery => "$inQuery",
            Self::NotInQuery => "$notInQuery",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.key() == key)
    }

    /// `$in` for the including operators, `$nin` for the excluding ones.
    #[must_use]
    pub fn merge_key(self) -> &'static str {
        match self {
            Self::Select | Self::InQuery => "$in",
            Self::DontSelect | Self::NotInQuery => "$nin",
        }
    }
}

/// One `order` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Parsed REST query options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Projection; `None` selects every field.
    pub keys: Option<BTreeSet<String>>,
    pub count: bool,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub order: Vec<SortKey>,
    /// Include paths as given, before prefix expansion.
    pub include: Vec<String>,
    pub redirect_class_name_for_key: Option<String>,
}

impl QueryOptions {
    /// Parses the raw option map.
    ///
    /// Recognized names: `keys`, `count`, `skip`, `limit`, `order`,
    /// `include`, `redirectClassNameForKey`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` for an unrecognized option or a value of the
    /// wrong type.
    pub fn from_raw(raw: &Map) -> Result<Self> {
        let mut options = Self::default();
        for (name, value) in raw {
            match name.as_str() {
                "keys" => options.keys = Some(parse_keys(&comma_list(name, value)?)),
                "count" => options.count = parse_flag(name, value)?,
                "skip" => options.skip = Some(parse_count(name, value)?),
                "limit" => options.limit = Some(parse_count(name, value)?),
                "order" => {
                    options.order = comma_list(name, value)?
                        .into_iter()
                        .map(|field| match field.strip_prefix('-') {
                            Some(rest) => SortKey {
                                field: rest.to_string(),
                                descending: true,
                            },
                            None => SortKey {
                                field,
                                descending: false,
                            },
                        })
                        .collect();
                }
                "include" => options.include = comma_list(name, value)?,
                "redirectClassNameForKey" => {
                    let key = value.as_str().ok_or_else(|| {
                        Error::InvalidJson("redirectClassNameForKey must be a string".to_string())
                    })?;
                    options.redirect_class_name_for_key = Some(key.to_string());
                }
                other => return Err(Error::InvalidJson(format!("bad option: {other}"))),
            }
        }
        Ok(options)
    }

    /// Include paths expanded to their prefix closure, in ascending order.
    ///
    /// `"a.b"` yields `"a"` and `"a.b"`, so a parent path is always hydrated
    /// before a child path descends into it.
    #[must_use]
    pub fn include_paths(&self) -> Vec<String> {
        let mut paths = BTreeSet::new();
        for path in &self.include {
            let segments: Vec<&str> = path.split('.').collect();
            for end in 1..=segments.len() {
                paths.insert(segments[..end].join("."));
            }
        }
        paths.into_iter().collect()
    }
}

fn comma_list(name: &str, value: &Value) -> Result<Vec<String>> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::InvalidJson(format!("{name} must be a comma-separated string")))?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_keys(keys: &[String]) -> BTreeSet<String> {
    let mut selected: BTreeSet<String> = ALWAYS_SELECTED_KEYS
        .iter()
        .map(|k| (*k).to_string())
        .collect();
    for key in keys {
        // "a.b" needs "a" fetched to project into it.
        if let Some((head, _)) = key.split_once('.') {
            selected.insert(head.to_string());
        }
        selected.insert(key.clone());
    }
    selected
}

fn parse_flag(name: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(i) => Ok(*i != 0),
        Value::String(s) if s == "1" || s == "true" => Ok(true),
        Value::String(s) if s == "0" || s == "false" => Ok(false),
        other => Err(Error::InvalidJson(format!(
            "{name} must be a boolean, got {}",
            other.type_name()
        ))),
    }
}

fn parse_count(name: &str, value: &Value) -> Result<usize> {
    let parsed = match value {
        Value::Int(i) => usize::try_from(*i).ok(),
        Value::String(s) => s.parse::<usize>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::InvalidJson(format!("{name} must be a non-negative integer")))
}
