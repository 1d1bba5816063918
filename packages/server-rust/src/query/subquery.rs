//! Locating and merging sub-query operators in a where-tree.
//!
//! The compiler repeatedly asks [`find_first`] for the first object (in
//! depth-first order, through objects and arrays) that carries a sub-query
//! operator, executes it, and merges the collected values with
//! [`merge_values`] until no operator is left.

use basalt_core::{Error, Map, Result, SubqueryOp, Value, Where};

/// One step from the where-clause root to a nested node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Key(String),
    Index(usize),
}

/// Location of the first sub-query operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    /// Path to the object holding the operator key.
    pub path: Vec<Step>,
    pub op: SubqueryOp,
}

/// First sub-query operator in depth-first order, if any.
#[must_use]
pub fn find_first(where_clause: &Where) -> Option<Occurrence> {
    let mut path = Vec::new();
    search_map(where_clause, &mut path)
}

fn search_map(map: &Map, path: &mut Vec<Step>) -> Option<Occurrence> {
    if let Some(op) = SubqueryOp::ALL.into_iter().find(|op| map.contains_key(op.key())) {
        return Some(Occurrence { path: path.clone(), op });
    }
    for (key, child) in map {
        path.push(Step::Key(key.clone()));
        if let Some(found) = search_value(child, path) {
            return Some(found);
        }
        path.pop();
    }
    None
}

fn search_value(value: &Value, path: &mut Vec<Step>) -> Option<Occurrence> {
    match value {
        Value::Object(map) => search_map(map, path),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                path.push(Step::Index(index));
                if let Some(found) = search_value(item, path) {
                    return Some(found);
                }
                path.pop();
            }
            None
        }
        _ => None,
    }
}

/// The object at `path`, walking through objects and arrays.
pub fn node_at<'a>(where_clause: &'a mut Where, path: &[Step]) -> Option<&'a mut Map> {
    let Some((first, rest)) = path.split_first() else {
        return Some(where_clause);
    };
    let Step::Key(key) = first else {
        return None;
    };
    let mut value = where_clause.get_mut(key)?;
    for step in rest {
        value = match step {
            Step::Key(key) => value.as_object_mut()?.get_mut(key)?,
            Step::Index(index) => match value {
                Value::Array(items) => items.get_mut(*index)?,
                _ => return None,
            },
        };
    }
    value.as_object_mut()
}

/// Appends `values` to the `$in`/`$nin` array of `node`, creating it if
/// absent.
///
/// # Errors
///
/// Returns `InvalidQuery` if the node already carries a non-array value
/// under that key.
pub fn merge_values(node: &mut Map, op: SubqueryOp, values: Vec<Value>) -> Result<()> {
    let key = op.merge_key();
    match node
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(existing) => {
            existing.extend(values);
            Ok(())
        }
        other => Err(Error::InvalidQuery(format!(
            "{key} must be an array to merge {} results, got {}",
            op.key(),
            other.type_name()
        ))),
    }
}

/// A validated sub-query operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub class_name: String,
    pub where_clause: Where,
    /// Field collected from each row; `None` collects pointers to the rows.
    pub key: Option<String>,
}

/// Validates an operand of `op`.
///
/// `$select`/`$dontSelect` take exactly `{query, key}`, and their `query`
/// takes exactly `{where, className}`. `$inQuery`/`$notInQuery` take
/// exactly `{where, className}`.
///
/// # Errors
///
/// Returns `InvalidQuery` for any other shape.
pub fn parse_operand(op: SubqueryOp, operand: &Value) -> Result<Subquery> {
    let malformed = || Error::InvalidQuery(format!("improper usage of {}", op.key()));
    let operand = operand.as_object().ok_or_else(&malformed)?;
    match op {
        SubqueryOp::Select | SubqueryOp::DontSelect => {
            if !has_exactly(operand, &["query", "key"]) {
                return Err(malformed());
            }
            let (Some(Value::Object(query)), Some(Value::String(key))) =
                (operand.get("query"), operand.get("key"))
            else {
                return Err(malformed());
            };
            let mut parsed = parse_query(query).ok_or_else(&malformed)?;
            parsed.key = Some(key.clone());
            Ok(parsed)
        }
        SubqueryOp::InQuery | SubqueryOp::NotInQuery => parse_query(operand).ok_or_else(malformed),
    }
}

fn has_exactly(map: &Map, keys: &[&str]) -> bool {
    map.len() == keys.len() && keys.iter().all(|key| map.contains_key(*key))
}

/// `{where, className}` with an object `where` and a string `className`.
fn parse_query(query: &Map) -> Option<Subquery> {
    if !has_exactly(query, &["where", "className"]) {
        return None;
    }
    let class_name = query.get("className").and_then(Value::as_str)?;
    let where_clause = query.get("where").and_then(Value::as_object)?;
    Some(Subquery {
        class_name: class_name.to_string(),
        where_clause: where_clause.clone(),
        key: None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(j: serde_json::Value) -> Map {
        match Value::from_json(j).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn finds_nothing_in_plain_where() {
        assert_eq!(find_first(&map(json!({"a": 1, "b": {"$gt": 2}}))), None);
    }

    #[test]
    fn finds_first_occurrence_through_arrays() {
        let where_clause = map(json!({
            "$or": [
                {"a": 1},
                {"team": {"$inQuery": {"where": {}, "className": "Team"}}},
            ],
            "z": {"$select": {"query": {"className": "X"}, "key": "k"}},
        }));
        let found = find_first(&where_clause).unwrap();
        assert_eq!(found.op, SubqueryOp::InQuery);
        assert_eq!(
            found.path,
            vec![Step::Key("$or".into()), Step::Index(1), Step::Key("team".into())]
        );
    }

    #[test]
    fn node_lookup_follows_path() {
        let mut where_clause = map(json!({"$or": [{"a": 1}, {"team": {"$gt": 1}}]}));
        let path = [Step::Key("$or".into()), Step::Index(1), Step::Key("team".into())];
        assert!(node_at(&mut where_clause, &path).unwrap().contains_key("$gt"));
        assert!(node_at(&mut where_clause, &[]).is_some());
    }

    #[test]
    fn merge_appends_to_existing_in() {
        let mut node = map(json!({"$in": ["1003"]}));
        merge_values(&mut node, SubqueryOp::Select, vec!["1001".into(), "1002".into()]).unwrap();
        assert_eq!(node, map(json!({"$in": ["1003", "1001", "1002"]})));

        merge_values(&mut node, SubqueryOp::NotInQuery, vec!["x".into()]).unwrap();
        assert_eq!(node.get("$nin"), Some(&Value::Array(vec!["x".into()])));

        let mut bad = map(json!({"$in": 1}));
        assert!(merge_values(&mut bad, SubqueryOp::InQuery, vec![]).is_err());
    }

    #[test]
    fn operand_shapes() {
        let select = json!({
            "query": {"className": "Team", "where": {"winPct": {"$gt": 0.5}}},
            "key": "city",
        });
        let parsed = parse_operand(SubqueryOp::Select, &Value::from_json(select).unwrap()).unwrap();
        assert_eq!(parsed.class_name, "Team");
        assert_eq!(parsed.key.as_deref(), Some("city"));
        assert_eq!(parsed.where_clause.len(), 1);

        let in_query = json!({"where": {}, "className": "Team"});
        let parsed =
            parse_operand(SubqueryOp::InQuery, &Value::from_json(in_query).unwrap()).unwrap();
        assert_eq!(parsed.key, None);

        let team = json!({"className": "Team", "where": {}});
        let limited = json!({"className": "Team", "where": {}, "limit": 1});
        let bad_shapes = [
            (SubqueryOp::Select, json!({"query": team})),
            (SubqueryOp::Select, json!({"query": team, "key": "a", "extra": 1})),
            (SubqueryOp::Select, json!({"query": {"className": "Team"}, "key": "city"})),
            (SubqueryOp::Select, json!({"query": limited, "key": "city"})),
            (SubqueryOp::DontSelect, json!({"query": {"where": {}}, "key": "a"})),
            (SubqueryOp::InQuery, json!({"className": "Team"})),
            (SubqueryOp::InQuery, json!({"where": {}, "className": "Team", "limit": 1})),
            (SubqueryOp::InQuery, json!({"where": {}, "className": "Team", "bogus": 1})),
            (SubqueryOp::InQuery, json!({"where": [], "className": "Team"})),
            (SubqueryOp::NotInQuery, json!({"where": {}})),
            (SubqueryOp::InQuery, json!("Team")),
        ];
        for (op, shape) in bad_shapes {
            let err = parse_operand(op, &Value::from_json(shape.clone()).unwrap()).unwrap_err();
            assert!(matches!(err, Error::InvalidQuery(_)), "{shape}");
        }
    }
}
