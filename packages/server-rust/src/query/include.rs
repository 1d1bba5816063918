//! Include expansion: hydrating pointers in result rows.
//!
//! Paths are processed in ascending order of their prefix closure, so the
//! pointers of `a` are hydrated before `a.b` descends into them. Pointers
//! at each path are grouped by class and fetched in one nested query per
//! class with the caller's principal; pointers that stay hidden remain
//! pointers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use basalt_core::query::ALWAYS_SELECTED_KEYS;
use basalt_core::{Map, Pointer, QueryOptions, Result, Value, Where};
use tracing::debug;

use super::compiler::QueryCompiler;

type Fetched = HashMap<(String, String), Map>;

/// Hydrates every pointer named by the compiler's `include` option.
///
/// # Errors
///
/// Propagates errors of the nested queries.
pub async fn expand_includes(compiler: &QueryCompiler, rows: &mut [Map]) -> Result<()> {
    for path in compiler.options().include_paths() {
        let segments: Vec<&str> = path.split('.').collect();
        let mut wanted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows.iter() {
            collect_in_map(row, &segments, &mut wanted);
        }
        if wanted.is_empty() {
            continue;
        }

        let keys = nested_keys(compiler.options(), &path);
        let mut fetched = Fetched::new();
        for (class_name, ids) in wanted {
            if !compiler.context().schema.has_class(&class_name).await {
                continue;
            }
            debug!(path = %path, class = %class_name, ids = ids.len(), "including pointers");
            let mut where_clause = Where::new();
            where_clause.insert(
                "objectId".to_string(),
                Value::Object(Map::from([(
                    "$in".to_string(),
                    Value::Array(ids.into_iter().map(Value::String).collect()),
                )])),
            );
            let options = QueryOptions {
                keys: keys.clone(),
                ..QueryOptions::default()
            };
            let response = compiler
                .nested(class_name.clone(), where_clause, options)?
                .execute()
                .await?;
            for row in response.results {
                if let Some(id) = row.get("objectId").and_then(Value::as_str).map(str::to_string) {
                    fetched.insert((class_name.clone(), id), row);
                }
            }
        }

        for row in rows.iter_mut() {
            replace_in_map(row, &segments, &fetched);
        }
    }
    Ok(())
}

/// Projection for the objects included at `path`: the `path.`-prefixed
/// entries of the outer `keys`, or everything if there are none.
fn nested_keys(options: &QueryOptions, path: &str) -> Option<BTreeSet<String>> {
    let prefix = format!("{path}.");
    let suffixes: Vec<&str> = options
        .keys
        .as_ref()?
        .iter()
        .filter_map(|key| key.strip_prefix(&prefix))
        .collect();
    if suffixes.is_empty() {
        return None;
    }
    let mut keys: BTreeSet<String> =
        ALWAYS_SELECTED_KEYS.iter().map(|k| (*k).to_string()).collect();
    for suffix in suffixes {
        if let Some((head, _)) = suffix.split_once('.') {
            keys.insert(head.to_string());
        }
        keys.insert(suffix.to_string());
    }
    Some(keys)
}

fn collect_in_map(map: &Map, segments: &[&str], wanted: &mut BTreeMap<String, BTreeSet<String>>) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Some(child) = map.get(*first) else {
        return;
    };
    if rest.is_empty() {
        let mut want = |p: &Pointer| {
            wanted
                .entry(p.class_name.clone())
                .or_default()
                .insert(p.object_id.clone());
        };
        match child {
            Value::Pointer(p) => want(p),
            Value::Array(items) => {
                for item in items {
                    if let Value::Pointer(p) = item {
                        want(p);
                    }
                }
            }
            _ => {}
        }
        return;
    }
    match child {
        Value::Object(inner) => collect_in_map(inner, rest, wanted),
        Value::Array(items) => {
            for inner in items.iter().filter_map(Value::as_object) {
                collect_in_map(inner, rest, wanted);
            }
        }
        _ => {}
    }
}

fn replace_in_map(map: &mut Map, segments: &[&str], fetched: &Fetched) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Some(child) = map.get_mut(*first) else {
        return;
    };
    if rest.is_empty() {
        match child {
            Value::Array(items) => items.iter_mut().for_each(|item| hydrate(item, fetched)),
            single => hydrate(single, fetched),
        }
        return;
    }
    match child {
        Value::Object(inner) => replace_in_map(inner, rest, fetched),
        Value::Array(items) => {
            for inner in items.iter_mut().filter_map(Value::as_object_mut) {
                replace_in_map(inner, rest, fetched);
            }
        }
        _ => {}
    }
}

/// Replaces a fetched pointer with its object, tagged `__type: "Object"`.
fn hydrate(value: &mut Value, fetched: &Fetched) {
    let replacement = match value {
        Value::Pointer(p) => fetched
            .get(&(p.class_name.clone(), p.object_id.clone()))
            .map(|object| {
                let mut object = object.clone();
                object.insert("__type".to_string(), Value::from("Object"));
                object.insert("className".to_string(), Value::from(p.class_name.as_str()));
                Value::Object(object)
            }),
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::auth::Auth;
    use crate::query::write::WriteExecutor;
    use crate::service::{ServerConfig, ServerContext};
    use crate::storage::{MemorySchemaProvider, MemoryStorage};

    fn map(j: serde_json::Value) -> Map {
        match Value::from_json(j).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn ptr(class: &str, object: &Map) -> serde_json::Value {
        let id = object.get("objectId").and_then(Value::as_str).unwrap();
        json!({"__type": "Pointer", "className": class, "objectId": id})
    }

    #[tokio::test]
    async fn nested_paths_hydrate_in_order() {
        let ctx = ServerContext::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemorySchemaProvider::new()),
            ServerConfig::default(),
        );
        let writer = WriteExecutor::new(Arc::clone(&ctx));
        let master = Auth::master();
        let coach = writer.create(&master, "Coach", &map(json!({"name": "kim"}))).await.unwrap();
        let team = writer
            .create(
                &master,
                "Team",
                &map(json!({"city": "x", "motto": "go", "coach": ptr("Coach", &coach)})),
            )
            .await
            .unwrap();
        writer
            .create(&master, "Player", &map(json!({"name": "ann", "team": ptr("Team", &team)})))
            .await
            .unwrap();

        let raw = map(json!({"include": "team.coach", "keys": "name,team.city,team.coach"}));
        let compiler =
            QueryCompiler::from_raw(Arc::clone(&ctx), master, "Player", Where::new(), &raw);
        let response = compiler.unwrap().execute().await.unwrap();

        let team = response.results[0].get("team").and_then(Value::as_object).unwrap();
        assert_eq!(team.get("__type"), Some(&Value::from("Object")));
        assert_eq!(team.get("className"), Some(&Value::from("Team")));
        assert_eq!(team.get("city"), Some(&Value::from("x")));
        assert!(!team.contains_key("motto"));
        let coach = team.get("coach").and_then(Value::as_object).unwrap();
        assert_eq!(coach.get("name"), Some(&Value::from("kim")));
    }

    #[tokio::test]
    async fn hidden_pointers_stay_pointers() {
        let ctx = ServerContext::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemorySchemaProvider::new()),
            ServerConfig::default(),
        );
        let writer = WriteExecutor::new(Arc::clone(&ctx));
        let master = Auth::master();
        let secret = writer
            .create(&master, "Team", &map(json!({"city": "x", "ACL": {}})))
            .await
            .unwrap();
        writer
            .create(&master, "Player", &map(json!({"name": "ann", "team": ptr("Team", &secret)})))
            .await
            .unwrap();

        let raw = map(json!({"include": "team"}));
        let compiler =
            QueryCompiler::from_raw(Arc::clone(&ctx), Auth::nobody(), "Player", Where::new(), &raw);
        let response = compiler.unwrap().execute().await.unwrap();
        assert!(matches!(response.results[0].get("team"), Some(Value::Pointer(_))));
    }

    #[test]
    fn nested_key_projection() {
        let raw = map(json!({"keys": "name,team.city,team.coach.name"}));
        let options = QueryOptions::from_raw(&raw).unwrap();
        let keys = nested_keys(&options, "team").unwrap();
        assert!(keys.contains("city") && keys.contains("coach") && keys.contains("coach.name"));
        assert!(keys.contains("objectId"));
        assert_eq!(nested_keys(&options, "other"), None);
        assert_eq!(nested_keys(&QueryOptions::default(), "team"), None);
    }
}
