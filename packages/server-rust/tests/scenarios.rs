//! End-to-end walks through the write path, the query compiler, roles and
//! live queries, all on in-memory storage.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use basalt_core::messages::{LiveQuery, RequestAck, ServerMessage, SubscribeRequest};
use basalt_core::{Acl, ChangeNotifier, Error, Map, QueryOptions, Value};
use basalt_server::auth::role_closure;
use basalt_server::storage::StorageValue;
use basalt_server::transform::transform_acl;
use basalt_server::{
    Auth, AuthResolver, LiveQueryServer, MemorySchemaProvider, MemoryStorage, QueryCompiler,
    ServerConfig, ServerContext, WriteExecutor,
};
use serde_json::json;
use tokio::sync::mpsc;

fn map(j: serde_json::Value) -> Map {
    match Value::from_json(j).unwrap() {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn ctx() -> Arc<ServerContext> {
    ServerContext::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(MemorySchemaProvider::new()),
        ServerConfig::default(),
    )
}

fn id_of(object: &Map) -> String {
    object.get("objectId").and_then(Value::as_str).unwrap().to_string()
}

fn strings(rows: &[Map], key: &str) -> Vec<String> {
    let mut out: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get(key).and_then(Value::as_str).map(str::to_string))
        .collect();
    out.sort();
    out
}

fn pointer(class_name: &str, object_id: &str) -> serde_json::Value {
    json!({"__type": "Pointer", "className": class_name, "objectId": object_id})
}

async fn query(
    ctx: &Arc<ServerContext>,
    auth: Auth,
    class: &str,
    where_clause: serde_json::Value,
) -> Vec<Map> {
    QueryCompiler::new(Arc::clone(ctx), auth, class, map(where_clause), QueryOptions::default())
        .execute()
        .await
        .unwrap()
        .results
}

#[tokio::test]
async fn increment_starts_from_zero_or_the_stored_value() {
    let ctx = ctx();
    let writer = WriteExecutor::new(Arc::clone(&ctx));
    let master = Auth::master();
    let increment = map(json!({"key": {"__op": "Increment", "amount": 10}}));

    let empty = writer.create(&master, "Counter", &Map::new()).await.unwrap();
    let updated = writer.update(&master, "Counter", &id_of(&empty), &increment).await.unwrap();
    assert_eq!(updated.get("key").and_then(Value::as_f64), Some(10.0));

    let twenty = writer.create(&master, "Counter", &map(json!({"key": 20}))).await.unwrap();
    let updated = writer.update(&master, "Counter", &id_of(&twenty), &increment).await.unwrap();
    assert_eq!(updated.get("key").and_then(Value::as_f64), Some(30.0));
}

#[tokio::test]
async fn select_filters_players_by_winning_cities() {
    let ctx = ctx();
    let writer = WriteExecutor::new(Arc::clone(&ctx));
    let master = Auth::master();
    for (city, pct) in [("beijing", 0.8), ("shanghai", 0.7), ("guangzhou", 0.4)] {
        writer.create(&master, "Team", &map(json!({"city": city, "winPct": pct}))).await.unwrap();
    }
    for (name, town) in [("ann", "beijing"), ("bo", "guangzhou"), ("cy", "shanghai")] {
        let player = map(json!({"name": name, "hometown": town}));
        writer.create(&master, "Player", &player).await.unwrap();
    }

    let rows = query(
        &ctx,
        master,
        "Player",
        json!({"hometown": {"$select": {
            "query": {"className": "Team", "where": {"winPct": {"$gt": 0.5}}},
            "key": "city",
        }}}),
    )
    .await;
    assert_eq!(strings(&rows, "name"), vec!["ann", "cy"]);
}

#[tokio::test]
async fn acl_controls_reads_and_writes() {
    let acl_json = json!({"1024": {"read": true, "write": true}, "*": {"read": true}});
    let acl = Acl::from_value(&Value::from_json(acl_json.clone()).unwrap()).unwrap();
    let stored = transform_acl(&acl);
    let readers: BTreeSet<&str> = stored.rperm.iter().map(String::as_str).collect();
    assert_eq!(readers, BTreeSet::from(["1024", "*"]));
    assert_eq!(stored.rperm.len(), 2);
    assert_eq!(stored.wperm, vec!["1024"]);
    assert_eq!(
        stored.combined.get("*").and_then(StorageValue::as_document).map(|d| d.contains_key("w")),
        Some(false)
    );

    let ctx = ctx();
    let writer = WriteExecutor::new(Arc::clone(&ctx));
    let note = writer
        .create(&Auth::master(), "Note", &map(json!({"text": "hi", "ACL": acl_json})))
        .await
        .unwrap();
    let id = id_of(&note);

    assert_eq!(query(&ctx, Auth::nobody(), "Note", json!({})).await.len(), 1);
    let stranger = Auth::user("2048", Map::new());
    let err = writer
        .update(&stranger, "Note", &id, &map(json!({"text": "mine"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ObjectNotFound(_)));

    let owner = Auth::user("1024", Map::new());
    let updated = writer
        .update(&owner, "Note", &id, &map(json!({"text": "edited"})))
        .await
        .unwrap();
    assert_eq!(updated.get("text").and_then(Value::as_str), Some("edited"));
}

#[tokio::test]
async fn inherited_roles_grant_access() {
    let ctx = ctx();
    let writer = WriteExecutor::new(Arc::clone(&ctx));
    let master = Auth::master();

    let member_role = writer
        .create(
            &master,
            "_Role",
            &map(json!({
                "name": "role1001",
                "users": {"__op": "AddRelation", "objects": [pointer("_User", "9001")]},
            })),
        )
        .await
        .unwrap();
    writer
        .create(
            &master,
            "_Role",
            &map(json!({
                "name": "role1002",
                "roles": {
                    "__op": "AddRelation",
                    "objects": [pointer("_Role", &id_of(&member_role))],
                },
            })),
        )
        .await
        .unwrap();

    assert_eq!(
        role_closure(&ctx, "9001").await.unwrap(),
        vec!["role:role1001", "role:role1002"]
    );

    writer
        .create(
            &master,
            "Vault",
            &map(json!({"secret": 1, "ACL": {"role:role1002": {"read": true}}})),
        )
        .await
        .unwrap();
    let member = Auth::user("9001", Map::new());
    assert_eq!(query(&ctx, member, "Vault", json!({})).await.len(), 1);
    let outsider = Auth::user("9002", Map::new());
    assert!(query(&ctx, outsider, "Vault", json!({})).await.is_empty());
}

async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message in time")
        .expect("channel open")
}

#[tokio::test]
async fn live_or_query_sees_only_matching_ages() {
    let ctx = ctx();
    let resolver = Arc::new(AuthResolver::new(Arc::clone(&ctx)));
    let live = Arc::new(LiveQueryServer::new(Arc::clone(&ctx), resolver));
    let writer = WriteExecutor::new(Arc::clone(&ctx))
        .with_notifier(Arc::clone(&live) as Arc<dyn ChangeNotifier>);
    let master = Auth::master();

    let (client, mut rx) = live.connect(None);
    next(&mut rx).await;
    live.subscribe(
        client.id,
        SubscribeRequest {
            request_id: 1,
            query: LiveQuery {
                class_name: "Person".to_string(),
                where_clause: map(json!({"$or": [{"age": 20}, {"age": 15}]})),
                fields: None,
            },
            session_token: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(
        next(&mut rx).await,
        ServerMessage::Subscribed(RequestAck {
            client_id: client.id.0,
            request_id: 1,
        })
    );

    writer.create(&master, "Person", &map(json!({"age": 16}))).await.unwrap();
    let fifteen = writer.create(&master, "Person", &map(json!({"age": 15}))).await.unwrap();
    match next(&mut rx).await {
        ServerMessage::Create(payload) => {
            assert_eq!(payload.request_id, 1);
            assert_eq!(payload.object.get("objectId"), fifteen.get("objectId"));
            assert_eq!(payload.object.get("age").and_then(Value::as_f64), Some(15.0));
        }
        other => panic!("expected create, got {other:?}"),
    }

    writer
        .update(&master, "Person", &id_of(&fifteen), &map(json!({"age": 30})))
        .await
        .unwrap();
    assert!(matches!(next(&mut rx).await, ServerMessage::Leave(_)));
    assert!(rx.try_recv().is_err());
    live.shutdown().await;
}

#[tokio::test]
async fn user_passwords_reach_neither_writer_nor_subscribers() {
    let ctx = ctx();
    let resolver = Arc::new(AuthResolver::new(Arc::clone(&ctx)));
    let live = Arc::new(LiveQueryServer::new(Arc::clone(&ctx), resolver));
    let writer = WriteExecutor::new(Arc::clone(&ctx))
        .with_notifier(Arc::clone(&live) as Arc<dyn ChangeNotifier>);

    let (client, mut rx) = live.connect(None);
    next(&mut rx).await;
    live.subscribe(
        client.id,
        SubscribeRequest {
            request_id: 1,
            query: LiveQuery {
                class_name: "_User".to_string(),
                where_clause: Map::new(),
                fields: None,
            },
            session_token: None,
        },
    )
    .await
    .unwrap();
    next(&mut rx).await;

    let created = writer
        .create(&Auth::master(), "_User", &map(json!({"username": "ann", "password": "hunter2"})))
        .await
        .unwrap();
    assert!(!created.contains_key("password"));

    match next(&mut rx).await {
        ServerMessage::Create(payload) => {
            assert_eq!(payload.object.get("username").and_then(Value::as_str), Some("ann"));
            assert!(!payload.object.contains_key("password"));
        }
        other => panic!("expected create, got {other:?}"),
    }
    live.shutdown().await;
}
