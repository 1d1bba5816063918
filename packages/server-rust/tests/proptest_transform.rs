//! Property tests for the storage transform.
//!
//! Special-type coders and the ACL split must round-trip, and the live
//! matcher must agree with the storage evaluator run on the encoded object
//! and the transformed where-clause, for every field type a player carries.

use basalt_core::types::{Bytes, Date, File};
use basalt_core::{
    geo, matches_query, Acl, ClassSchema, FieldType, GeoPoint, Map, Pointer, Value, Where,
};
use basalt_server::storage::matcher::matches;
use basalt_server::storage::Document;
use basalt_server::transform::{
    transform_acl, transform_create, transform_where, untransform_acl, BytesCoder, DateCoder,
    FileCoder, GeoPointCoder, PointerCoder, SpecialTypeCoder,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Generators
// ============================================================================

fn arb_identifier() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9]{0,11}"
}

fn arb_pointer() -> impl Strategy<Value = Value> {
    ("_?[A-Z][A-Za-z]{0,8}", "[A-Za-z0-9]{1,10}")
        .prop_map(|(class_name, object_id)| Value::Pointer(Pointer::new(class_name, object_id)))
}

/// Millisecond-precision instants between 1970 and 2100.
fn arb_date() -> impl Strategy<Value = Value> {
    (0i64..4_102_444_800_000).prop_filter_map("out of range", |millis| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|dt| Value::Date(Date::from_datetime(&dt)))
    })
}

fn arb_bytes() -> impl Strategy<Value = Value> {
    prop::collection::vec(any::<u8>(), 0..64).prop_map(|raw| {
        Value::Bytes(Bytes {
            base64: STANDARD.encode(raw),
        })
    })
}

fn arb_geo_point() -> impl Strategy<Value = Value> {
    (-180.0f64..=180.0, -90.0f64..=90.0)
        .prop_map(|(longitude, latitude)| Value::GeoPoint(GeoPoint::new(longitude, latitude)))
}

fn arb_file() -> impl Strategy<Value = Value> {
    "[a-z0-9_-]{1,16}\\.(png|txt|bin)".prop_map(|name| Value::File(File { name }))
}

/// An ACL whose every entry grants at least one permission.
fn arb_acl() -> impl Strategy<Value = Acl> {
    let entity = prop_oneof![
        Just("*".to_string()),
        "[0-9]{1,6}",
        "role:[A-Za-z]{1,8}",
    ];
    prop::collection::vec((entity, 1u8..=3), 0..6).prop_map(|entries| {
        let mut acl = Acl::new();
        for (entity, bits) in entries {
            acl.set_read(&entity, bits & 1 != 0);
            acl.set_write(&entity, bits & 2 != 0);
        }
        acl
    })
}

const NAMES: [&str; 3] = ["ann", "bo", "cy"];
const TEAMS: [&str; 3] = ["t1", "t2", "t3"];
const FILES: [&str; 3] = ["a.png", "b.png", "c.txt"];
const TAGS: [&str; 3] = ["red", "blue", "green"];

/// Three instants, each with equivalent ISO spellings.
const INSTANTS: [[&str; 2]; 3] = [
    ["2016-01-01T00:00:00.000Z", "2016-01-01T02:00:00+02:00"],
    ["2016-09-28T08:33:34.551Z", "2016-09-28T08:33:34.551+00:00"],
    ["2017-01-01T00:00:00.000Z", "2016-12-31T19:00:00-05:00"],
];

fn arb_name() -> impl Strategy<Value = String> {
    prop::sample::select(NAMES.to_vec()).prop_map(str::to_string)
}

fn team_json(id: &str) -> serde_json::Value {
    json!({"__type": "Pointer", "className": "Team", "objectId": id})
}

fn arb_team() -> impl Strategy<Value = serde_json::Value> {
    prop::sample::select(TEAMS.to_vec()).prop_map(team_json)
}

fn arb_instant() -> impl Strategy<Value = usize> {
    0..INSTANTS.len()
}

/// A date operand: the tagged form or either ISO spelling.
fn arb_date_operand() -> impl Strategy<Value = serde_json::Value> {
    (arb_instant(), 0usize..3).prop_map(|(i, form)| match form {
        0 => json!({"__type": "Date", "iso": INSTANTS[i][0]}),
        spelling => json!(INSTANTS[i][spelling - 1]),
    })
}

fn file_json(name: &str) -> serde_json::Value {
    json!({"__type": "File", "name": name})
}

fn arb_file_operand() -> impl Strategy<Value = serde_json::Value> {
    prop::sample::select(FILES.to_vec()).prop_map(file_json)
}

fn point_json(longitude: i32, latitude: i32) -> serde_json::Value {
    json!({"__type": "GeoPoint", "longitude": longitude, "latitude": latitude})
}

/// Points on a coarse grid near the origin.
fn arb_grid_point() -> impl Strategy<Value = serde_json::Value> {
    (-3i32..=3, -3i32..=3).prop_map(|(lon, lat)| point_json(lon, lat))
}

fn arb_tag() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        prop::sample::select(TAGS.to_vec()).prop_map(|t| json!(t)),
        (1i64..3).prop_map(|n| json!(n)),
    ]
}

fn arb_tags() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::vec(arb_tag(), 0..4).prop_map(|tags| json!(tags))
}

/// Player objects where every field is optional.
fn arb_object() -> impl Strategy<Value = Map> {
    (
        (prop::option::of(-5i64..5), prop::option::of(arb_name())),
        (prop::option::of(arb_team()), prop::option::of(arb_instant())),
        (prop::option::of(arb_file_operand()), prop::option::of(arb_grid_point())),
        prop::option::of(arb_tags()),
    )
        .prop_map(|((score, name), (team, when), (avatar, location), tags)| {
            let mut object = serde_json::Map::new();
            let fields = [
                ("score", score.map(|n| json!(n))),
                ("name", name.map(|n| json!(n))),
                ("team", team),
                ("when", when.map(|i| json!({"__type": "Date", "iso": INSTANTS[i][0]}))),
                ("avatar", avatar),
                ("location", location),
                ("tags", tags),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    object.insert(key.to_string(), value);
                }
            }
            to_map(serde_json::Value::Object(object))
        })
}

fn arb_score_constraint() -> impl Strategy<Value = serde_json::Value> {
    let n = -5i64..5;
    prop_oneof![
        n.clone().prop_map(|v| json!(v)),
        n.clone().prop_map(|v| json!({"$ne": v})),
        n.clone().prop_map(|v| json!({"$gt": v})),
        n.clone().prop_map(|v| json!({"$lte": v})),
        (n.clone(), n.clone()).prop_map(|(lo, hi)| json!({"$gte": lo, "$lt": hi})),
        prop::collection::vec(n.clone(), 0..4).prop_map(|vs| json!({"$in": vs})),
        prop::collection::vec(n, 0..4).prop_map(|vs| json!({"$nin": vs})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

fn arb_name_constraint() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        arb_name().prop_map(|v| json!(v)),
        arb_name().prop_map(|v| json!({"$ne": v})),
        prop::collection::vec(arb_name(), 0..3).prop_map(|vs| json!({"$in": vs})),
        Just(json!({"$regex": "^b"})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

fn arb_team_constraint() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        arb_team(),
        arb_team().prop_map(|t| json!({"$ne": t})),
        arb_team().prop_map(|t| json!({"$lt": t})),
        prop::collection::vec(arb_team(), 0..3).prop_map(|ts| json!({"$in": ts})),
        prop::collection::vec(arb_team(), 0..3).prop_map(|ts| json!({"$nin": ts})),
        Just(json!({"$ne": null})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

fn arb_when_constraint() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        arb_date_operand(),
        arb_date_operand().prop_map(|d| json!({"$ne": d})),
        arb_date_operand().prop_map(|d| json!({"$lt": d})),
        (arb_date_operand(), arb_date_operand())
            .prop_map(|(lo, hi)| json!({"$gte": lo, "$lte": hi})),
        prop::collection::vec(arb_date_operand(), 0..3).prop_map(|ds| json!({"$in": ds})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

fn arb_avatar_constraint() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        arb_file_operand(),
        arb_file_operand().prop_map(|f| json!({"$ne": f})),
        arb_file_operand().prop_map(|f| json!({"$gt": f})),
        prop::collection::vec(arb_file_operand(), 0..3).prop_map(|fs| json!({"$in": fs})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

/// `$nearSphere` with zero or more distance keys, or a `$within` box.
fn arb_location_constraint() -> impl Strategy<Value = serde_json::Value> {
    let distance_keys = prop::sample::subsequence(geo::MAX_DISTANCE_KEYS.to_vec(), 0..=4);
    let near = (
        arb_grid_point(),
        distance_keys,
        prop::collection::vec(prop::sample::select(vec![0.01, 0.05, 0.1, 100.0, 300.0]), 4),
    )
        .prop_map(|(center, keys, amounts)| {
            let mut constraint = serde_json::Map::new();
            constraint.insert("$nearSphere".to_string(), center);
            for (key, amount) in keys.into_iter().zip(amounts) {
                constraint.insert(key.to_string(), json!(amount));
            }
            serde_json::Value::Object(constraint)
        });
    let within = (-3i32..=3, -3i32..=3, 0i32..4, 0i32..4).prop_map(|(lon, lat, width, height)| {
        json!({"$within": {"$box": [point_json(lon, lat), point_json(lon + width, lat + height)]}})
    });
    prop_oneof![
        near,
        within,
        arb_grid_point(),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

fn arb_tags_constraint() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        arb_tag(),
        arb_tags(),
        prop::collection::vec(arb_tag(), 0..3).prop_map(|ts| json!({"$all": ts})),
        prop::collection::vec(arb_tag(), 0..3).prop_map(|ts| json!({"$in": ts})),
        prop::collection::vec(arb_tag(), 0..3).prop_map(|ts| json!({"$nin": ts})),
        any::<bool>().prop_map(|b| json!({"$exists": b})),
    ]
}

/// A clause constraining one to three of the player's fields.
fn arb_clause() -> impl Strategy<Value = serde_json::Value> {
    let constraint = prop_oneof![
        arb_score_constraint().prop_map(|c| ("score", c)),
        arb_name_constraint().prop_map(|c| ("name", c)),
        arb_team_constraint().prop_map(|c| ("team", c)),
        arb_when_constraint().prop_map(|c| ("when", c)),
        arb_avatar_constraint().prop_map(|c| ("avatar", c)),
        arb_location_constraint().prop_map(|c| ("location", c)),
        arb_tags_constraint().prop_map(|c| ("tags", c)),
    ];
    prop::collection::vec(constraint, 1..=3).prop_map(|constraints| {
        let mut clause = serde_json::Map::new();
        for (key, constraint) in constraints {
            clause.insert(key.to_string(), constraint);
        }
        serde_json::Value::Object(clause)
    })
}

fn arb_where() -> impl Strategy<Value = Where> {
    prop_oneof![
        arb_clause(),
        prop::collection::vec(arb_clause(), 1..4).prop_map(|branches| json!({"$or": branches})),
        prop::collection::vec(arb_clause(), 1..3).prop_map(|branches| json!({"$and": branches})),
    ]
    .prop_map(to_map)
}

fn to_map(j: serde_json::Value) -> Map {
    match Value::from_json(j) {
        Ok(Value::Object(map)) => map,
        other => panic!("generated value is not an object: {other:?}"),
    }
}

fn player_schema() -> ClassSchema {
    ClassSchema::new("Player")
        .with_field("score", FieldType::Number)
        .with_field("name", FieldType::String)
        .with_field("team", FieldType::pointer("Team"))
        .with_field("when", FieldType::Date)
        .with_field("avatar", FieldType::File)
        .with_field("location", FieldType::GeoPoint)
        .with_field("tags", FieldType::Array)
}

fn roundtrip(coder: &dyn SpecialTypeCoder, value: &Value) -> Value {
    assert!(coder.is_recognized(value));
    let stored = coder.to_storage(value).unwrap();
    coder.from_storage(&stored).unwrap()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn pointer_coder_roundtrips(value in arb_pointer()) {
        prop_assert_eq!(roundtrip(&PointerCoder, &value), value);
    }

    #[test]
    fn date_coder_roundtrips(value in arb_date()) {
        prop_assert_eq!(roundtrip(&DateCoder, &value), value);
    }

    #[test]
    fn bytes_coder_roundtrips(value in arb_bytes()) {
        prop_assert_eq!(roundtrip(&BytesCoder, &value), value);
    }

    #[test]
    fn geo_point_coder_roundtrips(value in arb_geo_point()) {
        prop_assert_eq!(roundtrip(&GeoPointCoder, &value), value);
    }

    #[test]
    fn file_coder_roundtrips(value in arb_file()) {
        prop_assert_eq!(roundtrip(&FileCoder, &value), value);
    }

    #[test]
    fn coders_reject_foreign_values(name in arb_identifier()) {
        let text = Value::String(name);
        prop_assert!(!PointerCoder.is_recognized(&text));
        prop_assert!(!DateCoder.is_recognized(&text));
        prop_assert!(PointerCoder.to_storage(&text).is_err());
        prop_assert!(GeoPointCoder.to_storage(&text).is_err());
    }

    #[test]
    fn acl_split_roundtrips(acl in arb_acl()) {
        let stored = transform_acl(&acl);
        for reader in &stored.rperm {
            prop_assert!(acl.permission(reader).read);
        }
        for writer in &stored.wperm {
            prop_assert!(acl.permission(writer).write);
        }
        prop_assert_eq!(stored.combined.len(), acl.iter().count());

        let doc: Document = stored
            .into_fields()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        prop_assert_eq!(untransform_acl(&doc), Some(acl));
    }

    #[test]
    fn live_matcher_agrees_with_storage(object in arb_object(), query in arb_where()) {
        let schema = player_schema();
        let doc = transform_create(&schema, &object).unwrap();
        let predicate = transform_where(&schema, &query).unwrap();
        prop_assert_eq!(
            matches_query(&object, &query),
            matches(&doc, &predicate),
            "object {:?} query {:?}",
            object,
            query
        );
    }
}
