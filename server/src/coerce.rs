//! Turns free-text model output into a payload shaped like an [`ExtractionSchema`].
//!
//! Models drift on field names, wrap JSON in prose or code fences, and return
//! partially valid records. Coercion is total: the result always carries every
//! schema field, at successively lower fidelity when validation fails.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::Outcome;
use crate::schema::{
	CoercedPayload, EntityRecord, EntityResolution, ExtractionSchema, FieldKind, FieldRole, RelationRecord,
	SchemaField,
};

type AliasTable = &'static [(&'static str, &'static [&'static str])];

/// Alternate top-level keys for list fields, by role.
const ENTITY_LIST_ALIASES: &[&str] = &["extracted_entities", "實體", "实体", "entities"];
const EDGE_LIST_ALIASES: &[&str] = &["edges", "extracted_edges", "relationships", "relations"];
const RESOLUTION_LIST_ALIASES: &[&str] = &["entity_resolutions", "resolutions"];

const ENTITY_ALIASES: AliasTable = &[("name", &["entity_name"]), ("entity_type", &["entity_type_name"])];
const EDGE_ALIASES: AliasTable = &[
	("source_entity_id", &["source_id", "subject_id"]),
	("target_entity_id", &["target_id", "object_id"]),
	("relation_type", &["relationship", "predicate"]),
];
const RESOLUTION_ALIASES: AliasTable = &[("duplicate_idx", &["duplication_idx"])];

/// Scratch fields models add to entities that the records do not carry.
const ENTITY_SCRATCH: &[&str] = &["description", "score", "mentioned", "speaker"];

const DEFAULT_RELATION: &str = "RELATES_TO";
const ENTITY_ID_PREFIX: &str = "ENTITY_";

fn patterns() -> &'static [Regex; 4] {
	static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
	PATTERNS.get_or_init(|| {
		[
			Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("fenced json pattern"),
			Regex::new(r"(?s)```\s*(.*?)\s*```").expect("fenced pattern"),
			Regex::new(r"\{[^}]*\}").expect("flat object pattern"),
			Regex::new(r"(?s)\{.*\}").expect("widest object pattern"),
		]
	})
}

fn parse_object(text: &str) -> Option<Map<String, JsonValue>> {
	match serde_json::from_str::<JsonValue>(text) {
		Ok(JsonValue::Object(map)) => Some(map),
		_ => None,
	}
}

/// Pulls the first JSON object out of `text`: the whole text, then each
/// ```` ```json ```` fence, each bare fence, each flat `{...}` span and
/// finally the widest `{...}` span. Empty map when nothing parses.
pub fn extract_json(text: &str) -> Map<String, JsonValue> {
	if let Some(map) = parse_object(text.trim()) {
		return map;
	}
	for pattern in patterns() {
		for caps in pattern.captures_iter(text) {
			if let Some(map) = caps.get(1).or_else(|| caps.get(0)).and_then(|m| parse_object(m.as_str())) {
				return map;
			}
		}
	}
	debug!(chars = text.len(), "no JSON object found in completion");
	Map::new()
}

/// Moves the first alias present onto `canonical` and drops every alias key.
fn remap(obj: &mut Map<String, JsonValue>, table: AliasTable) {
	for (canonical, aliases) in table {
		for alias in aliases.iter() {
			if let Some(v) = obj.remove(*alias) {
				if !obj.contains_key(*canonical) {
					obj.insert(canonical.to_string(), v);
				}
			}
		}
	}
}

fn list_aliases(role: FieldRole) -> &'static [&'static str] {
	match role {
		FieldRole::Entities => ENTITY_LIST_ALIASES,
		FieldRole::Edges => EDGE_LIST_ALIASES,
		FieldRole::Resolutions => RESOLUTION_LIST_ALIASES,
		FieldRole::Plain => &[],
	}
}

fn remap_list_field(obj: &mut Map<String, JsonValue>, field: &SchemaField) {
	for alias in list_aliases(field.role) {
		if *alias == field.name {
			continue;
		}
		if let Some(v) = obj.remove(*alias) {
			if !obj.contains_key(&field.name) {
				obj.insert(field.name.clone(), v);
			}
		}
	}
}

fn text_of(v: &JsonValue) -> Option<String> {
	match v {
		JsonValue::String(s) => Some(s.trim().to_string()),
		JsonValue::Null => None,
		other => Some(other.to_string()),
	}
}

fn as_int(v: &JsonValue) -> Option<i64> {
	match v {
		JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
		JsonValue::String(s) => {
			let s = s.trim();
			s.strip_prefix(ENTITY_ID_PREFIX).unwrap_or(s).trim().parse().ok()
		}
		_ => None,
	}
}

/// Number of entities that survive normalization in the payload's entity list.
fn entity_count(obj: &Map<String, JsonValue>, category_count: usize) -> usize {
	ENTITY_LIST_ALIASES
		.iter()
		.find_map(|k| obj.get(*k))
		.map(|v| match normalize_list(v.clone(), FieldRole::Entities, category_count, 0) {
			JsonValue::Array(items) => items.len(),
			_ => 0,
		})
		.unwrap_or(0)
}

fn string_entity(name: &str) -> JsonValue {
	json!({ "name": name, "labels": ["Entity"], "summary": name })
}

fn normalize_entity(item: JsonValue, category_count: usize) -> Option<JsonValue> {
	let mut obj = match item {
		JsonValue::String(s) if !s.trim().is_empty() => match string_entity(s.trim()) {
			JsonValue::Object(o) => o,
			_ => return None,
		},
		JsonValue::Object(o) => o,
		_ => return None,
	};
	remap(&mut obj, ENTITY_ALIASES);

	let name = obj.get("name").and_then(text_of).filter(|n| !n.is_empty())?;
	let description = obj.get("description").and_then(text_of).filter(|d| !d.is_empty());
	obj.insert("name".into(), JsonValue::String(name.clone()));

	if let Some(t) = obj.get("entity_type").filter(|t| !t.is_string() && !t.is_null()).map(|t| t.to_string()) {
		obj.insert("entity_type".into(), JsonValue::String(t));
	}

	let summary = match obj.get("entity_summary").and_then(text_of) {
		Some(s) => s,
		None => description.clone().unwrap_or_else(|| name.clone()),
	};
	obj.insert("entity_summary".into(), JsonValue::String(summary));

	let observations: Vec<JsonValue> = match obj.get("observations") {
		Some(JsonValue::Array(items)) => items.iter().filter_map(text_of).map(JsonValue::String).collect(),
		Some(other) => text_of(other).into_iter().map(JsonValue::String).collect(),
		None => vec![JsonValue::String(description.unwrap_or_else(|| format!("Related to {name}")))],
	};
	obj.insert("observations".into(), JsonValue::Array(observations));

	if let Some(labels) = obj.get("labels").filter(|l| !l.is_array()).and_then(text_of) {
		obj.insert("labels".into(), json!([labels]));
	}

	let category = obj
		.get("entity_type_id")
		.and_then(as_int)
		.filter(|id| *id >= 0 && (*id as usize) < category_count)
		.unwrap_or(0);
	obj.insert("entity_type_id".into(), json!(category));

	for key in ENTITY_SCRATCH {
		obj.remove(*key);
	}
	Some(JsonValue::Object(obj))
}

fn normalize_edge(item: JsonValue, entities: usize) -> Option<JsonValue> {
	let JsonValue::Object(mut obj) = item else { return None };
	remap(&mut obj, EDGE_ALIASES);

	let default_target = if entities > 1 { 1 } else { 0 };
	let source = obj.get("source_entity_id").map(|v| as_int(v).unwrap_or(0)).unwrap_or(0);
	let target = obj.get("target_entity_id").map(|v| as_int(v).unwrap_or(1)).unwrap_or(default_target);
	obj.insert("source_entity_id".into(), json!(source));
	obj.insert("target_entity_id".into(), json!(target));

	let relation = obj.get("relation_type").and_then(text_of).filter(|r| !r.is_empty()).unwrap_or_else(|| DEFAULT_RELATION.to_string());
	obj.insert("relation_type".into(), JsonValue::String(relation.clone()));
	let fact = obj.get("fact").and_then(text_of).filter(|f| !f.is_empty()).unwrap_or(relation);
	obj.insert("fact".into(), JsonValue::String(fact));

	let embedding_ok = matches!(obj.get("fact_embedding"), Some(JsonValue::Array(xs)) if xs.iter().all(|x| x.is_number()));
	if !embedding_ok {
		obj.insert("fact_embedding".into(), JsonValue::Null);
	}
	for key in ["valid_at", "invalid_at"] {
		if !matches!(obj.get(key), Some(JsonValue::String(_))) {
			obj.insert(key.into(), JsonValue::Null);
		}
	}
	Some(JsonValue::Object(obj))
}

fn normalize_resolution(item: JsonValue) -> Option<JsonValue> {
	let JsonValue::Object(mut obj) = item else { return None };
	remap(&mut obj, RESOLUTION_ALIASES);
	let idx = obj.get("duplicate_idx").and_then(as_int).unwrap_or(-1);
	obj.insert("duplicate_idx".into(), json!(idx));
	let extra: Vec<JsonValue> = match obj.get("additional_duplicates") {
		Some(JsonValue::Array(xs)) => xs.iter().filter_map(as_int).map(|i| json!(i)).collect(),
		_ => Vec::new(),
	};
	obj.insert("additional_duplicates".into(), JsonValue::Array(extra));
	if let Some(id) = obj.get("id").and_then(as_int) {
		obj.insert("id".into(), json!(id));
	}
	Some(JsonValue::Object(obj))
}

fn normalize_list(value: JsonValue, role: FieldRole, category_count: usize, entities: usize) -> JsonValue {
	let items = match value {
		JsonValue::Array(items) => items,
		JsonValue::String(s) if role == FieldRole::Entities && !s.trim().is_empty() => vec![JsonValue::String(s)],
		other => return other,
	};
	let normalized = items.into_iter().filter_map(|item| match role {
		FieldRole::Entities => normalize_entity(item, category_count),
		FieldRole::Edges => normalize_edge(item, entities),
		FieldRole::Resolutions => normalize_resolution(item),
		FieldRole::Plain => Some(item),
	});
	JsonValue::Array(normalized.collect())
}

fn element_valid(item: &JsonValue, role: FieldRole, category_count: usize) -> bool {
	match role {
		FieldRole::Entities => serde_json::from_value::<EntityRecord>(item.clone())
			.map(|e| !e.name.is_empty() && e.entity_type_id >= 0 && (e.entity_type_id as usize) < category_count)
			.unwrap_or(false),
		FieldRole::Edges => serde_json::from_value::<RelationRecord>(item.clone()).is_ok(),
		FieldRole::Resolutions => serde_json::from_value::<EntityResolution>(item.clone()).is_ok(),
		FieldRole::Plain => true,
	}
}

fn field_valid(value: &JsonValue, field: &SchemaField, category_count: usize) -> bool {
	if !field.kind.accepts(value) {
		return false;
	}
	match value {
		JsonValue::Array(items) => items.iter().all(|i| element_valid(i, field.role, category_count)),
		_ => true,
	}
}

fn validate(map: &Map<String, JsonValue>, schema: &ExtractionSchema) -> Result<(), String> {
	for field in schema.fields() {
		match map.get(&field.name) {
			None => return Err(format!("missing field '{}'", field.name)),
			Some(v) if !field_valid(v, field, schema.category_count()) => {
				return Err(format!("field '{}' is not a valid {}", field.name, field.kind.as_str()))
			}
			_ => {}
		}
	}
	Ok(())
}

// Keeps each field only if it validates on its own; list fields keep their valid elements.
fn minimal_instance(map: &Map<String, JsonValue>, schema: &ExtractionSchema) -> Map<String, JsonValue> {
	schema
		.fields()
		.iter()
		.map(|f| {
			let value = match map.get(&f.name) {
				Some(JsonValue::Array(items)) if f.kind == FieldKind::Array => JsonValue::Array(
					items.iter().filter(|i| element_valid(i, f.role, schema.category_count())).cloned().collect(),
				),
				Some(v) if field_valid(v, f, schema.category_count()) => v.clone(),
				_ => f.kind.default_value(),
			};
			(f.name.clone(), value)
		})
		.collect()
}

/// Coerces `raw` into `schema`, reporting any fidelity lost on the way.
pub fn coerce_outcome(raw: Map<String, JsonValue>, schema: &ExtractionSchema) -> Outcome<CoercedPayload> {
	let mut obj = raw;
	for field in schema.fields().iter().filter(|f| f.role != FieldRole::Plain) {
		remap_list_field(&mut obj, field);
	}
	for field in schema.fields().iter().filter(|f| f.role == FieldRole::Entities) {
		if let Some(value) = obj.remove(&field.name) {
			obj.insert(field.name.clone(), normalize_list(value, field.role, schema.category_count(), 0));
		}
	}
	let entities = entity_count(&obj, schema.category_count());

	for field in schema.fields().iter().filter(|f| matches!(f.role, FieldRole::Edges | FieldRole::Resolutions)) {
		if let Some(value) = obj.remove(&field.name) {
			obj.insert(field.name.clone(), normalize_list(value, field.role, schema.category_count(), entities));
		}
	}
	for field in schema.fields() {
		if !obj.contains_key(&field.name) {
			obj.insert(field.name.clone(), field.kind.default_value());
		}
	}

	match validate(&obj, schema) {
		Ok(()) => return Outcome::Ok(CoercedPayload::from_map(obj)),
		Err(reason) => {
			warn!(schema = schema.name(), %reason, "coerced payload failed validation, building minimal instance");
			let minimal = minimal_instance(&obj, schema);
			match validate(&minimal, schema) {
				Ok(()) => Outcome::degraded(CoercedPayload::from_map(minimal), format!("minimal instance: {reason}")),
				Err(second) => {
					warn!(schema = schema.name(), reason = %second, "minimal instance invalid, returning empty instance");
					Outcome::degraded(schema.empty_instance(), format!("empty instance: {second}"))
				}
			}
		}
	}
}

pub fn coerce(raw: Map<String, JsonValue>, schema: &ExtractionSchema) -> CoercedPayload {
	coerce_outcome(raw, schema).into_value()
}

/// [`extract_json`] followed by [`coerce_outcome`].
pub fn coerce_text(text: &str, schema: &ExtractionSchema) -> Outcome<CoercedPayload> {
	let raw = extract_json(text);
	let parsed = !raw.is_empty() || text.trim() == "{}";
	let out = coerce_outcome(raw, schema);
	if parsed { out } else { out.degrade("completion contained no JSON object") }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn obj(v: JsonValue) -> Map<String, JsonValue> {
		v.as_object().cloned().unwrap()
	}

	fn entities_and_edges() -> ExtractionSchema {
		ExtractionSchema::new("Graph").field("extracted_entities", FieldKind::Array).field("edges", FieldKind::Array)
	}

	#[test]
	fn extract_json_prefers_whole_text() {
		assert_eq!(extract_json(r#" {"a": {"b": 2}} "#), obj(json!({ "a": { "b": 2 } })));
	}

	#[test]
	fn extract_json_reads_fenced_block() {
		let text = "Here is the result:\n```json\n{\"a\": 1}\n```\nThanks";
		assert_eq!(extract_json(text), obj(json!({ "a": 1 })));
		let bare = "```\n{\"b\": true}\n```";
		assert_eq!(extract_json(bare), obj(json!({ "b": true })));
	}

	#[test]
	fn extract_json_falls_back_to_spans() {
		assert_eq!(extract_json("result: {\"a\": 1} and more {\"b\": 2}"), obj(json!({ "a": 1 })));
		let nested = "sure! {\"outer\": {\"inner\": [1, 2]}} done";
		assert_eq!(extract_json(nested), obj(json!({ "outer": { "inner": [1, 2] } })));
	}

	#[test]
	fn extract_json_tries_every_match_of_a_pattern() {
		let later_span = "note {not json} then {\"a\": 1}";
		assert_eq!(extract_json(later_span), obj(json!({ "a": 1 })));
		let second_fence = "```json\n{broken\n```\nretry:\n```json\n{\"a\": 1}\n```";
		assert_eq!(extract_json(second_fence), obj(json!({ "a": 1 })));
	}

	#[test]
	fn extract_json_returns_empty_on_garbage() {
		assert!(extract_json("no json here").is_empty());
		assert!(extract_json("{ broken").is_empty());
		assert!(extract_json("[1, 2, 3]").is_empty());
	}

	#[test]
	fn default_fill_on_empty_input() {
		let schema = ExtractionSchema::new("T").field("entities", FieldKind::Array).field("score", FieldKind::Number);
		let out = coerce(Map::new(), &schema);
		assert_eq!(out.into_value(), json!({ "entities": [], "score": 0 }));
	}

	#[test]
	fn default_fill_covers_every_kind() {
		let schema = ExtractionSchema::new("T")
			.field("s", FieldKind::String)
			.field("n", FieldKind::Number)
			.field("b", FieldKind::Boolean)
			.field("a", FieldKind::Array)
			.field("o", FieldKind::Object);
		let out = coerce(Map::new(), &schema);
		assert_eq!(out.into_value(), json!({ "s": "", "n": 0, "b": false, "a": [], "o": {} }));
	}

	#[test]
	fn entity_synonyms_are_remapped() {
		let raw = obj(json!({ "extracted_entities": [{ "entity_name": "Alice", "entity_type_name": "Person" }] }));
		let out = coerce_outcome(raw, &ExtractionSchema::extracted_entities());
		assert!(!out.is_degraded());
		let entity = &out.value().get("extracted_entities").unwrap()[0];
		assert_eq!(entity["name"], "Alice");
		assert_eq!(entity["entity_type"], "Person");
		assert_eq!(entity["entity_type_id"], 0);
		assert_eq!(entity["entity_summary"], "Alice");
		assert_eq!(entity["observations"], json!(["Related to Alice"]));
		assert!(entity.get("entity_name").is_none());
		assert!(entity.get("entity_type_name").is_none());
	}

	#[test]
	fn entity_list_alias_and_string_entities() {
		let raw = obj(json!({ "實體": ["Taipei", "", { "name": "TSMC", "description": "chip maker", "score": 0.9 }] }));
		let out = coerce(raw, &ExtractionSchema::extracted_entities());
		let entities = out.entities();
		assert_eq!(entities.len(), 2);
		assert_eq!(entities[0].name, "Taipei");
		assert_eq!(entities[0].labels, vec!["Entity".to_string()]);
		assert_eq!(entities[1].entity_summary, "chip maker");
		assert_eq!(entities[1].observations, vec!["chip maker".to_string()]);
		let raw_tsmc = &out.get("extracted_entities").unwrap()[1];
		assert!(raw_tsmc.get("description").is_none());
		assert!(raw_tsmc.get("score").is_none());
		assert!(out.get("實體").is_none());
	}

	#[test]
	fn bare_string_entity_field_becomes_list() {
		let raw = obj(json!({ "extracted_entities": "Rust" }));
		let out = coerce(raw, &ExtractionSchema::extracted_entities());
		assert_eq!(out.entities()[0].name, "Rust");
	}

	#[test]
	fn category_is_kept_in_range_and_clamped_outside() {
		let raw = obj(json!({ "extracted_entities": [
			{ "name": "Rust", "entity_type_id": 2 },
			{ "name": "Mars", "entity_type_id": 17 },
			{ "name": "Bob", "entity_type_id": "-1" },
			{ "name": "Paris", "entity_type_id": "4" }
		] }));
		let ids: Vec<i64> =
			coerce(raw, &ExtractionSchema::extracted_entities()).entities().iter().map(|e| e.entity_type_id).collect();
		assert_eq!(ids, vec![2, 0, 0, 4]);
	}

	#[test]
	fn nameless_entities_are_dropped() {
		let raw = obj(json!({ "extracted_entities": [{ "entity_type_id": 1 }, 42, { "name": "Ok" }] }));
		let out = coerce(raw, &ExtractionSchema::extracted_entities());
		assert_eq!(out.entities().len(), 1);
	}

	#[test]
	fn edge_endpoints_default_by_entity_count() {
		let two = obj(json!({
			"extracted_entities": ["Alice", "Bob"],
			"edges": [{ "relationship": "KNOWS" }]
		}));
		let rel = &coerce(two, &entities_and_edges()).relations()[0];
		assert_eq!((rel.source_entity_id, rel.target_entity_id), (0, 1));
		assert_eq!(rel.relation_type, "KNOWS");
		assert_eq!(rel.fact, "KNOWS");

		let one = obj(json!({ "extracted_entities": ["Alice"], "edges": [{}] }));
		let rel = &coerce(one, &entities_and_edges()).relations()[0];
		assert_eq!((rel.source_entity_id, rel.target_entity_id), (0, 0));
		assert_eq!(rel.relation_type, "RELATES_TO");
	}

	#[test]
	fn edge_target_counts_only_surviving_entities() {
		let raw = obj(json!({
			"extracted_entities": ["Alice", ""],
			"edges": [{ "relationship": "KNOWS" }]
		}));
		let out = coerce(raw, &entities_and_edges());
		assert_eq!(out.entities().len(), 1);
		let rel = &out.relations()[0];
		assert_eq!((rel.source_entity_id, rel.target_entity_id), (0, 0));

		let raw = obj(json!({
			"extracted_entities": ["Alice", { "summary": "no name" }, "Bob", "  "],
			"edges": [{}]
		}));
		let out = coerce(raw, &entities_and_edges());
		assert_eq!(out.entities().len(), 2);
		assert_eq!(out.relations()[0].target_entity_id, 1);
	}

	#[test]
	fn edge_ids_are_parsed_with_prefix_and_fallbacks() {
		let raw = obj(json!({ "edges": [
			{ "subject_id": "ENTITY_2", "object_id": "3", "predicate": "WORKS_AT", "fact": "Alice works at Acme" },
			{ "source_id": null, "target_id": "ENTITY_x" },
			{ "source_entity_id": "abc", "target_entity_id": null }
		] }));
		let out = coerce(raw, &ExtractionSchema::extracted_edges());
		let rels = out.relations();
		assert_eq!((rels[0].source_entity_id, rels[0].target_entity_id), (2, 3));
		assert_eq!(rels[0].fact, "Alice works at Acme");
		assert_eq!((rels[1].source_entity_id, rels[1].target_entity_id), (0, 1));
		assert_eq!((rels[2].source_entity_id, rels[2].target_entity_id), (0, 1));

		let first = &out.get("edges").unwrap()[0];
		assert!(first.get("subject_id").is_none());
		assert!(first["fact_embedding"].is_null());
		assert!(first.as_object().unwrap().contains_key("valid_at"));
		assert!(first.as_object().unwrap().contains_key("invalid_at"));
	}

	#[test]
	fn resolutions_are_normalized() {
		let raw = obj(json!({ "entity_resolutions": [
			{ "id": 0, "name": "Alice", "duplication_idx": 2 },
			{ "id": 1, "name": "Bob" }
		] }));
		let res = coerce(raw, &ExtractionSchema::node_resolutions()).resolutions();
		assert_eq!(res[0].duplicate_idx, 2);
		assert_eq!(res[1].duplicate_idx, -1);
		assert!(res[1].additional_duplicates.is_empty());
	}

	#[test]
	fn wrong_kind_degrades_to_minimal_instance() {
		let schema = ExtractionSchema::new("T").field("title", FieldKind::String).field("score", FieldKind::Number);
		let out = coerce_outcome(obj(json!({ "title": "ok", "score": "high" })), &schema);
		assert!(out.reason().unwrap().starts_with("minimal instance"));
		assert_eq!(out.into_value().into_value(), json!({ "title": "ok", "score": 0 }));
	}

	#[test]
	fn wrongly_shaped_list_field_becomes_empty() {
		let out = coerce_outcome(obj(json!({ "edges": { "not": "a list" } })), &ExtractionSchema::extracted_edges());
		assert!(out.is_degraded());
		assert_eq!(out.into_value().into_value(), json!({ "edges": [] }));
	}

	#[test]
	fn coerce_text_runs_full_pipeline() {
		let text = "```json\n{\"entities\": [{\"entity_name\": \"Ada\"}]}\n```";
		let out = coerce_text(text, &ExtractionSchema::extracted_entities());
		assert!(!out.is_degraded());
		assert_eq!(out.value().entities()[0].name, "Ada");

		let garbage = coerce_text("I cannot help with that.", &ExtractionSchema::extracted_entities());
		assert!(garbage.is_degraded());
		assert_eq!(garbage.into_value(), ExtractionSchema::extracted_entities().empty_instance());
	}
}
