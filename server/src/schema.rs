use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Entity categories offered to the model, indexed by `entity_type_id`.
pub const ENTITY_CATEGORIES: [&str; 6] = ["Person", "Organization", "Technology", "Concept", "Place", "Other"];

/// Coarse JSON type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
	String,
	Number,
	Boolean,
	Array,
	Object,
}

impl FieldKind {
	pub fn default_value(self) -> JsonValue {
		match self {
			FieldKind::String => JsonValue::String(String::new()),
			FieldKind::Number => json!(0),
			FieldKind::Boolean => JsonValue::Bool(false),
			FieldKind::Array => JsonValue::Array(Vec::new()),
			FieldKind::Object => JsonValue::Object(Map::new()),
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			FieldKind::String => "string",
			FieldKind::Number => "number",
			FieldKind::Boolean => "boolean",
			FieldKind::Array => "array",
			FieldKind::Object => "object",
		}
	}

	pub fn accepts(self, v: &JsonValue) -> bool {
		match self {
			FieldKind::String => v.is_string(),
			FieldKind::Number => v.is_number(),
			FieldKind::Boolean => v.is_boolean(),
			FieldKind::Array => v.is_array(),
			FieldKind::Object => v.is_object(),
		}
	}
}

/// What an array field holds, which decides the element normalization applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
	Plain,
	Entities,
	Edges,
	Resolutions,
}

impl FieldRole {
	/// Field names that carry this role when declared as arrays.
	pub fn field_names(self) -> &'static [&'static str] {
		match self {
			FieldRole::Entities => &["extracted_entities", "entities"],
			FieldRole::Edges => &["edges", "extracted_edges"],
			FieldRole::Resolutions => &["entity_resolutions", "resolutions"],
			FieldRole::Plain => &[],
		}
	}

	fn infer(name: &str, kind: FieldKind) -> Self {
		if kind != FieldKind::Array {
			return FieldRole::Plain;
		}
		[FieldRole::Entities, FieldRole::Edges, FieldRole::Resolutions]
			.into_iter()
			.find(|role| role.field_names().contains(&name))
			.unwrap_or(FieldRole::Plain)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaField {
	pub name: String,
	pub kind: FieldKind,
	pub role: FieldRole,
}

/// Target shape for a structured completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionSchema {
	name: String,
	fields: Vec<SchemaField>,
	category_count: usize,
}

impl ExtractionSchema {
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into(), fields: Vec::new(), category_count: ENTITY_CATEGORIES.len() }
	}

	pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
		let name = name.into();
		let role = FieldRole::infer(&name, kind);
		self.fields.push(SchemaField { name, kind, role });
		self
	}

	pub fn with_category_count(mut self, count: usize) -> Self {
		self.category_count = count.max(1);
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn fields(&self) -> &[SchemaField] {
		&self.fields
	}

	pub fn category_count(&self) -> usize {
		self.category_count
	}

	pub fn get(&self, name: &str) -> Option<&SchemaField> {
		self.fields.iter().find(|f| f.name == name)
	}

	pub fn field_with_role(&self, role: FieldRole) -> Option<&SchemaField> {
		self.fields.iter().find(|f| f.role == role)
	}

	/// `{field: "array" | "string" | ...}`, embedded in the extraction prompt.
	pub fn type_hint(&self) -> JsonValue {
		let map: Map<String, JsonValue> =
			self.fields.iter().map(|f| (f.name.clone(), JsonValue::String(f.kind.as_str().to_string()))).collect();
		JsonValue::Object(map)
	}

	/// Every field set to its zero value.
	pub fn empty_instance(&self) -> CoercedPayload {
		CoercedPayload(self.fields.iter().map(|f| (f.name.clone(), f.kind.default_value())).collect())
	}

	pub fn extracted_entities() -> Self {
		Self::new("ExtractedEntities").field("extracted_entities", FieldKind::Array)
	}

	pub fn extracted_edges() -> Self {
		Self::new("ExtractedEdges").field("edges", FieldKind::Array)
	}

	pub fn node_resolutions() -> Self {
		Self::new("NodeResolutions").field("entity_resolutions", FieldKind::Array)
	}

	pub fn builtin(name: &str) -> Option<Self> {
		match name {
			"extracted_entities" | "ExtractedEntities" => Some(Self::extracted_entities()),
			"extracted_edges" | "ExtractedEdges" => Some(Self::extracted_edges()),
			"node_resolutions" | "NodeResolutions" => Some(Self::node_resolutions()),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
	pub name: String,
	pub entity_type_id: i64,
	#[serde(default)]
	pub entity_type: Option<String>,
	#[serde(default)]
	pub entity_summary: String,
	#[serde(default)]
	pub observations: Vec<String>,
	#[serde(default)]
	pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
	pub source_entity_id: i64,
	pub target_entity_id: i64,
	pub relation_type: String,
	pub fact: String,
	#[serde(default)]
	pub fact_embedding: Option<Vec<f32>>,
	#[serde(default)]
	pub valid_at: Option<String>,
	#[serde(default)]
	pub invalid_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResolution {
	#[serde(default)]
	pub id: i64,
	#[serde(default)]
	pub name: String,
	/// -1 when no duplicate was found.
	pub duplicate_idx: i64,
	#[serde(default)]
	pub additional_duplicates: Vec<i64>,
}

/// Schema-shaped result of coercion: every schema field is present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoercedPayload(Map<String, JsonValue>);

impl CoercedPayload {
	pub fn from_map(map: Map<String, JsonValue>) -> Self {
		Self(map)
	}

	pub fn get(&self, field: &str) -> Option<&JsonValue> {
		self.0.get(field)
	}

	pub fn as_map(&self) -> &Map<String, JsonValue> {
		&self.0
	}

	pub fn into_value(self) -> JsonValue {
		JsonValue::Object(self.0)
	}

	/// Records from the first array field whose name carries `role`.
	fn records<T: serde::de::DeserializeOwned>(&self, role: FieldRole) -> Vec<T> {
		role.field_names()
			.iter()
			.find_map(|name| self.0.get(*name).and_then(|v| v.as_array()))
			.map(|items| items.iter().filter_map(|i| serde_json::from_value(i.clone()).ok()).collect())
			.unwrap_or_default()
	}

	pub fn entities(&self) -> Vec<EntityRecord> {
		self.records(FieldRole::Entities)
	}

	pub fn relations(&self) -> Vec<RelationRecord> {
		self.records(FieldRole::Edges)
	}

	pub fn resolutions(&self) -> Vec<EntityResolution> {
		self.records(FieldRole::Resolutions)
	}
}
