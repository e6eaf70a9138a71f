// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The contract between the REST layer and a document store.
//!
//! A [Model] describes the shape of a kind of document with an ordered [Schema]. A [Store] keeps
//! [Record]s of registered models, answers [Query]s built from [Predicate]s, and persists
//! single-record changes atomically through [Store::transaction].

use crate::types::fmt_as_json;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use snafu::Snafu;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Longest string, in bytes, an indexed string field will hold.
pub const MAX_INDEXED_BYTES: usize = 1500;

#[derive(Clone, Debug, Snafu, PartialEq)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("no {} with id {}", kind, id))]
    NotFound { kind: String, id: RecordId },

    #[snafu(display("unknown model {}", kind))]
    UnknownModel { kind: String },

    #[snafu(display("{}", message))]
    BadValue { message: String },

    #[snafu(display("record identifier {} cannot change to {}", current, requested))]
    IdentifierChanged {
        current: RecordId,
        requested: RecordId,
    },
}

fn bad_value(message: impl Into<String>) -> StoreError {
    StoreError::BadValue {
        message: message.into(),
    }
}

/// The identifier of a stored record.
///
/// Stores hand out integer identifiers. Named identifiers exist so that any URL segment can be
/// looked up, even if it can never match.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Name(String),
}

impl RecordId {
    /// Interpret a path segment as an identifier. Numeric segments name integer ids.
    pub fn parse(segment: &str) -> Self {
        match segment.parse() {
            Ok(id) => Self::Int(id),
            Err(_) => Self::Name(segment.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(id) => Value::from(*id),
            Self::Name(name) => Value::from(name.as_str()),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{}", id),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

/// The native type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Float,
    Boolean,
    /// Indexed string, limited to [MAX_INDEXED_BYTES].
    String,
    /// Unindexed string of any length.
    Text,
    /// Any JSON value, unindexed.
    Json,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    /// Whether queries may compare against fields of this kind.
    pub fn indexed(self) -> bool {
        !matches!(self, Self::Text | Self::Json)
    }

    /// Coerce a single decoded JSON value to this kind.
    pub fn validate(self, value: &Value) -> Result<Value, StoreError> {
        match (self, value) {
            (Self::Integer, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
            (Self::Float, Value::Number(n)) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| bad_value(format!("Expected float, got {}", value))),
            (Self::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (Self::String, Value::String(s)) if s.len() > MAX_INDEXED_BYTES => Err(bad_value(
                format!(
                    "Indexed value must be at most {} bytes, got {}",
                    MAX_INDEXED_BYTES,
                    s.len()
                ),
            )),
            (Self::String, Value::String(_)) | (Self::Text, Value::String(_)) => Ok(value.clone()),
            (Self::Json, _) => Ok(value.clone()),
            (kind, _) => Err(bad_value(format!(
                "Expected {}, got {}",
                kind.expected(),
                value
            ))),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "bool",
            Self::String | Self::Text => "string",
            Self::Json => "JSON value",
        }
    }

    fn accepts_operand(self, operand: &Value) -> bool {
        match self {
            Self::Integer | Self::Float => operand.is_number(),
            Self::Boolean => operand.is_boolean(),
            Self::String => operand.is_string(),
            Self::Text | Self::Json => false,
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Describes one field of a [Model].
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    kind: FieldKind,
    required: bool,
    repeated: bool,
    default: Option<Value>,
}

impl Field {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            repeated: false,
            default: None,
        }
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// The value a field holds before anything is assigned to it.
    pub fn initial(&self) -> Value {
        match &self.default {
            Some(default) => default.clone(),
            None if self.repeated => Value::Array(Vec::new()),
            None => Value::Null,
        }
    }

    /// Build a predicate comparing the field called `name` with `operand`.
    ///
    /// Fails with [StoreError::BadValue] if the field is not indexed or if an operand cannot be
    /// compared with values of this field's kind.
    pub fn compare(
        &self,
        name: &str,
        lookup: Lookup,
        operand: Operand,
    ) -> Result<Predicate, StoreError> {
        if !self.kind.indexed() {
            return Err(bad_value(format!(
                "Cannot query for unindexed {} field {}",
                self.kind, name
            )));
        }
        let values = match &operand {
            Operand::Scalar(value) => std::slice::from_ref(value),
            Operand::List(values) => values.as_slice(),
        };
        if let Some(value) = values.iter().find(|v| !self.kind.accepts_operand(v)) {
            return Err(bad_value(format!(
                "Expected {} to compare with {}, got {}",
                self.kind.expected(),
                name,
                value
            )));
        }
        Ok(Predicate {
            field: name.to_string(),
            lookup,
            operand,
        })
    }
}

/// Ordered mapping from field name to field descriptor.
pub type Schema = IndexMap<String, Field>;

/// A kind of document and its schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    kind: String,
    schema: Schema,
}

impl Model {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            schema: Schema::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.schema.insert(name.into(), field);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.schema.get(name)
    }
}

/// An instance of a [Model].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    kind: String,
    id: Option<RecordId>,
    values: IndexMap<String, Value>,
}

impl Record {
    /// A fresh, unpersisted record holding each field's initial value.
    pub fn new(model: &Model) -> Self {
        Self {
            kind: model.kind().to_string(),
            id: None,
            values: model
                .schema()
                .iter()
                .map(|(name, field)| (name.clone(), field.initial()))
                .collect(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    /// Give the record its identifier. Once assigned, the identifier never changes.
    pub fn assign_id(&mut self, id: RecordId) -> Result<(), StoreError> {
        match &self.id {
            Some(current) if *current != id => Err(StoreError::IdentifierChanged {
                current: current.clone(),
                requested: id,
            }),
            _ => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Assign validated values to the record's fields.
    ///
    /// A `null` assigned to a field that declares a default stores the default instead.
    pub fn populate(&mut self, model: &Model, values: &IndexMap<String, Value>) {
        for (name, value) in values {
            let value = match (value, model.field(name).and_then(Field::default_value)) {
                (Value::Null, Some(default)) => default.clone(),
                _ => value.clone(),
            };
            self.values.insert(name.clone(), value);
        }
    }

    /// The record's field values as a JSON object.
    ///
    /// With `include`, only the listed fields appear. Fields listed in `exclude` never appear,
    /// even if they are also included.
    pub fn to_map(&self, include: Option<&[String]>, exclude: Option<&[String]>) -> Map<String, Value> {
        self.values
            .iter()
            .filter(|(name, _)| include.map_or(true, |fields| fields.contains(*name)))
            .filter(|(name, _)| !exclude.map_or(false, |fields| fields.contains(*name)))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt_as_json(self, f)
    }
}

/// The closed set of comparisons a query can make.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lookup {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

impl Lookup {
    pub const ALL: [Lookup; 7] = [
        Lookup::In,
        Lookup::Eq,
        Lookup::Ne,
        Lookup::Gt,
        Lookup::Ge,
        Lookup::Lt,
        Lookup::Le,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::In => "in",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq | Self::In => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

impl Display for Lookup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Operand {
    Scalar(Value),
    List(Vec<Value>),
}

/// A single comparison condition on one field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Predicate {
    field: String,
    lookup: Lookup,
    operand: Operand,
}

impl Predicate {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn lookup(&self) -> Lookup {
        self.lookup
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// Whether `record` satisfies this condition.
    ///
    /// A repeated field satisfies it if any of its elements does. Missing and `null` values
    /// never satisfy a condition.
    pub fn matches(&self, record: &Record) -> bool {
        match record.get(&self.field) {
            Some(Value::Array(items)) => items.iter().any(|item| self.matches_value(item)),
            Some(value) => self.matches_value(value),
            None => false,
        }
    }

    fn matches_value(&self, value: &Value) -> bool {
        match &self.operand {
            Operand::List(items) => items
                .iter()
                .any(|item| compare(value, item) == Some(Ordering::Equal)),
            Operand::Scalar(operand) => {
                compare(value, operand).map_or(false, |ordering| self.lookup.accepts(ordering))
            }
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.field, self.lookup)?;
        fmt_as_json(&self.operand, f)
    }
}

fn compare(value: &Value, operand: &Value) -> Option<Ordering> {
    match (value, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// The records of one kind satisfying every predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    kind: String,
    predicates: Vec<Predicate>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            predicates: Vec::new(),
        }
    }

    /// Narrow the query by more predicates, combined conjunctively with the existing ones.
    pub fn filter(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.kind() == self.kind && self.predicates.iter().all(|p| p.matches(record))
    }
}

/// A document store holding records of registered models.
pub trait Store: Send + Sync {
    /// The registered model of the given kind.
    fn model(&self, kind: &str) -> Option<Arc<Model>>;

    fn get(&self, kind: &str, id: &RecordId) -> Result<Option<Record>, StoreError>;

    fn fetch(&self, query: &Query) -> Result<Vec<Record>, StoreError>;

    fn count(&self, query: &Query) -> Result<usize, StoreError> {
        Ok(self.fetch(query)?.len())
    }

    /// Apply `apply` to a record and persist the result as one atomic step.
    ///
    /// If `target` has an identifier, the currently stored version of that record is loaded
    /// and changed; `target` only names it. Otherwise `target` itself is changed and stored
    /// under a newly assigned identifier. Nothing is persisted if `apply` fails, and concurrent
    /// transactions on the same record never observe each other's partial changes.
    fn transaction(
        &self,
        target: Record,
        apply: &mut dyn FnMut(&mut Record) -> Result<(), StoreError>,
    ) -> Result<Record, StoreError>;

    /// Remove a record, returning whether it existed.
    fn delete(&self, kind: &str, id: &RecordId) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn item() -> Model {
        Model::new("Item")
            .with_field("number", Field::integer().default(42))
            .with_field("text", Field::string())
            .with_field("tags", Field::string().repeated())
            .with_field("notes", Field::text())
    }

    #[test]
    fn record_ids() {
        assert_eq!(RecordId::parse("12"), RecordId::Int(12));
        assert_eq!(RecordId::parse("abc"), RecordId::Name("abc".into()));
        assert_eq!(RecordId::Int(3).to_value(), json!(3));
        assert_eq!(RecordId::Name("x".into()).to_string(), "x");
    }

    #[test]
    fn native_coercion() {
        assert_eq!(FieldKind::Integer.validate(&json!(5)).unwrap(), json!(5));
        assert_eq!(
            FieldKind::Integer.validate(&json!("5")).unwrap_err(),
            StoreError::BadValue {
                message: r#"Expected integer, got "5""#.into()
            }
        );
        assert!(FieldKind::Integer.validate(&json!(1.5)).is_err());
        assert!(FieldKind::Integer.validate(&json!(true)).is_err());
        assert_eq!(FieldKind::Float.validate(&json!(2)).unwrap(), json!(2.0));
        assert!(FieldKind::Boolean.validate(&json!("true")).is_err());
        assert_eq!(FieldKind::Json.validate(&json!({"a": 1})).unwrap(), json!({"a": 1}));

        let long = "x".repeat(MAX_INDEXED_BYTES + 1);
        assert!(FieldKind::String.validate(&json!(long)).is_err());
        assert!(FieldKind::Text.validate(&json!(long)).is_ok());
    }

    #[test]
    fn fresh_records_hold_initial_values() {
        let record = Record::new(&item());
        assert_eq!(record.id(), None);
        assert_eq!(record.get("number"), Some(&json!(42)));
        assert_eq!(record.get("text"), Some(&Value::Null));
        assert_eq!(record.get("tags"), Some(&json!([])));
    }

    #[test]
    fn populate_falls_back_to_defaults() {
        let model = item();
        let mut record = Record::new(&model);
        let mut values = IndexMap::new();
        values.insert("number".to_string(), Value::Null);
        values.insert("text".to_string(), json!("hi"));
        record.populate(&model, &values);
        assert_eq!(record.get("number"), Some(&json!(42)));
        assert_eq!(record.get("text"), Some(&json!("hi")));
    }

    #[test]
    fn identifiers_are_immutable() {
        let mut record = Record::new(&item());
        record.assign_id(RecordId::Int(1)).unwrap();
        record.assign_id(RecordId::Int(1)).unwrap();
        assert_eq!(
            record.assign_id(RecordId::Int(2)).unwrap_err(),
            StoreError::IdentifierChanged {
                current: RecordId::Int(1),
                requested: RecordId::Int(2),
            }
        );
        assert_eq!(record.id(), Some(&RecordId::Int(1)));
    }

    #[test]
    fn exclude_wins_over_include() {
        let record = Record::new(&item());
        let include = vec!["number".to_string(), "text".to_string()];
        let exclude = vec!["text".to_string()];
        let map = record.to_map(Some(&include), Some(&exclude));
        assert_eq!(Value::Object(map), json!({"number": 42}));

        let map = record.to_map(None, Some(&exclude));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["number", "tags", "notes"]);
    }

    #[test]
    fn predicates() {
        let model = item();
        let mut record = Record::new(&model);
        record.set("number", 1);
        record.set("tags", json!(["red", "blue"]));

        let number = model.field("number").unwrap();
        let eq = number
            .compare("number", Lookup::Eq, Operand::Scalar(json!(1.0)))
            .unwrap();
        assert!(eq.matches(&record));
        let gt = number
            .compare("number", Lookup::Gt, Operand::Scalar(json!(1.0)))
            .unwrap();
        assert!(!gt.matches(&record));
        let le = number
            .compare("number", Lookup::Le, Operand::Scalar(json!(1)))
            .unwrap();
        assert!(le.matches(&record));
        let within = number
            .compare("number", Lookup::In, Operand::List(vec![json!(3.0), json!(1.0)]))
            .unwrap();
        assert!(within.matches(&record));

        let tags = model.field("tags").unwrap();
        let tagged = tags
            .compare("tags", Lookup::Eq, Operand::Scalar(json!("blue")))
            .unwrap();
        assert!(tagged.matches(&record));

        // `text` is null, which never matches.
        let text = model
            .field("text")
            .unwrap()
            .compare("text", Lookup::Ne, Operand::Scalar(json!("x")))
            .unwrap();
        assert!(!text.matches(&record));
    }

    #[test]
    fn comparisons_check_the_field_kind() {
        let model = item();
        assert!(model
            .field("number")
            .unwrap()
            .compare("number", Lookup::Eq, Operand::Scalar(json!("one")))
            .is_err());
        assert!(model
            .field("text")
            .unwrap()
            .compare("text", Lookup::In, Operand::List(vec![json!("a"), json!(1)]))
            .is_err());
        assert!(model
            .field("notes")
            .unwrap()
            .compare("notes", Lookup::Eq, Operand::Scalar(json!("a")))
            .is_err());
    }

    #[test]
    fn queries_are_conjunctive() {
        let model = item();
        let mut record = Record::new(&model);
        record.set("number", 5);
        record.set("text", "a");
        let number = model.field("number").unwrap();
        let text = model.field("text").unwrap();
        let query = Query::new("Item")
            .filter(vec![number
                .compare("number", Lookup::Ge, Operand::Scalar(json!(5.0)))
                .unwrap()])
            .filter(vec![text
                .compare("text", Lookup::Eq, Operand::Scalar(json!("b")))
                .unwrap()]);
        assert_eq!(query.predicates().len(), 2);
        assert!(!query.matches(&record));
        assert!(!Query::new("Other").matches(&record));
        assert!(Query::new("Item").matches(&record));
    }
}
