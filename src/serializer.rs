// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Translation between client data and records.
//!
//! A [ModelSerializer] validates decoded JSON input against a model's schema and writes the
//! result into a record, and turns records (or every record matching a query) back into plain
//! JSON representations.

use crate::error::ApiError;
use crate::store::{Field, Model, Query, Record, RecordId, Store, StoreError};
use crate::types::fmt_as_json;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{event, Level};

/// Extra validation for one field, run before the field's type is checked.
///
/// The hook sees the raw input value, or `None` if the field is absent.
pub type FieldValidator = Arc<dyn Fn(Option<&Value>) -> Result<(), ApiError> + Send + Sync>;

/// Computes the representation of one key from the whole record.
pub type FieldGetter = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Input that has passed validation against a schema, keyed by field name.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidatedData(IndexMap<String, Value>);

impl ValidatedData {
    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.0
    }
}

impl Deref for ValidatedData {
    type Target = IndexMap<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ValidatedData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt_as_json(self, f)
    }
}

/// Serializer for the records of one model.
///
/// * `include_fields` limits representations to the listed fields.
/// * `exclude_fields` removes fields from representations, and takes precedence over
///   `include_fields`.
/// * `translate_fields` maps field names to the names used by clients, both in input and in
///   representations.
/// * validators and getters are per-field hooks, looked up by field name (for getters, by
///   representation key).
#[derive(Clone)]
pub struct ModelSerializer {
    model: Arc<Model>,
    include_fields: Option<Vec<String>>,
    exclude_fields: Option<Vec<String>>,
    translate_fields: IndexMap<String, String>,
    validators: HashMap<String, FieldValidator>,
    getters: HashMap<String, FieldGetter>,
}

impl Debug for ModelSerializer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSerializer")
            .field("model", &self.model.kind())
            .field("include_fields", &self.include_fields)
            .field("exclude_fields", &self.exclude_fields)
            .field("translate_fields", &self.translate_fields)
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelSerializer {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            include_fields: None,
            exclude_fields: None,
            translate_fields: IndexMap::new(),
            validators: HashMap::new(),
            getters: HashMap::new(),
        }
    }

    pub fn include_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Expose the field `name` to clients as `external`.
    pub fn translate_field(mut self, name: impl Into<String>, external: impl Into<String>) -> Self {
        self.translate_fields.insert(name.into(), external.into());
        self
    }

    pub fn validator<F>(mut self, name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(Option<&Value>) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(validator));
        self
    }

    pub fn getter<F>(mut self, key: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.getters.insert(key.into(), Arc::new(getter));
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Validate `data` against this serializer's model.
    ///
    /// The result has exactly one entry per schema field.
    pub fn validate(&self, data: &Map<String, Value>) -> Result<ValidatedData, ApiError> {
        self.validate_for(data, &self.model, false)
    }

    /// Validate `data` against `model`.
    ///
    /// Every field of the schema is read from `data`, under its client-facing name if it has
    /// one. An absent (or `null`) field fails if it is required, and otherwise validates to `[]`
    /// if repeated or `null` if not. With `partial`, absent fields are skipped entirely instead,
    /// so the result only holds the fields present in `data`. An explicit `null` is never
    /// skipped: it clears the field, or fails if the field is required.
    pub fn validate_for(
        &self,
        data: &Map<String, Value>,
        model: &Model,
        partial: bool,
    ) -> Result<ValidatedData, ApiError> {
        let mut validated = IndexMap::new();
        for (name, field) in model.schema() {
            let value = self.input_value(data, name);
            if let Some(validator) = self.validators.get(name) {
                validator(value)?;
            }
            match value {
                None if partial => {}
                None | Some(Value::Null) if field.is_required() => {
                    return Err(ApiError::validation(format!(
                        "Property {} is required",
                        name
                    )));
                }
                None | Some(Value::Null) if field.is_repeated() => {
                    validated.insert(name.clone(), Value::Array(Vec::new()));
                }
                None | Some(Value::Null) => {
                    validated.insert(name.clone(), Value::Null);
                }
                Some(value) => {
                    validated.insert(name.clone(), coerce(name, field, value)?);
                }
            }
        }
        Ok(ValidatedData(validated))
    }

    fn input_value<'a>(&self, data: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
        self.translate_fields
            .get(name)
            .and_then(|external| data.get(external))
            .or_else(|| data.get(name))
    }

    /// Validate `data` and write it into `target`, atomically.
    ///
    /// Either every field is applied and the record persisted, or nothing is persisted and the
    /// error is returned.
    pub fn save(
        &self,
        store: &dyn Store,
        data: &Map<String, Value>,
        target: Record,
    ) -> Result<Record, ApiError> {
        self.save_with(store, data, target, false)
    }

    fn save_with(
        &self,
        store: &dyn Store,
        data: &Map<String, Value>,
        target: Record,
        partial: bool,
    ) -> Result<Record, ApiError> {
        let model = store
            .model(target.kind())
            .ok_or_else(|| StoreError::UnknownModel {
                kind: target.kind().to_string(),
            })?;
        let validated = self.validate_for(data, &model, partial)?;
        let record = store.transaction(target, &mut |record| {
            record.populate(&model, &validated);
            Ok(())
        })?;
        Ok(record)
    }

    /// Create a new record of this serializer's model from `data`.
    pub fn create(&self, store: &dyn Store, data: &Map<String, Value>) -> Result<Record, ApiError> {
        let target = self.get_or_create_target(store, None, None)?;
        let record = self.save(store, data, target)?;
        event!(
            Level::INFO,
            "created {} {}",
            record.kind(),
            record.id().map(RecordId::to_string).unwrap_or_default()
        );
        Ok(record)
    }

    /// Update the record at `id` with `data`.
    ///
    /// A `partial` update only touches the fields present in `data`.
    pub fn update(
        &self,
        store: &dyn Store,
        data: &Map<String, Value>,
        id: &RecordId,
        partial: bool,
    ) -> Result<Record, ApiError> {
        let target = self.get_or_create_target(store, Some(id), None)?;
        let record = self.save_with(store, data, target, partial)?;
        event!(Level::INFO, "updated {} {}", record.kind(), id);
        Ok(record)
    }

    /// The record a write should target.
    ///
    /// Without an `id` this is a fresh, unpersisted record; otherwise it is the stored record
    /// with that id. `kind` overrides this serializer's model, and must name a model registered
    /// in `store`.
    pub fn get_or_create_target(
        &self,
        store: &dyn Store,
        id: Option<&RecordId>,
        kind: Option<&str>,
    ) -> Result<Record, ApiError> {
        let kind = kind.unwrap_or_else(|| self.model.kind());
        let model = store.model(kind).ok_or_else(|| StoreError::UnknownModel {
            kind: kind.to_string(),
        })?;
        match id {
            None => Ok(Record::new(&model)),
            Some(id) => store.get(kind, id)?.ok_or_else(|| {
                StoreError::NotFound {
                    kind: kind.to_string(),
                    id: id.clone(),
                }
                .into()
            }),
        }
    }

    /// The plain JSON representation of `record`.
    ///
    /// Fields are projected through the include and exclude lists, the identifier is added under
    /// `"id"`, keys are renamed through `translate_fields`, and finally any getter registered for
    /// a key replaces that key's value.
    pub fn to_representation(&self, record: &Record) -> Value {
        let mut repr = record.to_map(
            self.include_fields.as_deref(),
            self.exclude_fields.as_deref(),
        );
        repr.insert(
            "id".to_string(),
            record.id().map_or(Value::Null, RecordId::to_value),
        );
        // Renaming keeps every key in its place.
        let mut repr = repr
            .into_iter()
            .map(|(key, value)| match self.translate_fields.get(&key) {
                Some(external) => (external.clone(), value),
                None => (key, value),
            })
            .collect::<Map<String, Value>>();
        for (key, value) in repr.iter_mut() {
            if let Some(getter) = self.getters.get(key) {
                *value = getter(record);
            }
        }
        Value::Object(repr)
    }

    /// The representation of a record, or the list of representations of a collection.
    pub fn representation<T: Serializable + ?Sized>(
        &self,
        store: &dyn Store,
        target: &T,
    ) -> Result<Value, ApiError> {
        target.represent(self, store)
    }

    fn to_representations(&self, records: &[Record]) -> Value {
        Value::Array(records.iter().map(|r| self.to_representation(r)).collect())
    }

    /// JSON text of [representation](Self::representation).
    pub fn serialize<T: Serializable + ?Sized>(
        &self,
        store: &dyn Store,
        target: &T,
    ) -> Result<String, ApiError> {
        let repr = self.representation(store, target)?;
        serde_json::to_string(&repr).map_err(|err| ApiError::internal(err.to_string()))
    }
}

/// Something a [ModelSerializer] can represent.
///
/// A [Record] has a single representation. A [Query] is run against the store and a slice of
/// records is used as is; both produce a list. A `dyn Any` is whichever of these it holds, and is
/// not serializable if it holds anything else.
pub trait Serializable {
    fn represent(&self, serializer: &ModelSerializer, store: &dyn Store)
        -> Result<Value, ApiError>;
}

impl Serializable for Record {
    fn represent(&self, serializer: &ModelSerializer, _: &dyn Store) -> Result<Value, ApiError> {
        Ok(serializer.to_representation(self))
    }
}

impl Serializable for Query {
    fn represent(&self, serializer: &ModelSerializer, store: &dyn Store) -> Result<Value, ApiError> {
        let records = store.fetch(self)?;
        event!(
            Level::DEBUG,
            "fetched {} {} records",
            records.len(),
            self.kind()
        );
        Ok(serializer.to_representations(&records))
    }
}

impl Serializable for [Record] {
    fn represent(&self, serializer: &ModelSerializer, _: &dyn Store) -> Result<Value, ApiError> {
        Ok(serializer.to_representations(self))
    }
}

impl Serializable for Vec<Record> {
    fn represent(&self, serializer: &ModelSerializer, store: &dyn Store) -> Result<Value, ApiError> {
        self.as_slice().represent(serializer, store)
    }
}

impl Serializable for dyn Any + Send + Sync {
    fn represent(&self, serializer: &ModelSerializer, store: &dyn Store) -> Result<Value, ApiError> {
        if let Some(record) = self.downcast_ref::<Record>() {
            record.represent(serializer, store)
        } else if let Some(query) = self.downcast_ref::<Query>() {
            query.represent(serializer, store)
        } else if let Some(records) = self.downcast_ref::<Vec<Record>>() {
            records.represent(serializer, store)
        } else {
            Err(ApiError::non_serializable(format!(
                "Object of type {:?} is not serializable",
                self.type_id()
            )))
        }
    }
}

fn coerce(name: &str, field: &Field, value: &Value) -> Result<Value, ApiError> {
    if field.is_repeated() {
        let items = value
            .as_array()
            .ok_or_else(|| ApiError::validation(format!("`{}` should be a list.", name)))?;
        let items = items
            .iter()
            .map(|item| field.kind().validate(item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(items))
    } else {
        Ok(field.kind().validate(value)?)
    }
}
