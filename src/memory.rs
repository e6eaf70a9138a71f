// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! An in-process [Store].

use crate::store::{Model, Query, Record, RecordId, Store, StoreError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Default)]
struct Tables {
    models: HashMap<String, Arc<Model>>,
    records: HashMap<String, BTreeMap<RecordId, Record>>,
    last_id: i64,
}

impl Tables {
    fn table(&self, kind: &str) -> Result<&BTreeMap<RecordId, Record>, StoreError> {
        self.records.get(kind).ok_or_else(|| StoreError::UnknownModel {
            kind: kind.to_string(),
        })
    }

    fn table_mut(&mut self, kind: &str) -> Result<&mut BTreeMap<RecordId, Record>, StoreError> {
        self.records
            .get_mut(kind)
            .ok_or_else(|| StoreError::UnknownModel {
                kind: kind.to_string(),
            })
    }
}

/// A [Store] keeping every record in memory.
///
/// All tables sit behind one lock, so a transaction excludes every other writer and reader for
/// its duration.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, making its schema immutable from now on.
    ///
    /// Registering a kind again replaces its schema but keeps its records.
    pub fn register(&self, model: Model) -> Arc<Model> {
        let model = Arc::new(model);
        let mut tables = self.tables.write();
        tables.records.entry(model.kind().to_string()).or_default();
        tables
            .models
            .insert(model.kind().to_string(), model.clone());
        event!(Level::DEBUG, "registered model {}", model.kind());
        model
    }
}

impl Store for MemoryStore {
    fn model(&self, kind: &str) -> Option<Arc<Model>> {
        self.tables.read().models.get(kind).cloned()
    }

    fn get(&self, kind: &str, id: &RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.tables.read().table(kind)?.get(id).cloned())
    }

    fn fetch(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .tables
            .read()
            .table(query.kind())?
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    fn transaction(
        &self,
        target: Record,
        apply: &mut dyn FnMut(&mut Record) -> Result<(), StoreError>,
    ) -> Result<Record, StoreError> {
        let mut tables = self.tables.write();
        let kind = target.kind().to_string();
        let mut record = match target.id() {
            Some(id) => tables
                .table(&kind)?
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    kind: kind.clone(),
                    id: id.clone(),
                })?,
            None => {
                tables.table(&kind)?;
                target
            }
        };
        apply(&mut record)?;
        let id = match record.id() {
            Some(id) => id.clone(),
            None => {
                let id = RecordId::Int(tables.last_id + 1);
                record.assign_id(id.clone())?;
                tables.last_id += 1;
                id
            }
        };
        tables.table_mut(&kind)?.insert(id, record.clone());
        Ok(record)
    }

    fn delete(&self, kind: &str, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.tables.write().table_mut(kind)?.remove(id).is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{Field, Lookup, Operand};
    use serde_json::json;
    use std::thread;

    fn store() -> (MemoryStore, Arc<Model>) {
        let store = MemoryStore::new();
        let model = store.register(
            Model::new("Pair")
                .with_field("left", Field::integer())
                .with_field("right", Field::integer()),
        );
        (store, model)
    }

    #[test]
    fn inserts_assign_fresh_ids() {
        let (store, model) = store();
        let first = store
            .transaction(Record::new(&model), &mut |_| Ok(()))
            .unwrap();
        let second = store
            .transaction(Record::new(&model), &mut |_| Ok(()))
            .unwrap();
        assert_eq!(first.id(), Some(&RecordId::Int(1)));
        assert_eq!(second.id(), Some(&RecordId::Int(2)));
        assert_eq!(store.count(&Query::new("Pair")).unwrap(), 2);
    }

    #[test]
    fn failed_transactions_persist_nothing() {
        let (store, model) = store();
        let err = store
            .transaction(Record::new(&model), &mut |record| {
                record.set("left", 1);
                Err(StoreError::BadValue {
                    message: "no".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::BadValue { .. }));
        assert_eq!(store.count(&Query::new("Pair")).unwrap(), 0);

        let saved = store
            .transaction(Record::new(&model), &mut |record| {
                record.set("left", 1);
                Ok(())
            })
            .unwrap();
        let id = saved.id().unwrap().clone();
        store
            .transaction(saved, &mut |record| {
                record.set("left", 2);
                Err(StoreError::BadValue {
                    message: "no".into(),
                })
            })
            .unwrap_err();
        let stored = store.get("Pair", &id).unwrap().unwrap();
        assert_eq!(stored.get("left"), Some(&json!(1)));
    }

    #[test]
    fn updates_of_missing_records_fail() {
        let (store, model) = store();
        let saved = store
            .transaction(Record::new(&model), &mut |_| Ok(()))
            .unwrap();
        let id = saved.id().unwrap().clone();
        assert!(store.delete("Pair", &id).unwrap());
        assert!(!store.delete("Pair", &id).unwrap());
        assert_eq!(
            store.transaction(saved, &mut |_| Ok(())).unwrap_err(),
            StoreError::NotFound {
                kind: "Pair".into(),
                id,
            }
        );
    }

    #[test]
    fn unknown_kinds() {
        let store = MemoryStore::new();
        assert!(store.model("Nope").is_none());
        assert!(matches!(
            store.fetch(&Query::new("Nope")),
            Err(StoreError::UnknownModel { .. })
        ));
        let orphan = Record::new(&Model::new("Nope"));
        assert!(matches!(
            store.transaction(orphan, &mut |_| Ok(())),
            Err(StoreError::UnknownModel { .. })
        ));
    }

    #[test]
    fn fetch_applies_predicates() {
        let (store, model) = store();
        for n in 0..5 {
            store
                .transaction(Record::new(&model), &mut |record| {
                    record.set("left", n);
                    Ok(())
                })
                .unwrap();
        }
        let left = model.field("left").unwrap();
        let query = Query::new("Pair").filter(vec![left
            .compare("left", Lookup::Ge, Operand::Scalar(json!(3.0)))
            .unwrap()]);
        let found = store.fetch(&query).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r.get("left").unwrap().as_i64().unwrap() >= 3));
    }

    #[test]
    fn concurrent_updates_never_interleave() {
        let (store, model) = store();
        let store = Arc::new(store);
        let saved = store
            .transaction(Record::new(&model), &mut |_| Ok(()))
            .unwrap();

        let handles = (0..8)
            .map(|n| {
                let store = store.clone();
                let target = saved.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        store
                            .transaction(target.clone(), &mut |record| {
                                record.set("left", n);
                                thread::yield_now();
                                record.set("right", n);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = store.get("Pair", saved.id().unwrap()).unwrap().unwrap();
        assert_eq!(stored.get("left"), stored.get("right"));
    }
}
