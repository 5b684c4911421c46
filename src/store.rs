//! Record store collaborators.
//!
//! The backup code only sees records as an integer id plus opaque JSON
//! fields, grouped in named collections.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::StoreError;
use crate::storage::Storage;

/// One application record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    id: i64,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: i64, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Converts any serializable struct with an integer `id` field.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(value)?)
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Describes a record collection and, optionally, which field names a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    name: String,
    blob_field: Option<String>,
}

impl CollectionSpec {
    /// A collection without blobs.
    pub fn records(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blob_field: None,
        }
    }

    /// A collection whose records reference a blob through a string field.
    pub fn with_blobs(name: impl Into<String>, blob_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blob_field: Some(blob_field.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blob_field(&self) -> Option<&str> {
        self.blob_field.as_deref()
    }

    /// The blob a record of this collection points at, if any.
    pub fn blob_reference(&self, record: &Record) -> Option<BlobReference> {
        let field = self.blob_field()?;
        let name = record.get(field)?.as_str()?;
        if name.is_empty() {
            return None;
        }
        Some(BlobReference {
            name: name.to_string(),
            collection: self.name.clone(),
            record_id: record.id(),
        })
    }
}

/// Links a blob name to the record that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReference {
    pub name: String,
    pub collection: String,
    pub record_id: i64,
}

/// Shared by both sides of a record store: the collections it holds, in
/// export order.
pub trait RecordCollections {
    fn collections(&self) -> Vec<CollectionSpec>;
}

/// Read side used by the exporter.
pub trait RecordSource: RecordCollections {
    /// Point-in-time copy of every record in `collection`, ordered by id.
    fn snapshot(&self, collection: &str) -> Result<Vec<Record>, StoreError>;
}

/// Write side used by the importer.
pub trait RecordSink: RecordCollections {
    /// Inserts `records`, overwriting any record with the same id. Records
    /// not in `records` are kept. Returns how many records were written.
    fn replace_all(&mut self, collection: &str, records: Vec<Record>) -> Result<usize, StoreError>;

    /// Makes every `replace_all` since the last commit durable in one step.
    /// Stores without a backing file have nothing to do.
    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory record store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    specs: Vec<CollectionSpec>,
    collections: HashMap<String, BTreeMap<i64, Record>>,
}

impl MemoryRecordStore {
    pub fn new(specs: Vec<CollectionSpec>) -> Self {
        let collections = specs
            .iter()
            .map(|spec| (spec.name.clone(), BTreeMap::new()))
            .collect();
        Self { specs, collections }
    }

    /// Adds a record, failing if the id is already taken.
    pub fn insert(&mut self, collection: &str, record: Record) -> Result<(), StoreError> {
        let records = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id: record.id,
            });
        }
        records.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, collection: &str, id: i64) -> Option<&Record> {
        self.collections.get(collection)?.get(&id)
    }

    pub fn records(&self, collection: &str) -> impl Iterator<Item = &Record> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(|records| records.values())
    }

    /// Next free id in `collection`.
    pub fn next_id(&self, collection: &str) -> i64 {
        self.collections
            .get(collection)
            .and_then(|records| records.keys().next_back())
            .map_or(1, |id| id + 1)
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordCollections for MemoryRecordStore {
    fn collections(&self) -> Vec<CollectionSpec> {
        self.specs.clone()
    }
}

impl RecordSource for MemoryRecordStore {
    fn snapshot(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        self.collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }
}

impl RecordSink for MemoryRecordStore {
    fn replace_all(&mut self, collection: &str, records: Vec<Record>) -> Result<usize, StoreError> {
        if !self.collections.contains_key(collection) {
            // Collections unknown to this build are kept rather than dropped.
            self.specs.push(CollectionSpec::records(collection));
        }
        let target = self.collections.entry(collection.to_string()).or_default();

        let count = records.len();
        for record in records {
            target.insert(record.id, record);
        }
        Ok(count)
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    collections: BTreeMap<String, Vec<Record>>,
}

/// Record store persisted as one JSON file.
///
/// `insert` saves immediately. Changes made through [`RecordSink`] stay in
/// memory until [`RecordSink::commit`], which writes them all back with one
/// atomic save.
#[derive(Debug)]
pub struct JsonRecordStore {
    storage: Storage,
    memory: MemoryRecordStore,
    dirty: bool,
}

impl JsonRecordStore {
    /// Loads the store, or starts empty if the file does not exist yet.
    pub fn open(storage: Storage, specs: Vec<CollectionSpec>) -> Result<Self, StoreError> {
        let mut memory = MemoryRecordStore::new(specs);

        if storage.exists() {
            let file: StoreFile = serde_json::from_slice(&storage.load()?)?;
            for (name, records) in file.collections {
                memory.replace_all(&name, records)?;
            }
            debug!(path = %storage.path().display(), records = memory.len(), "loaded record store");
        }

        Ok(Self {
            storage,
            memory,
            dirty: false,
        })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            collections: self
                .memory
                .collections
                .iter()
                .map(|(name, records)| (name.clone(), records.values().cloned().collect()))
                .collect(),
        };
        self.storage.save(&serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Adds a record and persists the store.
    pub fn insert(&mut self, collection: &str, record: Record) -> Result<(), StoreError> {
        self.memory.insert(collection, record)?;
        self.save()
    }

    pub fn records(&self, collection: &str) -> impl Iterator<Item = &Record> {
        self.memory.records(collection)
    }

    pub fn next_id(&self, collection: &str) -> i64 {
        self.memory.next_id(collection)
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

impl RecordCollections for JsonRecordStore {
    fn collections(&self) -> Vec<CollectionSpec> {
        self.memory.collections()
    }
}

impl RecordSource for JsonRecordStore {
    fn snapshot(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        self.memory.snapshot(collection)
    }
}

impl RecordSink for JsonRecordStore {
    fn replace_all(&mut self, collection: &str, records: Vec<Record>) -> Result<usize, StoreError> {
        let count = self.memory.replace_all(collection, records)?;
        self.dirty = true;
        Ok(count)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.save()?;
            self.dirty = false;
        }
        Ok(())
    }
}
