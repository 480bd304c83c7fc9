//! Where document metadata is kept: the SQLite index, or (without one) an
//! in-memory listing rebuilt from directory scans.

use docmgt_index::error::{ErrorKind, Result};
use docmgt_index::{DocumentId, Fields, IndexTable, Order, Record, RecordStream, TrustedPredicate};
use docmgt_storage::error::ErrorKind as StorageErrorKind;
use docmgt_storage::{FIELDS, Metadata, MetadataStream, Value, validate_path};
use exn::ResultExt;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub(crate) enum Catalog {
    Table(IndexTable),
    Memory(MemoryCatalog),
}

impl Catalog {
    pub(crate) async fn insert(&mut self, fields: &Fields) -> Result<DocumentId> {
        match self {
            Self::Table(table) => table.insert(fields).await,
            Self::Memory(memory) => Ok(memory.insert(fields)),
        }
    }

    pub(crate) async fn update(&mut self, id: DocumentId, fields: &Fields) -> Result<()> {
        match self {
            Self::Table(table) => table.update(id, fields).await,
            Self::Memory(memory) => memory.update(id, fields),
        }
    }

    pub(crate) async fn refresh(&mut self, id: DocumentId, metadata: &Metadata) -> Result<()> {
        match self {
            Self::Table(table) => table.refresh(id, metadata).await,
            Self::Memory(memory) => memory.refresh(id, metadata),
        }
    }

    pub(crate) async fn get(&self, id: DocumentId) -> Result<Record> {
        match self {
            Self::Table(table) => table.get(id).await,
            Self::Memory(memory) => memory.get(id),
        }
    }

    pub(crate) async fn path_of(&self, id: DocumentId) -> Result<PathBuf> {
        match self {
            Self::Table(table) => table.path_of(id).await,
            Self::Memory(memory) => memory.path_of(id),
        }
    }

    pub(crate) async fn remove(&mut self, id: DocumentId) -> Result<()> {
        match self {
            Self::Table(table) => table.remove(id).await,
            Self::Memory(memory) => memory.remove(id),
        }
    }

    pub(crate) async fn load(&mut self, records: MetadataStream<'_>) -> Result<u64> {
        match self {
            Self::Table(table) => table.load(records).await,
            Self::Memory(memory) => memory.load(records).await,
        }
    }

    /// Callers must reject predicates for the in-memory catalog first.
    pub(crate) fn search(&self, predicate: Option<&TrustedPredicate>, order: &Order) -> Result<RecordStream> {
        match self {
            Self::Table(table) => table.search(predicate, order),
            Self::Memory(memory) => memory.search(order),
        }
    }
}

/// Extractor fields for every file found by the last scan, plus any
/// documents created since.
///
/// Identifiers keep increasing across reloads, so an id handed out before a
/// reload never refers to a different file afterwards.
#[derive(Debug, Default)]
pub(crate) struct MemoryCatalog {
    last_id: i64,
    rows: BTreeMap<DocumentId, Fields>,
}

impl MemoryCatalog {
    fn extractor_fields(fields: &Fields) -> impl Iterator<Item = (&String, &Value)> {
        fields.iter().filter(|(name, _)| FIELDS.contains(&name.as_str()))
    }

    fn insert(&mut self, fields: &Fields) -> DocumentId {
        self.last_id += 1;
        let id = DocumentId::new(self.last_id);
        let row = Self::extractor_fields(fields).map(|(name, value)| (name.clone(), value.clone())).collect();
        self.rows.insert(id, row);
        id
    }

    fn row_mut(&mut self, id: DocumentId) -> Result<&mut Fields> {
        match self.rows.get_mut(&id) {
            Some(row) => Ok(row),
            None => exn::bail!(ErrorKind::NotFound(id)),
        }
    }

    fn update(&mut self, id: DocumentId, fields: &Fields) -> Result<()> {
        let updates: Vec<(String, Value)> =
            Self::extractor_fields(fields).map(|(name, value)| (name.clone(), value.clone())).collect();
        self.row_mut(id)?.extend(updates);
        Ok(())
    }

    fn refresh(&mut self, id: DocumentId, metadata: &Metadata) -> Result<()> {
        let row = self.row_mut(id)?;
        row.extend(metadata.fields().into_iter().map(|(name, value)| (name.to_string(), value)));
        Ok(())
    }

    fn record(id: DocumentId, row: &Fields) -> Record {
        let fields = FIELDS.iter().map(|field| (field.to_string(), row.get(*field).cloned().unwrap_or(Value::Null))).collect();
        Record::new(id, fields)
    }

    fn get(&self, id: DocumentId) -> Result<Record> {
        match self.rows.get(&id) {
            Some(row) => Ok(Self::record(id, row)),
            None => exn::bail!(ErrorKind::NotFound(id)),
        }
    }

    fn path_of(&self, id: DocumentId) -> Result<PathBuf> {
        let row = self.rows.get(&id);
        let Some(row) = row else {
            exn::bail!(ErrorKind::NotFound(id));
        };
        match row.get("path").and_then(Value::as_str) {
            Some(path) => validate_path(path).or_raise(|| ErrorKind::InvalidData("document path")),
            None => exn::bail!(ErrorKind::InvalidData("document has no path")),
        }
    }

    fn remove(&mut self, id: DocumentId) -> Result<()> {
        match self.rows.remove(&id) {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::NotFound(id)),
        }
    }

    async fn load(&mut self, mut records: MetadataStream<'_>) -> Result<u64> {
        // Collect first so a failed scan leaves the previous listing intact.
        let mut scanned = Vec::new();
        while let Some(metadata) = records.next().await {
            match metadata {
                Ok(metadata) => scanned.push(metadata),
                Err(err) if matches!(&*err, StorageErrorKind::Unreadable(_)) => {
                    tracing::warn!(error = %err, "Skipping directory entry");
                },
                Err(err) => return Err(err).or_raise(|| ErrorKind::Scan),
            }
        }
        self.rows.clear();
        for metadata in &scanned {
            self.last_id += 1;
            let row = metadata.fields().into_iter().map(|(name, value)| (name.to_string(), value)).collect();
            self.rows.insert(DocumentId::new(self.last_id), row);
        }
        tracing::info!(rows = scanned.len(), "Reloaded in-memory catalog from directory scan");
        Ok(scanned.len() as u64)
    }

    fn search(&self, order: &Order) -> Result<RecordStream> {
        let terms = order.resolve(|column| column == "id" || FIELDS.contains(&column))?;
        let mut records: Vec<Record> = self.rows.iter().map(|(id, row)| Self::record(*id, row)).collect();
        records.sort_by(|a, b| {
            terms
                .iter()
                .map(|term| match term.column.as_str() {
                    "id" => term.compare(&Value::Integer(a.id.get()), &Value::Integer(b.id.get())),
                    column => term.compare(a.get(column).unwrap_or(&Value::Null), b.get(column).unwrap_or(&Value::Null)),
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Box::pin(futures::stream::iter(records.into_iter().map(Ok))))
    }
}
