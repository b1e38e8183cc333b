use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Range;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::token::{ClassId, TransactionTypeName, DEFAULT_CLASS, DEFAULT_TRANSACTION_TYPENAME};
use crate::{Error, Result};

pub const BATCH_EXTENSION: &str = "batch";

/// A single document (or more generally an item) of a batch. Token ids
/// index the containing batch's token table. The transaction layout splits
/// the token sequence into groups that co-occur as a unit: entry i of
/// `transaction_start_index` is where transaction i starts, and the array
/// carries one trailing entry equal to `token_id.len()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    pub id: i32,
    pub title: String,
    pub token_id: Vec<u32>,
    pub token_weight: Vec<f32>,
    pub transaction_start_index: Vec<u32>,
    pub transaction_typename_id: Vec<u32>,
}

impl Item {
    /// Item-level consistency. Failures here drop the item, not the batch.
    pub fn validate(&self, token_count: usize, typename_count: usize) -> Result<()> {
        if self.token_id.len() != self.token_weight.len() {
            return Err(Error::InvalidArgument(format!(
                "item {}: token_id size {} != token_weight size {}",
                self.id,
                self.token_id.len(),
                self.token_weight.len()
            )));
        }

        if let Some(&max_id) = self.token_id.iter().max() {
            if max_id as usize >= token_count {
                return Err(Error::InvalidArgument(format!(
                    "item {}: token_id {} out of range ({} tokens in batch)",
                    self.id, max_id, token_count
                )));
            }
        }

        if !self.transaction_start_index.is_empty() {
            let starts = &self.transaction_start_index;

            if starts[0] != 0 || *starts.last().unwrap() as usize != self.token_id.len() {
                return Err(Error::InvalidArgument(format!(
                    "item {}: transaction_start_index must span 0..{}",
                    self.id,
                    self.token_id.len()
                )));
            }

            if !starts.windows(2).all(|w| w[0] < w[1]) {
                return Err(Error::InvalidArgument(format!(
                    "item {}: transaction_start_index is not strictly increasing",
                    self.id
                )));
            }

            if self.transaction_typename_id.len() != starts.len() - 1 {
                return Err(Error::InvalidArgument(format!(
                    "item {}: expected {} transaction typename ids, got {}",
                    self.id,
                    starts.len() - 1,
                    self.transaction_typename_id.len()
                )));
            }

            if let Some(&max_id) = self.transaction_typename_id.iter().max() {
                if max_id as usize >= typename_count.max(1) {
                    return Err(Error::InvalidArgument(format!(
                        "item {}: transaction typename id {} out of range",
                        self.id, max_id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Iterates transactions as (token range, typename id). Items without
    /// an explicit layout degrade to one single-token transaction per
    /// occurrence, with the default typename.
    pub fn transactions(&self) -> impl Iterator<Item = (Range<usize>, usize)> + '_ {
        let explicit = !self.transaction_start_index.is_empty();
        let count = if explicit {
            self.transaction_start_index.len() - 1
        } else {
            self.token_id.len()
        };

        (0..count).map(move |i| {
            if explicit {
                let start = self.transaction_start_index[i] as usize;
                let end = self.transaction_start_index[i + 1] as usize;
                (start..end, self.transaction_typename_id[i] as usize)
            } else {
                (i..i + 1, 0)
            }
        })
    }
}

/// In-memory representation of one batch file: a modality-aware token
/// table shared by all of its items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub token: Vec<String>,
    pub class_id: Vec<ClassId>,
    pub transaction_typename: Vec<TransactionTypeName>,
    pub item: Vec<Item>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    pub fn class_id_at(&self, token_index: usize) -> &str {
        self.class_id
            .get(token_index)
            .map(|c| c.as_str())
            .unwrap_or(DEFAULT_CLASS)
    }

    pub fn typename_at(&self, typename_index: usize) -> &str {
        self.transaction_typename
            .get(typename_index)
            .map(|t| t.as_str())
            .unwrap_or(DEFAULT_TRANSACTION_TYPENAME)
    }

    /// Batch-level consistency: anything failing here rejects the whole
    /// batch. Item layouts are checked separately so that one malformed
    /// item does not take the batch down with it.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidArgument("batch is missing an id".to_string()));
        }

        if self.token.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "batch {} has an empty token table",
                self.id
            )));
        }

        if !self.class_id.is_empty() && self.class_id.len() != self.token.len() {
            return Err(Error::InvalidArgument(format!(
                "batch {}: class_id size {} != token size {}",
                self.id,
                self.class_id.len(),
                self.token.len()
            )));
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let file = File::create(path).map_err(|e| Error::disk_write(path, e))?;
        let writer = BufWriter::new(file);

        bincode::serialize_into(writer, self)
            .map_err(|e| Error::DiskWrite(format!("{}: {}", path.display(), e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::disk_read(path, e))?;
        let reader = BufReader::new(file);

        let mut batch: Batch = bincode::deserialize_from(reader)
            .map_err(|e| Error::CorruptedMessage(format!("{}: {}", path.display(), e)))?;

        if batch.id.is_empty() {
            // Batches written by older tooling rely on their filename
            // being the uuid.
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();

            match Uuid::parse_str(stem) {
                Ok(uuid) => batch.id = uuid.to_string(),
                Err(_) => {
                    return Err(Error::DiskRead(format!(
                        "unable to detect batch id or uuid filename in {}",
                        path.display()
                    )))
                }
            }
        }

        batch.validate()?;

        Ok(batch)
    }
}

/// All `.batch` files under the given directory, recursively, in sorted
/// order so that passes enumerate batches deterministically.
pub fn list_batches(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| Error::disk_read(&dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::disk_read(&dir, e))?;
            let path = entry.path();

            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(BATCH_EXTENSION) {
                found.push(path);
            }
        }
    }

    found.sort();

    Ok(found)
}
