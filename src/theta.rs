use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use ahash::AHashMap;

use crate::{Error, Result};

/// Topic × item distribution. Items are columns; `item_weights[d]` holds
/// item d's distribution over `topic_names` (dense), or over
/// `topic_indices[d]` when the matrix is a sparse projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThetaMatrix {
    pub topic_names: Vec<String>,
    pub item_ids: Vec<i32>,
    pub item_titles: Vec<String>,
    pub item_weights: Vec<Vec<f32>>,
    pub topic_indices: Vec<Vec<u32>>,
}

impl ThetaMatrix {
    pub fn new(topic_names: Vec<String>) -> Self {
        Self {
            topic_names,
            ..Self::default()
        }
    }

    pub fn num_items(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_sparse(&self) -> bool {
        !self.topic_indices.is_empty()
    }

    pub fn push(&mut self, item_id: i32, item_title: &str, weights: Vec<f32>) {
        self.item_ids.push(item_id);
        self.item_titles.push(item_title.to_string());
        self.item_weights.push(weights);
    }

    /// Concatenates another theta over the same topic axis.
    pub fn append(&mut self, other: &ThetaMatrix) -> Result<()> {
        if self.topic_names != other.topic_names {
            return Err(Error::InvalidOperation(
                "cannot append theta matrices with different topic axes".to_string(),
            ));
        }

        self.item_ids.extend_from_slice(&other.item_ids);
        self.item_titles.extend_from_slice(&other.item_titles);
        self.item_weights.extend_from_slice(&other.item_weights);
        self.topic_indices.extend_from_slice(&other.topic_indices);

        Ok(())
    }

    /// Restricts to a subset of topics and optionally re-encodes sparsely,
    /// dropping entries below eps. Only valid on a dense source.
    pub fn project(
        &self,
        topic_subset: Option<&[String]>,
        sparse: bool,
        eps: f32,
    ) -> Result<ThetaMatrix> {
        if self.is_sparse() {
            return Err(Error::InvalidOperation(
                "cannot project an already sparse theta matrix".to_string(),
            ));
        }

        let selected: Vec<usize> = match topic_subset {
            None => (0..self.topic_names.len()).collect(),
            Some(subset) => subset
                .iter()
                .map(|name| {
                    self.topic_names
                        .iter()
                        .position(|t| t == name)
                        .ok_or_else(|| Error::NotFound(format!("topic {}", name)))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let mut out = ThetaMatrix::new(
            selected
                .iter()
                .map(|&t| self.topic_names[t].clone())
                .collect(),
        );
        out.item_ids = self.item_ids.clone();
        out.item_titles = self.item_titles.clone();

        for weights in &self.item_weights {
            if sparse {
                let mut row = Vec::new();
                let mut indices = Vec::new();

                for (position, &t) in selected.iter().enumerate() {
                    if weights[t].abs() >= eps {
                        indices.push(position as u32);
                        row.push(weights[t]);
                    }
                }

                out.item_weights.push(row);
                out.topic_indices.push(indices);
            } else {
                out.item_weights.push(selected.iter().map(|&t| weights[t]).collect());
            }
        }

        Ok(out)
    }
}

/// Theta slice retained for one batch, keyed by batch id in the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedBatchTheta {
    pub topic_names: Vec<String>,
    pub item_ids: Vec<i32>,
    pub item_titles: Vec<String>,
    pub item_weights: Vec<Vec<f32>>,
}

impl CachedBatchTheta {
    pub fn weights_for(&self, item_id: i32) -> Option<&[f32]> {
        self.item_ids
            .iter()
            .position(|&id| id == item_id)
            .map(|position| self.item_weights[position].as_slice())
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Memory(Arc<CachedBatchTheta>),
    Disk(PathBuf),
}

/// Per-batch theta store behind `cache_theta` / `reuse_theta`. With a disk
/// cache path configured, slices overflow to one file per batch id instead
/// of accumulating in memory.
#[derive(Debug, Default)]
pub struct ThetaCache {
    disk_path: Option<PathBuf>,
    slots: AHashMap<String, Slot>,
}

impl ThetaCache {
    pub fn new(disk_path: Option<PathBuf>) -> Self {
        Self {
            disk_path,
            slots: AHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn batch_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn store(&mut self, batch_id: &str, theta: CachedBatchTheta) -> Result<()> {
        match &self.disk_path {
            None => {
                self.slots
                    .insert(batch_id.to_string(), Slot::Memory(Arc::new(theta)));
            }
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| Error::disk_write(dir, e))?;

                let path = dir.join(format!("{}.theta", batch_id));
                let file = File::create(&path).map_err(|e| Error::disk_write(&path, e))?;

                bincode::serialize_into(BufWriter::new(file), &theta)
                    .map_err(|e| Error::DiskWrite(format!("{}: {}", path.display(), e)))?;

                self.slots.insert(batch_id.to_string(), Slot::Disk(path));
            }
        }

        Ok(())
    }

    pub fn get(&self, batch_id: &str) -> Result<Option<Arc<CachedBatchTheta>>> {
        match self.slots.get(batch_id) {
            None => Ok(None),
            Some(Slot::Memory(theta)) => Ok(Some(theta.clone())),
            Some(Slot::Disk(path)) => {
                let file = File::open(path).map_err(|e| Error::disk_read(path, e))?;
                let theta: CachedBatchTheta = bincode::deserialize_from(BufReader::new(file))
                    .map_err(|e| Error::CorruptedMessage(format!("{}: {}", path.display(), e)))?;

                Ok(Some(Arc::new(theta)))
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.values() {
            if let Slot::Disk(path) = slot {
                // Cache files are disposable; removal failures only mean
                // a leftover file.
                let _ = std::fs::remove_file(path);
            }
        }

        self.slots.clear();
    }
}
