use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use ahash::AHashMap;

use crate::collections::TokenCollection;
use crate::token::{ClassId, Token, DEFAULT_TRANSACTION_TYPENAME};
use crate::{Error, Result};

/// Entries whose magnitude falls below this threshold are omitted from
/// sparse projections unless the caller overrides eps.
pub const DEFAULT_EPS: f32 = 1e-37;

/// Serialized form of a Φ-like matrix: one weight row per token, with an
/// optional sparse encoding listing the nonzero topic indices per token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicModel {
    pub name: String,
    pub topic_name: Vec<String>,
    pub token: Vec<String>,
    pub class_id: Vec<String>,
    pub transaction_typename: Vec<String>,
    pub token_weights: Vec<Vec<f32>>,
    pub topic_indices: Vec<Vec<u32>>,
}

impl TopicModel {
    pub fn is_sparse(&self) -> bool {
        !self.topic_indices.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.len() != self.token_weights.len() {
            return Err(Error::InvalidArgument(format!(
                "topic model {}: {} tokens but {} weight rows",
                self.name,
                self.token.len(),
                self.token_weights.len()
            )));
        }

        if !self.class_id.is_empty() && self.class_id.len() != self.token.len() {
            return Err(Error::InvalidArgument(format!(
                "topic model {}: class_id size {} != token size {}",
                self.name,
                self.class_id.len(),
                self.token.len()
            )));
        }

        if self.is_sparse() {
            if self.topic_indices.len() != self.token.len() {
                return Err(Error::InvalidArgument(format!(
                    "topic model {}: topic_indices size {} != token size {}",
                    self.name,
                    self.topic_indices.len(),
                    self.token.len()
                )));
            }

            for (row, indices) in self.token_weights.iter().zip(&self.topic_indices) {
                if row.len() != indices.len() {
                    return Err(Error::InvalidArgument(format!(
                        "topic model {}: sparse row sizes disagree",
                        self.name
                    )));
                }

                if indices.iter().any(|&t| t as usize >= self.topic_name.len()) {
                    return Err(Error::InvalidArgument(format!(
                        "topic model {}: topic index out of range",
                        self.name
                    )));
                }
            }
        } else {
            for row in &self.token_weights {
                if row.len() != self.topic_name.len() {
                    return Err(Error::InvalidArgument(format!(
                        "topic model {}: dense row size {} != topic count {}",
                        self.name,
                        row.len(),
                        self.topic_name.len()
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::disk_write(path, e))?;
        let writer = BufWriter::new(file);

        bincode::serialize_into(writer, self)
            .map_err(|e| Error::DiskWrite(format!("{}: {}", path.display(), e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::disk_read(path, e))?;
        let reader = BufReader::new(file);

        let model: TopicModel = bincode::deserialize_from(reader)
            .map_err(|e| Error::CorruptedMessage(format!("{}: {}", path.display(), e)))?;
        model.validate()?;

        Ok(model)
    }
}

/// Backing storage of a dense matrix. The attached variant shares the
/// buffer with an external owner; writes made through the shared handle
/// are visible to readers of the matrix.
#[derive(Debug, Clone)]
enum Storage {
    Owned(Vec<f32>),
    Attached(Arc<RwLock<Vec<f32>>>),
}

/// Read view over the raw `W × T` row-major buffer. Owned storage derefs
/// for free; attached storage holds a read guard for the view's lifetime.
pub enum Values<'a> {
    Owned(&'a [f32]),
    Attached(RwLockReadGuard<'a, Vec<f32>>),
}

impl Deref for Values<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            Values::Owned(slice) => slice,
            Values::Attached(guard) => guard,
        }
    }
}

/// Dense token × topic matrix, row-major. Published instances are treated
/// as immutable snapshots; training allocates a fresh one per pass.
#[derive(Debug, Clone)]
pub struct DensePhiMatrix {
    name: String,
    topic_names: Vec<String>,
    tokens: TokenCollection,
    storage: Storage,
}

impl DensePhiMatrix {
    pub fn new(name: &str, topic_names: Vec<String>, tokens: TokenCollection) -> Self {
        let size = tokens.len() * topic_names.len();

        Self {
            name: name.to_string(),
            topic_names,
            tokens,
            storage: Storage::Owned(vec![0.0; size]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn token_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn topic_size(&self) -> usize {
        self.topic_names.len()
    }

    pub fn topic_names(&self) -> &[String] {
        &self.topic_names
    }

    pub fn tokens(&self) -> &TokenCollection {
        &self.tokens
    }

    pub fn values(&self) -> Values<'_> {
        match &self.storage {
            Storage::Owned(values) => Values::Owned(values),
            Storage::Attached(shared) => Values::Attached(shared.read().unwrap()),
        }
    }

    pub fn get(&self, token_index: usize, topic_index: usize) -> f32 {
        self.values()[token_index * self.topic_names.len() + topic_index]
    }

    pub fn set(&mut self, token_index: usize, topic_index: usize, value: f32) {
        let offset = token_index * self.topic_names.len() + topic_index;

        match &mut self.storage {
            Storage::Owned(values) => values[offset] = value,
            Storage::Attached(shared) => shared.write().unwrap()[offset] = value,
        }
    }

    pub fn increase(&mut self, token_index: usize, topic_index: usize, delta: f32) {
        let offset = token_index * self.topic_names.len() + topic_index;

        match &mut self.storage {
            Storage::Owned(values) => values[offset] += delta,
            Storage::Attached(shared) => shared.write().unwrap()[offset] += delta,
        }
    }

    pub fn increase_row(&mut self, token_index: usize, deltas: &[f32]) {
        let topics = self.topic_names.len();
        let offset = token_index * topics;

        match &mut self.storage {
            Storage::Owned(values) => {
                crate::blas::saxpy(1.0, deltas, &mut values[offset..offset + topics]);
            }
            Storage::Attached(shared) => {
                let mut values = shared.write().unwrap();
                crate::blas::saxpy(1.0, deltas, &mut values[offset..offset + topics]);
            }
        }
    }

    pub fn clear(&mut self) {
        match &mut self.storage {
            Storage::Owned(values) => values.fill(0.0),
            Storage::Attached(shared) => shared.write().unwrap().fill(0.0),
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.storage, Storage::Attached(_))
    }

    /// Whether an external holder still shares the attached buffer.
    pub fn attachment_live(&self) -> bool {
        match &self.storage {
            Storage::Owned(_) => false,
            Storage::Attached(shared) => Arc::strong_count(shared) > 1,
        }
    }

    /// Moves the values into a shared buffer and returns the handle. The
    /// matrix keeps reading through the same buffer, so external writes
    /// are observed by later requests.
    pub fn attach(&mut self) -> Arc<RwLock<Vec<f32>>> {
        let values = match &self.storage {
            Storage::Owned(values) => values.clone(),
            Storage::Attached(shared) => return shared.clone(),
        };

        let shared = Arc::new(RwLock::new(values));
        self.storage = Storage::Attached(shared.clone());

        shared
    }

    /// Deep copy with owned storage, regardless of attachment.
    pub fn detach_clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            topic_names: self.topic_names.clone(),
            tokens: self.tokens.clone(),
            storage: Storage::Owned(self.values().to_vec()),
        }
    }

    /// Reorders and extends the topic axis. Columns named in both lists
    /// keep their values, new topics start at zero. The token axis is
    /// preserved untouched.
    pub fn reshape_topics(&self, new_topic_names: &[String]) -> Self {
        let old_positions: AHashMap<&str, usize> = self
            .topic_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let old_topics = self.topic_names.len();
        let new_topics = new_topic_names.len();
        let values = self.values();

        let mut out = vec![0.0; self.tokens.len() * new_topics];

        for (new_t, name) in new_topic_names.iter().enumerate() {
            if let Some(&old_t) = old_positions.get(name.as_str()) {
                for w in 0..self.tokens.len() {
                    out[w * new_topics + new_t] = values[w * old_topics + old_t];
                }
            }
        }

        Self {
            name: self.name.clone(),
            topic_names: new_topic_names.to_vec(),
            tokens: self.tokens.clone(),
            storage: Storage::Owned(out),
        }
    }
}

/// Sparse token × topic matrix: each row keeps only its entries above the
/// construction tolerance, sorted by topic index.
#[derive(Debug, Clone)]
pub struct SparsePhiMatrix {
    name: String,
    topic_names: Vec<String>,
    tokens: TokenCollection,
    rows: Vec<Vec<(u32, f32)>>,
}

impl SparsePhiMatrix {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn topic_size(&self) -> usize {
        self.topic_names.len()
    }

    pub fn topic_names(&self) -> &[String] {
        &self.topic_names
    }

    pub fn tokens(&self) -> &TokenCollection {
        &self.tokens
    }

    pub fn get(&self, token_index: usize, topic_index: usize) -> f32 {
        let row = &self.rows[token_index];

        match row.binary_search_by_key(&(topic_index as u32), |&(t, _)| t) {
            Ok(pos) => row[pos].1,
            Err(_) => 0.0,
        }
    }

    pub fn row(&self, token_index: usize) -> &[(u32, f32)] {
        &self.rows[token_index]
    }
}

/// A Φ-like matrix in either representation. Training always goes through
/// the dense form; the sparse form exists to hand compact projections to
/// callers.
#[derive(Debug, Clone)]
pub enum PhiMatrix {
    Dense(DensePhiMatrix),
    Sparse(SparsePhiMatrix),
}

impl PhiMatrix {
    pub fn name(&self) -> &str {
        match self {
            PhiMatrix::Dense(m) => m.name(),
            PhiMatrix::Sparse(m) => m.name(),
        }
    }

    pub fn token_size(&self) -> usize {
        match self {
            PhiMatrix::Dense(m) => m.token_size(),
            PhiMatrix::Sparse(m) => m.token_size(),
        }
    }

    pub fn topic_size(&self) -> usize {
        match self {
            PhiMatrix::Dense(m) => m.topic_size(),
            PhiMatrix::Sparse(m) => m.topic_size(),
        }
    }

    pub fn topic_names(&self) -> &[String] {
        match self {
            PhiMatrix::Dense(m) => m.topic_names(),
            PhiMatrix::Sparse(m) => m.topic_names(),
        }
    }

    pub fn tokens(&self) -> &TokenCollection {
        match self {
            PhiMatrix::Dense(m) => m.tokens(),
            PhiMatrix::Sparse(m) => m.tokens(),
        }
    }

    pub fn get(&self, token_index: usize, topic_index: usize) -> f32 {
        match self {
            PhiMatrix::Dense(m) => m.get(token_index, topic_index),
            PhiMatrix::Sparse(m) => m.get(token_index, topic_index),
        }
    }

    pub fn row_nonzero(&self, token_index: usize, eps: f32) -> Vec<(usize, f32)> {
        match self {
            PhiMatrix::Dense(m) => {
                let topics = m.topic_size();
                let values = m.values();
                let row = &values[token_index * topics..(token_index + 1) * topics];

                row.iter()
                    .enumerate()
                    .filter(|(_, v)| v.abs() >= eps)
                    .map(|(t, &v)| (t, v))
                    .collect()
            }
            PhiMatrix::Sparse(m) => m
                .row(token_index)
                .iter()
                .filter(|(_, v)| v.abs() >= eps)
                .map(|&(t, v)| (t as usize, v))
                .collect(),
        }
    }

    pub fn as_dense(&self) -> Option<&DensePhiMatrix> {
        match self {
            PhiMatrix::Dense(m) => Some(m),
            PhiMatrix::Sparse(_) => None,
        }
    }

    pub fn clone_as_dense(&self) -> DensePhiMatrix {
        match self {
            PhiMatrix::Dense(m) => m.detach_clone(),
            PhiMatrix::Sparse(m) => {
                let mut dense =
                    DensePhiMatrix::new(m.name(), m.topic_names.clone(), m.tokens.clone());

                for (w, row) in m.rows.iter().enumerate() {
                    for &(t, v) in row {
                        dense.set(w, t as usize, v);
                    }
                }

                dense
            }
        }
    }

    pub fn clone_as_sparse(&self, tol: f32) -> SparsePhiMatrix {
        match self {
            PhiMatrix::Dense(m) => {
                let rows = (0..m.token_size())
                    .map(|w| {
                        self.row_nonzero(w, tol)
                            .into_iter()
                            .map(|(t, v)| (t as u32, v))
                            .collect()
                    })
                    .collect();

                SparsePhiMatrix {
                    name: m.name().to_string(),
                    topic_names: m.topic_names().to_vec(),
                    tokens: m.tokens().clone(),
                    rows,
                }
            }
            PhiMatrix::Sparse(m) => m.clone(),
        }
    }
}

impl From<DensePhiMatrix> for PhiMatrix {
    fn from(matrix: DensePhiMatrix) -> Self {
        PhiMatrix::Dense(matrix)
    }
}

impl From<SparsePhiMatrix> for PhiMatrix {
    fn from(matrix: SparsePhiMatrix) -> Self {
        PhiMatrix::Sparse(matrix)
    }
}

/// Builds a dense matrix from its serialized form, adopting the token and
/// topic axes of the message.
pub fn from_topic_model(model: &TopicModel) -> Result<DensePhiMatrix> {
    model.validate()?;

    let mut tokens = TokenCollection::with_capacity(model.token.len());

    for (i, keyword) in model.token.iter().enumerate() {
        let class_id = model
            .class_id
            .get(i)
            .map(|c| c.as_str())
            .unwrap_or(crate::token::DEFAULT_CLASS);
        let typename = model
            .transaction_typename
            .get(i)
            .map(|t| t.as_str())
            .unwrap_or(DEFAULT_TRANSACTION_TYPENAME);

        tokens.insert(Token::with_typename(class_id, keyword, typename))?;
    }

    let mut matrix = DensePhiMatrix::new(&model.name, model.topic_name.clone(), tokens);

    for (w, weights) in model.token_weights.iter().enumerate() {
        if model.is_sparse() {
            for (&t, &v) in model.topic_indices[w].iter().zip(weights) {
                matrix.set(w, t as usize, v);
            }
        } else {
            for (t, &v) in weights.iter().enumerate() {
                matrix.set(w, t, v);
            }
        }
    }

    Ok(matrix)
}

/// Per-modality normalization group: all rows sharing a class id form one
/// normalizer per topic column.
fn class_groups(tokens: &TokenCollection) -> (Vec<ClassId>, Vec<usize>) {
    let mut classes: Vec<ClassId> = Vec::new();
    let mut positions: AHashMap<ClassId, usize> = AHashMap::new();
    let mut row_class = Vec::with_capacity(tokens.len());

    for token in tokens.iter() {
        let index = match positions.get(&token.class_id) {
            Some(&index) => index,
            None => {
                classes.push(token.class_id.clone());
                positions.insert(token.class_id.clone(), classes.len() - 1);
                classes.len() - 1
            }
        };

        row_class.push(index);
    }

    (classes, row_class)
}

/// Turns an accumulated N (+ optional R) into a column-stochastic Φ: for
/// every modality and topic, `p = max(n + r, 0) / s` with `s` the positive
/// mass of that modality's column. Columns with no mass stay zero.
pub fn normalize(
    target_name: &str,
    n: &DensePhiMatrix,
    r: Option<&DensePhiMatrix>,
) -> Result<DensePhiMatrix> {
    let topics = n.topic_size();
    let tokens = n.token_size();

    if let Some(r) = r {
        if r.token_size() != tokens || r.topic_size() != topics {
            return Err(Error::InvalidOperation(format!(
                "normalize: r matrix shape ({}, {}) does not match n ({}, {})",
                r.token_size(),
                r.topic_size(),
                tokens,
                topics
            )));
        }
    }

    let (classes, row_class) = class_groups(n.tokens());

    let n_values = n.values();
    let r_values = r.map(|r| r.values());

    // First pass: clamp n + r at zero and accumulate per-(class, topic)
    // normalizers.
    let mut clamped = vec![0.0f32; tokens * topics];
    let mut sums = vec![0.0f32; classes.len() * topics];

    for w in 0..tokens {
        let offset = w * topics;
        let class_offset = row_class[w] * topics;

        for t in 0..topics {
            let mut value = n_values[offset + t];
            if let Some(r_values) = &r_values {
                value += r_values[offset + t];
            }

            let value = value.max(0.0);
            clamped[offset + t] = value;
            sums[class_offset + t] += value;
        }
    }

    for w in 0..tokens {
        let offset = w * topics;
        let class_offset = row_class[w] * topics;

        for t in 0..topics {
            let sum = sums[class_offset + t];
            clamped[offset + t] = if sum > 0.0 { clamped[offset + t] / sum } else { 0.0 };
        }
    }

    let mut out = DensePhiMatrix::new(target_name, n.topic_names().to_vec(), n.tokens().clone());
    out.storage = Storage::Owned(clamped);

    Ok(out)
}
