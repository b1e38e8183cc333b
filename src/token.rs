use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

pub type ClassId = String;
pub type TransactionTypeName = String;

pub const DEFAULT_CLASS: &str = "@default_class";
pub const DEFAULT_TRANSACTION_TYPENAME: &str = "@default_transaction";

// Modality of the pseudo-tokens exposing items through the ptd slot.
pub const DOCUMENTS_CLASS: &str = "@documents_class";

// Separator used by the joined string form of a transaction type.
pub const TRANSACTION_SEPARATOR: char = '^';

fn combine_str(mut hash: u64, value: &str) -> u64 {
    for byte in value.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    hash.wrapping_mul(31).wrapping_add(0xff)
}

/// A token is the triple of its modality (class id), keyword and the
/// typename of the transaction it belongs to. The triple is what gets
/// interned: two tokens with the same keyword but different modalities are
/// distinct rows of Φ.
///
/// The hash is computed once at construction because tokens are used as
/// keys of very hot hash maps during training.
#[derive(Debug, Clone)]
pub struct Token {
    pub class_id: ClassId,
    pub keyword: String,
    pub transaction_typename: TransactionTypeName,
    hash: u64,
}

impl Token {
    pub fn new(class_id: &str, keyword: &str) -> Self {
        Self::with_typename(class_id, keyword, DEFAULT_TRANSACTION_TYPENAME)
    }

    pub fn with_typename(class_id: &str, keyword: &str, transaction_typename: &str) -> Self {
        let mut hash: u64 = 0;
        hash = combine_str(hash, keyword);
        hash = combine_str(hash, class_id);
        hash = combine_str(hash, transaction_typename);

        Self {
            class_id: class_id.to_string(),
            keyword: keyword.to_string(),
            transaction_typename: transaction_typename.to_string(),
            hash,
        }
    }

    /// Deterministic per-token seed used by model initialization. Stable
    /// across runs and platforms, so that a fixed global seed yields a
    /// reproducible Φ.
    pub fn init_seed(&self, seed: u32) -> u64 {
        let mut h: u64 = 1125899906842597;

        if self.class_id != DEFAULT_CLASS {
            for byte in self.class_id.bytes() {
                h = h.wrapping_mul(31).wrapping_add(byte as u64);
            }
        }

        h = h.wrapping_mul(31).wrapping_add(255);

        for byte in self.keyword.bytes() {
            h = h.wrapping_mul(31).wrapping_add(byte as u64);
        }

        if seed > 0 {
            h = h.wrapping_mul(31).wrapping_add(seed as u64);
        }

        h
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.keyword == other.keyword
            && self.class_id == other.class_id
            && self.transaction_typename == other.transaction_typename
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keyword
            .cmp(&other.keyword)
            .then_with(|| self.class_id.cmp(&other.class_id))
            .then_with(|| self.transaction_typename.cmp(&other.transaction_typename))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.class_id, self.keyword)
    }
}

/// An unordered set of class ids materialized both as a separator-joined
/// string and as a decomposed list. The empty string stands for "all class
/// ids of the model".
#[derive(Debug, Clone)]
pub struct TransactionType {
    data: String,
    class_ids: Vec<ClassId>,
}

impl TransactionType {
    pub fn parse(data: &str) -> Self {
        let class_ids = if data.is_empty() {
            Vec::new()
        } else {
            data.split(TRANSACTION_SEPARATOR)
                .map(|c| c.to_string())
                .collect()
        };

        Self {
            data: data.to_string(),
            class_ids,
        }
    }

    pub fn from_class_ids(class_ids: &[ClassId]) -> Self {
        Self {
            data: class_ids.join(&TRANSACTION_SEPARATOR.to_string()),
            class_ids: class_ids.to_vec(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    pub fn class_ids(&self) -> &[ClassId] {
        &self.class_ids
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.class_ids.is_empty() || self.class_ids.iter().any(|c| c == class_id)
    }
}

impl PartialEq for TransactionType {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for TransactionType {}

impl Hash for TransactionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}
