use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ahash::{AHashMap, AHashSet};

use crate::batch::Batch;
use crate::collections::{TokenCollection, TopEntries};
use crate::token::{Token, DEFAULT_TRANSACTION_TYPENAME};
use crate::{Error, Result};

/// Co-occurrence statistics attached to a pair of dictionary tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoocEntry {
    pub tf: f32,
    pub df: f32,
    pub value: f32,
}

/// Serialized form of a dictionary: parallel arrays over tokens, plus
/// optional co-occurrence triples indexing those arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionaryData {
    pub name: String,
    pub token: Vec<String>,
    pub class_id: Vec<String>,
    pub transaction_typename: Vec<String>,
    pub token_tf: Vec<f32>,
    pub token_df: Vec<f32>,
    pub token_value: Vec<f32>,
    pub cooc_first_index: Vec<u32>,
    pub cooc_second_index: Vec<u32>,
    pub cooc_value: Vec<f32>,
    pub cooc_tf: Vec<f32>,
    pub cooc_df: Vec<f32>,
    pub num_items: u64,
}

/// Token statistics used by initialization, filtering and several scores:
/// `tf` is the summed weight over the collection, `df` the number of items
/// containing the token, `value` a caller- or gather-provided weight.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    name: String,
    tokens: TokenCollection,
    token_tf: Vec<f32>,
    token_df: Vec<f32>,
    token_value: Vec<f32>,
    cooc: AHashMap<(u32, u32), CoocEntry>,
    num_items: u64,
}

/// Bounds for [`Dictionary::filter`]. Absolute and fractional df bounds
/// compose; a token must satisfy all of the configured ones.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub min_df: Option<f32>,
    pub max_df: Option<f32>,
    pub min_df_rate: Option<f32>,
    pub max_df_rate: Option<f32>,
    pub min_tf: Option<f32>,
    pub max_tf: Option<f32>,
    pub max_dictionary_size: Option<usize>,
}

impl Dictionary {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn tokens(&self) -> &TokenCollection {
        &self.tokens
    }

    pub fn index_of(&self, token: &Token) -> Option<usize> {
        self.tokens.index_of(token)
    }

    pub fn token_tf(&self, index: usize) -> f32 {
        self.token_tf[index]
    }

    pub fn token_df(&self, index: usize) -> f32 {
        self.token_df[index]
    }

    pub fn token_value(&self, index: usize) -> f32 {
        self.token_value[index]
    }

    pub fn insert(&mut self, token: Token, tf: f32, df: f32, value: f32) -> Result<usize> {
        let index = self.tokens.insert(token)?;

        self.token_tf.push(tf);
        self.token_df.push(df);
        self.token_value.push(value);

        Ok(index)
    }

    /// Symmetric co-occurrence lookup.
    pub fn cooc(&self, first: usize, second: usize) -> Option<&CoocEntry> {
        self.cooc
            .get(&(first as u32, second as u32))
            .or_else(|| self.cooc.get(&(second as u32, first as u32)))
    }

    pub fn set_cooc(&mut self, first: usize, second: usize, entry: CoocEntry) {
        self.cooc.insert((first as u32, second as u32), entry);
    }

    pub fn cooc_len(&self) -> usize {
        self.cooc.len()
    }

    pub fn cooc_iter(&self) -> impl Iterator<Item = (usize, usize, &CoocEntry)> {
        self.cooc
            .iter()
            .map(|(&(first, second), entry)| (first as usize, second as usize, entry))
    }

    /// Builds a dictionary by scanning batches once: `df` counts the items
    /// containing a token, `tf` sums its weight; `value` ends up being the
    /// token's relative frequency within its modality.
    pub fn gather(name: &str, batches: &[&Batch]) -> Result<Self> {
        let mut dictionary = Dictionary::new(name);

        for batch in batches {
            batch.validate()?;

            for item in &batch.item {
                if item.validate(batch.token.len(), batch.transaction_typename.len().max(1))
                    .is_err()
                {
                    continue;
                }

                // A token's dictionary identity carries the typename of
                // the transaction it occurred in, matching how the
                // processor resolves Φ rows.
                let mut seen: AHashSet<(u32, usize)> = AHashSet::new();

                for (range, typename_id) in item.transactions() {
                    for i in range {
                        let token_id = item.token_id[i];
                        let weight = item.token_weight[i];

                        let token = Token::with_typename(
                            batch.class_id_at(token_id as usize),
                            &batch.token[token_id as usize],
                            batch.typename_at(typename_id),
                        );

                        let index = match dictionary.tokens.index_of(&token) {
                            Some(index) => index,
                            None => dictionary.insert(token, 0.0, 0.0, 0.0)?,
                        };

                        dictionary.token_tf[index] += weight;

                        if seen.insert((token_id, typename_id)) {
                            dictionary.token_df[index] += 1.0;
                        }
                    }
                }

                dictionary.num_items += 1;
            }
        }

        // token_value defaults to the in-modality relative frequency.
        let mut class_totals: AHashMap<&str, f32> = AHashMap::new();
        for (index, token) in dictionary.tokens.iter().enumerate() {
            *class_totals.entry(token.class_id.as_str()).or_default() +=
                dictionary.token_tf[index];
        }

        let values: Vec<f32> = dictionary
            .tokens
            .iter()
            .enumerate()
            .map(|(index, token)| {
                let total = class_totals[token.class_id.as_str()];
                if total > 0.0 {
                    dictionary.token_tf[index] / total
                } else {
                    0.0
                }
            })
            .collect();
        dictionary.token_value = values;

        tracing::debug!(
            name,
            tokens = dictionary.len(),
            items = dictionary.num_items,
            "gathered dictionary"
        );

        Ok(dictionary)
    }

    /// Retains tokens passing the df/tf bounds, optionally capping the
    /// result to the top-k by value. Co-occurrence pairs are remapped to
    /// the surviving ids; pairs with a dropped member disappear.
    pub fn filter(&self, name: &str, spec: &FilterSpec) -> Result<Self> {
        let items = self.num_items as f32;

        let mut keep: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let tf = self.token_tf[i];
                let df = self.token_df[i];

                spec.min_df.is_none_or(|bound| df >= bound)
                    && spec.max_df.is_none_or(|bound| df <= bound)
                    && spec.min_df_rate.is_none_or(|bound| items > 0.0 && df / items >= bound)
                    && spec.max_df_rate.is_none_or(|bound| items > 0.0 && df / items <= bound)
                    && spec.min_tf.is_none_or(|bound| tf >= bound)
                    && spec.max_tf.is_none_or(|bound| tf <= bound)
            })
            .collect();

        if let Some(cap) = spec.max_dictionary_size {
            if keep.len() > cap {
                let mut top: TopEntries<usize> = TopEntries::with_capacity(cap);
                for &i in &keep {
                    top.push(self.token_value[i], i);
                }

                keep = top.into_sorted_vec().into_iter().map(|(_, i)| i).collect();
                // Preserve the original token order in the result.
                keep.sort_unstable();
            }
        }

        let mut filtered = Dictionary::new(name);
        filtered.num_items = self.num_items;

        let mut remap: AHashMap<u32, u32> = AHashMap::with_capacity(keep.len());

        for &old_index in &keep {
            let token = self.tokens.get(old_index).unwrap().clone();
            let new_index = filtered.insert(
                token,
                self.token_tf[old_index],
                self.token_df[old_index],
                self.token_value[old_index],
            )?;
            remap.insert(old_index as u32, new_index as u32);
        }

        for (&(first, second), entry) in &self.cooc {
            if let (Some(&first), Some(&second)) = (remap.get(&first), remap.get(&second)) {
                filtered.cooc.insert((first, second), *entry);
            }
        }

        tracing::debug!(
            from = self.name.as_str(),
            name,
            kept = filtered.len(),
            dropped = self.len() - filtered.len(),
            "filtered dictionary"
        );

        Ok(filtered)
    }

    pub fn from_data(data: &DictionaryData) -> Result<Self> {
        let size = data.token.len();

        for (field, len) in [
            ("class_id", data.class_id.len()),
            ("token_tf", data.token_tf.len()),
            ("token_df", data.token_df.len()),
            ("token_value", data.token_value.len()),
        ] {
            if len != 0 && len != size {
                return Err(Error::InvalidArgument(format!(
                    "dictionary {}: {} size {} != token size {}",
                    data.name, field, len, size
                )));
            }
        }

        if data.cooc_first_index.len() != data.cooc_second_index.len()
            || data.cooc_first_index.len() != data.cooc_value.len()
        {
            return Err(Error::InvalidArgument(format!(
                "dictionary {}: co-occurrence arrays disagree in size",
                data.name
            )));
        }

        let mut dictionary = Dictionary::new(&data.name);
        dictionary.num_items = data.num_items;

        for i in 0..size {
            let class_id = data
                .class_id
                .get(i)
                .map(|c| c.as_str())
                .unwrap_or(crate::token::DEFAULT_CLASS);
            let typename = data
                .transaction_typename
                .get(i)
                .map(|t| t.as_str())
                .unwrap_or(DEFAULT_TRANSACTION_TYPENAME);

            dictionary.insert(
                Token::with_typename(class_id, &data.token[i], typename),
                data.token_tf.get(i).copied().unwrap_or(0.0),
                data.token_df.get(i).copied().unwrap_or(0.0),
                data.token_value.get(i).copied().unwrap_or(0.0),
            )?;
        }

        for i in 0..data.cooc_first_index.len() {
            let first = data.cooc_first_index[i];
            let second = data.cooc_second_index[i];

            if first as usize >= size || second as usize >= size {
                return Err(Error::InvalidArgument(format!(
                    "dictionary {}: co-occurrence pair ({}, {}) out of range",
                    data.name, first, second
                )));
            }

            dictionary.cooc.insert(
                (first, second),
                CoocEntry {
                    tf: data.cooc_tf.get(i).copied().unwrap_or(0.0),
                    df: data.cooc_df.get(i).copied().unwrap_or(0.0),
                    value: data.cooc_value[i],
                },
            );
        }

        Ok(dictionary)
    }

    pub fn to_data(&self) -> DictionaryData {
        let mut data = DictionaryData {
            name: self.name.clone(),
            num_items: self.num_items,
            token_tf: self.token_tf.clone(),
            token_df: self.token_df.clone(),
            token_value: self.token_value.clone(),
            ..DictionaryData::default()
        };

        for token in self.tokens.iter() {
            data.token.push(token.keyword.clone());
            data.class_id.push(token.class_id.clone());
            data.transaction_typename
                .push(token.transaction_typename.clone());
        }

        let mut pairs: Vec<_> = self.cooc.iter().collect();
        pairs.sort_by_key(|(&(first, second), _)| (first, second));

        for (&(first, second), entry) in pairs {
            data.cooc_first_index.push(first);
            data.cooc_second_index.push(second);
            data.cooc_value.push(entry.value);
            data.cooc_tf.push(entry.tf);
            data.cooc_df.push(entry.df);
        }

        data
    }

    pub fn export(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::disk_write(path, e))?;
        let writer = BufWriter::new(file);

        bincode::serialize_into(writer, &self.to_data())
            .map_err(|e| Error::DiskWrite(format!("{}: {}", path.display(), e)))
    }

    pub fn import(name: &str, path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::disk_read(path, e))?;
        let reader = BufReader::new(file);

        let mut data: DictionaryData = bincode::deserialize_from(reader)
            .map_err(|e| Error::CorruptedMessage(format!("{}: {}", path.display(), e)))?;
        data.name = name.to_string();

        Self::from_data(&data)
    }
}
