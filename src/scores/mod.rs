mod batch;
mod model;

pub use batch::calculate_batch_partials;

use std::collections::hash_map::Entry;
use std::sync::Mutex;

use ahash::AHashMap;

use crate::phi::PhiMatrix;
use crate::token::ClassId;
use crate::{Error, Result};

/// One configured score instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub name: String,
    pub spec: ScoreSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScoreSpec {
    Perplexity {
        /// Modalities entering the blended value; empty means every
        /// modality the model trains on.
        class_ids: Vec<ClassId>,
        /// Substitution for zero-probability terms.
        model_type: PerplexityModelType,
        /// Collection-model substitution reads token values from here.
        dictionary_name: Option<String>,
    },
    SparsityPhi {
        class_id: Option<ClassId>,
        topic_names: Vec<String>,
        eps: Option<f32>,
    },
    SparsityTheta {
        topic_names: Vec<String>,
        eps: Option<f32>,
    },
    TopTokens {
        num_tokens: usize,
        class_id: Option<ClassId>,
        dictionary_name: Option<String>,
    },
    TopicKernel {
        class_id: Option<ClassId>,
        probability_mass_threshold: f32,
        dictionary_name: Option<String>,
    },
    ThetaSnippet {
        num_items: usize,
    },
    ItemsProcessed,
    ClassPrecision {
        class_id: ClassId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerplexityModelType {
    Document,
    Collection,
}

impl ScoreSpec {
    /// Whether the score accumulates per-batch contributions (as opposed
    /// to being computed from Φ alone at finalization).
    pub fn is_cumulative(&self) -> bool {
        matches!(
            self,
            ScoreSpec::Perplexity { .. }
                | ScoreSpec::SparsityTheta { .. }
                | ScoreSpec::ThetaSnippet { .. }
                | ScoreSpec::ItemsProcessed
                | ScoreSpec::ClassPrecision { .. }
        )
    }
}

/// Per-modality perplexity decomposition entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerplexityClassInfo {
    pub class_id: ClassId,
    pub raw: f64,
    pub normalizer: f64,
    pub zero_words: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerplexityScore {
    pub value: f64,
    pub raw: f64,
    pub normalizer: f64,
    pub zero_words: u64,
    pub class_info: Vec<PerplexityClassInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityScore {
    pub value: f64,
    pub zero_entries: u64,
    pub total_entries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopTokensScore {
    pub num_entries: usize,
    pub topic_name: Vec<String>,
    pub token: Vec<String>,
    pub weight: Vec<f32>,
    pub topic_coherence: Vec<f32>,
    pub average_coherence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicKernelScore {
    pub kernel_size: Vec<f32>,
    pub purity: Vec<f32>,
    pub contrast: Vec<f32>,
    pub coherence: Vec<f32>,
    pub average_kernel_size: f32,
    pub average_purity: f32,
    pub average_contrast: f32,
    pub average_coherence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThetaSnippetScore {
    pub item_id: Vec<i32>,
    pub values: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemsProcessedScore {
    pub num_items: u64,
    pub num_batches: u64,
    pub token_weight: f64,
    pub token_weight_in_effect: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassPrecisionScore {
    pub value: f64,
    pub correct: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoreValue {
    Perplexity(PerplexityScore),
    SparsityPhi(SparsityScore),
    SparsityTheta(SparsityScore),
    TopTokens(TopTokensScore),
    TopicKernel(TopicKernelScore),
    ThetaSnippet(ThetaSnippetScore),
    ItemsProcessed(ItemsProcessedScore),
    ClassPrecision(ClassPrecisionScore),
}

/// Associative per-batch contribution to a cumulative score. Combining is
/// order-insensitive for every kind except the snippet, which keeps the
/// first items it sees.
#[derive(Debug, Clone)]
pub enum ScorePartial {
    Perplexity {
        raw: f64,
        normalizer: f64,
        zero_words: u64,
        class_info: AHashMap<ClassId, (f64, f64, u64)>,
    },
    SparsityTheta {
        zero_entries: u64,
        total_entries: u64,
    },
    ThetaSnippet {
        capacity: usize,
        item_id: Vec<i32>,
        values: Vec<Vec<f32>>,
    },
    ItemsProcessed {
        num_items: u64,
        num_batches: u64,
        token_weight: f64,
        token_weight_in_effect: f64,
    },
    ClassPrecision {
        correct: u64,
        total: u64,
    },
}

impl ScorePartial {
    fn append(&mut self, other: &ScorePartial) {
        match (self, other) {
            (
                ScorePartial::Perplexity {
                    raw,
                    normalizer,
                    zero_words,
                    class_info,
                },
                ScorePartial::Perplexity {
                    raw: other_raw,
                    normalizer: other_normalizer,
                    zero_words: other_zero,
                    class_info: other_info,
                },
            ) => {
                *raw += other_raw;
                *normalizer += other_normalizer;
                *zero_words += other_zero;

                for (class_id, (r, n, z)) in other_info {
                    let entry = class_info.entry(class_id.clone()).or_default();
                    entry.0 += r;
                    entry.1 += n;
                    entry.2 += z;
                }
            }
            (
                ScorePartial::SparsityTheta {
                    zero_entries,
                    total_entries,
                },
                ScorePartial::SparsityTheta {
                    zero_entries: other_zero,
                    total_entries: other_total,
                },
            ) => {
                *zero_entries += other_zero;
                *total_entries += other_total;
            }
            (
                ScorePartial::ThetaSnippet {
                    capacity,
                    item_id,
                    values,
                },
                ScorePartial::ThetaSnippet {
                    item_id: other_ids,
                    values: other_values,
                    ..
                },
            ) => {
                for (id, row) in other_ids.iter().zip(other_values) {
                    if item_id.len() >= *capacity {
                        break;
                    }

                    item_id.push(*id);
                    values.push(row.clone());
                }
            }
            (
                ScorePartial::ItemsProcessed {
                    num_items,
                    num_batches,
                    token_weight,
                    token_weight_in_effect,
                },
                ScorePartial::ItemsProcessed {
                    num_items: other_items,
                    num_batches: other_batches,
                    token_weight: other_weight,
                    token_weight_in_effect: other_effective,
                },
            ) => {
                *num_items += other_items;
                *num_batches += other_batches;
                *token_weight += other_weight;
                *token_weight_in_effect += other_effective;
            }
            (
                ScorePartial::ClassPrecision { correct, total },
                ScorePartial::ClassPrecision {
                    correct: other_correct,
                    total: other_total,
                },
            ) => {
                *correct += other_correct;
                *total += other_total;
            }
            _ => debug_assert!(false, "mismatched score partial kinds"),
        }
    }

    fn finalize(&self) -> ScoreValue {
        match self {
            ScorePartial::Perplexity {
                raw,
                normalizer,
                zero_words,
                class_info,
            } => {
                let value = if *normalizer > 0.0 {
                    (-raw / normalizer).exp()
                } else {
                    0.0
                };

                let mut info: Vec<PerplexityClassInfo> = class_info
                    .iter()
                    .map(|(class_id, (raw, normalizer, zero_words))| PerplexityClassInfo {
                        class_id: class_id.clone(),
                        raw: *raw,
                        normalizer: *normalizer,
                        zero_words: *zero_words,
                    })
                    .collect();
                info.sort_by(|a, b| a.class_id.cmp(&b.class_id));

                // With a modality decomposition, the blended value is
                // reported through class_info while raw/normalizer stay
                // per-class.
                let (raw, normalizer) = if info.is_empty() {
                    (*raw, *normalizer)
                } else {
                    (0.0, 0.0)
                };

                ScoreValue::Perplexity(PerplexityScore {
                    value,
                    raw,
                    normalizer,
                    zero_words: *zero_words,
                    class_info: info,
                })
            }
            ScorePartial::SparsityTheta {
                zero_entries,
                total_entries,
            } => ScoreValue::SparsityTheta(SparsityScore {
                value: if *total_entries > 0 {
                    *zero_entries as f64 / *total_entries as f64
                } else {
                    0.0
                },
                zero_entries: *zero_entries,
                total_entries: *total_entries,
            }),
            ScorePartial::ThetaSnippet {
                item_id, values, ..
            } => ScoreValue::ThetaSnippet(ThetaSnippetScore {
                item_id: item_id.clone(),
                values: values.clone(),
            }),
            ScorePartial::ItemsProcessed {
                num_items,
                num_batches,
                token_weight,
                token_weight_in_effect,
            } => ScoreValue::ItemsProcessed(ItemsProcessedScore {
                num_items: *num_items,
                num_batches: *num_batches,
                token_weight: *token_weight,
                token_weight_in_effect: *token_weight_in_effect,
            }),
            ScorePartial::ClassPrecision { correct, total } => {
                ScoreValue::ClassPrecision(ClassPrecisionScore {
                    value: if *total > 0 {
                        *correct as f64 / *total as f64
                    } else {
                        0.0
                    },
                    correct: *correct,
                    total: *total,
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct ScoreState {
    cumulative: AHashMap<String, ScorePartial>,
    last: AHashMap<String, ScoreValue>,
    array: AHashMap<String, Vec<ScoreValue>>,
}

/// Accumulates per-batch score contributions during a pass and
/// materializes finalized values at each checkpoint without re-reading
/// data. Finalized values land both in a last-value cache and in the
/// per-score array cache, which preserves checkpoint order.
#[derive(Debug)]
pub struct ScoreManager {
    configs: Vec<ScoreConfig>,
    state: Mutex<ScoreState>,
}

impl ScoreManager {
    pub fn new(configs: Vec<ScoreConfig>) -> Result<Self> {
        let mut seen = ahash::AHashSet::new();

        for config in &configs {
            if !seen.insert(config.name.clone()) {
                return Err(Error::AlreadyExists(format!("score {}", config.name)));
            }
        }

        Ok(Self {
            configs,
            state: Mutex::new(ScoreState::default()),
        })
    }

    pub fn configs(&self) -> &[ScoreConfig] {
        &self.configs
    }

    pub fn config(&self, name: &str) -> Result<&ScoreConfig> {
        self.configs
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NotFound(format!("score {}", name)))
    }

    /// Folds one batch's partials into the running pass.
    pub fn append(&self, partials: Vec<(String, ScorePartial)>) {
        let mut state = self.state.lock().unwrap();

        for (name, partial) in partials {
            match state.cumulative.entry(name) {
                Entry::Occupied(mut cumulative) => cumulative.get_mut().append(&partial),
                Entry::Vacant(slot) => {
                    slot.insert(partial);
                }
            }
        }
    }

    /// Ends a pass (or an online checkpoint): finalizes every configured
    /// score against the just-committed Φ, records the values, and resets
    /// the cumulative state for the next pass.
    pub fn finalize_pass(&self, phi: &PhiMatrix, dictionaries: crate::regularizers::DictionaryResolver) {
        let mut state = self.state.lock().unwrap();

        for config in &self.configs {
            let value = if config.spec.is_cumulative() {
                state.cumulative.get(&config.name).map(|c| c.finalize())
            } else {
                Some(model::calculate(&config.spec, phi, dictionaries))
            };

            let Some(value) = value else { continue };

            state.last.insert(config.name.clone(), value.clone());
            state.array.entry(config.name.clone()).or_default().push(value);
        }

        state.cumulative.clear();
    }

    pub fn get(&self, name: &str) -> Result<ScoreValue> {
        self.config(name)?;

        self.state
            .lock()
            .unwrap()
            .last
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("score {} has no value yet", name)))
    }

    pub fn get_array(&self, name: &str) -> Result<Vec<ScoreValue>> {
        self.config(name)?;

        Ok(self
            .state
            .lock()
            .unwrap()
            .array
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    /// Drops cumulative and last values, keeping the arrays.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock().unwrap();
        state.cumulative.clear();
        state.last.clear();
    }

    pub fn clear_array_cache(&self) {
        self.state.lock().unwrap().array.clear();
    }

    /// Deep copy for master duplication.
    pub fn duplicate(&self) -> Self {
        let state = self.state.lock().unwrap();

        Self {
            configs: self.configs.clone(),
            state: Mutex::new(ScoreState {
                cumulative: state.cumulative.clone(),
                last: state.last.clone(),
                array: state.array.clone(),
            }),
        }
    }
}
