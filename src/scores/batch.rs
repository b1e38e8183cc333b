use ahash::AHashMap;

use crate::batch::Batch;
use crate::blas;
use crate::phi::{DensePhiMatrix, DEFAULT_EPS};
use crate::processor::{self, BatchContribution, ProcessorSettings};
use crate::regularizers::DictionaryResolver;
use crate::Result;

use super::{PerplexityModelType, ScoreConfig, ScorePartial, ScoreSpec};

/// Computes the per-batch contribution of every cumulative score, given
/// the batch's freshly computed theta slice. Pure over its inputs, so the
/// master may call it from any worker.
pub fn calculate_batch_partials(
    configs: &[ScoreConfig],
    batch: &Batch,
    contribution: &BatchContribution,
    phi: &DensePhiMatrix,
    settings: &ProcessorSettings,
    dictionaries: DictionaryResolver,
) -> Result<Vec<(String, ScorePartial)>> {
    let cumulative: Vec<_> = configs.iter().filter(|c| c.spec.is_cumulative()).collect();

    if cumulative.is_empty() {
        return Ok(Vec::new());
    }

    let resolved = processor::resolve_batch(batch, phi, settings);
    let mut partials = Vec::with_capacity(cumulative.len());

    for config in cumulative {
        let partial = match &config.spec {
            ScoreSpec::Perplexity {
                class_ids,
                model_type,
                dictionary_name,
            } => perplexity_partial(
                batch,
                contribution,
                phi,
                settings,
                &resolved,
                class_ids,
                *model_type,
                dictionary_name.as_deref(),
                dictionaries,
            )?,
            ScoreSpec::SparsityTheta { topic_names, eps } => {
                sparsity_theta_partial(contribution, settings, topic_names, eps.unwrap_or(DEFAULT_EPS))
            }
            ScoreSpec::ThetaSnippet { num_items } => ScorePartial::ThetaSnippet {
                capacity: *num_items,
                item_id: contribution
                    .theta
                    .item_ids
                    .iter()
                    .take(*num_items)
                    .copied()
                    .collect(),
                values: contribution
                    .theta
                    .item_weights
                    .iter()
                    .take(*num_items)
                    .cloned()
                    .collect(),
            },
            ScoreSpec::ItemsProcessed => ScorePartial::ItemsProcessed {
                num_items: contribution.items_processed,
                num_batches: 1,
                token_weight: contribution.token_weight_raw,
                token_weight_in_effect: contribution.token_weight_scaled,
            },
            ScoreSpec::ClassPrecision { class_id } => {
                class_precision_partial(batch, contribution, phi, class_id)
            }
            _ => continue,
        };

        partials.push((config.name.clone(), partial));
    }

    Ok(partials)
}

#[allow(clippy::too_many_arguments)]
fn perplexity_partial(
    batch: &Batch,
    contribution: &BatchContribution,
    phi: &DensePhiMatrix,
    settings: &ProcessorSettings,
    resolved: &processor::ResolvedBatch,
    score_class_ids: &[String],
    model_type: PerplexityModelType,
    dictionary_name: Option<&str>,
    dictionaries: DictionaryResolver,
) -> Result<ScorePartial> {
    let topics = settings.topic_names.len();
    let phi_values = phi.values();

    // Modalities entering the score: the intersection of the score's list
    // (empty = all) with the model's whitelist. A disjoint intersection
    // leaves the partial empty.
    let admitted = |class_id: &str| -> bool {
        let in_score = score_class_ids.is_empty() || score_class_ids.iter().any(|c| c == class_id);
        let in_model = match &settings.class_weights {
            None => true,
            Some(weights) => weights.contains_key(class_id),
        };

        in_score && in_model
    };

    // Per-modality decomposition is reported when the model trains with
    // an explicit modality whitelist.
    let decompose = settings.class_weights.is_some();

    let dictionary = match dictionary_name {
        None => None,
        Some(name) => dictionaries(name),
    };

    let mut raw = 0.0f64;
    let mut normalizer = 0.0f64;
    let mut zero_words = 0u64;
    let mut class_info: AHashMap<String, (f64, f64, u64)> = AHashMap::new();

    let typename_count = batch.transaction_typename.len().max(1);
    let mut theta_row = 0usize;

    for item in &batch.item {
        if item.validate(batch.token.len(), typename_count).is_err() {
            continue;
        }

        let theta = &contribution.theta.item_weights[theta_row];
        theta_row += 1;

        let (transactions, _, item_scaled_weight) = processor::resolve_item(item, resolved);
        let mut posterior = vec![0.0f32; topics];

        for transaction in &transactions {
            let first_row = transaction.rows[0];
            let class_id = &phi.tokens().get(first_row).unwrap().class_id;

            if !admitted(class_id) {
                continue;
            }

            let weight = transaction.weight as f64;
            let p = processor::transaction_posterior(
                transaction,
                &phi_values,
                topics,
                theta,
                &mut posterior,
            ) as f64;

            let mut term = 0.0f64;

            if p > 0.0 {
                term = weight * p.ln();
            } else {
                zero_words += 1;

                // Zero-probability substitution.
                let substitute = match model_type {
                    PerplexityModelType::Document => {
                        if item_scaled_weight > 0.0 {
                            Some(weight / item_scaled_weight)
                        } else {
                            None
                        }
                    }
                    PerplexityModelType::Collection => dictionary.as_ref().and_then(|d| {
                        let mut product = 1.0f64;

                        for &row in &transaction.rows {
                            let token = phi.tokens().get(row).unwrap();
                            let value = d.index_of(token).map(|i| d.token_value(i)).unwrap_or(0.0);

                            if value <= 0.0 {
                                return None;
                            }
                            product *= value as f64;
                        }

                        Some(product)
                    }),
                };

                if let Some(substitute) = substitute {
                    term = weight * substitute.ln();
                }
            }

            raw += term;
            normalizer += weight;

            if decompose {
                let entry = class_info.entry(class_id.clone()).or_default();
                entry.0 += term;
                entry.1 += weight;
                if p <= 0.0 {
                    entry.2 += 1;
                }
            }
        }
    }

    Ok(ScorePartial::Perplexity {
        raw,
        normalizer,
        zero_words,
        class_info,
    })
}

fn sparsity_theta_partial(
    contribution: &BatchContribution,
    settings: &ProcessorSettings,
    topic_names: &[String],
    eps: f32,
) -> ScorePartial {
    let selected: Vec<usize> = if topic_names.is_empty() {
        (0..settings.topic_names.len()).collect()
    } else {
        settings
            .topic_names
            .iter()
            .enumerate()
            .filter(|(_, name)| topic_names.contains(name))
            .map(|(t, _)| t)
            .collect()
    };

    let mut zero_entries = 0u64;
    let mut total_entries = 0u64;

    for weights in &contribution.theta.item_weights {
        for &t in &selected {
            total_entries += 1;
            if weights[t].abs() < eps {
                zero_entries += 1;
            }
        }
    }

    ScorePartial::SparsityTheta {
        zero_entries,
        total_entries,
    }
}

/// Among items carrying a gold token of the given modality, counts those
/// whose most probable token of that modality (under the item's theta)
/// matches the gold one.
fn class_precision_partial(
    batch: &Batch,
    contribution: &BatchContribution,
    phi: &DensePhiMatrix,
    class_id: &str,
) -> ScorePartial {
    let topics = phi.topic_size();
    let phi_values = phi.values();

    // Candidate rows of the target modality.
    let candidates: Vec<usize> = phi
        .tokens()
        .iter()
        .enumerate()
        .filter(|(_, token)| token.class_id == class_id)
        .map(|(row, _)| row)
        .collect();

    let mut correct = 0u64;
    let mut total = 0u64;

    if candidates.is_empty() {
        return ScorePartial::ClassPrecision { correct, total };
    }

    let typename_count = batch.transaction_typename.len().max(1);
    let mut theta_row = 0usize;

    for item in &batch.item {
        if item.validate(batch.token.len(), typename_count).is_err() {
            continue;
        }

        let theta = &contribution.theta.item_weights[theta_row];
        theta_row += 1;

        // The item's gold label: its heaviest token of the modality.
        let mut gold: Option<(&str, f32)> = None;

        for (&token_id, &weight) in item.token_id.iter().zip(&item.token_weight) {
            if batch.class_id_at(token_id as usize) == class_id && weight > 0.0 {
                let keyword = batch.token[token_id as usize].as_str();

                if gold.is_none_or(|(_, best)| weight > best) {
                    gold = Some((keyword, weight));
                }
            }
        }

        let Some((gold_keyword, _)) = gold else {
            continue;
        };

        let predicted = candidates
            .iter()
            .map(|&row| {
                let phi_row = &phi_values[row * topics..(row + 1) * topics];
                (row, blas::sdot(phi_row, theta))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(row, _)| row)
            .unwrap();

        total += 1;
        if phi.tokens().get(predicted).unwrap().keyword == gold_keyword {
            correct += 1;
        }
    }

    ScorePartial::ClassPrecision { correct, total }
}
