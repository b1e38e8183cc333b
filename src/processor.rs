use ahash::AHashMap;
use std::sync::Arc;

use crate::batch::{Batch, Item};
use crate::blas;
use crate::phi::DensePhiMatrix;
use crate::regularizers::ThetaRegularizers;
use crate::theta::CachedBatchTheta;
use crate::token::{ClassId, Token, DOCUMENTS_CLASS};
use crate::{Error, Result};

/// Model-level knobs the E-step needs, snapshotted out of the master
/// config so workers never read shared state.
#[derive(Debug, Clone, Default)]
pub struct ProcessorSettings {
    pub topic_names: Vec<String>,
    /// None whitelists every modality at weight 1.
    pub class_weights: Option<AHashMap<ClassId, f32>>,
    /// None accepts every transaction typename at weight 1.
    pub typename_weights: Option<AHashMap<String, f32>>,
    pub num_document_passes: usize,
    pub opt_for_avx: bool,
    pub reuse_theta: bool,
}

/// One unit of work: a batch against an immutable Φ snapshot. The task
/// only borrows; nothing here points back at the master.
pub struct BatchTask<'a> {
    pub batch: &'a Batch,
    pub phi: &'a DensePhiMatrix,
    pub settings: &'a ProcessorSettings,
    pub regularizers: &'a ThetaRegularizers,
    pub cached_theta: Option<Arc<CachedBatchTheta>>,
    pub ptd: Option<&'a DensePhiMatrix>,
    /// Transform runs skip the n_wt accumulation entirely.
    pub accumulate_nwt: bool,
}

/// Everything one batch contributes to a pass: touched n_wt rows, its
/// theta slice and the counters the score engine wants.
#[derive(Debug, Default)]
pub struct BatchContribution {
    pub batch_id: String,
    pub nwt: AHashMap<usize, Vec<f32>>,
    pub theta: CachedBatchTheta,
    pub items_processed: u64,
    pub items_dropped: u64,
    pub token_weight_raw: f64,
    pub token_weight_scaled: f64,
}

/// A resolved transaction: Φ rows of its usable members and the combined
/// weight its posterior contributes with.
pub(crate) struct Transaction {
    pub(crate) rows: Vec<usize>,
    pub(crate) weight: f32,
}

pub(crate) struct ResolvedBatch {
    /// Φ row per (typename id, batch token id), or None when the token is
    /// unknown to Φ or its modality is not whitelisted.
    pub(crate) rows: Vec<Vec<Option<usize>>>,
    pub(crate) class_weights: Vec<f32>,
    pub(crate) typename_weights: Vec<f32>,
}

pub(crate) fn resolve_batch(batch: &Batch, phi: &DensePhiMatrix, settings: &ProcessorSettings) -> ResolvedBatch {
    let typename_count = batch.transaction_typename.len().max(1);

    let class_weights: Vec<f32> = (0..batch.token.len())
        .map(|i| match &settings.class_weights {
            None => 1.0,
            Some(weights) => weights.get(batch.class_id_at(i)).copied().unwrap_or(0.0),
        })
        .collect();

    let typename_weights: Vec<f32> = (0..typename_count)
        .map(|i| match &settings.typename_weights {
            None => 1.0,
            Some(weights) => weights.get(batch.typename_at(i)).copied().unwrap_or(0.0),
        })
        .collect();

    let rows = (0..typename_count)
        .map(|typename_id| {
            let typename = batch.typename_at(typename_id);

            (0..batch.token.len())
                .map(|i| {
                    if class_weights[i] == 0.0 {
                        return None;
                    }

                    phi.tokens().index_of(&Token::with_typename(
                        batch.class_id_at(i),
                        &batch.token[i],
                        typename,
                    ))
                })
                .collect()
        })
        .collect();

    ResolvedBatch {
        rows,
        class_weights,
        typename_weights,
    }
}

/// Builds the item's usable transactions. Members unknown to Φ drop out
/// of the product; transactions with no usable member, or with a zero
/// typename weight, disappear.
pub(crate) fn resolve_item(item: &Item, resolved: &ResolvedBatch) -> (Vec<Transaction>, f64, f64) {
    let mut transactions = Vec::new();
    let mut raw_weight = 0.0f64;
    let mut scaled_weight = 0.0f64;

    for (range, typename_id) in item.transactions() {
        let typename_weight = resolved.typename_weights[typename_id];
        raw_weight += range
            .clone()
            .map(|i| item.token_weight[i] as f64)
            .sum::<f64>();

        if typename_weight == 0.0 {
            continue;
        }

        let mut rows = Vec::with_capacity(range.len());
        let mut weight_sum = 0.0f32;

        for i in range {
            let token_id = item.token_id[i] as usize;

            if let Some(row) = resolved.rows[typename_id][token_id] {
                rows.push(row);
                weight_sum += item.token_weight[i] * resolved.class_weights[token_id];
            }
        }

        if rows.is_empty() {
            continue;
        }

        let weight = typename_weight * weight_sum / rows.len() as f32;

        if weight > 0.0 {
            scaled_weight += weight as f64;
            transactions.push(Transaction { rows, weight });
        }
    }

    (transactions, raw_weight, scaled_weight)
}

fn initial_theta(
    item: &Item,
    topics: usize,
    task: &BatchTask,
) -> Vec<f32> {
    if task.settings.reuse_theta {
        if let Some(cached) = &task.cached_theta {
            if cached.topic_names == task.settings.topic_names {
                if let Some(weights) = cached.weights_for(item.id) {
                    return weights.to_vec();
                }
            }
        }
    }

    // The cache wins over the ptd slot; the slot only seeds items the
    // cache has never seen.
    if let Some(ptd) = task.ptd {
        let token = Token::new(DOCUMENTS_CLASS, &item.id.to_string());

        if let Some(row) = ptd.tokens().index_of(&token) {
            if ptd.topic_size() == topics {
                let values = ptd.values();
                let slice = &values[row * topics..(row + 1) * topics];
                let sum = blas::ssum(slice);

                if sum > 0.0 {
                    let mut theta = slice.to_vec();
                    blas::sscale(1.0 / sum, &mut theta);
                    return theta;
                }
            }
        }
    }

    vec![1.0 / topics as f32; topics]
}

fn normalize_theta(n_td: &[f32], r_td: &[f32], theta: &mut [f32]) {
    let mut sum = 0.0f32;

    for t in 0..theta.len() {
        theta[t] = (n_td[t] + r_td[t]).max(0.0);
        sum += theta[t];
    }

    if sum > 0.0 {
        blas::sscale(1.0 / sum, theta);
    } else {
        theta.fill(1.0 / theta.len() as f32);
    }
}

/// Unnormalized posterior of one transaction: θ_td times the product of
/// member rows' φ values.
pub(crate) fn transaction_posterior(
    transaction: &Transaction,
    phi_values: &[f32],
    topics: usize,
    theta: &[f32],
    posterior: &mut [f32],
) -> f32 {
    posterior.copy_from_slice(theta);

    for &row in &transaction.rows {
        let phi_row = &phi_values[row * topics..(row + 1) * topics];

        for (p, &phi) in posterior.iter_mut().zip(phi_row) {
            *p *= phi;
        }
    }

    blas::ssum(posterior)
}

/// Scalar kernel handling arbitrary transactions and ptdw-level
/// regularizers.
fn process_item_general(
    item: &Item,
    transactions: &[Transaction],
    task: &BatchTask,
    contribution: &mut BatchContribution,
) -> Vec<f32> {
    let topics = task.settings.topic_names.len();
    let phi_values = task.phi.values();
    let ptdw_level = task.regularizers.has_ptdw();

    let mut theta = initial_theta(item, topics, task);
    let mut posterior = vec![0.0f32; topics];
    let mut rows: Vec<Vec<f32>> = if ptdw_level {
        vec![vec![0.0; topics]; transactions.len()]
    } else {
        Vec::new()
    };

    for pass in 0..task.settings.num_document_passes {
        let mut n_td = vec![0.0f32; topics];

        for (x, transaction) in transactions.iter().enumerate() {
            let sum = transaction_posterior(transaction, &phi_values, topics, &theta, &mut posterior);

            if sum <= 0.0 {
                if ptdw_level {
                    rows[x].fill(0.0);
                }
                continue;
            }

            blas::sscale(1.0 / sum, &mut posterior);

            if ptdw_level {
                rows[x].copy_from_slice(&posterior);
            } else {
                blas::saxpy(transaction.weight, &posterior, &mut n_td);
            }
        }

        if ptdw_level {
            task.regularizers.apply_ptdw(&mut rows);

            for (x, transaction) in transactions.iter().enumerate() {
                blas::saxpy(transaction.weight, &rows[x], &mut n_td);
            }
        }

        let mut r_td = vec![0.0f32; topics];
        task.regularizers.apply(pass, &theta, &mut r_td);

        normalize_theta(&n_td, &r_td, &mut theta);
    }

    if task.accumulate_nwt {
        // Final sweep with the converged theta.
        if ptdw_level {
            for (x, transaction) in transactions.iter().enumerate() {
                let sum =
                    transaction_posterior(transaction, &phi_values, topics, &theta, &mut posterior);
                if sum <= 0.0 {
                    continue;
                }
                blas::sscale(1.0 / sum, &mut posterior);
                rows[x].copy_from_slice(&posterior);
            }

            task.regularizers.apply_ptdw(&mut rows);

            for (x, transaction) in transactions.iter().enumerate() {
                for &row in &transaction.rows {
                    let entry = contribution
                        .nwt
                        .entry(row)
                        .or_insert_with(|| vec![0.0; topics]);
                    blas::saxpy(transaction.weight, &rows[x], entry);
                }
            }
        } else {
            for transaction in transactions {
                let sum =
                    transaction_posterior(transaction, &phi_values, topics, &theta, &mut posterior);
                if sum <= 0.0 {
                    continue;
                }
                blas::sscale(1.0 / sum, &mut posterior);

                for &row in &transaction.rows {
                    let entry = contribution
                        .nwt
                        .entry(row)
                        .or_insert_with(|| vec![0.0; topics]);
                    blas::saxpy(transaction.weight, &posterior, entry);
                }
            }
        }
    }

    theta
}

/// Dense kernel for the common case: single-token transactions and no
/// ptdw-level regularizer. Walks contiguous Φ rows so the loops stay
/// vectorizable.
fn process_item_fast(
    item: &Item,
    transactions: &[Transaction],
    task: &BatchTask,
    contribution: &mut BatchContribution,
) -> Vec<f32> {
    let topics = task.settings.topic_names.len();
    let phi_values = task.phi.values();

    let mut theta = initial_theta(item, topics, task);
    let mut posterior = vec![0.0f32; topics];

    for pass in 0..task.settings.num_document_passes {
        let mut n_td = vec![0.0f32; topics];

        for transaction in transactions {
            let row = transaction.rows[0];
            let phi_row = &phi_values[row * topics..(row + 1) * topics];

            let sum = blas::sdot(phi_row, &theta);
            if sum <= 0.0 {
                continue;
            }

            let scale = transaction.weight / sum;
            for t in 0..topics {
                n_td[t] += scale * phi_row[t] * theta[t];
            }
        }

        let mut r_td = vec![0.0f32; topics];
        task.regularizers.apply(pass, &theta, &mut r_td);

        normalize_theta(&n_td, &r_td, &mut theta);
    }

    if task.accumulate_nwt {
        for transaction in transactions {
            let row = transaction.rows[0];
            let phi_row = &phi_values[row * topics..(row + 1) * topics];

            let sum = blas::sdot(phi_row, &theta);
            if sum <= 0.0 {
                continue;
            }

            let scale = transaction.weight / sum;
            for (t, p) in posterior.iter_mut().enumerate() {
                *p = scale * phi_row[t] * theta[t];
            }

            let entry = contribution
                .nwt
                .entry(row)
                .or_insert_with(|| vec![0.0; topics]);
            blas::saxpy(1.0, &posterior, entry);
        }
    }

    theta
}

/// Runs the document-level EM over one batch against a Φ snapshot.
/// Malformed items are dropped with a warning; a batch-level
/// inconsistency fails the whole batch so it contributes nothing.
pub fn process_batch(task: &BatchTask) -> Result<BatchContribution> {
    task.batch.validate()?;

    let topics = task.settings.topic_names.len();
    if topics == 0 {
        return Err(Error::InvalidOperation(
            "cannot process a batch with an empty topic list".to_string(),
        ));
    }

    let resolved = resolve_batch(task.batch, task.phi, task.settings);

    let mut contribution = BatchContribution {
        batch_id: task.batch.id.clone(),
        theta: CachedBatchTheta {
            topic_names: task.settings.topic_names.clone(),
            ..CachedBatchTheta::default()
        },
        ..BatchContribution::default()
    };

    let typename_count = task.batch.transaction_typename.len().max(1);

    for item in &task.batch.item {
        if let Err(error) = item.validate(task.batch.token.len(), typename_count) {
            tracing::warn!(
                batch = task.batch.id.as_str(),
                item = item.id,
                %error,
                "dropping malformed item"
            );
            contribution.items_dropped += 1;
            continue;
        }

        let (transactions, raw_weight, scaled_weight) = resolve_item(item, &resolved);

        let fast = task.settings.opt_for_avx
            && !task.regularizers.has_ptdw()
            && transactions.iter().all(|x| x.rows.len() == 1);

        let theta = if fast {
            process_item_fast(item, &transactions, task, &mut contribution)
        } else {
            process_item_general(item, &transactions, task, &mut contribution)
        };

        contribution.items_processed += 1;
        contribution.token_weight_raw += raw_weight;
        contribution.token_weight_scaled += scaled_weight;
        contribution.theta.item_ids.push(item.id);
        contribution.theta.item_titles.push(item.title.clone());
        contribution.theta.item_weights.push(theta);
    }

    Ok(contribution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::TokenCollection;
    use crate::token::DEFAULT_CLASS;

    fn settings(topics: usize, passes: usize) -> ProcessorSettings {
        ProcessorSettings {
            topic_names: (0..topics).map(|t| format!("t{}", t)).collect(),
            class_weights: None,
            typename_weights: None,
            num_document_passes: passes,
            opt_for_avx: true,
            reuse_theta: false,
        }
    }

    fn uniform_phi(keywords: &[&str], topics: usize) -> DensePhiMatrix {
        let tokens: TokenCollection = keywords
            .iter()
            .map(|k| Token::new(DEFAULT_CLASS, k))
            .collect();
        let topic_names = (0..topics).map(|t| format!("t{}", t)).collect();

        let mut phi = DensePhiMatrix::new("pwt", topic_names, tokens);
        for w in 0..keywords.len() {
            for t in 0..topics {
                phi.set(w, t, 1.0 / keywords.len() as f32);
            }
        }

        phi
    }

    fn one_item_batch(tokens: &[&str], ids: &[u32]) -> Batch {
        Batch {
            id: "batch".to_string(),
            token: tokens.iter().map(|t| t.to_string()).collect(),
            item: vec![Item {
                id: 0,
                token_id: ids.to_vec(),
                token_weight: vec![1.0; ids.len()],
                ..Item::default()
            }],
            ..Batch::default()
        }
    }

    #[test]
    fn zero_passes_yield_uniform_theta() {
        let phi = uniform_phi(&["a", "b"], 3);
        let batch = one_item_batch(&["a", "b"], &[0, 1]);
        let settings = settings(3, 0);
        let regularizers = ThetaRegularizers::resolve(&[], &settings.topic_names).unwrap();

        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &settings,
            regularizers: &regularizers,
            cached_theta: None,
            ptd: None,
            accumulate_nwt: true,
        };

        let contribution = process_batch(&task).unwrap();
        assert_eq!(contribution.theta.item_weights[0], vec![1.0 / 3.0; 3]);
    }

    #[test]
    fn contributions_match_token_mass() {
        let phi = uniform_phi(&["a", "b"], 2);
        let batch = one_item_batch(&["a", "b"], &[0, 1, 0]);
        let settings = settings(2, 1);
        let regularizers = ThetaRegularizers::resolve(&[], &settings.topic_names).unwrap();

        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &settings,
            regularizers: &regularizers,
            cached_theta: None,
            ptd: None,
            accumulate_nwt: true,
        };

        let contribution = process_batch(&task).unwrap();

        // Three unit-weight occurrences: total accumulated mass is 3.
        let total: f32 = contribution.nwt.values().flatten().sum();
        assert!((total - 3.0).abs() < 1e-5);

        // Token a saw two of them.
        let row_a: f32 = contribution.nwt[&0].iter().sum();
        assert!((row_a - 2.0).abs() < 1e-5);

        assert_eq!(contribution.items_processed, 1);
        assert!((contribution.token_weight_raw - 3.0).abs() < 1e-9);
    }

    #[test]
    fn fast_and_general_paths_agree() {
        let phi = {
            let mut phi = uniform_phi(&["a", "b", "c"], 2);
            phi.set(0, 0, 0.7);
            phi.set(0, 1, 0.1);
            phi.set(1, 0, 0.2);
            phi.set(1, 1, 0.3);
            phi.set(2, 0, 0.1);
            phi.set(2, 1, 0.6);
            phi
        };
        let batch = one_item_batch(&["a", "b", "c"], &[0, 1, 2, 1]);

        let mut fast_settings = settings(2, 5);
        let mut scalar_settings = settings(2, 5);
        scalar_settings.opt_for_avx = false;
        fast_settings.opt_for_avx = true;

        let regularizers = ThetaRegularizers::resolve(&[], &fast_settings.topic_names).unwrap();

        let run = |s: &ProcessorSettings| {
            let task = BatchTask {
                batch: &batch,
                phi: &phi,
                settings: s,
                regularizers: &regularizers,
                cached_theta: None,
                ptd: None,
                accumulate_nwt: true,
            };
            process_batch(&task).unwrap()
        };

        let fast = run(&fast_settings);
        let scalar = run(&scalar_settings);

        for t in 0..2 {
            assert!(
                (fast.theta.item_weights[0][t] - scalar.theta.item_weights[0][t]).abs() < 1e-6
            );
        }

        for (row, values) in &fast.nwt {
            for (t, v) in values.iter().enumerate() {
                assert!((v - scalar.nwt[row][t]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn unknown_modalities_are_skipped() {
        let phi = uniform_phi(&["a"], 2);
        let mut batch = one_item_batch(&["a", "b"], &[0, 1]);
        batch.class_id = vec!["@unlisted".to_string(), DEFAULT_CLASS.to_string()];

        let mut s = settings(2, 1);
        s.class_weights = Some(
            [(DEFAULT_CLASS.to_string(), 1.0)]
                .into_iter()
                .collect(),
        );

        let regularizers = ThetaRegularizers::resolve(&[], &s.topic_names).unwrap();
        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &s,
            regularizers: &regularizers,
            cached_theta: None,
            ptd: None,
            accumulate_nwt: true,
        };

        let contribution = process_batch(&task).unwrap();

        // Token b is absent from phi and token a's modality is unlisted:
        // nothing accumulates.
        assert!(contribution.nwt.is_empty());
    }

    #[test]
    fn zero_transaction_weight_removes_the_typename() {
        // Φ rows carry the typenames the batch's transactions use.
        let tokens: TokenCollection = vec![
            Token::with_typename(DEFAULT_CLASS, "a", "@kept"),
            Token::with_typename(DEFAULT_CLASS, "b", "@removed"),
        ]
        .into_iter()
        .collect();
        let mut phi =
            DensePhiMatrix::new("pwt", vec!["t0".to_string(), "t1".to_string()], tokens);
        for w in 0..2 {
            for t in 0..2 {
                phi.set(w, t, 0.5);
            }
        }

        let mut batch = one_item_batch(&["a", "b"], &[0, 1]);
        batch.transaction_typename =
            vec!["@kept".to_string(), "@removed".to_string()];
        batch.item[0].transaction_start_index = vec![0, 1, 2];
        batch.item[0].transaction_typename_id = vec![0, 1];

        let mut s = settings(2, 1);
        s.typename_weights = Some(
            [("@kept".to_string(), 1.0), ("@removed".to_string(), 0.0)]
                .into_iter()
                .collect(),
        );

        let regularizers = ThetaRegularizers::resolve(&[], &s.topic_names).unwrap();
        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &s,
            regularizers: &regularizers,
            cached_theta: None,
            ptd: None,
            accumulate_nwt: true,
        };

        let contribution = process_batch(&task).unwrap();

        // Only the @kept transaction (token a) accumulates.
        assert!(contribution.nwt.contains_key(&0));
        assert!(!contribution.nwt.contains_key(&1));
    }

    #[test]
    fn malformed_items_are_dropped_not_fatal() {
        let phi = uniform_phi(&["a"], 2);
        let mut batch = one_item_batch(&["a"], &[0]);
        batch.item.push(Item {
            id: 1,
            token_id: vec![5],
            token_weight: vec![1.0],
            ..Item::default()
        });

        let s = settings(2, 1);
        let regularizers = ThetaRegularizers::resolve(&[], &s.topic_names).unwrap();
        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &s,
            regularizers: &regularizers,
            cached_theta: None,
            ptd: None,
            accumulate_nwt: true,
        };

        let contribution = process_batch(&task).unwrap();
        assert_eq!(contribution.items_processed, 1);
        assert_eq!(contribution.items_dropped, 1);
    }

    #[test]
    fn cached_theta_seeds_reuse() {
        let phi = uniform_phi(&["a"], 2);
        let batch = one_item_batch(&["a"], &[0]);

        let mut s = settings(2, 0);
        s.reuse_theta = true;

        let cached = CachedBatchTheta {
            topic_names: s.topic_names.clone(),
            item_ids: vec![0],
            item_titles: vec![String::new()],
            item_weights: vec![vec![0.9, 0.1]],
        };

        let regularizers = ThetaRegularizers::resolve(&[], &s.topic_names).unwrap();
        let task = BatchTask {
            batch: &batch,
            phi: &phi,
            settings: &s,
            regularizers: &regularizers,
            cached_theta: Some(Arc::new(cached)),
            ptd: None,
            accumulate_nwt: false,
        };

        let contribution = process_batch(&task).unwrap();
        assert_eq!(contribution.theta.item_weights[0], vec![0.9, 0.1]);
    }
}
