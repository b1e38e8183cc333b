use std::sync::Arc;

use crate::collections::TopEntries;
use crate::dictionary::Dictionary;
use crate::phi::{PhiMatrix, DEFAULT_EPS};
use crate::regularizers::DictionaryResolver;

use super::{ScoreSpec, ScoreValue, SparsityScore, TopTokensScore, TopicKernelScore};

/// Computes a model-level score against the committed Φ snapshot.
pub fn calculate(spec: &ScoreSpec, phi: &PhiMatrix, dictionaries: DictionaryResolver) -> ScoreValue {
    match spec {
        ScoreSpec::SparsityPhi {
            class_id,
            topic_names,
            eps,
        } => sparsity_phi(phi, class_id.as_deref(), topic_names, eps.unwrap_or(DEFAULT_EPS)),
        ScoreSpec::TopTokens {
            num_tokens,
            class_id,
            dictionary_name,
        } => top_tokens(
            phi,
            *num_tokens,
            class_id.as_deref(),
            dictionary_name.as_deref().and_then(|name| dictionaries(name)),
        ),
        ScoreSpec::TopicKernel {
            class_id,
            probability_mass_threshold,
            dictionary_name,
        } => topic_kernel(
            phi,
            class_id.as_deref(),
            *probability_mass_threshold,
            dictionary_name.as_deref().and_then(|name| dictionaries(name)),
        ),
        _ => unreachable!("cumulative scores are finalized from partials"),
    }
}

fn selected_rows(phi: &PhiMatrix, class_id: Option<&str>) -> Vec<usize> {
    (0..phi.token_size())
        .filter(|&w| match class_id {
            None => true,
            Some(class_id) => phi.tokens().get(w).unwrap().class_id == class_id,
        })
        .collect()
}

fn selected_topics(phi: &PhiMatrix, topic_names: &[String]) -> Vec<usize> {
    if topic_names.is_empty() {
        return (0..phi.topic_size()).collect();
    }

    phi.topic_names()
        .iter()
        .enumerate()
        .filter(|(_, name)| topic_names.contains(name))
        .map(|(t, _)| t)
        .collect()
}

fn sparsity_phi(
    phi: &PhiMatrix,
    class_id: Option<&str>,
    topic_names: &[String],
    eps: f32,
) -> ScoreValue {
    let rows = selected_rows(phi, class_id);
    let topics = selected_topics(phi, topic_names);

    let mut zero_entries = 0u64;
    let total_entries = (rows.len() * topics.len()) as u64;

    for &w in &rows {
        for &t in &topics {
            if phi.get(w, t).abs() < eps {
                zero_entries += 1;
            }
        }
    }

    ScoreValue::SparsityPhi(SparsityScore {
        value: if total_entries > 0 {
            zero_entries as f64 / total_entries as f64
        } else {
            0.0
        },
        zero_entries,
        total_entries,
    })
}

/// Average pairwise co-occurrence value over a token set, the usual
/// corpus-based coherence estimate.
fn coherence(rows: &[usize], phi: &PhiMatrix, dictionary: &Dictionary) -> f32 {
    if rows.len() < 2 {
        return 0.0;
    }

    let indices: Vec<Option<usize>> = rows
        .iter()
        .map(|&w| dictionary.index_of(phi.tokens().get(w).unwrap()))
        .collect();

    let mut sum = 0.0f32;

    for i in 0..indices.len() {
        for j in (i + 1)..indices.len() {
            if let (Some(a), Some(b)) = (indices[i], indices[j]) {
                if let Some(entry) = dictionary.cooc(a, b) {
                    sum += entry.value;
                }
            }
        }
    }

    let pairs = (rows.len() * (rows.len() - 1) / 2) as f32;
    sum / pairs
}

fn top_tokens(
    phi: &PhiMatrix,
    num_tokens: usize,
    class_id: Option<&str>,
    dictionary: Option<Arc<Dictionary>>,
) -> ScoreValue {
    let rows = selected_rows(phi, class_id);

    let mut score = TopTokensScore::default();
    let mut coherence_sum = 0.0f32;
    let mut coherence_count = 0usize;

    for t in 0..phi.topic_size() {
        let mut top: TopEntries<usize> = TopEntries::with_capacity(num_tokens);

        for &w in &rows {
            let weight = phi.get(w, t);
            if weight > 0.0 {
                top.push(weight, w);
            }
        }

        let entries = top.into_sorted_vec();
        let topic_rows: Vec<usize> = entries.iter().map(|&(_, w)| w).collect();

        for (weight, w) in entries {
            score.topic_name.push(phi.topic_names()[t].clone());
            score.token.push(phi.tokens().get(w).unwrap().keyword.clone());
            score.weight.push(weight);
            score.num_entries += 1;
        }

        if let Some(dictionary) = &dictionary {
            let value = coherence(&topic_rows, phi, dictionary);
            score.topic_coherence.push(value);
            coherence_sum += value;
            coherence_count += 1;
        }
    }

    if coherence_count > 0 {
        score.average_coherence = coherence_sum / coherence_count as f32;
    }

    ScoreValue::TopTokens(score)
}

fn topic_kernel(
    phi: &PhiMatrix,
    class_id: Option<&str>,
    threshold: f32,
    dictionary: Option<Arc<Dictionary>>,
) -> ScoreValue {
    let rows = selected_rows(phi, class_id);
    let topics = phi.topic_size();

    // p(t | w) under a uniform topic prior.
    let mut row_totals = vec![0.0f32; phi.token_size()];
    for &w in &rows {
        for t in 0..topics {
            row_totals[w] += phi.get(w, t);
        }
    }

    let mut score = TopicKernelScore::default();

    for t in 0..topics {
        let kernel: Vec<usize> = rows
            .iter()
            .filter(|&&w| {
                row_totals[w] > 0.0 && phi.get(w, t) / row_totals[w] >= threshold
            })
            .copied()
            .collect();

        let size = kernel.len() as f32;
        let purity: f32 = kernel.iter().map(|&w| phi.get(w, t)).sum();
        let contrast = if size > 0.0 { purity / size } else { 0.0 };

        score.kernel_size.push(size);
        score.purity.push(purity);
        score.contrast.push(contrast);

        if let Some(dictionary) = &dictionary {
            score.coherence.push(coherence(&kernel, phi, dictionary));
        }
    }

    let count = topics.max(1) as f32;
    score.average_kernel_size = score.kernel_size.iter().sum::<f32>() / count;
    score.average_purity = score.purity.iter().sum::<f32>() / count;
    score.average_contrast = score.contrast.iter().sum::<f32>() / count;

    if !score.coherence.is_empty() {
        score.average_coherence = score.coherence.iter().sum::<f32>() / count;
    }

    ScoreValue::TopicKernel(score)
}
