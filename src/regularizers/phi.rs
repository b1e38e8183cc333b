use std::sync::Arc;

use crate::collections::TopEntries;
use crate::dictionary::Dictionary;
use crate::phi::DensePhiMatrix;
use crate::{Error, Result};

use super::{RegularizerConfig, RegularizerSpec};

/// How regularizers find the dictionaries their configs name; the master
/// passes a closure over its own dictionary table.
pub type DictionaryResolver<'a> = &'a dyn Fn(&str) -> Option<Arc<Dictionary>>;

fn resolve_dictionary(
    name: &Option<String>,
    regularizer: &str,
    dictionaries: DictionaryResolver,
) -> Result<Option<Arc<Dictionary>>> {
    match name {
        None => Ok(None),
        Some(name) => dictionaries(name)
            .map(Some)
            .ok_or_else(|| Error::NotFound(format!("dictionary {} (regularizer {})", name, regularizer))),
    }
}

fn topic_mask(topic_names: &[String], selected: &[String]) -> Result<Vec<bool>> {
    if selected.is_empty() {
        return Ok(vec![true; topic_names.len()]);
    }

    let mut mask = vec![false; topic_names.len()];

    for name in selected {
        let position = topic_names
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        mask[position] = true;
    }

    Ok(mask)
}

fn row_mask(n: &DensePhiMatrix, class_ids: &[String]) -> Vec<bool> {
    if class_ids.is_empty() {
        return vec![true; n.token_size()];
    }

    n.tokens()
        .iter()
        .map(|token| class_ids.iter().any(|c| *c == token.class_id))
        .collect()
}

/// Per-token dictionary value, used as the smoothing weight. Tokens
/// absent from the dictionary contribute nothing.
fn dictionary_weights(n: &DensePhiMatrix, dictionary: Option<&Dictionary>) -> Vec<f32> {
    match dictionary {
        None => vec![1.0; n.token_size()],
        Some(dictionary) => n
            .tokens()
            .iter()
            .map(|token| {
                dictionary
                    .index_of(token)
                    .map(|i| dictionary.token_value(i))
                    .unwrap_or(0.0)
            })
            .collect(),
    }
}

struct Scope<'a> {
    rows: Vec<bool>,
    topics: Vec<bool>,
    n: &'a DensePhiMatrix,
    p: &'a DensePhiMatrix,
}

fn fill_unit(
    config: &RegularizerConfig,
    scope: &Scope,
    dictionaries: DictionaryResolver,
    scratch: &mut [f32],
) -> Result<()> {
    let topics = scope.n.topic_size();
    let tokens = scope.n.token_size();
    let n_values = scope.n.values();
    let p_values = scope.p.values();

    match &config.spec {
        RegularizerSpec::SmoothSparsePhi {
            dictionary_name, ..
        } => {
            let dictionary = resolve_dictionary(dictionary_name, &config.name, dictionaries)?;
            let weights = dictionary_weights(scope.n, dictionary.as_deref());

            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                for t in (0..topics).filter(|&t| scope.topics[t]) {
                    scratch[w * topics + t] += weights[w];
                }
            }
        }
        RegularizerSpec::DecorrelatorPhi { .. } => {
            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                let row = &p_values[w * topics..(w + 1) * topics];

                let selected_sum: f32 = (0..topics)
                    .filter(|&t| scope.topics[t])
                    .map(|t| row[t])
                    .sum();

                for t in (0..topics).filter(|&t| scope.topics[t]) {
                    scratch[w * topics + t] -= row[t] * (selected_sum - row[t]);
                }
            }
        }
        RegularizerSpec::LabelRegularizationPhi {
            dictionary_name, ..
        } => {
            let dictionary = resolve_dictionary(dictionary_name, &config.name, dictionaries)?;
            let weights = dictionary_weights(scope.n, dictionary.as_deref());

            // Per-topic mass over the scoped rows.
            let mut topic_mass = vec![0.0f32; topics];
            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                for t in (0..topics).filter(|&t| scope.topics[t]) {
                    topic_mass[t] += n_values[w * topics + t];
                }
            }

            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                let row = &p_values[w * topics..(w + 1) * topics];

                let denominator: f32 = (0..topics)
                    .filter(|&t| scope.topics[t])
                    .map(|t| row[t] * topic_mass[t])
                    .sum();

                if denominator <= 0.0 {
                    continue;
                }

                for t in (0..topics).filter(|&t| scope.topics[t]) {
                    scratch[w * topics + t] += weights[w] * row[t] * topic_mass[t] / denominator;
                }
            }
        }
        RegularizerSpec::ImproveCoherencePhi {
            dictionary_name, ..
        } => {
            let dictionary = dictionaries(dictionary_name).ok_or_else(|| {
                Error::NotFound(format!(
                    "dictionary {} (regularizer {})",
                    dictionary_name, config.name
                ))
            })?;

            // Dictionary ids to matrix rows, once.
            let to_row: Vec<Option<usize>> = dictionary
                .tokens()
                .iter()
                .map(|token| scope.n.tokens().index_of(token))
                .collect();

            for (first, second, entry) in dictionary.cooc_iter() {
                let (Some(w1), Some(w2)) = (to_row[first], to_row[second]) else {
                    continue;
                };

                if w1 == w2 || !scope.rows[w1] || !scope.rows[w2] {
                    continue;
                }

                for t in (0..topics).filter(|&t| scope.topics[t]) {
                    scratch[w1 * topics + t] += entry.value * n_values[w2 * topics + t];
                    scratch[w2 * topics + t] += entry.value * n_values[w1 * topics + t];
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// Zeroes everything but the top-k entries per column (or per row) of the
/// scoped class by cancelling their accumulated mass. Applied verbatim,
/// outside the tau/gamma scaling.
fn apply_specified_sparse(
    scope: &Scope,
    max_elements: usize,
    by_columns: bool,
    r: &mut DensePhiMatrix,
) {
    let topics = scope.n.topic_size();
    let tokens = scope.n.token_size();
    let n_values = scope.n.values();

    if by_columns {
        for t in 0..topics {
            let mut top: TopEntries<usize> = TopEntries::with_capacity(max_elements);
            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                top.push(n_values[w * topics + t], w);
            }

            let keep: Vec<usize> = top.into_sorted_vec().into_iter().map(|(_, w)| w).collect();

            for w in (0..tokens).filter(|&w| scope.rows[w]) {
                if !keep.contains(&w) {
                    r.increase(w, t, -n_values[w * topics + t]);
                }
            }
        }
    } else {
        for w in (0..tokens).filter(|&w| scope.rows[w]) {
            let mut top: TopEntries<usize> = TopEntries::with_capacity(max_elements);
            for t in 0..topics {
                top.push(n_values[w * topics + t], t);
            }

            let keep: Vec<usize> = top.into_sorted_vec().into_iter().map(|(_, t)| t).collect();

            for t in 0..topics {
                if !keep.contains(&t) {
                    r.increase(w, t, -n_values[w * topics + t]);
                }
            }
        }
    }
}

/// Runs every Phi regularizer over the accumulated N, producing the R
/// matrix of the regularize/normalize pipeline. Returns `None` when no
/// Phi regularizer is configured.
///
/// With `gamma` set on a regularizer, its per-topic coefficient becomes
/// `tau * ((1 - gamma) + gamma * n_t / |r|_t)`, tying the strength to the
/// topic's data mass instead of the raw tau.
pub fn regularize_phi(
    configs: &[RegularizerConfig],
    n: &DensePhiMatrix,
    p: &DensePhiMatrix,
    dictionaries: DictionaryResolver,
) -> Result<Option<DensePhiMatrix>> {
    let phi_configs: Vec<_> = configs.iter().filter(|c| c.is_phi()).collect();

    if phi_configs.is_empty() {
        return Ok(None);
    }

    let topics = n.topic_size();
    let tokens = n.token_size();
    let mut r = DensePhiMatrix::new("rwt", n.topic_names().to_vec(), n.tokens().clone());

    for config in phi_configs {
        config.validate()?;

        let (selected_topics, class_ids) = match &config.spec {
            RegularizerSpec::SmoothSparsePhi {
                topic_names,
                class_ids,
                ..
            }
            | RegularizerSpec::DecorrelatorPhi {
                topic_names,
                class_ids,
            }
            | RegularizerSpec::LabelRegularizationPhi {
                topic_names,
                class_ids,
                ..
            }
            | RegularizerSpec::ImproveCoherencePhi {
                topic_names,
                class_ids,
                ..
            } => (topic_names.clone(), class_ids.clone()),
            RegularizerSpec::SpecifiedSparsePhi { class_id, .. } => {
                (Vec::new(), vec![class_id.clone()])
            }
            _ => continue,
        };

        let scope = Scope {
            rows: row_mask(n, &class_ids),
            topics: topic_mask(n.topic_names(), &selected_topics)?,
            n,
            p,
        };

        if let RegularizerSpec::SpecifiedSparsePhi {
            max_elements_count,
            sparse_by_columns,
            ..
        } = &config.spec
        {
            apply_specified_sparse(&scope, *max_elements_count, *sparse_by_columns, &mut r);
            continue;
        }

        let mut scratch = vec![0.0f32; tokens * topics];
        fill_unit(config, &scope, dictionaries, &mut scratch)?;

        // Per-topic effective coefficient (relative regularization).
        let mut coefficients = vec![config.tau; topics];

        if let Some(gamma) = config.gamma {
            let n_values = n.values();

            for (t, coefficient) in coefficients.iter_mut().enumerate() {
                if !scope.topics[t] {
                    continue;
                }

                let mut topic_mass = 0.0f32;
                let mut regularizer_mass = 0.0f32;

                for w in (0..tokens).filter(|&w| scope.rows[w]) {
                    topic_mass += n_values[w * topics + t];
                    regularizer_mass += scratch[w * topics + t].abs();
                }

                if regularizer_mass > 0.0 {
                    *coefficient =
                        config.tau * ((1.0 - gamma) + gamma * topic_mass / regularizer_mass);
                }
            }
        }

        for w in 0..tokens {
            for t in 0..topics {
                let value = scratch[w * topics + t];
                if value != 0.0 {
                    r.increase(w, t, coefficients[t] * value);
                }
            }
        }
    }

    Ok(Some(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::TokenCollection;
    use crate::token::{Token, DEFAULT_CLASS};

    fn no_dictionaries(_: &str) -> Option<Arc<Dictionary>> {
        None
    }

    fn matrix(values: &[&[f32]], classes: &[&str]) -> DensePhiMatrix {
        let tokens: TokenCollection = classes
            .iter()
            .enumerate()
            .map(|(i, class_id)| Token::new(class_id, &format!("w{}", i)))
            .collect();

        let topic_names: Vec<String> = (0..values[0].len()).map(|t| format!("t{}", t)).collect();
        let mut m = DensePhiMatrix::new("m", topic_names, tokens);

        for (w, row) in values.iter().enumerate() {
            for (t, &v) in row.iter().enumerate() {
                m.set(w, t, v);
            }
        }

        m
    }

    #[test]
    fn smooth_sparse_phi_adds_tau_everywhere() {
        let n = matrix(&[&[1.0, 2.0], &[3.0, 4.0]], &[DEFAULT_CLASS, DEFAULT_CLASS]);
        let p = matrix(&[&[0.5, 0.5], &[0.5, 0.5]], &[DEFAULT_CLASS, DEFAULT_CLASS]);

        let config = RegularizerConfig {
            name: "smooth".to_string(),
            tau: -0.1,
            gamma: None,
            spec: RegularizerSpec::SmoothSparsePhi {
                topic_names: Vec::new(),
                class_ids: Vec::new(),
                dictionary_name: None,
            },
        };

        let r = regularize_phi(&[config], &n, &p, &no_dictionaries)
            .unwrap()
            .unwrap();

        for w in 0..2 {
            for t in 0..2 {
                assert!((r.get(w, t) + 0.1).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn decorrelator_penalizes_shared_mass() {
        let p = matrix(&[&[0.8, 0.2]], &[DEFAULT_CLASS]);
        let n = matrix(&[&[1.0, 1.0]], &[DEFAULT_CLASS]);

        let config = RegularizerConfig {
            name: "decorrelate".to_string(),
            tau: 1.0,
            gamma: None,
            spec: RegularizerSpec::DecorrelatorPhi {
                topic_names: Vec::new(),
                class_ids: Vec::new(),
            },
        };

        let r = regularize_phi(&[config], &n, &p, &no_dictionaries)
            .unwrap()
            .unwrap();

        assert!((r.get(0, 0) + 0.8 * 0.2).abs() < 1e-6);
        assert!((r.get(0, 1) + 0.2 * 0.8).abs() < 1e-6);
    }

    #[test]
    fn specified_sparse_cancels_everything_but_top_k() {
        let n = matrix(
            &[&[5.0, 0.0], &[3.0, 0.0], &[1.0, 0.0]],
            &[DEFAULT_CLASS, DEFAULT_CLASS, DEFAULT_CLASS],
        );
        let p = matrix(
            &[&[0.5, 0.5], &[0.3, 0.3], &[0.2, 0.2]],
            &[DEFAULT_CLASS, DEFAULT_CLASS, DEFAULT_CLASS],
        );

        let config = RegularizerConfig {
            name: "sparse".to_string(),
            tau: 1.0,
            gamma: None,
            spec: RegularizerSpec::SpecifiedSparsePhi {
                class_id: DEFAULT_CLASS.to_string(),
                max_elements_count: 2,
                sparse_by_columns: true,
            },
        };

        let r = regularize_phi(&[config], &n, &p, &no_dictionaries)
            .unwrap()
            .unwrap();

        // The weakest row of column 0 gets cancelled, the top two stay.
        assert_eq!(r.get(0, 0), 0.0);
        assert_eq!(r.get(1, 0), 0.0);
        assert_eq!(r.get(2, 0), -1.0);
    }

    #[test]
    fn missing_dictionary_is_reported() {
        let n = matrix(&[&[1.0]], &[DEFAULT_CLASS]);
        let p = matrix(&[&[1.0]], &[DEFAULT_CLASS]);

        let config = RegularizerConfig {
            name: "coherence".to_string(),
            tau: 1.0,
            gamma: None,
            spec: RegularizerSpec::ImproveCoherencePhi {
                topic_names: Vec::new(),
                class_ids: Vec::new(),
                dictionary_name: "absent".to_string(),
            },
        };

        assert!(matches!(
            regularize_phi(&[config], &n, &p, &no_dictionaries),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn relative_gamma_rescales_by_topic_mass() {
        let n = matrix(&[&[10.0, 0.0]], &[DEFAULT_CLASS]);
        let p = matrix(&[&[1.0, 0.0]], &[DEFAULT_CLASS]);

        let config = RegularizerConfig {
            name: "smooth".to_string(),
            tau: 1.0,
            gamma: Some(1.0),
            spec: RegularizerSpec::SmoothSparsePhi {
                topic_names: Vec::new(),
                class_ids: Vec::new(),
                dictionary_name: None,
            },
        };

        let r = regularize_phi(&[config], &n, &p, &no_dictionaries)
            .unwrap()
            .unwrap();

        // Unit contribution 1 rescaled by n_t / |r|_t = 10 / 1.
        assert!((r.get(0, 0) - 10.0).abs() < 1e-6);
    }
}
