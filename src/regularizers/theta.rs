use super::{RegularizerConfig, RegularizerSpec};
use crate::{Error, Result};

enum ThetaKind {
    SmoothSparse { alpha_iter: Vec<f32> },
    TopicSelection,
}

struct ThetaEntry {
    tau: f32,
    kind: ThetaKind,
    // One flag per topic of the model; None means all topics.
    mask: Option<Vec<bool>>,
}

/// Theta regularizers of one model, resolved against its topic axis so
/// the processor can apply them per item without name lookups.
pub struct ThetaRegularizers {
    entries: Vec<ThetaEntry>,
    ptdw_taus: Vec<f32>,
}

fn topic_mask(topic_names: &[String], selected: &[String]) -> Result<Option<Vec<bool>>> {
    if selected.is_empty() {
        return Ok(None);
    }

    let mut mask = vec![false; topic_names.len()];

    for name in selected {
        let position = topic_names
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        mask[position] = true;
    }

    Ok(Some(mask))
}

impl ThetaRegularizers {
    pub fn resolve(configs: &[RegularizerConfig], topic_names: &[String]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut ptdw_taus = Vec::new();

        for config in configs.iter().filter(|c| c.is_theta()) {
            config.validate()?;

            match &config.spec {
                RegularizerSpec::SmoothSparseTheta {
                    topic_names: selected,
                    alpha_iter,
                } => entries.push(ThetaEntry {
                    tau: config.tau,
                    kind: ThetaKind::SmoothSparse {
                        alpha_iter: alpha_iter.clone(),
                    },
                    mask: topic_mask(topic_names, selected)?,
                }),
                RegularizerSpec::TopicSelectionTheta {
                    topic_names: selected,
                } => entries.push(ThetaEntry {
                    tau: config.tau,
                    kind: ThetaKind::TopicSelection,
                    mask: topic_mask(topic_names, selected)?,
                }),
                RegularizerSpec::SmoothPtdw {} => ptdw_taus.push(config.tau),
                _ => {}
            }
        }

        Ok(Self { entries, ptdw_taus })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.ptdw_taus.is_empty()
    }

    pub fn has_ptdw(&self) -> bool {
        !self.ptdw_taus.is_empty()
    }

    /// Adds the regularizer contributions for one inner iteration into
    /// `r`, given the item's current theta.
    pub fn apply(&self, inner_iter: usize, theta: &[f32], r: &mut [f32]) {
        for entry in &self.entries {
            match &entry.kind {
                ThetaKind::SmoothSparse { alpha_iter } => {
                    let alpha = alpha_iter.get(inner_iter).copied().unwrap_or(1.0);
                    let value = entry.tau * alpha;

                    for (t, rt) in r.iter_mut().enumerate() {
                        if entry.mask.as_ref().is_none_or(|m| m[t]) {
                            *rt += value;
                        }
                    }
                }
                ThetaKind::TopicSelection => {
                    // Damps (or with a negative tau, boosts) topics in
                    // proportion to their current share of the item.
                    for (t, rt) in r.iter_mut().enumerate() {
                        if entry.mask.as_ref().is_none_or(|m| m[t]) {
                            *rt -= entry.tau * theta[t];
                        }
                    }
                }
            }
        }
    }

    /// Positional smoothing over p(t|d,w): every token's posterior is
    /// pulled towards its sequence neighbors. `ptdw` is one row of T
    /// probabilities per token occurrence.
    pub fn apply_ptdw(&self, ptdw: &mut [Vec<f32>]) {
        for &tau in &self.ptdw_taus {
            if ptdw.len() < 2 || tau <= 0.0 {
                continue;
            }

            let source = ptdw.to_vec();
            let last = source.len() - 1;

            for (i, row) in ptdw.iter_mut().enumerate() {
                // At either end the missing neighbor is the token itself.
                let prev = &source[i.saturating_sub(1)];
                let next = &source[(i + 1).min(last)];

                let mut sum = 0.0;
                for t in 0..row.len() {
                    let neighbor = 0.5 * (prev[t] + next[t]);
                    row[t] = (row[t] + tau * neighbor) / (1.0 + tau);
                    sum += row[t];
                }

                if sum > 0.0 {
                    crate::blas::sscale(1.0 / sum, row);
                }
            }
        }
    }
}
