mod phi;
mod theta;

pub use phi::{regularize_phi, DictionaryResolver};
pub use theta::ThetaRegularizers;

use crate::{Error, Result};

/// One configured regularizer instance. `tau` scales the contribution;
/// `gamma`, when set, blends in a data-scale term so that tau does not
/// have to be retuned when the collection grows (relative
/// regularization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularizerConfig {
    pub name: String,
    pub tau: f32,
    pub gamma: Option<f32>,
    pub spec: RegularizerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegularizerSpec {
    SmoothSparseTheta {
        topic_names: Vec<String>,
        // Per-inner-iteration multipliers on tau; missing entries mean 1.
        alpha_iter: Vec<f32>,
    },
    TopicSelectionTheta {
        topic_names: Vec<String>,
    },
    SmoothPtdw {},
    SmoothSparsePhi {
        topic_names: Vec<String>,
        class_ids: Vec<String>,
        dictionary_name: Option<String>,
    },
    DecorrelatorPhi {
        topic_names: Vec<String>,
        class_ids: Vec<String>,
    },
    LabelRegularizationPhi {
        topic_names: Vec<String>,
        class_ids: Vec<String>,
        dictionary_name: Option<String>,
    },
    ImproveCoherencePhi {
        topic_names: Vec<String>,
        class_ids: Vec<String>,
        dictionary_name: String,
    },
    SpecifiedSparsePhi {
        class_id: String,
        max_elements_count: usize,
        sparse_by_columns: bool,
    },
}

impl RegularizerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(gamma) = self.gamma {
            if !(0.0..=1.0).contains(&gamma) {
                return Err(Error::InvalidArgument(format!(
                    "regularizer {}: gamma {} outside [0, 1]",
                    self.name, gamma
                )));
            }
        }

        if let RegularizerSpec::SpecifiedSparsePhi {
            max_elements_count, ..
        } = &self.spec
        {
            if *max_elements_count == 0 {
                return Err(Error::InvalidArgument(format!(
                    "regularizer {}: max_elements_count must be positive",
                    self.name
                )));
            }
        }

        Ok(())
    }

    pub fn is_theta(&self) -> bool {
        matches!(
            self.spec,
            RegularizerSpec::SmoothSparseTheta { .. }
                | RegularizerSpec::TopicSelectionTheta { .. }
                | RegularizerSpec::SmoothPtdw {}
        )
    }

    pub fn is_ptdw(&self) -> bool {
        matches!(self.spec, RegularizerSpec::SmoothPtdw {})
    }

    pub fn is_phi(&self) -> bool {
        !self.is_theta()
    }
}
