use artm::batch::{Batch, Item};
use artm::master::{InitializeModelArgs, MasterModel, MasterModelConfig};
use artm::scores::{PerplexityModelType, ScoreConfig, ScoreSpec, ScoreValue};
use artm::token::DEFAULT_CLASS;
use artm::TopicModel;

pub fn topic_names(n: usize) -> Vec<String> {
    (0..n).map(|t| format!("topic{}", t)).collect()
}

/// Two small batches over the vocabulary {a, b, c, d}.
pub fn corpus() -> Vec<Batch> {
    let batch_1 = Batch {
        id: "batch-1".to_string(),
        token: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        item: vec![
            Item {
                id: 0,
                title: "first".to_string(),
                token_id: vec![0, 1],
                token_weight: vec![2.0, 1.0],
                ..Item::default()
            },
            Item {
                id: 1,
                title: "second".to_string(),
                token_id: vec![1, 2],
                token_weight: vec![1.0, 3.0],
                ..Item::default()
            },
        ],
        ..Batch::default()
    };

    let batch_2 = Batch {
        id: "batch-2".to_string(),
        token: vec!["b".to_string(), "c".to_string(), "d".to_string()],
        item: vec![
            Item {
                id: 2,
                title: "third".to_string(),
                token_id: vec![0, 2],
                token_weight: vec![2.0, 1.0],
                ..Item::default()
            },
            Item {
                id: 3,
                title: "fourth".to_string(),
                token_id: vec![1, 2],
                token_weight: vec![1.0, 2.0],
                ..Item::default()
            },
        ],
        ..Batch::default()
    };

    vec![batch_1, batch_2]
}

pub fn batch_ids(batches: &[Batch]) -> Vec<String> {
    batches.iter().map(|b| b.id.clone()).collect()
}

/// Five single-item batches over the same vocabulary, for online and
/// async scenarios.
pub fn five_batches() -> Vec<Batch> {
    let vocabulary = ["a", "b", "c", "d"];

    (0..5)
        .map(|i| Batch {
            id: format!("online-{}", i),
            token: vocabulary.iter().map(|t| t.to_string()).collect(),
            item: vec![Item {
                id: i as i32,
                token_id: vec![(i % 4) as u32, ((i + 1) % 4) as u32],
                token_weight: vec![1.0 + i as f32, 2.0],
                ..Item::default()
            }],
            ..Batch::default()
        })
        .collect()
}

pub fn perplexity_score() -> ScoreConfig {
    ScoreConfig {
        name: "perplexity".to_string(),
        spec: ScoreSpec::Perplexity {
            class_ids: Vec::new(),
            model_type: PerplexityModelType::Document,
            dictionary_name: None,
        },
    }
}

pub fn base_config(topics: usize) -> MasterModelConfig {
    MasterModelConfig {
        topic_names: topic_names(topics),
        num_processors: 1,
        num_document_passes: 1,
        scores: vec![perplexity_score()],
        ..MasterModelConfig::default()
    }
}

/// A master over the tiny corpus: batches imported, a dictionary gathered
/// as "dictionary" and Φ initialized with the given seed.
pub fn fitted_master(config: MasterModelConfig, seed: u32) -> (MasterModel, Vec<String>) {
    let batches = corpus();
    let ids = batch_ids(&batches);

    let master = MasterModel::new(config).unwrap();
    master.import_batches(batches).unwrap();
    master.gather_dictionary("dictionary", &ids).unwrap();
    master
        .initialize_model(&InitializeModelArgs {
            model_name: None,
            dictionary_name: "dictionary".to_string(),
            seed,
        })
        .unwrap();

    (master, ids)
}

pub fn perplexity_value(value: &ScoreValue) -> f64 {
    match value {
        ScoreValue::Perplexity(score) => score.value,
        other => panic!("expected a perplexity score, got {:?}", other),
    }
}

/// Every (modality, topic) column of the projection must sum to one
/// within tolerance.
pub fn assert_column_stochastic(model: &TopicModel, tolerance: f32) {
    let mut classes: Vec<&str> = model.class_id.iter().map(|c| c.as_str()).collect();
    classes.sort_unstable();
    classes.dedup();

    if classes.is_empty() {
        classes.push(DEFAULT_CLASS);
    }

    for class in classes {
        for t in 0..model.topic_name.len() {
            let sum: f32 = model
                .token_weights
                .iter()
                .enumerate()
                .filter(|(w, _)| model.class_id.get(*w).map(|c| c.as_str()).unwrap_or(DEFAULT_CLASS) == class)
                .map(|(_, row)| row[t])
                .sum();

            assert!(
                (sum - 1.0).abs() < tolerance,
                "column ({}, {}) sums to {}",
                class,
                model.topic_name[t],
                sum
            );
        }
    }
}

pub fn assert_models_close(a: &TopicModel, b: &TopicModel, tolerance: f32) {
    assert_eq!(a.token, b.token);
    assert_eq!(a.topic_name, b.topic_name);

    for (row_a, row_b) in a.token_weights.iter().zip(&b.token_weights) {
        for (va, vb) in row_a.iter().zip(row_b) {
            assert!((va - vb).abs() <= tolerance, "{} != {}", va, vb);
        }
    }
}
