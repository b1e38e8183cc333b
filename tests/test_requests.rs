use artm::master::{GetThetaMatrixArgs, GetTopicModelArgs, MatrixLayout};
use artm::Error;

use crate::support::{base_config, fitted_master};

#[test]
fn sparse_and_dense_projections_agree() {
    let (master, ids) = fitted_master(base_config(3), 9);
    master.fit_offline(&ids, 2).unwrap();

    let eps = 0.05f32;
    let subset = Some(vec!["topic2".to_string(), "topic0".to_string()]);

    let dense = master
        .get_topic_model(&GetTopicModelArgs {
            topic_names: subset.clone(),
            layout: MatrixLayout::Dense,
            ..GetTopicModelArgs::default()
        })
        .unwrap();

    let sparse = master
        .get_topic_model(&GetTopicModelArgs {
            topic_names: subset,
            layout: MatrixLayout::Sparse,
            eps: Some(eps),
            ..GetTopicModelArgs::default()
        })
        .unwrap();

    assert_eq!(dense.token, sparse.token);
    assert_eq!(dense.topic_name, sparse.topic_name);

    for w in 0..dense.token.len() {
        let mut seen = vec![false; dense.topic_name.len()];

        // Emitted sparse cells carry exactly the dense values.
        for (&t, &value) in sparse.topic_indices[w].iter().zip(&sparse.token_weights[w]) {
            assert_eq!(value, dense.token_weights[w][t as usize]);
            seen[t as usize] = true;
        }

        // Omitted cells are all below eps.
        for (t, &value) in dense.token_weights[w].iter().enumerate() {
            if !seen[t] {
                assert!(value.abs() < eps);
            }
        }
    }
}

#[test]
fn unknown_topic_projection_is_reported() {
    let (master, _) = fitted_master(base_config(2), 9);

    let request = master.get_topic_model(&GetTopicModelArgs {
        topic_names: Some(vec!["nope".to_string()]),
        ..GetTopicModelArgs::default()
    });

    assert!(matches!(request, Err(Error::NotFound(_))));
}

#[test]
fn class_and_keyword_projections_filter_rows() {
    let (master, _) = fitted_master(base_config(2), 9);

    let projected = master
        .get_topic_model(&GetTopicModelArgs {
            keywords: Some(vec!["a".to_string(), "d".to_string()]),
            ..GetTopicModelArgs::default()
        })
        .unwrap();

    assert_eq!(projected.token, vec!["a", "d"]);
}

#[test]
fn export_import_round_trips_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");

    let (master, ids) = fitted_master(base_config(3), 11);
    master.fit_offline(&ids, 2).unwrap();

    let before = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    master.export_model("pwt", &path).unwrap();

    master.dispose_model("pwt").unwrap();
    master.import_model(&path).unwrap();

    let after = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(before.topic_name, after.topic_name);
    assert_eq!(before.token, after.token);
    assert_eq!(before.token_weights, after.token_weights);
}

#[test]
fn import_of_garbage_is_a_corrupted_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    std::fs::write(&path, b"not a model").unwrap();

    let (master, _) = fitted_master(base_config(2), 11);
    assert!(matches!(
        master.import_model(&path),
        Err(Error::CorruptedMessage(_))
    ));
}

#[test]
fn attached_buffer_writes_are_observed() {
    let (master, _) = fitted_master(base_config(2), 13);

    let attachment = master.attach_model("pwt").unwrap();
    assert_eq!(attachment.token_size, 4);
    assert_eq!(attachment.topic_size, 2);

    attachment.buffer.write().unwrap()[0] = 0.42;

    let model = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(model.token_weights[0][0], 0.42);

    // The topic axis is frozen while the attachment lives.
    assert!(matches!(
        master.reconfigure_topic_names(vec!["other".to_string()]),
        Err(Error::InvalidOperation(_))
    ));

    drop(attachment);
    master
        .reconfigure_topic_names(vec!["other".to_string()])
        .unwrap();
}

#[test]
fn theta_cache_feeds_theta_requests() {
    let mut config = base_config(3);
    config.cache_theta = true;

    let (master, ids) = fitted_master(config, 17);
    master.fit_offline(&ids, 1).unwrap();

    let theta = master.get_theta_matrix(&GetThetaMatrixArgs::default()).unwrap();
    assert_eq!(theta.num_items(), 4);
    assert_eq!(theta.item_titles.len(), 4);

    for weights in &theta.item_weights {
        let sum: f32 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    let sparse = master
        .get_theta_matrix(&GetThetaMatrixArgs {
            layout: MatrixLayout::Sparse,
            eps: Some(0.01),
            ..GetThetaMatrixArgs::default()
        })
        .unwrap();
    assert!(sparse.is_sparse());

    master.clear_theta_cache();
    let empty = master.get_theta_matrix(&GetThetaMatrixArgs::default()).unwrap();
    assert_eq!(empty.num_items(), 0);
}

#[test]
fn theta_requests_without_cache_are_invalid() {
    let (master, ids) = fitted_master(base_config(2), 17);
    master.fit_offline(&ids, 1).unwrap();

    assert!(matches!(
        master.get_theta_matrix(&GetThetaMatrixArgs::default()),
        Err(Error::InvalidOperation(_))
    ));
}
