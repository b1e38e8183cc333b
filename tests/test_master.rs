use artm::master::{GetTopicModelArgs, MasterModelConfig, MergeModelArgs};
use artm::phi::TopicModel;
use artm::{Error, MasterModel};

use crate::support::{assert_models_close, base_config, fitted_master, topic_names};

#[test]
fn empty_master_reports_its_configuration() {
    let config = MasterModelConfig {
        topic_names: topic_names(2),
        num_processors: 2,
        ..MasterModelConfig::default()
    };

    let master = MasterModel::new(config).unwrap();
    let info = master.get_master_info();

    assert_eq!(info.num_processors, 2);
    assert!(info.matrices.is_empty());
    assert_eq!(info.batches, 0);
}

#[test]
fn overwrite_model_adopts_the_message_axes() {
    let master = MasterModel::new(MasterModelConfig::with_topics(&["a", "b", "c", "d", "e"]))
        .unwrap();

    let model = TopicModel {
        name: "pwt".to_string(),
        topic_name: topic_names(5),
        token: vec!["t1".to_string(), "t2".to_string()],
        class_id: Vec::new(),
        transaction_typename: Vec::new(),
        token_weights: vec![
            vec![0.0, 0.1, 0.2, 0.3, 0.4],
            vec![5.0 / 15.0, 4.0 / 15.0, 3.0 / 15.0, 2.0 / 15.0, 1.0 / 15.0],
        ],
        topic_indices: Vec::new(),
    };

    master.overwrite_model(&model).unwrap();

    let returned = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(returned.token, vec!["t1", "t2"]);
    assert_eq!(returned.topic_name, topic_names(5));
    assert_models_close(&returned, &model, 1e-7);
}

#[test]
fn overwrite_of_a_request_is_identity() {
    let (master, ids) = fitted_master(base_config(3), 3);
    master.fit_offline(&ids, 2).unwrap();

    let before = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    master.overwrite_model(&before).unwrap();
    let after = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();

    assert_eq!(before.token_weights, after.token_weights);
}

#[test]
fn merge_with_unit_weight_is_identity() {
    let (master, ids) = fitted_master(base_config(3), 2);
    master.fit_offline(&ids, 1).unwrap();

    master
        .merge_model(&MergeModelArgs {
            sources: vec![("pwt".to_string(), 1.0)],
            target: "copy".to_string(),
            topic_names: None,
            dictionary_name: Some("dictionary".to_string()),
        })
        .unwrap();

    let original = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    let copy = master
        .get_topic_model(&GetTopicModelArgs {
            model_name: Some("copy".to_string()),
            ..GetTopicModelArgs::default()
        })
        .unwrap();

    assert_models_close(&original, &copy, 1e-7);
}

#[test]
fn merge_restricts_topics_and_zero_fills_unknown_ones() {
    let (master, _) = fitted_master(base_config(2), 2);

    master
        .merge_model(&MergeModelArgs {
            sources: vec![("pwt".to_string(), 1.0)],
            target: "wider".to_string(),
            topic_names: Some(vec!["topic1".to_string(), "brand_new".to_string()]),
            dictionary_name: None,
        })
        .unwrap();

    let wider = master
        .get_topic_model(&GetTopicModelArgs {
            model_name: Some("wider".to_string()),
            ..GetTopicModelArgs::default()
        })
        .unwrap();
    let original = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();

    assert_eq!(wider.topic_name, vec!["topic1", "brand_new"]);

    for (w, row) in wider.token_weights.iter().enumerate() {
        assert_eq!(row[0], original.token_weights[w][1]);
        assert_eq!(row[1], 0.0);
    }
}

#[test]
fn merge_topic_mismatch_against_missing_source_is_reported() {
    let (master, _) = fitted_master(base_config(2), 2);

    let missing = master.merge_model(&MergeModelArgs {
        sources: vec![("nope".to_string(), 1.0)],
        target: "out".to_string(),
        topic_names: None,
        dictionary_name: None,
    });

    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[test]
fn name_collisions_and_missing_names_follow_the_taxonomy() {
    let (master, _) = fitted_master(base_config(2), 2);

    // The gathered dictionary already exists.
    let duplicate = master.create_dictionary(&master.get_dictionary("dictionary").unwrap());
    assert!(matches!(duplicate, Err(Error::AlreadyExists(_))));

    assert!(matches!(
        master.get_dictionary("absent"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        master.dispose_dictionary("absent"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        master.dispose_model("absent"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        master.dispose_batch("absent"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        master.dispose_regularizer("absent"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(master.get_score("absent"), Err(Error::NotFound(_))));
}

#[test]
fn dispose_removes_objects() {
    let (master, ids) = fitted_master(base_config(2), 2);

    master.dispose_dictionary("dictionary").unwrap();
    assert!(master.get_dictionary("dictionary").is_err());

    master.dispose_batch(&ids[0]).unwrap();
    assert!(master.fit_offline(&ids, 1).is_err());

    master.dispose_model("pwt").unwrap();
    assert!(master
        .get_topic_model(&GetTopicModelArgs::default())
        .is_err());
}

#[test]
fn dispose_regularizer_removes_the_config_entry() {
    use artm::regularizers::{RegularizerConfig, RegularizerSpec};

    let mut config = base_config(2);
    config.regularizers.push(RegularizerConfig {
        name: "smooth".to_string(),
        tau: -0.1,
        gamma: None,
        spec: RegularizerSpec::SmoothSparsePhi {
            topic_names: Vec::new(),
            class_ids: Vec::new(),
            dictionary_name: None,
        },
    });

    let (master, ids) = fitted_master(config, 2);
    assert_eq!(master.config().regularizers.len(), 1);

    master.dispose_regularizer("smooth").unwrap();
    assert!(master.config().regularizers.is_empty());
    assert!(matches!(
        master.dispose_regularizer("smooth"),
        Err(Error::NotFound(_))
    ));

    // Later passes run without the disposed regularizer.
    master.fit_offline(&ids, 1).unwrap();
}

#[test]
fn gamma_outside_unit_interval_is_rejected() {
    use artm::regularizers::{RegularizerConfig, RegularizerSpec};

    let mut config = base_config(2);
    config.regularizers.push(RegularizerConfig {
        name: "smooth".to_string(),
        tau: 0.1,
        gamma: Some(1.5),
        spec: RegularizerSpec::SmoothSparsePhi {
            topic_names: Vec::new(),
            class_ids: Vec::new(),
            dictionary_name: None,
        },
    });

    assert!(matches!(
        MasterModel::new(config),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn duplicate_clones_state_independently() {
    let (master, ids) = fitted_master(base_config(3), 4);
    master.fit_offline(&ids, 2).unwrap();

    let clone = master.duplicate().unwrap();

    let original = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    let cloned = clone.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(original.token_weights, cloned.token_weights);

    assert_eq!(
        master.get_score_array("perplexity").unwrap(),
        clone.get_score_array("perplexity").unwrap()
    );

    // Fitting the clone further leaves the original untouched.
    clone.fit_offline(&ids, 1).unwrap();
    let original_after = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(original.token_weights, original_after.token_weights);
}

#[test]
fn reconfigure_keeps_the_topic_axis() {
    let (master, _) = fitted_master(base_config(2), 2);

    let mut config = (*master.config()).clone();
    config.num_document_passes = 5;
    master.reconfigure(config).unwrap();
    assert_eq!(master.config().num_document_passes, 5);

    let mut config = (*master.config()).clone();
    config.topic_names = topic_names(4);
    assert!(matches!(
        master.reconfigure(config),
        Err(Error::InvalidOperation(_))
    ));
}

#[test]
fn reconfigure_topic_names_reshapes_models() {
    let (master, _) = fitted_master(base_config(2), 2);

    let renamed = vec![
        "topic1".to_string(),
        "topic0".to_string(),
        "fresh".to_string(),
    ];
    master.reconfigure_topic_names(renamed.clone()).unwrap();

    let model = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(model.topic_name, renamed);

    for row in &model.token_weights {
        assert_eq!(row[2], 0.0);
    }
}

#[test]
fn registry_round_trip() {
    let id = artm::registry::create(MasterModelConfig::with_topics(&["only"])).unwrap();

    let master = artm::registry::get(id).unwrap();
    assert_eq!(master.config().topic_names, vec!["only"]);

    artm::registry::dispose(id).unwrap();
    assert!(matches!(artm::registry::get(id), Err(Error::NotFound(_))));
}
