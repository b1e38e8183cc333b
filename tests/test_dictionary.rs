use artm::batch::{list_batches, Batch};
use artm::dictionary::FilterSpec;
use artm::master::{GetTopicModelArgs, InitializeModelArgs};
use artm::{Error, MasterModel};

use crate::support::{base_config, batch_ids, corpus};

#[test]
fn gathered_statistics_match_the_corpus() {
    let batches = corpus();
    let ids = batch_ids(&batches);

    let master = MasterModel::new(base_config(2)).unwrap();
    master.import_batches(batches).unwrap();
    master.gather_dictionary("dictionary", &ids).unwrap();

    let data = master.get_dictionary("dictionary").unwrap();
    assert_eq!(data.token, vec!["a", "b", "c", "d"]);
    assert_eq!(data.num_items, 4);

    let b = data.token.iter().position(|t| t == "b").unwrap();
    assert_eq!(data.token_df[b], 3.0);
    assert_eq!(data.token_tf[b], 4.0);

    let a = data.token.iter().position(|t| t == "a").unwrap();
    assert_eq!(data.token_df[a], 1.0);
    assert_eq!(data.token_tf[a], 2.0);
}

#[test]
fn filtering_produces_a_new_dictionary() {
    let batches = corpus();
    let ids = batch_ids(&batches);

    let master = MasterModel::new(base_config(2)).unwrap();
    master.import_batches(batches).unwrap();
    master.gather_dictionary("dictionary", &ids).unwrap();

    master
        .filter_dictionary(
            "dictionary",
            "frequent",
            &FilterSpec {
                min_df: Some(3.0),
                ..FilterSpec::default()
            },
        )
        .unwrap();

    let filtered = master.get_dictionary("frequent").unwrap();
    assert_eq!(filtered.token, vec!["b"]);

    // The source dictionary is untouched.
    assert_eq!(master.get_dictionary("dictionary").unwrap().token.len(), 4);
}

#[test]
fn dictionary_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corpus.dict");

    let batches = corpus();
    let ids = batch_ids(&batches);

    let master = MasterModel::new(base_config(2)).unwrap();
    master.import_batches(batches).unwrap();
    master.gather_dictionary("dictionary", &ids).unwrap();
    master.export_dictionary("dictionary", &path).unwrap();

    master.import_dictionary("restored", &path).unwrap();

    let original = master.get_dictionary("dictionary").unwrap();
    let restored = master.get_dictionary("restored").unwrap();

    assert_eq!(original.token, restored.token);
    assert_eq!(original.token_tf, restored.token_tf);
    assert_eq!(original.token_df, restored.token_df);
    assert_eq!(original.token_value, restored.token_value);
}

#[test]
fn corrupted_dictionary_files_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.dict");
    std::fs::write(&path, b"\x00\x01garbage").unwrap();

    let master = MasterModel::new(base_config(2)).unwrap();
    assert!(matches!(
        master.import_dictionary("broken", &path),
        Err(Error::CorruptedMessage(_))
    ));
}

#[test]
fn batches_train_straight_from_disk() {
    let dir = tempfile::tempdir().unwrap();

    let mut paths = Vec::new();
    for batch in corpus() {
        let path = dir.path().join(format!("{}.batch", batch.id));
        batch.save(&path).unwrap();
        paths.push(path.to_string_lossy().to_string());
    }

    let listed = list_batches(dir.path()).unwrap();
    assert_eq!(listed.len(), 2);

    let master = MasterModel::new(base_config(2)).unwrap();
    master.gather_dictionary("dictionary", &paths).unwrap();
    master
        .initialize_model(&InitializeModelArgs {
            dictionary_name: "dictionary".to_string(),
            seed: 3,
            ..InitializeModelArgs::default()
        })
        .unwrap();

    master.fit_offline(&paths, 2).unwrap();

    let model = master.get_topic_model(&GetTopicModelArgs::default()).unwrap();
    assert_eq!(model.token.len(), 4);
}

#[test]
fn loading_a_batch_without_id_falls_back_to_its_filename() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = "0f8fad5b-d9cb-469f-a165-70867728950e";
    let path = dir.path().join(format!("{}.batch", uuid));

    let mut batch = corpus().remove(0);
    batch.id = String::new();

    // Bypass save's validation by serializing directly.
    let file = std::fs::File::create(&path).unwrap();
    bincode::serialize_into(file, &batch).unwrap();

    let loaded = Batch::load(&path).unwrap();
    assert_eq!(loaded.id, uuid);
}
