//! Registry publish/atomicity scenarios: concurrent readers never observe a
//! half-written entry, and a later failed run never displaces the last
//! successfully published one.

use std::collections::HashMap;
use std::sync::Arc;

use txn_ml_pipeline::model::EncoderConfig;
use txn_ml_pipeline::registry::Registry;
use txn_ml_pipeline::trainer::gbm;

fn toy_model(classes: &[String]) -> gbm::GbmModel {
    let rows = vec![vec![0.0; 10], vec![1.0; 10]];
    let (model, _) = gbm::train(&rows, &[0, 1], &[1.0, 1.0], classes, 3, 2, 11, None);
    model
}

#[test]
fn concurrent_readers_always_see_a_fully_formed_entry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let classes = vec!["a".to_string(), "b".to_string()];
    let encoder_config = EncoderConfig {
        num_hash_buckets: 10,
        hash_seed: 1,
        channel_vocab: vec![],
    };
    let model = toy_model(&classes);
    registry
        .publish(
            "run-a",
            &classes,
            &encoder_config,
            &model,
            &HashMap::new(),
            &Default::default(),
        )
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let entry = registry.current().expect("entry must always be present once published");
                assert!(!entry.run_id.is_empty());
                assert_eq!(entry.classes.len(), 2);
            }
        }));
    }

    // Publish a second run concurrently with the readers above.
    let model2 = toy_model(&classes);
    registry
        .publish(
            "run-b",
            &classes,
            &encoder_config,
            &model2,
            &HashMap::new(),
            &Default::default(),
        )
        .unwrap();

    for h in handles {
        h.join().unwrap();
    }

    let current = registry.current().unwrap();
    assert_eq!(current.run_id, "run-b");
}

#[test]
fn gc_never_removes_the_published_run_even_if_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path()).unwrap();
    let classes = vec!["a".to_string()];
    let encoder_config = EncoderConfig {
        num_hash_buckets: 8,
        hash_seed: 1,
        channel_vocab: vec![],
    };

    for run_id in ["run-1", "run-2", "run-3"] {
        let model = toy_model(&classes);
        registry
            .publish(run_id, &classes, &encoder_config, &model, &HashMap::new(), &Default::default())
            .unwrap();
    }
    // "run-1" is oldest but no longer current; "run-3" is current.
    let removed = registry.gc(1).unwrap();
    assert!(removed >= 1);
    assert_eq!(registry.current().unwrap().run_id, "run-3");
    assert!(registry.load("run-3").unwrap().is_some());
}
