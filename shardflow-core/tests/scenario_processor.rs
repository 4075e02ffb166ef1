//! End-to-end runs over an in-process worker group and JSON containers

use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shardflow_core::comm::{Channel, LocalGroup};
use shardflow_core::config::{Mode, OnError};
use shardflow_core::data::{MetadataRecord, Parameters, Scalar, SeriesItem};
use shardflow_core::processor::builtin;
use shardflow_core::processor::{transform, TransformOutput};
use shardflow_core::store::json::{StoredAuxiliary, UnitEntry};
use shardflow_core::store::Document;
use shardflow_core::{Processor, ProcessorConfig, Result, RunReport, ShardflowError};

/// Auxiliary source with one record per key under `tag`
fn aux_source(dir: &Path, name: &str, tag: &str, keys: usize, scale: f64) -> PathBuf {
    let mut doc = Document::default();
    doc.add_event(&MetadataRecord::new("ev1", serde_json::json!({"depth_km": 24.4})));

    let group = doc.auxiliary.entry(tag.into()).or_default();
    for i in 0..keys {
        group.insert(
            format!("K{:02}", i),
            StoredAuxiliary {
                data: vec![i as f64 * scale, 1.0],
                parameters: Parameters::new(),
                crc32c: None,
            },
        );
    }

    let path = dir.join(name);
    doc.save(&path).unwrap();
    path
}

async fn run_local(processor: Arc<Processor>, workers: u32) -> Vec<Result<RunReport>> {
    let mut handles = Vec::new();
    for channel in LocalGroup::channels(workers) {
        let processor = processor.clone();
        let channel: Arc<dyn Channel> = Arc::new(channel);
        handles.push(tokio::spawn(async move { processor.run(channel).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

fn difference_config(dir: &Path, observed: usize, synthetic: usize) -> ProcessorConfig {
    let a = aux_source(dir, "observed.json", "raw", observed, 2.0);
    let b = aux_source(dir, "synthetic.json", "synthetic", synthetic, 1.0);

    let mut config = ProcessorConfig::new([a, b])
        .with_sink(dir.join("out").join("misfit.json"))
        .with_mode(Mode::AuxiliaryItem);
    config.output_tag = Some("misfit".into());
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_two_sources_nine_keys_three_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = difference_config(dir.path(), 11, 9);
    let sink = config.sink.clone().unwrap();

    let processor = Arc::new(Processor::new(config, builtin::lookup("difference").unwrap()));
    let reports: Vec<RunReport> = run_local(processor, 3)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    for report in &reports {
        assert_eq!(report.owned, 3, "Worker {} owns the wrong count", report.rank);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);
        assert!(report.wrote);
    }

    let doc = Document::load(&sink).unwrap();
    assert_eq!(doc.events.len(), 1, "Events should be copied once");

    let misfit = &doc.auxiliary["misfit"];
    assert_eq!(misfit.len(), 9, "Incomplete keys must not be processed");
    assert!(!misfit.contains_key("K09"));
    let k04 = &misfit["K04"];
    assert_eq!(k04.data, vec![4.0, 0.0]);
    assert_eq!(k04.parameters["misfit"], Scalar::Float(2.0));
    assert!(!sink.with_extension("json.lock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_key_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = difference_config(dir.path(), 10, 10);
    config.pass_accessor = true;
    let sink = config.sink.clone().unwrap();

    let fail_on_k04 = transform(|inputs| {
        let accessor = inputs[0].accessor().ok_or("expected accessors")?;
        if accessor.key() == "K04" {
            return Err("synthetic blew up".into());
        }
        builtin::difference(inputs)
    });
    let processor = Arc::new(Processor::new(config, fail_on_k04));

    let reports: Vec<RunReport> = run_local(processor, 2)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let processed: usize = reports.iter().map(|r| r.processed).sum();
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    assert_eq!((processed, failed), (9, 1));

    let errors: Vec<&String> = reports.iter().flat_map(|r| r.errors.iter()).collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("K04"));
    assert!(errors[0].contains("synthetic blew up"));

    let doc = Document::load(&sink).unwrap();
    assert_eq!(doc.auxiliary["misfit"].len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_raise_policy_fails_owner_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = difference_config(dir.path(), 9, 9);
    config.pass_accessor = true;
    config.on_error = OnError::Raise;

    let fail_on_k02 = transform(|inputs| {
        if inputs[0].accessor().map(|a| a.key()) == Some("K02") {
            return Err("boom".into());
        }
        Ok(TransformOutput::None)
    });
    let processor = Arc::new(Processor::new(config, fail_on_k02));

    let results = run_local(processor, 3).await;
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(matches!(
        results[2],
        Err(ShardflowError::Transform { ref key, .. }) if key == "K02"
    ));
}

#[tokio::test]
async fn test_callback_policy_collects_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = difference_config(dir.path(), 9, 9);
    config.on_error = OnError::Callback;
    config.sink = None;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let collected = seen.clone();
    let processor = Processor::new(config, transform(|_| Err("always".into())))
        .on_error(move |e| collected.lock().push(e.to_string()));

    let results = run_local(Arc::new(processor), 1).await;
    let report = results.into_iter().next().unwrap().unwrap();

    assert_eq!(report.failed, 9);
    assert!(!report.wrote);
    assert_eq!(seen.lock().len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pairwise_accessors_see_fellows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = difference_config(dir.path(), 9, 9);
    config.pass_accessor = true;
    config.pairwise = true;
    config.sink = None;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let check_fellows = transform(move |inputs| {
        counter.fetch_add(1, Ordering::SeqCst);
        for input in inputs {
            let accessor = input.accessor().ok_or("expected accessors")?;
            if accessor.fellows().len() != 9 {
                return Err(format!("{} fellows", accessor.fellows().len()).into());
            }
            if !accessor.fellows().iter().any(|f| f.key() == accessor.key()) {
                return Err("own key missing from fellows".into());
            }
        }
        Ok(TransformOutput::None)
    });
    let processor = Arc::new(Processor::new(config, check_fellows));

    let reports: Vec<RunReport> = run_local(processor, 2)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 9);
    assert!(reports.iter().all(|r| r.failed == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_copy_collections_forwards_inventory() {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2011, 3, 11, 5, 46, 24).unwrap();

    let mut doc = Document::default();
    for name in ["II.BFO", "IU.ANMO", "G.SSB"] {
        let key = Document::unit_key(name);
        let mut entry = UnitEntry::default();
        entry.inventory = Some(MetadataRecord::new(name, serde_json::json!({"code": name})));
        entry.series.insert(
            "raw".into(),
            vec![
                SeriesItem::new(key.clone(), "Z", start, 1.0, vec![1.0, 2.0]),
                SeriesItem::new(key.clone(), "N", start, 1.0, vec![3.0, 4.0]),
            ],
        );
        doc.units.insert(name.into(), entry);
    }
    let source = dir.path().join("raw.json");
    doc.save(&source).unwrap();

    let mut config = ProcessorConfig::new([source])
        .with_sink(dir.path().join("copy.json"))
        .with_mode(Mode::SeriesCollection);
    config.output_tag = Some("processed".into());
    let sink = config.sink.clone().unwrap();

    let processor = Arc::new(Processor::new(config, builtin::lookup("copy").unwrap()));
    for result in run_local(processor, 2).await {
        result.unwrap();
    }

    let out = Document::load(&sink).unwrap();
    assert_eq!(out.units.len(), 3);
    let bfo = &out.units["II_BFO"];
    assert_eq!(bfo.series["processed"].len(), 2);
    assert_eq!(bfo.inventory.as_ref().unwrap().id, "II.BFO");
}

#[tokio::test]
async fn test_invalid_config_fails_every_worker_fast() {
    let mut config = ProcessorConfig::new(["a.json"]);
    config.pairwise = true;

    let processor = Arc::new(Processor::new(config, transform(|_| Ok(TransformOutput::None))));
    for result in run_local(processor, 3).await {
        assert!(result.unwrap_err().is_config());
    }
}

#[test]
fn test_access_lists_complete_keys() {
    let dir = tempfile::tempdir().unwrap();
    let a = aux_source(dir.path(), "a.json", "raw", 4, 1.0);

    let config = ProcessorConfig::new([a.clone(), a]).with_mode(Mode::AuxiliaryItem);
    let processor = Processor::new(config, transform(|_| Ok(TransformOutput::None)));

    let accessors = processor.access().unwrap();
    assert_eq!(accessors.len(), 4);
    for (i, per_source) in accessors.iter().enumerate() {
        assert_eq!(per_source.len(), 2);
        assert_eq!(per_source[0].key(), format!("K{:02}", i));
        assert_eq!(per_source[1].tag(), "raw");
        assert!(per_source[0].fellows().is_empty());
    }
}
