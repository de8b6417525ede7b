use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;

use serde_json::json;
use tar::{Builder, Header};
use tempfile::tempdir;

use shardmix::{
    DatasetIndex, OriginalMapping, RunConfig, RunController, RunPhase, ShardAssignment,
};

fn append(builder: &mut Builder<File>, name: &str, body: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, body).unwrap();
}

/// Train shard whose entries are `(name, status, caption)`.
fn write_train_shard(dir: &Path, file: &str, entries: &[(&str, &str, &str)]) {
    let mut builder = Builder::new(File::create(dir.join(file)).unwrap());
    for (name, status, caption) in entries {
        append(&mut builder, &format!("{name}.jpg"), format!("jpeg:{name}").as_bytes());
        let annotation = json!({ "status": status, "caption": caption, "key": name });
        append(
            &mut builder,
            &format!("{name}.json"),
            annotation.to_string().as_bytes(),
        );
    }
    builder.finish().unwrap();
}

fn write_validation_shard(dir: &Path, file: &str, entries: &[(&str, &str)]) {
    let mut builder = Builder::new(File::create(dir.join(file)).unwrap());
    for (name, _) in entries {
        append(&mut builder, &format!("{name}.jpg"), format!("jpeg:{name}").as_bytes());
    }
    for (name, caption) in entries {
        append(&mut builder, &format!("{name}.txt"), caption.as_bytes());
    }
    builder.finish().unwrap();
}

fn mapped_ids(target: &Path) -> Vec<String> {
    let mapping = OriginalMapping::load(OriginalMapping::default_path_in_dir(target)).unwrap();
    mapping.iter().map(|(_, id)| id.clone()).collect()
}

#[test]
fn rerunning_never_exceeds_target_or_duplicates_names() {
    let dataset = tempdir().unwrap();
    let target = tempdir().unwrap();
    write_train_shard(
        dataset.path(),
        "cc3m-train-000000.tar",
        &[
            ("a1", "success", "one"),
            ("a2", "failed_to_download", "two"),
            ("a3", "success", ""),
            ("a4", "success", "four"),
        ],
    );
    write_train_shard(
        dataset.path(),
        "cc3m-train-000001.tar",
        &[("b1", "success", "five"), ("b2", "success", "six")],
    );

    let first = RunController::new(RunConfig::train(dataset.path(), target.path(), 3)).run();
    assert_eq!(first.phase, RunPhase::Done);
    assert_eq!(first.final_count, 3);

    let second = RunController::new(RunConfig::train(dataset.path(), target.path(), 3)).run();
    assert_eq!(second.committed(), 0);

    let third = RunController::new(RunConfig::train(dataset.path(), target.path(), 10)).run();
    assert_eq!(third.final_count, 4);
    assert!(!third.target_met());

    let index = DatasetIndex::load(DatasetIndex::default_path_in_dir(target.path())).unwrap();
    assert_eq!(index.len(), 4);
    let ids = mapped_ids(target.path());
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(ids, vec!["0000001", "0000002", "0000003", "0000004"]);

    let mapping =
        OriginalMapping::load(OriginalMapping::default_path_in_dir(target.path())).unwrap();
    assert!(!mapping.contains("a2"));
    assert!(!mapping.contains("a3"));
    let late = fs::read_to_string(target.path().join("cap_folder/000000/0000004.json")).unwrap();
    assert!(late.contains("four"));
    let early = fs::read_to_string(target.path().join("cap_folder/000000/0000003.json")).unwrap();
    assert!(early.contains("six"));
}

#[test]
fn previously_mapped_name_is_not_extracted_again() {
    let dataset = tempdir().unwrap();
    let target = tempdir().unwrap();
    write_train_shard(
        dataset.path(),
        "cc3m-train-000000.tar",
        &[("abc123", "success", "mapped"), ("xyz789", "success", "fresh")],
    );
    let mut mapping =
        OriginalMapping::load(OriginalMapping::default_path_in_dir(target.path())).unwrap();
    mapping.insert("abc123".into(), "0000500".into());
    mapping.persist().unwrap();

    let report = RunController::new(RunConfig::train(dataset.path(), target.path(), 2)).run();
    assert_eq!(report.committed(), 1);
    let index = DatasetIndex::load(DatasetIndex::default_path_in_dir(target.path())).unwrap();
    assert_eq!(index.records()[0].image, "000000/0000001.jpg");
    assert_eq!(
        fs::read(target.path().join("local_folder/000000/0000001.jpg")).unwrap(),
        b"jpeg:xyz789"
    );
}

#[test]
fn foreign_files_in_the_layout_are_preserved() {
    let dataset = tempdir().unwrap();
    let target = tempdir().unwrap();
    write_train_shard(
        dataset.path(),
        "cc3m-train-000000.tar",
        &[("n1", "success", "first"), ("n2", "success", "second")],
    );
    let image_dir = target.path().join("local_folder/000000");
    fs::create_dir_all(&image_dir).unwrap();
    fs::write(image_dir.join("0000001.jpg"), b"hand placed").unwrap();

    let report = RunController::new(RunConfig::train(dataset.path(), target.path(), 2)).run();
    assert_eq!(report.committed(), 0);
    assert_eq!(fs::read(image_dir.join("0000001.jpg")).unwrap(), b"hand placed");
}

#[test]
fn validation_layout_counts_images_and_uses_zero_based_ids() {
    let dataset = tempdir().unwrap();
    let target = tempdir().unwrap();
    write_validation_shard(
        dataset.path(),
        "cc3m-validation-000000.tar",
        &[("v1", "a kite"), ("v2", "  "), ("v3", "a lake\n")],
    );

    let report = RunController::new(RunConfig::validation(dataset.path(), target.path(), 5)).run();
    assert_eq!(report.phase, RunPhase::Done);
    assert_eq!(report.final_count, 2);
    assert_eq!(
        fs::read_to_string(target.path().join("texts/00000000.txt")).unwrap(),
        "a kite"
    );
    assert_eq!(
        fs::read_to_string(target.path().join("texts/00000001.txt")).unwrap(),
        "a lake"
    );
    assert!(!target.path().join("data_info.json").exists());

    let again = RunController::new(RunConfig::validation(dataset.path(), target.path(), 5)).run();
    assert_eq!(again.initial_count, 2);
    assert_eq!(again.committed(), 0);
}

#[test]
fn workers_split_shards_between_target_dirs() {
    let dataset = tempdir().unwrap();
    let first_target = tempdir().unwrap();
    let second_target = tempdir().unwrap();
    write_train_shard(dataset.path(), "cc3m-train-000000.tar", &[("s0", "success", "zero")]);
    write_train_shard(dataset.path(), "cc3m-train-000001.tar", &[("s1", "success", "one")]);
    write_train_shard(dataset.path(), "cc3m-train-000002.tar", &[("s2", "success", "two")]);

    for (worker, target) in [(0, &first_target), (1, &second_target)] {
        let config = RunConfig::train(dataset.path(), target.path(), 10)
            .with_assignment(ShardAssignment::new(worker, 2).unwrap());
        RunController::new(config).run();
    }
    let first = OriginalMapping::load(OriginalMapping::default_path_in_dir(first_target.path()))
        .unwrap();
    let second = OriginalMapping::load(OriginalMapping::default_path_in_dir(second_target.path()))
        .unwrap();
    assert!(first.contains("s0") && first.contains("s2"));
    assert!(second.contains("s1"));
    assert_eq!(first.len() + second.len(), 3);
}

#[test]
fn garbled_mapping_fails_setup_without_touching_output() {
    let dataset = tempdir().unwrap();
    let target = tempdir().unwrap();
    write_train_shard(dataset.path(), "cc3m-train-000000.tar", &[("g1", "success", "x")]);
    let mapping_path = OriginalMapping::default_path_in_dir(target.path());
    fs::write(&mapping_path, b"{\"g1\": ").unwrap();

    let report = RunController::new(RunConfig::train(dataset.path(), target.path(), 1)).run();
    assert_eq!(report.phase, RunPhase::SetupFailed);
    assert_eq!(fs::read(&mapping_path).unwrap(), b"{\"g1\": ");
    assert!(!target.path().join("local_folder").exists());
}
