//! End-to-end runs of the pipeline over temporary directories.

use std::fs;
use std::path::{Path, PathBuf};

use metapipe_core::config::{ErrorMode, Flow, Operation, OutputFormat, RunConfig};
use metapipe_core::diff::{DiffStatus, MergeStrategy, PatchOpKind};
use metapipe_core::domain::{MetapipeError, StageKind, SENTINEL_EXIT_CODE};
use metapipe_core::envelope::{ItemAction, Outcome, ResultEnvelope};
use metapipe_core::output::render_envelope;
use metapipe_exec::{Pipeline, RunReport};
use serde_json::{json, Value};
use tempfile::TempDir;

fn write(dir: &Path, rel: &str, text: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}

fn write_record(dir: &Path, file: &str, locator: &str, meta: &str) {
    write(dir, file, &format!("locator: {locator}\nmeta: {meta}\n"));
}

fn records_config(root: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.discovery.root = root.to_path_buf();
    config.workers = Some(2);
    config
}

fn files_config(root: &Path, meta_dir: &Path, operation: Operation) -> RunConfig {
    let mut config = records_config(root);
    config.flow = Flow::Files;
    config.operation = operation;
    config.store.meta_dir = meta_dir.to_path_buf();
    config
}

async fn collect(config: RunConfig) -> RunReport {
    Pipeline::prepare(config).unwrap().collect().await.unwrap()
}

fn envelope(report: &RunReport) -> &ResultEnvelope {
    report.envelope.as_ref().expect("run produced an envelope")
}

fn locators(envelope: &ResultEnvelope) -> Vec<String> {
    envelope
        .records
        .iter()
        .map(|r| {
            r.locator
                .clone()
                .or_else(|| r.file.as_ref().map(|f| f.rel_path.clone()))
                .unwrap_or_default()
        })
        .collect()
}

/// Two valid records and one over the size limit, keep-going.
#[tokio::test]
async fn test_oversize_record_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "docs/a.md", "{title: A}");
    write_record(dir.path(), "b.yaml", "docs/b.md", "{title: B}");
    let padding = "x".repeat(400);
    write_record(dir.path(), "c.yaml", "docs/c.md", &format!("{{title: {padding}}}"));

    let mut config = records_config(dir.path());
    config.limits.max_record_bytes = 200;
    let report = collect(config).await;
    let env = envelope(&report);

    assert_eq!(env.errors.len(), 1);
    assert_eq!(env.errors[0].stage, StageKind::Parse);
    assert_eq!(env.errors[0].context.as_deref(), Some("c.yaml"));
    assert!(env.errors[0].message.contains("max_record_bytes=200"));
    assert_eq!(locators(env), vec!["docs/a.md", "docs/b.md"]);
    assert!(env.records.iter().all(|r| r.error.is_none()));
    assert_eq!(env.meta.counts.discovered, 3);
    assert_eq!(env.meta.counts.failed, 1);
    assert_eq!(env.meta.outcome, Outcome::PartialFailure);
    assert_ne!(report.exit_code, 0);
}

#[tokio::test]
async fn test_filter_keeps_enabled_records() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "on.yaml", "on.md", "{enabled: true}");
    write_record(dir.path(), "off.yaml", "off.md", "{enabled: false}");

    let mut config = records_config(dir.path());
    config.stages.filter = Some("return meta.enabled == true".into());
    let report = collect(config).await;
    let env = envelope(&report);

    assert_eq!(locators(env), vec!["on.md"]);
    assert_eq!(env.meta.counts.filtered, 1);
    assert_eq!(env.meta.counts.succeeded, 1);
    assert!(env.records[0].value.is_none());
    assert_eq!(report.exit_code, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_strict_templates_fail_before_spawning() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{}");
    let marker = dir.path().join("spawned");

    let mut config = records_config(dir.path());
    config.shell.enabled = true;
    config.shell.argv = Some(vec![
        "sh".into(),
        "-c".into(),
        format!("touch {}; echo \"$0\"", marker.display()),
        "{oops}".into(),
    ]);
    let err = Pipeline::prepare(config.clone()).err().unwrap();
    assert!(matches!(err, MetapipeError::InvalidConfig(_)));
    assert!(err.to_string().contains("oops"));
    assert!(!marker.exists());

    config.shell.strict_templates = false;
    let report = collect(config).await;
    let shell = envelope(&report).records[0].shell.clone().unwrap();
    assert_eq!(shell.stdout.as_deref(), Some("{oops}\n"));
    assert!(marker.exists());
}

#[tokio::test]
async fn test_diff_patch_for_type_change() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "notes/a.txt", "hello");

    let mut create = files_config(&root, &meta_dir, Operation::Create);
    create.stages.map = Some("{ a = 1, b = 2 }".into());
    let report = collect(create).await;
    assert_eq!(envelope(&report).records[0].action, Some(ItemAction::Created));

    let mut diff = files_config(&root, &meta_dir, Operation::Diff);
    diff.stages.map = Some("{ a = \"1\", c = 3 }".into());
    diff.diff.strategy = MergeStrategy::Jsonpatch;
    diff.diff.include_snapshots = true;
    let report = collect(diff).await;
    let env = envelope(&report);
    assert!(env.records.is_empty());

    let report_diff = env.diff.as_ref().unwrap();
    assert_eq!(report_diff.entries.len(), 1);
    let entry = &report_diff.entries[0];
    assert_eq!(entry.file, "notes/a.txt");
    assert_eq!(entry.status, DiffStatus::Modified);
    let ops: Vec<(PatchOpKind, &str)> = entry
        .patch
        .as_ref()
        .unwrap()
        .iter()
        .map(|op| (op.op, op.path.as_str()))
        .collect();
    assert_eq!(
        ops,
        vec![
            (PatchOpKind::Replace, "/a"),
            (PatchOpKind::Remove, "/b"),
            (PatchOpKind::Add, "/c"),
        ]
    );
    assert_eq!(entry.before, Some(json!({"a": 1, "b": 2})));
    assert_eq!(entry.after, Some(json!({"a": "1", "c": 3})));
    assert_eq!(report_diff.summary.changed, 1);
    assert_eq!(report.exit_code, 0);
}

fn numbered_records(dir: &Path, count: usize) {
    for i in 0..count {
        write_record(
            dir,
            &format!("r{i:02}.yaml"),
            &format!("items/{:02}.md", count - i),
            &format!("{{n: {i}}}"),
        );
    }
    write_record(dir, "broken.yaml", "items/broken.md", "{}");
}

#[tokio::test]
async fn test_output_is_identical_across_worker_counts() {
    let dir = TempDir::new().unwrap();
    numbered_records(dir.path(), 12);

    let render = |workers: usize| {
        let mut config = records_config(dir.path());
        config.workers = Some(workers);
        config.stages.map = Some("{ double = meta.n * 2, loc = locator }".into());
        config.stages.reduce = Some("(acc or \"\") .. value.loc .. \";\"".into());
        async move {
            let report = collect(config).await;
            render_envelope(envelope(&report), false).unwrap()
        }
    };

    let single = render(1).await;
    let parallel = render(4).await;
    assert_eq!(single, parallel);
    assert_eq!(render(4).await, parallel);

    let parsed: Value = serde_json::from_slice(&single).unwrap();
    assert_eq!(parsed["records"].as_array().unwrap().len(), 12);
    assert_eq!(parsed["errors"][0]["stage"], json!("map"));
    assert_eq!(parsed["errors"][0]["locator"], json!("items/broken.md"));
    assert!(parsed["meta"].get("workers").is_none());
}

#[tokio::test]
async fn test_reduce_consumes_canonical_order() {
    let dir = TempDir::new().unwrap();
    for name in ["c", "a", "d", "b"] {
        write_record(dir.path(), &format!("{name}.yaml"), &format!("{name}.md"), "{}");
    }
    for workers in [1, 3] {
        let mut config = records_config(dir.path());
        config.workers = Some(workers);
        config.stages.map = Some("locator".into());
        config.stages.reduce = Some("(acc or \"\") .. value".into());
        let report = collect(config).await;
        assert_eq!(envelope(&report).reduce, Some(json!("a.mdb.mdc.mdd.md")));
    }
}

#[tokio::test]
async fn test_reduce_without_items_is_null() {
    let dir = TempDir::new().unwrap();
    let mut config = records_config(dir.path());
    config.stages.reduce = Some("(acc or 0) + 1".into());
    let report = collect(config).await;
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.diagnostics, vec!["no items to process".to_string()]);
    assert_eq!(envelope(&report).reduce, Some(Value::Null));
    assert_eq!(envelope(&report).meta.outcome, Outcome::NoItems);
}

#[tokio::test]
async fn test_update_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "guide/intro.md", "# Intro");
    write(&root, "guide/setup.md", "# Setup");

    let mut create = files_config(&root, &meta_dir, Operation::Create);
    create.stages.map = Some("{ title = file.name, tags = { \"docs\" } }".into());
    let report = collect(create.clone()).await;
    let env = envelope(&report);
    assert!(env.records.iter().all(|r| r.action == Some(ItemAction::Created)));
    let first: Vec<Vec<u8>> = sorted_meta_files(&meta_dir);
    assert_eq!(first.len(), 2);

    let report = collect(create).await;
    assert!(envelope(&report)
        .records
        .iter()
        .all(|r| r.action == Some(ItemAction::Skipped)));

    let mut update = files_config(&root, &meta_dir, Operation::Update);
    update.stages.map = Some("{ title = file.name }".into());
    update.diff.strategy = MergeStrategy::Deep;
    for _ in 0..2 {
        let report = collect(update.clone()).await;
        let env = envelope(&report);
        assert!(env.records.iter().all(|r| r.action == Some(ItemAction::Unchanged)));
        assert_eq!(env.records[0].meta, Some(json!({"title": "intro", "tags": ["docs"]})));
        assert_eq!(sorted_meta_files(&meta_dir), first);
    }
}

fn sorted_meta_files(meta_dir: &Path) -> Vec<Vec<u8>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(meta_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths.iter().map(|p| fs::read(p).unwrap()).collect()
}

#[tokio::test]
async fn test_diff_reports_orphans_and_fails_on_change() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "keep.txt", "k");
    write(&root, "gone.txt", "g");

    let mut create = files_config(&root, &meta_dir, Operation::Create);
    create.stages.map = Some("{ size = 1 }".into());
    collect(create).await;
    fs::remove_file(root.join("gone.txt")).unwrap();

    let mut diff = files_config(&root, &meta_dir, Operation::Diff);
    diff.stages.map = Some("{ size = 1 }".into());
    diff.diff.fail_on_change = true;
    let report = collect(diff.clone()).await;
    let env = envelope(&report);
    let summary = env.diff.as_ref().unwrap().summary;
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.orphans, 1);
    assert_eq!(env.meta.outcome, Outcome::ChangesDetected);
    assert_eq!(report.exit_code, 2);

    diff.diff.only = metapipe_core::diff::DiffFilter::Orphans;
    let report = collect(diff).await;
    let listed = &envelope(&report).diff.as_ref().unwrap().entries;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].file, "gone.txt");
    assert_eq!(envelope(&report).diff.as_ref().unwrap().summary.unchanged, 1);
}

#[tokio::test]
async fn test_unreadable_metadata_is_invalid_input_for_diff() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "a.txt", "a");
    write(&meta_dir, "broken.yaml", "locator: [unclosed\n");

    let mut diff = files_config(&root, &meta_dir, Operation::Diff);
    diff.stages.map = Some("{ x = 1 }".into());
    let report = collect(diff).await;
    let env = envelope(&report);
    assert_eq!(env.meta.outcome, Outcome::InvalidInput);
    assert_eq!(report.exit_code, 1);
    assert_eq!(env.errors[0].context.as_deref(), Some("broken.yaml"));
    assert_eq!(env.diff.as_ref().unwrap().summary.missing, 1);
}

#[tokio::test]
async fn test_post_map_patch_wins() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "a.txt", "a");

    let mut create = files_config(&root, &meta_dir, Operation::Create);
    create.stages.post_map = Some(
        "return { meta = { ignored = true }, patch = { { op = \"add\", path = \"/from_patch\", value = file.ext } } }"
            .into(),
    );
    let report = collect(create).await;
    let record = &envelope(&report).records[0];
    assert_eq!(record.meta, Some(json!({"from_patch": "txt"})));
    assert_eq!(record.action, Some(ItemAction::Created));
}

#[cfg(unix)]
#[tokio::test]
async fn test_all_shell_failures_are_reported_distinctly() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{}");
    write_record(dir.path(), "b.yaml", "b.md", "{}");

    let mut config = records_config(dir.path());
    config.shell.enabled = true;
    config.shell.command = Some("echo {locator} >&2; exit 3".into());
    let report = collect(config).await;
    let env = envelope(&report);

    assert_eq!(report.exit_code, 2);
    assert_eq!(env.meta.outcome, Outcome::AllFailed);
    assert_eq!(
        report.diagnostics,
        vec!["all 2 items failed at the shell stage".to_string()]
    );
    assert_eq!(locators(env), vec!["a.md", "b.md"]);
    let shell = env.records[0].shell.as_ref().unwrap();
    assert_eq!(shell.exit_code, 3);
    assert_eq!(shell.stderr.as_deref(), Some("a.md\n"));
    assert!(shell.duration_ms.is_none());
    assert_eq!(env.errors.len(), 2);
    assert_eq!(env.errors[0].details, Some(json!({"exitCode": 3, "timedOut": false})));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_timeout_without_stdout_capture() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{}");

    let mut config = records_config(dir.path());
    config.shell.enabled = true;
    config.shell.argv = Some(vec!["sleep".into(), "30".into()]);
    config.shell.timeout_ms = 100;
    config.shell.grace_ms = 100;
    config.shell.capture_stdout = false;
    let report = collect(config).await;
    let env = envelope(&report);
    let shell = env.records[0].shell.as_ref().unwrap();
    assert!(shell.timed_out);
    assert_eq!(shell.exit_code, SENTINEL_EXIT_CODE);
    assert!(shell.stdout.is_none());
    assert!(!shell.stdout_truncated);
    assert_eq!(env.errors[0].message, "command timed out");
}

#[cfg(unix)]
#[tokio::test]
async fn test_post_map_sees_shell_result() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{n: 2}");

    let mut config = records_config(dir.path());
    config.stages.map = Some("meta.n * 10".into());
    config.shell.enabled = true;
    config.shell.argv = Some(vec!["printf".into(), "%s".into(), "{value}".into()]);
    config.stages.post_map = Some("{ out = shell.stdout, code = shell.exitCode, was = value }".into());
    let report = collect(config).await;
    let record = &envelope(&report).records[0];
    assert_eq!(record.value, Some(json!({"out": "20", "code": 0, "was": 20})));
}

#[tokio::test]
async fn test_fail_fast_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("records");
    for i in 0..6 {
        write_record(&root, &format!("{i}.yaml"), &format!("{i}.md"), "{}");
    }
    let out = dir.path().join("out.jsonl");
    fs::write(&out, "previous\n").unwrap();

    let mut config = records_config(&root);
    config.errors.mode = ErrorMode::FailFast;
    config.stages.map = Some("if locator == \"3.md\" then error(\"boom\") end return 1".into());
    config.output.format = OutputFormat::Jsonl;
    config.output.path = Some(out.clone());
    let report = Pipeline::prepare(config.clone()).unwrap().execute().await.unwrap();
    assert_eq!(report.exit_code, 3);
    assert!(report.envelope.is_none());
    assert!(report.diagnostics[0].starts_with("run aborted: map failed for 3.md"));
    assert_eq!(fs::read_to_string(&out).unwrap(), "previous\n");

    let aggregate = dir.path().join("out.json");
    config.output.format = OutputFormat::Json;
    config.output.path = Some(aggregate.clone());
    let report = Pipeline::prepare(config).unwrap().execute().await.unwrap();
    assert_eq!(report.exit_code, 3);
    assert!(!aggregate.exists());
}

#[tokio::test]
async fn test_fail_fast_parse_error_exits_2() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{}");
    write(dir.path(), "b.yaml", "- just\n- a list\n");

    let mut config = records_config(dir.path());
    config.errors.mode = ErrorMode::FailFast;
    let report = collect(config).await;
    assert_eq!(report.exit_code, 2);
    assert!(report.diagnostics[0].contains("b.yaml"));
}

#[tokio::test]
async fn test_embedded_errors_and_duplicate_locators() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "same.md", "{n: 1}");
    write_record(dir.path(), "b.yaml", "./same.md", "{n: 2}");
    write_record(dir.path(), "c.yaml", "other.md", "{}");

    let mut config = records_config(dir.path());
    config.errors.embed = true;
    config.stages.map = Some("meta.n + 1".into());
    let report = collect(config).await;
    let env = envelope(&report);

    assert_eq!(locators(env), vec!["other.md", "same.md"]);
    assert_eq!(env.records[0].error.as_ref().unwrap().stage, StageKind::Map);
    assert_eq!(env.records[1].value, Some(json!(2)));
    let stages: Vec<(&str, &str)> = env
        .errors
        .iter()
        .map(|e| (e.stage.as_str(), e.subject()))
        .collect();
    assert_eq!(stages, vec![("map", "other.md"), ("parse", "b.yaml")]);
    assert_eq!(report.exit_code, 2);
}

#[tokio::test]
async fn test_buffer_cap_rejects_aggregate_output() {
    let dir = TempDir::new().unwrap();
    write_record(dir.path(), "a.yaml", "a.md", "{}");
    write_record(dir.path(), "b.yaml", "b.md", "{}");

    let mut config = records_config(dir.path());
    config.output.max_buffered_items = Some(1);
    let err = Pipeline::prepare(config.clone())
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, MetapipeError::BufferCapExceeded { count: 2, cap: 1 }));

    config.output.format = OutputFormat::Jsonl;
    config.output.path = Some(dir.path().join("out/records.jsonl"));
    let report = Pipeline::prepare(config).unwrap().execute().await.unwrap();
    assert_eq!(report.exit_code, 0);
}

#[tokio::test]
async fn test_jsonl_stream_layout() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("records");
    write_record(&root, "a.yaml", "a.md", "{n: 1}");
    write_record(&root, "b.yaml", "b.md", "{n: 2}");
    let out = dir.path().join("out.jsonl");

    let mut config = records_config(&root);
    config.stages.reduce = Some("(acc or 0) + value.n".into());
    config.output.format = OutputFormat::Jsonl;
    config.output.path = Some(out.clone());
    let report = Pipeline::prepare(config).unwrap().execute().await.unwrap();
    assert_eq!(report.exit_code, 0);

    let lines: Vec<Value> = fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["locator"], json!("a.md"));
    assert_eq!(lines[1]["locator"], json!("b.md"));
    assert_eq!(lines[2], json!({"reduce": 3}));
    assert_eq!(lines[3]["meta"]["counts"]["succeeded"], json!(2));
}

#[tokio::test]
async fn test_file_pipeline_uses_relative_paths() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "b/two.md", "2");
    write(dir.path(), "a/one.md", "1");
    write(dir.path(), "a/skip.txt", "x");

    let mut config = records_config(dir.path());
    config.flow = Flow::Files;
    config.discovery.include_info = true;
    config.stages.filter = Some("file.ext == \"md\"".into());
    config.stages.map = Some("{ base = file.base, size = file.info.size }".into());
    let report = collect(config).await;
    let env = envelope(&report);
    assert_eq!(locators(env), vec!["a/one.md", "b/two.md"]);
    assert_eq!(env.records[0].value, Some(json!({"base": "one.md", "size": 1})));
    assert_eq!(env.meta.counts.filtered, 1);
    assert_eq!(env.meta.counts.discovered, 3);
}

#[tokio::test]
async fn test_existing_is_nil_until_metadata_is_stored() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    let meta_dir = dir.path().join("meta");
    write(&root, "a.txt", "a");

    let mut fresh = files_config(&root, &meta_dir, Operation::Create);
    fresh.stages.post_map =
        Some("return { meta = { is_nil = (existing == nil), ty = type(existing) } }".into());
    fresh.store.meta_dir = dir.path().join("fresh_meta");
    let report = collect(fresh).await;
    let record = &envelope(&report).records[0];
    assert_eq!(record.meta, Some(json!({"is_nil": true, "ty": "nil"})));

    let mut create = files_config(&root, &meta_dir, Operation::Create);
    create.stages.map = Some("{ title = file.name }".into());
    collect(create).await;

    let mut update = files_config(&root, &meta_dir, Operation::Update);
    update.stages.post_map =
        Some("return { meta = { prev = existing and existing.title or \"none\" } }".into());
    let report = collect(update).await;
    let record = &envelope(&report).records[0];
    assert_eq!(record.meta.as_ref().unwrap()["prev"], json!("a"));
    assert_eq!(record.action, Some(ItemAction::Updated));
}

#[cfg(unix)]
#[tokio::test]
async fn test_followed_symlink_cycle_lists_each_file_once() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a/one.md", "1");
    write(dir.path(), "b/two.md", "2");
    std::os::unix::fs::symlink(dir.path(), dir.path().join("a/loop")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("b"), dir.path().join("b/self")).unwrap();

    let mut config = records_config(dir.path());
    config.flow = Flow::Files;
    config.discovery.follow_symlinks = true;
    let report = collect(config).await;
    let env = envelope(&report);
    assert_eq!(locators(env), vec!["a/one.md", "b/two.md"]);
    assert_eq!(env.meta.counts.discovered, 2);
    assert_eq!(report.exit_code, 0);
}
