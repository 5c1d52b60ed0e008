//! End-to-end tests: schema → resolve → cook → mass run → queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;

use validator_core::{
    cook, default_registry, resolve_pipeline, BuildPlugin, CheckPlugin, ContextPlugin, Plugin,
    PluginArgs, PluginInstance, PluginKind, PluginRegistry,
};
use validator_mass::{MassManager, MassOptions, MassQueue, TIMEOUT_MESSAGE};
use validator_types::{Context, ExecutorKind, Result, RunResult, StepOutcome};

const CUBES: &str = r#"#usda 1.0
(
    defaultPrim = "World"
)

def Xform "World"
{
    def Cube "Cube"
    {
        double size = 1
    }
    def Sphere "Sphere"
    {
    }
}
"#;

// ---------------------------------------------------------------------------
// Test plugins
// ---------------------------------------------------------------------------

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
struct NapData {
    #[serde(default)]
    ms: u64,
    #[serde(default = "yes")]
    pass: bool,
}

/// Check that sleeps, then passes or fails as configured.
struct Nap {
    data: NapData,
}

impl BuildPlugin for Nap {
    const NAME: &'static str = "Nap";
    const KIND: PluginKind = PluginKind::Check;

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        Ok(PluginInstance::check(Nap { data: args.data()? }))
    }
}

#[async_trait]
impl Plugin for Nap {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl CheckPlugin for Nap {
    async fn check(&self, _ctx: &Context, _targets: Option<&[String]>) -> Result<StepOutcome> {
        tokio::time::sleep(Duration::from_millis(self.data.ms)).await;
        Ok(if self.data.pass {
            StepOutcome::success(format!("slept {}ms", self.data.ms))
        } else {
            StepOutcome::fail("woke up grumpy")
        })
    }
}

#[derive(Deserialize)]
struct MarkerData {
    marker: String,
    #[serde(default)]
    teardown_ms: u64,
}

/// Context that writes a marker file on teardown.
struct Marker {
    data: MarkerData,
}

impl BuildPlugin for Marker {
    const NAME: &'static str = "Marker";
    const KIND: PluginKind = PluginKind::Context;

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        Ok(PluginInstance::context(Marker { data: args.data()? }))
    }
}

#[async_trait]
impl Plugin for Marker {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl ContextPlugin for Marker {
    async fn setup(&self, _ctx: &Context) -> Result<StepOutcome> {
        Ok(StepOutcome::success("Ok"))
    }

    async fn teardown(&self, _ctx: &Context) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.data.teardown_ms)).await;
        tokio::fs::write(&self.data.marker, "torn down").await?;
        Ok(())
    }
}

fn registry() -> PluginRegistry {
    let mut registry = default_registry();
    registry.register::<Nap>().unwrap();
    registry.register::<Marker>().unwrap();
    registry
}

fn layer_schema(file: &str) -> Value {
    json!({
        "name": "Cubes",
        "context_plugin": {"name": "USDFile", "data": {"file": file}},
        "check_plugins": [{"name": "PrintPrims", "selector_plugins": [{"name": "AllPrims"}]}]
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn layer_schema_passes_against_an_existing_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("cubes.usda");
    std::fs::write(&file, CUBES).unwrap();

    let manager = MassManager::from_schemas(
        &registry(),
        &[layer_schema(&file.to_string_lossy())],
        ExecutorKind::InProcess,
        MassOptions::default(),
    )
    .await
    .unwrap();
    let summary = manager.run().await.unwrap();
    assert!(summary.passed);

    let result = manager.jobs()[0].result.clone().unwrap();
    assert!(result.passed);
    assert_eq!(result.per_check.len(), 1);
    assert_eq!(result.per_check[0].message, "3 prims");
}

#[tokio::test]
async fn missing_layer_fails_setup_with_normalized_path() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("sub/../missing.usda");

    let manager = MassManager::from_schemas(
        &registry(),
        &[layer_schema(&raw.to_string_lossy())],
        ExecutorKind::InProcess,
        MassOptions::default(),
    )
    .await
    .unwrap();
    let summary = manager.run().await.unwrap();
    assert!(!summary.passed);

    let expected = format!("Can't read the file {}", dir.path().join("missing.usda").display());
    let result = manager.jobs()[0].result.clone().unwrap();
    assert_eq!(result, RunResult::failed(expected.clone()));
    // No check ran.
    assert!(result.per_check.is_empty());
    assert_eq!(summary.messages, vec![expected]);
}

#[tokio::test]
async fn resolution_is_idempotent_and_collapses_duplicate_checks() {
    let registry = registry();
    let schema = json!({
        "name": "Dup",
        "context_plugin": {"name": "Empty"},
        "check_plugins": [
            {"name": "PrimCount", "data": {"min": 0}},
            {"name": "PrintPrims"},
            {"name": "PrimCount", "data": {"min": 0}}
        ]
    });
    let a = resolve_pipeline(&registry, &schema).unwrap();
    let b = resolve_pipeline(&registry, &schema).unwrap();
    assert_eq!(a.checks.len(), 2);
    let names = |m: &validator_core::PipelineModel| {
        m.checks.iter().map(|c| c.plugin.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&a), names(&b));
    assert_eq!(names(&a), vec!["PrimCount", "PrintPrims"]);
}

#[tokio::test]
async fn every_check_runs_even_after_a_failure() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("cubes.usda");
    std::fs::write(&file, CUBES).unwrap();

    let schema = json!({
        "name": "Three",
        "context_plugin": {"name": "USDFile", "data": {"file": file.to_string_lossy()}},
        "check_plugins": [
            {"name": "PrimCount", "data": {"min": 1}},
            {"name": "PrimCount", "data": {"min": 10}},
            {"name": "PrimCount", "data": {"max": 3}}
        ]
    });
    let manager = MassManager::from_schemas(
        &registry(),
        &[schema],
        ExecutorKind::InProcess,
        MassOptions::default(),
    )
    .await
    .unwrap();
    manager.run().await.unwrap();

    let result = manager.jobs()[0].result.clone().unwrap();
    assert!(!result.passed);
    let passed: Vec<bool> = result.per_check.iter().map(|c| c.passed).collect();
    assert_eq!(passed, vec![true, false, true]);
    assert_eq!(result.message, "1 of 3 checks failed");
}

#[tokio::test]
async fn directory_template_runs_one_job_per_file_with_monotonic_progress() {
    let dir = TempDir::new().unwrap();
    for name in ["a.usda", "b.usda", "c.usda"] {
        std::fs::write(dir.path().join(name), CUBES).unwrap();
    }
    let schema = json!({
        "name": "Dir",
        "context_plugin": {
            "name": "USDDirectory",
            "data": {"directory": dir.path().to_string_lossy()}
        },
        "check_plugins": [{"name": "PrimCount", "data": {"min": 3, "max": 3}}]
    });

    let registry = registry();
    let template = resolve_pipeline(&registry, &schema).unwrap();
    assert_eq!(cook(&registry, &template).await.unwrap().len(), 3);

    let manager = MassManager::from_schemas(
        &registry,
        &[schema],
        ExecutorKind::InProcess,
        MassOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(manager.len(), 3);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    let _sub = manager.subscribe_progress(move |p| {
        sink.lock().unwrap().push((p.index, p.total));
    });
    let items = Arc::new(AtomicUsize::new(0));
    let count = items.clone();
    let _items = manager.subscribe_item_finished(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let summary = manager.run().await.unwrap();
    assert!(summary.passed, "{:?}", summary.messages);
    assert_eq!(*progress.lock().unwrap(), vec![(0, 3), (1, 3), (2, 3)]);
    assert_eq!(items.load(Ordering::SeqCst), 3);

    let names: Vec<String> = manager.jobs().iter().map(|j| j.pipeline.name.clone()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn timeout_cancels_slow_jobs_and_still_tears_down() {
    let dir = TempDir::new().unwrap();
    let marker = |name: &str| dir.path().join(format!("{}.torn", name));
    let schema = |name: &str, ms: u64| {
        json!({
            "name": name,
            "context_plugin": {"name": "Marker", "data": {"marker": marker(name).to_string_lossy()}},
            "check_plugins": [{"name": "Nap", "data": {"ms": ms}}]
        })
    };
    let manager = MassManager::from_schemas(
        &registry(),
        &[schema("quick", 0), schema("slow", 30_000)],
        ExecutorKind::InProcess,
        MassOptions {
            timeout: Some(Duration::from_millis(200)),
            grace_period: Duration::from_millis(500),
            queue_id: None,
        },
    )
    .await
    .unwrap();

    let summary = manager.run().await.unwrap();
    assert!(summary.timed_out);
    assert!(!summary.passed);

    let jobs = manager.jobs();
    assert!(jobs[0].result.as_ref().unwrap().passed);
    assert_eq!(jobs[1].result, Some(RunResult::failed(TIMEOUT_MESSAGE)));
    assert_eq!(summary.failed_job_ids, vec![jobs[1].id.clone()]);
    assert!(marker("quick").exists());
    assert!(marker("slow").exists());
}

#[tokio::test]
async fn slow_teardown_outlives_the_grace_period_in_process() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("slow.torn");
    let schema = json!({
        "name": "hung",
        "context_plugin": {
            "name": "Marker",
            "data": {"marker": marker.to_string_lossy(), "teardown_ms": 300}
        },
        "check_plugins": [{"name": "Nap", "data": {"ms": 30_000}}]
    });
    let manager = MassManager::from_schemas(
        &registry(),
        &[schema],
        ExecutorKind::InProcess,
        MassOptions {
            timeout: Some(Duration::from_millis(100)),
            grace_period: Duration::from_millis(100),
            queue_id: None,
        },
    )
    .await
    .unwrap();

    let summary = manager.run().await.unwrap();
    assert!(summary.timed_out);
    assert_eq!(summary.messages, vec![TIMEOUT_MESSAGE]);
    // The job reports only after its teardown finished.
    assert!(marker.exists());
}

#[tokio::test]
async fn failing_job_does_not_affect_siblings() {
    let schema = |name: &str, pass: bool| {
        json!({
            "name": name,
            "context_plugin": {"name": "Empty"},
            "check_plugins": [{"name": "Nap", "data": {"ms": 10, "pass": pass}}]
        })
    };
    let manager = MassManager::from_schemas(
        &registry(),
        &[schema("one", true), schema("two", false), schema("three", true)],
        ExecutorKind::InProcess,
        MassOptions::default(),
    )
    .await
    .unwrap();
    let summary = manager.run().await.unwrap();

    let jobs = manager.jobs();
    assert_eq!(summary.failed_job_ids, vec![jobs[1].id.clone()]);
    assert_eq!(summary.messages, vec!["1 of 1 checks failed"]);
    assert!(jobs[0].result.as_ref().unwrap().passed);
    assert!(jobs[2].result.as_ref().unwrap().passed);
}

#[tokio::test]
async fn queue_update_for_unknown_ids_is_ignored() {
    let queue = MassQueue::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let count = hits.clone();
    let _sub = queue.subscribe_on_update_item(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!queue.update_schema("ghost", "nobody", RunResult::failed("late")));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
mod process {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use validator_mass::{ProcessExecutor, ProcessExecutorConfig};

    fn worker(dir: &TempDir, body: &str) -> ProcessExecutorConfig {
        let path = dir.path().join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ProcessExecutorConfig {
            program: path,
            base_args: Vec::new(),
            grace_period: Duration::from_millis(200),
            max_concurrent: None,
        }
    }

    fn plain(name: &str) -> validator_core::PipelineModel {
        resolve_pipeline(
            &registry(),
            &json!({
                "name": name,
                "context_plugin": {"name": "Empty"},
                "check_plugins": [{"name": "PrintPrims"}]
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn worker_updates_reach_the_queue() {
        let dir = TempDir::new().unwrap();
        // Arguments: --schema <file> --queue-id <q> --job-id <j>
        let config = worker(
            &dir,
            r#"echo "{\"queue_id\":\"$4\",\"schema\":{\"uuid\":\"$6\",\"finished\":true,\"result\":{\"passed\":false,\"message\":\"remote says no\"}}}""#,
        );
        let queue = Arc::new(MassQueue::new());
        let manager = Arc::new(
            MassManager::new(
                vec![plain("remote")],
                ExecutorKind::Process,
                MassOptions {
                    queue_id: Some("q1".into()),
                    ..MassOptions::default()
                },
            )
            .with_executor(Arc::new(ProcessExecutor::new(config).with_queue(queue.clone()))),
        );
        queue.enqueue("q1", manager.clone());

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let _sub = queue.subscribe_on_update_item(move |(schema, queue_id)| {
            sink.lock().unwrap().push((schema["uuid"].clone(), queue_id.clone()));
        });

        let summary = manager.run().await.unwrap();
        assert!(!summary.passed);

        let job = &manager.jobs()[0];
        assert_eq!(job.result, Some(RunResult::failed("remote says no")));
        assert_eq!(*updates.lock().unwrap(), vec![(json!(job.id), "q1".to_string())]);
    }

    #[tokio::test]
    async fn mixed_executor_kinds_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let config = worker(&dir, "sleep 0.2\nexit 0");
        let manager = MassManager::with_kinds(
            vec![
                (plain("in-process"), ExecutorKind::InProcess),
                (plain("child"), ExecutorKind::Process),
            ],
            MassOptions::default(),
        )
        .with_executor(Arc::new(ProcessExecutor::new(config)));

        let summary = manager.run().await.unwrap();
        assert!(summary.passed, "{:?}", summary.messages);
        let jobs = manager.jobs();
        assert_eq!(jobs[1].executor_kind, ExecutorKind::Process);
        assert_eq!(jobs[1].result.as_ref().unwrap().message, "Ok");
        assert_eq!(jobs[0].result.as_ref().unwrap().message, "Check done");
    }

    #[tokio::test]
    async fn timed_out_process_is_terminated() {
        let dir = TempDir::new().unwrap();
        let config = worker(&dir, "sleep 30");
        let manager = MassManager::new(
            vec![plain("sleepy")],
            ExecutorKind::Process,
            MassOptions {
                timeout: Some(Duration::from_millis(200)),
                grace_period: Duration::from_millis(500),
                queue_id: None,
            },
        )
        .with_executor(Arc::new(ProcessExecutor::new(config)));

        let started = std::time::Instant::now();
        let summary = manager.run().await.unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.messages, vec![TIMEOUT_MESSAGE]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
