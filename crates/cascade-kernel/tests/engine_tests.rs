use cascade_kernel::dag::Dag;
use cascade_kernel::prelude::*;
use cascade_kernel::{RefreshStatus, Version};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn fixed_clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
}

fn engine_with(clock: &FixedClock, config: EngineConfig) -> Engine {
    Engine::new(config, Arc::new(clock.clone())).unwrap()
}

fn numbers(rows: &[u64]) -> Materialized {
    Materialized::from_rows(rows.to_vec()).unwrap()
}

/// Stage summing the rows of its upstreams, counting how often it runs
fn sum_stage(name: &str, upstreams: &[&'static str], calls: &Arc<AtomicUsize>) -> StageDefinition {
    let inputs: Vec<&'static str> = upstreams.to_vec();
    let calls = Arc::clone(calls);
    StageDefinition::new(name.to_string(), move |ctx: &RefreshContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        let mut total = 0u64;
        for input in &inputs {
            total += ctx.rows::<u64>(input)?.iter().sum::<u64>();
        }
        Materialized::from_rows(vec![total])
    })
    .depends_on(upstreams.iter().copied())
}

#[test]
fn cycle_is_rejected_at_registration_time() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let noop = |_: &RefreshContext| Materialized::from_rows(Vec::<u64>::new());

    let a = engine.register_stage(StageDefinition::new("a", noop)).unwrap();
    engine
        .register_stage(StageDefinition::new("b", noop).depends_on(["a"]))
        .unwrap();
    let c = engine
        .register_stage(StageDefinition::new("c", noop).depends_on(["b"]))
        .unwrap();

    let err = engine.add_dependency(a, c).unwrap_err();
    assert_eq!(
        err,
        EngineError::CycleDetected {
            downstream: "a".into(),
            upstream: "c".into(),
        }
    );
    assert!(err.is_registration_error());

    // The rejected edge left no trace in the graph.
    let order: Vec<String> = engine
        .tables()
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(engine.describe(a).unwrap().upstreams.is_empty());
}

#[tokio::test]
async fn source_change_refreshes_each_downstream_once() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    engine.register_stage(sum_stage("left", &["raw"], &calls)).unwrap();
    engine.register_stage(sum_stage("right", &["raw"], &calls)).unwrap();
    let joined = engine
        .register_stage(sum_stage("joined", &["left", "right"], &calls))
        .unwrap();

    engine.write_source(raw, numbers(&[1, 2])).unwrap();
    engine.bootstrap().await.unwrap();
    assert_eq!(calls.swap(0, Ordering::SeqCst), 3);
    assert_eq!(*engine.read_rows::<u64>(joined).unwrap(), vec![6]);

    let report = engine
        .write_and_propagate(raw, numbers(&[1, 2, 3]))
        .await
        .unwrap()
        .expect("changed source runs a cycle");

    assert!(report.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.refreshed.last().map(String::as_str), Some("joined"));
    assert_eq!(*engine.read_rows::<u64>(joined).unwrap(), vec![12]);
}

#[tokio::test]
async fn identical_source_write_runs_nothing() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    engine.register_stage(sum_stage("total", &["raw"], &calls)).unwrap();

    engine.write_source(raw, numbers(&[4, 5])).unwrap();
    engine.bootstrap().await.unwrap();

    let outcome = engine.write_and_propagate(raw, numbers(&[4, 5])).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(engine.versions(raw), vec![Version(1)]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forced_refresh_with_same_inputs_is_unchanged() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let total = engine.register_stage(sum_stage("total", &["raw"], &calls)).unwrap();
    engine.register_stage(sum_stage("report", &["total"], &calls)).unwrap();

    engine.write_source(raw, numbers(&[7])).unwrap();
    engine.bootstrap().await.unwrap();
    let before = engine.read(total).unwrap();

    let report = engine.refresh(&[total]).await.unwrap();

    assert_eq!(report.unchanged, vec!["total"]);
    assert_eq!(report.up_to_date, vec!["report"]);
    let after = engine.read(total).unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.contents.fingerprint(), before.contents.fingerprint());
}

#[tokio::test]
async fn failure_halts_downstream_and_keeps_committed_upstream() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let broken = Arc::new(AtomicBool::new(false));

    let stable = engine.register_stage(sum_stage("stable", &["raw"], &calls)).unwrap();
    let fragile = engine
        .register_stage(
            StageDefinition::new("fragile", {
                let broken = Arc::clone(&broken);
                move |ctx: &RefreshContext| {
                    if broken.load(Ordering::SeqCst) {
                        return Err(StageError::computation("division by zero"));
                    }
                    let rows = ctx.rows::<u64>("raw")?;
                    Materialized::from_rows(vec![rows.len() as u64])
                }
            })
            .depends_on(["raw"]),
        )
        .unwrap();
    let tail = engine.register_stage(sum_stage("tail", &["fragile"], &calls)).unwrap();

    engine.write_source(raw, numbers(&[1, 1])).unwrap();
    engine.bootstrap().await.unwrap();

    broken.store(true, Ordering::SeqCst);
    let report = engine
        .write_and_propagate(raw, numbers(&[1, 1, 1]))
        .await
        .unwrap()
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].table, "fragile");
    assert!(report.failed[0].reason.contains("division by zero"));
    assert_eq!(report.skipped, vec!["tail"]);
    assert_eq!(report.refreshed, vec!["stable"]);

    // Upstream work of the failed cycle stays committed; the failed stage keeps its last version.
    assert_eq!(*engine.read_rows::<u64>(stable).unwrap(), vec![3]);
    assert_eq!(*engine.read_rows::<u64>(fragile).unwrap(), vec![2]);
    assert_eq!(*engine.read_rows::<u64>(tail).unwrap(), vec![2]);

    let fragile_history = engine.history(fragile);
    assert!(matches!(
        &fragile_history[0].status,
        RefreshStatus::Failed { reason } if reason.contains("division by zero")
    ));
    assert_eq!(
        engine.history(tail)[0].status,
        RefreshStatus::Skipped {
            upstream: "fragile".into()
        }
    );

    let last = engine.last_refresh(fragile).unwrap();
    assert_eq!(last.cycle, report.cycle);
    assert!(!last.status.is_success());
    let failed: Vec<String> = engine
        .failed_refreshes()
        .into_iter()
        .map(|r| r.table_name)
        .collect();
    assert_eq!(failed, vec!["fragile"]);

    // The next cycle reaching them retries, even though the source did not move again.
    broken.store(false, Ordering::SeqCst);
    let retry = engine.sources_changed(&[raw]).await.unwrap();
    assert!(retry.is_success());
    assert_eq!(retry.refreshed, vec!["fragile", "tail"]);
    assert_eq!(retry.up_to_date, vec!["stable"]);
    assert_eq!(*engine.read_rows::<u64>(tail).unwrap(), vec![3]);
}

#[tokio::test]
async fn independent_stages_run_concurrently() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default().with_workers(2));
    let raw = engine.register_source("raw").unwrap();
    let barrier = Arc::new(Barrier::new(2));

    for name in ["east", "west"] {
        let barrier = Arc::clone(&barrier);
        engine
            .register_stage(
                StageDefinition::new(name, move |ctx: &RefreshContext| {
                    // Deadlocks unless the sibling is running at the same time.
                    barrier.wait();
                    Materialized::from_rows(ctx.rows::<u64>("raw")?.as_ref().clone())
                })
                .depends_on(["raw"]),
            )
            .unwrap();
    }
    engine.write_source(raw, numbers(&[1])).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), engine.bootstrap())
        .await
        .expect("sibling stages should overlap")
        .unwrap();
    assert_eq!(report.refreshed.len(), 2);
}

/// Counts in-flight runs of one stage and remembers the peak
#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl Overlap {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

fn slow_sum(name: &'static str, upstream: &'static str, overlap: &Arc<Overlap>) -> StageDefinition {
    let overlap = Arc::clone(overlap);
    StageDefinition::new(name, move |ctx: &RefreshContext| {
        overlap.enter();
        std::thread::sleep(Duration::from_millis(2));
        let total = ctx.rows::<u64>(upstream).map(|rows| rows.iter().sum::<u64>());
        overlap.exit();
        Materialized::from_rows(vec![total?])
    })
    .depends_on([upstream])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_cycles_never_run_a_stage_twice_at_once() {
    let clock = fixed_clock();
    let config = EngineConfig::default().with_workers(4).with_retained_versions(64);
    let engine = engine_with(&clock, config);
    let raw = engine.register_source("raw").unwrap();
    let head_overlap = Arc::new(Overlap::default());
    let tail_overlap = Arc::new(Overlap::default());
    let head = engine.register_stage(slow_sum("head", "raw", &head_overlap)).unwrap();
    let tail = engine.register_stage(slow_sum("tail", "head", &tail_overlap)).unwrap();
    engine.write_source(raw, numbers(&[0])).unwrap();
    engine.bootstrap().await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 1..=16_u64 {
        let engine = engine.clone();
        tasks.spawn(async move {
            if i % 4 == 0 {
                engine.refresh(&[head]).await.map(|_| ())
            } else {
                engine
                    .write_and_propagate(raw, numbers(&[i, i]))
                    .await
                    .map(|_| ())
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(head_overlap.peak.load(Ordering::SeqCst), 1);
    assert_eq!(tail_overlap.peak.load(Ordering::SeqCst), 1);
    assert!(head_overlap.runs.load(Ordering::SeqCst) > 1);

    let versions = engine.versions(raw);
    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]), "{versions:?}");
    assert_eq!(versions.len(), 13);

    // Whatever write landed last, one more cycle leaves the chain consistent with it.
    engine.sources_changed(&[raw]).await.unwrap();
    let expected: u64 = engine.read_rows::<u64>(raw).unwrap().iter().sum();
    assert_eq!(*engine.read_rows::<u64>(head).unwrap(), vec![expected]);
    assert_eq!(*engine.read_rows::<u64>(tail).unwrap(), vec![expected]);
}

#[tokio::test]
async fn interval_stage_refreshes_only_when_due() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let rollup = engine
        .register_stage(
            sum_stage("rollup", &["raw"], &calls)
                .policy(RefreshPolicy::every(Duration::from_secs(60))),
        )
        .unwrap();

    engine.write_source(raw, numbers(&[1])).unwrap();
    engine.bootstrap().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Source changes do not reach interval stages.
    let report = engine.write_and_propagate(raw, numbers(&[1, 2])).await.unwrap().unwrap();
    assert!(!report.recomputed("rollup"));
    assert_eq!(*engine.read_rows::<u64>(rollup).unwrap(), vec![1]);

    clock.advance(ChronoDuration::seconds(30));
    let early = engine.tick().await.unwrap();
    assert_eq!(early.recomputed_count(), 0);

    clock.advance(ChronoDuration::seconds(30));
    let due = engine.tick().await.unwrap();
    assert_eq!(due.refreshed, vec!["rollup"]);
    assert_eq!(*engine.read_rows::<u64>(rollup).unwrap(), vec![3]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn time_dependent_stage_runs_every_tick_but_publishes_only_changes() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let today = engine
        .register_stage(
            StageDefinition::new("today", |ctx: &RefreshContext| {
                let _ = ctx.rows::<u64>("raw")?;
                Materialized::from_rows(vec![ctx.now().date_naive().to_string()])
            })
            .depends_on(["raw"])
            .time_dependent(),
        )
        .unwrap();
    engine.write_source(raw, numbers(&[])).unwrap();
    engine.bootstrap().await.unwrap();

    clock.advance(ChronoDuration::hours(1));
    let same_day = engine.tick().await.unwrap();
    assert_eq!(same_day.unchanged, vec!["today"]);
    assert_eq!(engine.read(today).unwrap().version, Version(1));

    clock.advance(ChronoDuration::days(1));
    let next_day = engine.tick().await.unwrap();
    assert_eq!(next_day.refreshed, vec!["today"]);
    assert_eq!(*engine.read_rows::<String>(today).unwrap(), vec!["2024-06-02".to_string()]);
}

#[tokio::test]
async fn suspended_stage_blocks_propagation_until_resumed() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let middle = engine.register_stage(sum_stage("middle", &["raw"], &calls)).unwrap();
    let last = engine.register_stage(sum_stage("last", &["middle"], &calls)).unwrap();

    engine.write_source(raw, numbers(&[1])).unwrap();
    engine.bootstrap().await.unwrap();

    engine.suspend(middle).unwrap();
    assert!(engine.is_suspended(middle));
    let report = engine.write_and_propagate(raw, numbers(&[1, 5])).await.unwrap().unwrap();
    assert_eq!(report.recomputed_count(), 0);
    assert_eq!(*engine.read_rows::<u64>(last).unwrap(), vec![1]);

    engine.resume(middle).unwrap();
    assert!(!engine.is_suspended(middle));
    let report = engine.sources_changed(&[raw]).await.unwrap();
    assert_eq!(report.refreshed, vec!["middle", "last"]);
    assert_eq!(*engine.read_rows::<u64>(last).unwrap(), vec![6]);
}

#[tokio::test]
async fn older_versions_are_retained_up_to_the_limit() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default().with_retained_versions(2));
    let raw = engine.register_source("raw").unwrap();

    for n in 1..=3 {
        engine.write_source(raw, numbers(&[n])).unwrap();
    }

    assert_eq!(engine.versions(raw), vec![Version(2), Version(3)]);
    assert!(engine.read_version(raw, Version(1)).is_none());
    let v2 = engine.read_version(raw, Version(2)).unwrap();
    assert_eq!(*v2.rows::<u64>().unwrap(), vec![2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticker_drives_due_stages_until_shutdown() {
    let clock = fixed_clock();
    let engine = engine_with(&clock, EngineConfig::default());
    let raw = engine.register_source("raw").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let rollup = engine
        .register_stage(
            sum_stage("rollup", &["raw"], &calls)
                .policy(RefreshPolicy::every(Duration::from_secs(60))),
        )
        .unwrap();
    engine.write_source(raw, numbers(&[2])).unwrap();
    engine.bootstrap().await.unwrap();

    clock.advance(ChronoDuration::minutes(1));
    let ticker = engine.spawn_ticker(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(150)).await;
    ticker.shutdown().await;

    // The clock never moves again, so only the first tick finds the stage due.
    let history = engine.history(rollup);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].trigger, "tick");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

proptest! {
    #[test]
    fn dag_never_accepts_a_cycle(
        nodes in 2u32..12,
        edges in prop::collection::vec((0u32..12, 0u32..12), 0..40),
    ) {
        let dag = Dag::new();
        for n in 0..nodes {
            dag.add_node(TableId(n));
        }

        let mut accepted = Vec::new();
        for (up, down) in edges {
            let (up, down) = (TableId(up % nodes), TableId(down % nodes));
            if dag.add_edge(up, down).is_ok() {
                accepted.push((up, down));
            }
        }

        let order = dag.topological_sort().unwrap();
        prop_assert_eq!(order.len(), nodes as usize);
        let position = |id: TableId| order.iter().position(|n| *n == id).unwrap();
        for (up, down) in accepted {
            prop_assert!(position(up) < position(down));
        }
    }
}
