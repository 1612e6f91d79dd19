mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serial_test::serial;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wristband::catalog::Target;
use wristband::config::DispatcherConfig;
use wristband::dispatch::Dispatcher;
use wristband::metric::{ChangeSpeed, Column, DataType, MetricGroup, Value};
use wristband::probe::{Probe, ProbeError, ResultSet};
use wristband::schedule::{never, InstanceId, Schedule};
use wristband::state::SharedState;
use wristband::writer::Writer;

use common::{catalog, target, MemoryRepository};

/// Answers with one `busy` sample, optionally after a delay.
struct CpuProbe {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl CpuProbe {
    fn new(delay: Duration, fail: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail,
        }
    }
}

impl Probe for CpuProbe {
    async fn probe(
        &self,
        _instance_id: InstanceId,
        target: &Target,
        _group: &MetricGroup,
    ) -> Result<ResultSet, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ProbeError::ConnectRefused(target.endpoint.clone()));
        }
        Ok(ResultSet::new(
            Utc::now(),
            vec!["busy".to_string()],
            vec![vec![Value::Double(target.id as f64)]],
        ))
    }
}

fn cpu_group() -> MetricGroup {
    MetricGroup {
        id: 2,
        name: "cpu".to_string(),
        probe_code: "cpuu".to_string(),
        query: "/cpu".to_string(),
        change_speed: ChangeSpeed::Fast,
        multi_row: false,
        cumulative: false,
        key_columns: Vec::new(),
        attribute_columns: Vec::new(),
        attribute_change_speed: ChangeSpeed::Static,
        metric_columns: vec![Column::new("busy", DataType::Double)],
        schedule: Schedule::new(0, 1, 1),
        archive_tiers: Vec::new(),
    }
}

struct Running {
    state: SharedState<MemoryRepository>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Running {
    async fn stop(self) -> SharedState<MemoryRepository> {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
        self.state
    }
}

fn start(
    repo: &MemoryRepository,
    probe: Arc<CpuProbe>,
    targets: Vec<i64>,
    cfg: DispatcherConfig,
) -> Running {
    let group = cpu_group();
    let state = SharedState::new(
        Arc::new(repo.clone()),
        catalog(
            targets.iter().map(|id| target(*id, vec![group.id])).collect(),
            vec![group.clone()],
        ),
        None,
    );
    for id in &targets {
        state.registry.register(*id, group.id, group.schedule);
    }

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let writer = Writer::new(state.clone());
    let writer_cancel = cancel.clone();
    let dispatcher = Dispatcher::new(state.clone(), probe, tx, cfg);
    let dispatcher_cancel = cancel.clone();

    let tasks = vec![
        tokio::spawn(async move { writer.run(rx, writer_cancel).await }),
        tokio::spawn(async move { dispatcher.run(dispatcher_cancel).await }),
    ];

    Running {
        state,
        cancel,
        tasks,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_due_schedules_are_probed_and_written() {
    let repo = MemoryRepository::new();
    let probe = Arc::new(CpuProbe::new(Duration::ZERO, false));
    let running = start(&repo, Arc::clone(&probe), vec![1, 2], DispatcherConfig::default());

    let table_1 = "tgt000000001.cpuu_000000002_data_single_fast";
    let table_2 = "tgt000000002.cpuu_000000002_data_single_fast";
    let written = wait_for(
        || repo.rows(table_1).len() >= 2 && repo.rows(table_2).len() >= 2,
        Duration::from_secs(5),
    )
    .await;
    let state = running.stop().await;

    assert!(written, "both targets sampled twice");
    assert_eq!(repo.rows(table_2)[0]["busy"], Value::Double(2.0));

    for instance in state.registry.snapshot() {
        assert!(instance.last_polled > never());
    }
    assert!(state.supervisor.failures().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_failed_probes_are_rescheduled_without_writes() {
    let repo = MemoryRepository::new();
    let probe = Arc::new(CpuProbe::new(Duration::ZERO, true));
    let running = start(&repo, Arc::clone(&probe), vec![1], DispatcherConfig::default());

    let retried = wait_for(
        || probe.calls.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(5),
    )
    .await;
    let state = running.stop().await;

    assert!(retried, "probe retried on the next fire");
    assert!(repo.log().is_empty());
    let instance = &state.registry.snapshot()[0];
    assert_eq!(instance.last_polled, never());
    assert!(state.supervisor.failures().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_in_flight_probes_are_bounded() {
    let repo = MemoryRepository::new();
    let probe = Arc::new(CpuProbe::new(Duration::from_secs(3), false));
    let cfg = DispatcherConfig {
        max_in_flight: 1,
        ..DispatcherConfig::default()
    };
    let running = start(&repo, Arc::clone(&probe), vec![1, 2, 3], cfg);

    let started = wait_for(
        || probe.calls.load(Ordering::SeqCst) >= 1,
        Duration::from_secs(3),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let calls = probe.calls.load(Ordering::SeqCst);
    running.stop().await;

    assert!(started);
    assert_eq!(calls, 1, "one permit, one probe in flight");
}
