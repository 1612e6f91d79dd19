//! Write path for probe results.
//!
//! Multi-row batches go through dimension reconciliation: dictionary rows
//! are committed and the dictionary cache reloaded before any fact row
//! that references their ids is written.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheRegistry};
use crate::metric::{MetricGroup, TargetId, Value};
use crate::probe::ResultSet;
use crate::reconcile::{reconcile, DictionaryOp, DimensionRow};
use crate::repository::sql::{self, FactRow};
use crate::repository::{execute_in_transaction, Repository, RepositoryError, Statement};
use crate::schedule::InstanceId;
use crate::state::SharedState;

/// A successful probe result queued for persistence.
#[derive(Debug, Clone)]
pub struct ProbeMessage {
    pub instance_id: InstanceId,
    pub target_id: TargetId,
    pub metric_group: Arc<MetricGroup>,
    pub result_set: ResultSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Fact rows persisted and caches refreshed.
    Written(usize),
    /// The probe returned no rows.
    Empty,
    /// Columns did not match the declared shape.
    ShapeMismatch,
}

pub struct Writer<R: Repository> {
    state: SharedState<R>,
}

impl<R: Repository> Writer<R> {
    pub fn new(state: SharedState<R>) -> Self {
        Self { state }
    }

    /// Consumes the queue until it closes or `cancel` fires. On cancel,
    /// messages already queued are still written.
    pub async fn run(&self, mut rx: mpsc::Receiver<ProbeMessage>, cancel: CancellationToken) {
        info!("writer started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(msg) = rx.recv().await {
                        self.handle(msg).await;
                        drained += 1;
                    }
                    info!(drained, "writer stopped");
                    return;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if let Some(health) = &self.state.health {
                            health.write_queue_length.set(rx.len() as f64);
                        }
                        self.handle(msg).await;
                    }
                    None => {
                        info!("write queue closed, writer stopped");
                        return;
                    }
                },
            }
        }
    }

    /// Writes one message, absorbing per-batch failures.
    pub async fn handle(&self, msg: ProbeMessage) {
        if !self.state.supervisor.is_accessible() {
            debug!(target_id = msg.target_id, "repository inaccessible, dropping sample");
            self.dropped("repository_inaccessible");
            return;
        }

        match self.write(&msg).await {
            Ok(_) => {}
            Err(e) if RepositoryError::is_connectivity(&e) => {
                warn!(
                    target_id = msg.target_id,
                    group = %msg.metric_group.name,
                    error = %e,
                    "repository unreachable, dropping sample"
                );
                self.state.supervisor.set_accessible(false);
                self.dropped("connectivity");
            }
            Err(e) => {
                error!(
                    instance_id = msg.instance_id,
                    target_id = msg.target_id,
                    group = %msg.metric_group.name,
                    error = %format!("{e:#}"),
                    "batch aborted"
                );
                self.dropped("error");
            }
        }
    }

    /// Persists one probe result.
    pub async fn write(&self, msg: &ProbeMessage) -> Result<WriteOutcome> {
        let group = &msg.metric_group;
        let rs = &msg.result_set;

        if !rs.matches_shape(group) {
            warn!(
                target_id = msg.target_id,
                group = %group.name,
                columns = ?rs.columns,
                "probe columns do not match metric group, dropping sample"
            );
            self.dropped("shape_mismatch");
            return Ok(WriteOutcome::ShapeMismatch);
        }

        if rs.is_empty() {
            debug!(target_id = msg.target_id, group = %group.name, "empty result set");
            return Ok(WriteOutcome::Empty);
        }

        let started = Instant::now();
        let rows = if group.multi_row {
            self.write_multi_row(msg.target_id, group, rs).await?
        } else if group.is_interval_data() {
            self.write_interval(msg.target_id, group, rs).await?
        } else {
            self.write_single_row(msg.target_id, group, rs).await?
        };

        if let Some(health) = &self.state.health {
            health.samples_written.inc_by(rows as f64);
            health.write_duration.observe(started.elapsed().as_secs_f64());
        }

        Ok(WriteOutcome::Written(rows))
    }

    async fn write_multi_row(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        rs: &ResultSet,
    ) -> Result<usize> {
        let repo = &*self.state.repo;
        let caches = &self.state.caches;

        let ids = match self.apply_dictionary(target_id, group, rs).await {
            Err(e) if RepositoryError::is_missing_object(&e) => {
                info!(target_id, group = %group.name, "creating tables and retrying batch");
                cache::create_tables(repo, target_id, group).await?;
                cache::load_dictionary(repo, caches, target_id, group).await?;
                self.apply_dictionary(target_id, group, rs).await?
            }
            result => result?,
        };

        // Seed before inserting so the previous sample comes from storage.
        let data = cache::ensure_data(repo, caches, target_id, group).await?;

        let metric_start = group.key_columns.len() + group.attribute_columns.len();
        let facts: Vec<FactRow> = rs
            .rows
            .iter()
            .zip(&ids)
            .map(|(row, id)| FactRow {
                dt: rs.probed_at,
                dict_id: Some(*id),
                metrics: row[metric_start..].to_vec(),
            })
            .collect();

        if let Some(insert) = sql::insert_facts(target_id, group, &facts) {
            execute_in_transaction(repo, &[insert])
                .await
                .context("writing facts")?;
        }

        for fact in &facts {
            data.add_or_update(fact.dict_id, Vec::new(), fact.metrics.clone(), None)?;
        }

        Ok(facts.len())
    }

    /// Reconciles the batch's dimensions, commits the dictionary writes and
    /// returns the surrogate id of every row.
    async fn apply_dictionary(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        rs: &ResultSet,
    ) -> Result<Vec<i64>> {
        let repo = &*self.state.repo;
        let caches: &CacheRegistry = &self.state.caches;

        let mut dictionary = cache::ensure_dictionary(repo, caches, target_id, group).await?;

        let key_count = group.key_columns.len();
        let attribute_end = key_count + group.attribute_columns.len();
        let dimensions: Vec<DimensionRow> = rs
            .rows
            .iter()
            .map(|row| DimensionRow {
                keys: row[..key_count].to_vec(),
                attributes: row[key_count..attribute_end].to_vec(),
            })
            .collect();

        let plan = reconcile(
            &dictionary,
            group.attribute_change_speed,
            &dimensions,
            rs.probed_at,
        )?;

        if !plan.is_empty() {
            let updated = Utc::now();
            let statements: Vec<Statement> = plan
                .ops
                .iter()
                .map(|op| dictionary_statement(target_id, group, op, updated))
                .collect();

            execute_in_transaction(repo, &statements)
                .await
                .context("writing dictionary rows")?;

            if let Some(health) = &self.state.health {
                health.dictionary_rows_opened.inc_by(plan.opened() as f64);
                health.dictionary_rows_closed.inc_by(plan.closed() as f64);
            }
            debug!(
                target_id,
                group = %group.name,
                opened = plan.opened(),
                closed = plan.closed(),
                "dictionary updated"
            );

            dictionary = cache::load_dictionary(repo, caches, target_id, group).await?;
        }

        dimensions
            .iter()
            .map(|d| {
                dictionary
                    .get_by_key(&d.keys)
                    .ok_or_else(|| anyhow!("dictionary has no id for key {:?}", d.keys))
            })
            .collect()
    }

    async fn write_single_row(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        rs: &ResultSet,
    ) -> Result<usize> {
        let metrics = first_row(rs, group)?;
        let data = cache::ensure_data(&*self.state.repo, &self.state.caches, target_id, group)
            .await?;

        let fact = FactRow {
            dt: rs.probed_at,
            dict_id: None,
            metrics: metrics.clone(),
        };
        if let Some(insert) = sql::insert_facts(target_id, group, &[fact]) {
            self.execute_creating_tables(target_id, group, &insert).await?;
        }

        data.add_or_update(Some(target_id), Vec::new(), metrics, None)?;
        Ok(1)
    }

    /// Extends the open interval while values are unchanged; otherwise
    /// starts a new one at the sample time.
    async fn write_interval(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        rs: &ResultSet,
    ) -> Result<usize> {
        let metrics = first_row(rs, group)?;
        let data = cache::ensure_data(&*self.state.repo, &self.state.caches, target_id, group)
            .await?;

        let now = rs.probed_at;
        let start = match data.get_row(target_id) {
            Some(current) if current.values == metrics => current.valid_from.unwrap_or(now),
            _ => now,
        };

        let insert = sql::insert_interval(target_id, group, start, now, &metrics);
        self.execute_creating_tables(target_id, group, &insert).await?;

        data.add_or_update(Some(target_id), Vec::new(), metrics, Some(start))?;
        Ok(1)
    }

    /// Executes `statement`, creating the tables of (target, group) and
    /// retrying once if they are missing.
    async fn execute_creating_tables(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        statement: &Statement,
    ) -> Result<()> {
        let repo = &*self.state.repo;
        match repo.execute(statement).await {
            Err(e) if RepositoryError::is_missing_object(&e) => {
                info!(target_id, group = %group.name, "creating tables and retrying write");
                cache::create_tables(repo, target_id, group).await?;
                repo.execute(statement).await.context("writing sample")
            }
            result => result.context("writing sample"),
        }
    }

    fn dropped(&self, reason: &str) {
        if let Some(health) = &self.state.health {
            health.samples_dropped.with_label_values(&[reason]).inc();
        }
    }
}

fn first_row(rs: &ResultSet, group: &MetricGroup) -> Result<Vec<Value>> {
    if rs.rows.len() > 1 {
        warn!(
            group = %group.name,
            rows = rs.rows.len(),
            "single-row group returned several rows, using the first"
        );
    }
    rs.rows
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("result set is empty"))
}

fn dictionary_statement(
    target_id: TargetId,
    group: &MetricGroup,
    op: &DictionaryOp,
    updated: chrono::DateTime<Utc>,
) -> Statement {
    match op {
        DictionaryOp::Open {
            id,
            keys,
            attributes,
            valid_from,
        } => sql::insert_dictionary_row(
            target_id, group, *id, keys, attributes, *valid_from, None, updated,
        ),
        DictionaryOp::Close {
            id,
            keys,
            attributes,
            valid_from,
            valid_to,
        } => sql::insert_dictionary_row(
            target_id,
            group,
            *id,
            keys,
            attributes,
            *valid_from,
            Some(*valid_to),
            updated,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Target};
    use crate::metric::tests::sample_group;
    use crate::metric::ChangeSpeed;
    use crate::repository::testing::RecordingRepository;
    use chrono::{DateTime, TimeZone};

    const DICT: &str = "tgt000000001.sqlp_000000004_dict_slow FINAL";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    fn writer(group: &MetricGroup) -> (Writer<RecordingRepository>, RecordingRepository) {
        let repo = RecordingRepository::new();
        let catalog = Catalog::new(
            vec![Target {
                id: 1,
                name: "sql01".into(),
                endpoint: "http://sql01:8080".into(),
                metric_groups: vec![group.id],
            }],
            vec![group.clone()],
        );
        let state = SharedState::new(Arc::new(repo.clone()), catalog, None);
        (Writer::new(state), repo)
    }

    fn message(group: &MetricGroup, probed_at: DateTime<Utc>, rows: Vec<Vec<Value>>) -> ProbeMessage {
        ProbeMessage {
            instance_id: 1,
            target_id: 1,
            metric_group: Arc::new(group.clone()),
            result_set: ResultSet::new(
                probed_at,
                group.expected_columns().map(|c| c.name.clone()).collect(),
                rows,
            ),
        }
    }

    fn wait_row(category: &str, tasks: f64, ms: f64) -> Vec<Value> {
        vec![
            Value::Text("LCK_M_S".into()),
            Value::Text(category.into()),
            Value::Double(tasks),
            Value::Double(ms),
        ]
    }

    fn stored_dictionary_row(id: i64, category: &str, from: DateTime<Utc>) -> Vec<Value> {
        vec![
            Value::Int(id),
            Value::Text("LCK_M_S".into()),
            Value::Text(category.into()),
            Value::Int(from.timestamp()),
        ]
    }

    #[tokio::test]
    async fn test_dictionary_commits_before_facts() {
        let group = sample_group();
        let (writer, repo) = writer(&group);
        repo.respond_once(DICT, Vec::new());
        repo.respond(DICT, vec![stored_dictionary_row(1, "lock", at(0))]);

        let outcome = writer
            .write(&message(&group, at(0), vec![wait_row("lock", 2.0, 100.0)]))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(1));

        let log = repo.log();
        let dict_insert = log
            .iter()
            .position(|s| s.starts_with("INSERT INTO tgt000000001.sqlp_000000004_dict_slow"))
            .unwrap();
        let fact_insert = log
            .iter()
            .position(|s| s.starts_with("INSERT INTO tgt000000001.sqlp_000000004_data_multi_fast"))
            .unwrap();
        assert_eq!(log[dict_insert - 1], "BEGIN");
        assert_eq!(log[dict_insert + 1], "COMMIT");
        assert!(log[dict_insert + 2].contains(DICT), "dictionary reloaded after commit");
        assert!(dict_insert < fact_insert);
        assert!(log[fact_insert].contains("'2024-01-01 00:00:00.000', 1, 2, 100"));
    }

    #[tokio::test]
    async fn test_second_sample_yields_delta_and_no_dictionary_write() {
        let group = sample_group();
        let (writer, repo) = writer(&group);
        repo.respond_once(DICT, Vec::new());
        repo.respond(DICT, vec![stored_dictionary_row(1, "lock", at(0))]);

        writer
            .write(&message(&group, at(0), vec![wait_row("lock", 2.0, 100.0)]))
            .await
            .unwrap();
        let data = writer.state.caches.data(1, &group).unwrap();
        assert_eq!(data.get(1), None);

        writer
            .write(&message(&group, at(15), vec![wait_row("lock", 3.0, 140.0)]))
            .await
            .unwrap();
        assert_eq!(data.get(1), Some(vec![Value::Double(1.0), Value::Double(40.0)]));
        assert_eq!(
            repo.statements_containing("INSERT INTO tgt000000001.sqlp_000000004_dict_slow")
                .len(),
            1
        );
        assert_eq!(
            repo.statements_containing("INSERT INTO tgt000000001.sqlp_000000004_data_multi_fast")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_attribute_change_closes_and_opens() {
        let group = sample_group();
        let (writer, repo) = writer(&group);
        repo.respond_once(DICT, vec![stored_dictionary_row(1, "lock", at(0))]);
        repo.respond_once("max(id)", vec![vec![Value::Int(1)]]);
        repo.respond(DICT, vec![stored_dictionary_row(2, "latch", at(60))]);

        writer
            .write(&message(&group, at(60), vec![wait_row("latch", 1.0, 5.0)]))
            .await
            .unwrap();

        let inserts =
            repo.statements_containing("INSERT INTO tgt000000001.sqlp_000000004_dict_slow");
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].contains("VALUES (1, 'LCK_M_S', 'lock', '2024-01-01 00:00:00.000', '2024-01-01 00:01:00.000'"));
        assert!(inserts[1].contains("VALUES (2, 'LCK_M_S', 'latch', '2024-01-01 00:01:00.000', NULL"));

        let facts = repo.statements_containing("data_multi_fast (dt, dictId");
        assert!(facts[0].contains(", 2, 1, 5)"));
    }

    #[tokio::test]
    async fn test_missing_dictionary_table_is_created_and_retried() {
        let group = sample_group();
        let (writer, repo) = writer(&group);
        repo.respond_once(DICT, Vec::new());
        repo.respond_once(DICT, Vec::new());
        repo.respond(DICT, vec![stored_dictionary_row(1, "lock", at(0))]);
        repo.fail_once(
            "INSERT INTO tgt000000001.sqlp_000000004_dict_slow",
            RepositoryError::MissingObject("table".into()),
        );

        let outcome = writer
            .write(&message(&group, at(0), vec![wait_row("lock", 2.0, 100.0)]))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(1));
        assert!(repo.log().contains(&"ROLLBACK".to_string()));
        assert_eq!(repo.statements_containing("CREATE TABLE").len(), 2);
        assert_eq!(
            repo.statements_containing("INSERT INTO tgt000000001.sqlp_000000004_dict_slow")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_shape_mismatch_drops_sample() {
        let group = sample_group();
        let (writer, repo) = writer(&group);
        let mut msg = message(&group, at(0), vec![wait_row("lock", 1.0, 1.0)]);
        msg.result_set.columns.swap(0, 1);

        let outcome = writer.write(&msg).await.unwrap();
        assert_eq!(outcome, WriteOutcome::ShapeMismatch);
        assert!(repo.log().is_empty());
    }

    fn single_row_group(change_speed: ChangeSpeed) -> MetricGroup {
        let mut group = sample_group();
        group.multi_row = false;
        group.cumulative = false;
        group.change_speed = change_speed;
        group.key_columns.clear();
        group.attribute_columns.clear();
        group.archive_tiers.clear();
        group
    }

    #[tokio::test]
    async fn test_single_row_fast_insert() {
        let group = single_row_group(ChangeSpeed::Fast);
        let (writer, repo) = writer(&group);
        let metrics = vec![Value::Double(1.0), Value::Double(2.5)];

        writer
            .write(&message(&group, at(0), vec![metrics.clone()]))
            .await
            .unwrap();

        let inserts = repo.statements_containing("INSERT INTO");
        assert_eq!(
            inserts,
            vec!["INSERT INTO tgt000000001.sqlp_000000004_data_single_fast \
                  (dt, waiting_tasks, wait_ms) VALUES ('2024-01-01 00:00:00.000', 1, 2.5)"
                .to_string()]
        );
        assert_eq!(writer.state.caches.data(1, &group).unwrap().get(1), Some(metrics));
    }

    #[tokio::test]
    async fn test_interval_extends_until_values_change() {
        let group = single_row_group(ChangeSpeed::Slow);
        let (writer, repo) = writer(&group);
        let first = vec![Value::Double(4.0), Value::Double(8.0)];
        let second = vec![Value::Double(4.0), Value::Double(16.0)];

        for (secs, metrics) in [(0, &first), (3600, &first), (7200, &second)] {
            writer
                .write(&message(&group, at(secs), vec![metrics.clone()]))
                .await
                .unwrap();
        }

        let inserts = repo.statements_containing("INSERT INTO");
        assert_eq!(inserts.len(), 3);
        assert!(inserts[1].contains("VALUES ('2024-01-01 00:00:00.000', '2024-01-01 01:00:00.000', 4, 8)"));
        assert!(inserts[2].contains("VALUES ('2024-01-01 02:00:00.000', '2024-01-01 02:00:00.000', 4, 16)"));
    }

    #[tokio::test]
    async fn test_connectivity_loss_marks_repository_inaccessible() {
        let group = single_row_group(ChangeSpeed::Fast);
        let (writer, repo) = writer(&group);
        repo.fail_once("INSERT INTO", RepositoryError::Connectivity("reset".into()));

        let metrics = vec![Value::Double(1.0), Value::Double(2.0)];
        writer.handle(message(&group, at(0), vec![metrics.clone()])).await;
        assert!(!writer.state.supervisor.is_accessible());

        // Dropped while inaccessible.
        writer.handle(message(&group, at(15), vec![metrics])).await;
        assert!(repo.statements_containing("INSERT INTO").is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_cancel() {
        let group = single_row_group(ChangeSpeed::Fast);
        let (writer, repo) = writer(&group);
        let (tx, rx) = mpsc::channel(8);
        for secs in [0, 15] {
            tx.send(message(&group, at(secs), vec![vec![Value::Double(1.0), Value::Double(2.0)]]))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        writer.run(rx, cancel).await;

        assert_eq!(repo.statements_containing("INSERT INTO").len(), 2);
    }
}
