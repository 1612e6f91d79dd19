//! In-memory repository that records rendered statements and answers
//! queries from canned responses.

use std::sync::Arc;

use anyhow::Result;

use super::{Executor, Repository, RepositoryError, Row, Statement, Transaction};

#[derive(Default)]
struct Inner {
    log: parking_lot::Mutex<Vec<String>>,
    responses: parking_lot::Mutex<Vec<(String, Vec<Row>)>>,
    once: parking_lot::Mutex<Vec<(String, Vec<Row>)>>,
    failures: parking_lot::Mutex<Vec<(String, RepositoryError)>>,
    ping_ok: parking_lot::Mutex<bool>,
}

impl Inner {
    fn execute(&self, statement: &Statement) -> Result<()> {
        let sql = statement.render()?;
        self.fail_if_scripted(&sql)?;
        self.log.lock().push(sql);
        Ok(())
    }

    fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        let sql = statement.render()?;
        self.fail_if_scripted(&sql)?;
        let once = {
            let mut once = self.once.lock();
            once.iter()
                .position(|(needle, _)| sql.contains(needle.as_str()))
                .map(|pos| once.remove(pos).1)
        };
        let rows = once.unwrap_or_else(|| self.canned(&sql));
        self.log.lock().push(sql);
        Ok(rows)
    }

    fn canned(&self, sql: &str) -> Vec<Row> {
        self.responses
            .lock()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }

    fn fail_if_scripted(&self, sql: &str) -> Result<()> {
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|(needle, _)| sql.contains(needle.as_str())) {
            let (_, err) = failures.remove(pos);
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct RecordingRepository {
    inner: Arc<Inner>,
}

impl RecordingRepository {
    pub(crate) fn new() -> Self {
        let inner = Inner::default();
        *inner.ping_ok.lock() = true;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Queries whose text contains `needle` return `rows`.
    pub(crate) fn respond(&self, needle: &str, rows: Vec<Row>) {
        self.inner.responses.lock().push((needle.to_string(), rows));
    }

    /// The next query containing `needle` returns `rows`, ahead of any
    /// standing response. Queued answers are consumed in order.
    pub(crate) fn respond_once(&self, needle: &str, rows: Vec<Row>) {
        self.inner.once.lock().push((needle.to_string(), rows));
    }

    /// The next statement containing `needle` fails with `err`.
    pub(crate) fn fail_once(&self, needle: &str, err: RepositoryError) {
        self.inner.failures.lock().push((needle.to_string(), err));
    }

    pub(crate) fn set_ping(&self, ok: bool) {
        *self.inner.ping_ok.lock() = ok;
    }

    /// Every statement seen so far, including transaction markers.
    pub(crate) fn log(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }

    pub(crate) fn statements_containing(&self, needle: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|sql| sql.contains(needle))
            .collect()
    }
}

impl Executor for RecordingRepository {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        self.inner.execute(statement)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.inner.query(statement)
    }
}

impl Repository for RecordingRepository {
    type Transaction = RecordingTransaction;

    async fn begin(&self) -> Result<RecordingTransaction> {
        self.inner.log.lock().push("BEGIN".to_string());
        Ok(RecordingTransaction {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn ping(&self) -> Result<()> {
        if *self.inner.ping_ok.lock() {
            Ok(())
        } else {
            Err(RepositoryError::Connectivity("ping refused".into()).into())
        }
    }
}

pub(crate) struct RecordingTransaction {
    inner: Arc<Inner>,
}

impl Executor for RecordingTransaction {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        self.inner.execute(statement)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.inner.query(statement)
    }
}

impl Transaction for RecordingTransaction {
    async fn commit(self) -> Result<()> {
        self.inner.log.lock().push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.inner.log.lock().push("ROLLBACK".to_string());
        Ok(())
    }
}
