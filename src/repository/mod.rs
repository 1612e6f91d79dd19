//! Durable store seam: statements, executor traits and error taxonomy.

pub mod clickhouse;
pub mod sql;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;

use anyhow::Result;
use thiserror::Error;

use crate::metric::Value;

pub use self::clickhouse::ClickHouseRepository;

/// Failure kinds callers branch on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A schema or table does not exist yet.
    #[error("missing object: {0}")]
    MissingObject(String),

    /// The repository cannot be reached.
    #[error("repository unreachable: {0}")]
    Connectivity(String),

    #[error("{0}")]
    Other(String),
}

impl RepositoryError {
    /// Finds a classified repository error anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&RepositoryError> {
        err.chain().find_map(|e| e.downcast_ref::<RepositoryError>())
    }

    pub fn is_missing_object(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Self::MissingObject(_)))
    }

    pub fn is_connectivity(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Self::Connectivity(_)))
    }
}

/// Placeholder/parameter mismatch while rendering a statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    #[error("statement has more placeholders than the {0} bound parameters")]
    MissingParam(usize),

    #[error("statement binds {params} parameters but uses only {used}")]
    UnusedParams { params: usize, used: usize },
}

/// SQL text with `?` placeholders and their parameters.
///
/// Parameters are rendered client-side as escaped literals. A `?` inside a
/// quoted literal is not a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    text: String,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    /// Appends one parameter.
    pub fn bind(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }

    pub fn bind_all(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.params.extend(values);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Substitutes every placeholder with its literal.
    pub fn render(&self) -> Result<String, StatementError> {
        let mut out = String::with_capacity(self.text.len() + self.params.len() * 16);
        let mut params = self.params.iter();
        let mut used = 0;
        let mut in_literal = false;
        let mut escaped = false;

        for ch in self.text.chars() {
            if in_literal {
                out.push(ch);
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '\'' {
                    in_literal = false;
                }
                continue;
            }

            match ch {
                '\'' => {
                    in_literal = true;
                    out.push(ch);
                }
                '?' => {
                    let value = params.next().ok_or(StatementError::MissingParam(self.params.len()))?;
                    used += 1;
                    out.push_str(&sql::literal(value));
                }
                _ => out.push(ch),
            }
        }

        if used != self.params.len() {
            return Err(StatementError::UnusedParams {
                params: self.params.len(),
                used,
            });
        }

        Ok(out)
    }
}

/// One result row, in select-list order.
pub type Row = Vec<Value>;

/// Runs statements.
pub trait Executor: Send + Sync {
    /// Runs a statement that returns no rows.
    fn execute(&self, statement: &Statement) -> impl Future<Output = Result<()>> + Send;

    /// Runs a query and returns its rows. Timestamps come back as unix
    /// seconds (`Value::Int`); callers coerce to declared types.
    fn query(&self, statement: &Statement) -> impl Future<Output = Result<Vec<Row>>> + Send;
}

/// Connection-level operations.
pub trait Repository: Executor + 'static {
    type Transaction: Transaction;

    /// Opens a transaction on a dedicated connection.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;

    /// Cheap round trip used to detect recovered connectivity.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A unit of work. Dropping without commit leaves the outcome to the server.
pub trait Transaction: Executor + Sized {
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `statements` in one transaction, rolling back on the first failure.
pub async fn execute_in_transaction<R: Repository>(
    repo: &R,
    statements: &[Statement],
) -> Result<()> {
    let tx = repo.begin().await?;

    for statement in statements {
        if let Err(e) = tx.execute(statement).await {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            return Err(e);
        }
    }

    tx.commit().await
}
