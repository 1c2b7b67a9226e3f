//! Traced database connection wrapper.
//!
//! Every statement the engine sends goes through [`TracedConn`], which wraps
//! it in a `tracing::debug_span!` carrying the SQL and the result size.

use std::future::Future;
use std::pin::Pin;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::Instrument;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// A wrapper around a database connection that logs all statements via tracing.
///
/// # Example
///
/// ```ignore
/// use ddlsync::ConnectionExt;
///
/// let tx = client.transaction().await?;
/// let traced = tx.traced();
/// traced.execute("CREATE INDEX ...", &[]).await?;
/// ```
pub struct TracedConn<'a, C: Connection> {
    conn: &'a C,
}

impl<'a, C: Connection> TracedConn<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            params = params.len(),
            affected = tracing::field::Empty,
        );
        let affected = self
            .conn
            .execute(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("affected", affected);
        Ok(affected)
    }

    /// Execute a query, returning all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let rows = self
            .conn
            .query(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Execute a query, returning exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = 1u64,
        );
        self.conn.query_one(sql, params).instrument(span).await
    }

    /// Run one or more statements over the simple query protocol, without parameters.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.batch_execute", sql = %sql);
        self.conn.batch_execute(sql).instrument(span).await
    }
}

/// Extension trait to get a traced wrapper from a connection.
pub trait ConnectionExt: Connection + Sized {
    /// Wrap this connection in a `TracedConn` for statement logging.
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<C: Connection> ConnectionExt for C {}

/// Anything the engine can send statements to.
///
/// Implemented for `tokio_postgres::Client` and `tokio_postgres::Transaction`;
/// a run normally works on a transaction so its DDL commits or rolls back as one.
pub trait Connection: Send + Sync {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, u64>;

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Vec<Row>>;

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Row>;

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, ()>;
}

impl Connection for tokio_postgres::Client {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, u64> {
        Box::pin(tokio_postgres::Client::execute(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(tokio_postgres::Client::query(self, sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Row> {
        Box::pin(tokio_postgres::Client::query_one(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(tokio_postgres::Client::batch_execute(self, sql))
    }
}

impl Connection for tokio_postgres::Transaction<'_> {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, u64> {
        Box::pin(tokio_postgres::Transaction::execute(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(tokio_postgres::Transaction::query(self, sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Row> {
        Box::pin(tokio_postgres::Transaction::query_one(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(tokio_postgres::Transaction::batch_execute(self, sql))
    }
}
