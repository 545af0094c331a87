use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread;

use futures::Stream;
use rusqlite::{Connection, DatabaseName, params_from_iter};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, event};

use super::query::{Statement, quote_ident};
use crate::core::{QueryResult, Result, Row, SyncError, Value};

/// File name of the durable replica image inside the namespace directory.
pub const REPLICA_FILE: &str = "replica.db";

type Reply<T> = oneshot::Sender<Result<T>>;
type LiveSender = mpsc::UnboundedSender<Result<Vec<Row>>>;

/// One step of an engine transaction.
#[derive(Debug, Clone)]
pub enum TxStep {
    /// Unparameterised SQL, possibly several statements.
    Batch(String),
    Statement(Statement),
}

impl TxStep {
    fn touched(&self) -> Touched {
        match self {
            Self::Batch(_) => Touched::All,
            Self::Statement(statement) => Touched::from_statement(statement),
        }
    }
}

/// A row-level change received from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// Insert or update; the map holds every column carried by the message.
    Upsert(BTreeMap<String, Value>),
    /// Delete; the map must contain the primary-key columns.
    Delete(BTreeMap<String, Value>),
}

/// Changes for one table applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub table: String,
    pub primary_key: Vec<String>,
    /// Clear the table before applying `changes`.
    pub truncate: bool,
    pub changes: Vec<RowChange>,
}

impl ChangeBatch {
    pub fn new(table: &str, primary_key: &[String]) -> Self {
        Self {
            table: table.to_string(),
            primary_key: primary_key.to_vec(),
            truncate: false,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.truncate && self.changes.is_empty()
    }
}

enum EngineRequest {
    Ping {
        reply: Reply<()>,
    },
    Query {
        statement: Statement,
        reply: Reply<QueryResult>,
    },
    Execute {
        statement: Statement,
        reply: Reply<usize>,
    },
    ExecuteBatch {
        sql: String,
        reply: Reply<()>,
    },
    Transaction {
        steps: Vec<TxStep>,
        reply: Reply<usize>,
    },
    ApplyChanges {
        batch: ChangeBatch,
        reply: Reply<usize>,
    },
    TruncateTable {
        table: String,
        reply: Reply<()>,
    },
    Persist {
        reply: Reply<()>,
    },
    Subscribe {
        id: u64,
        statement: Statement,
        sender: LiveSender,
        reply: Reply<()>,
    },
    Unsubscribe {
        id: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the engine actor.
///
/// The actor runs on a dedicated thread owning an in-memory SQLite
/// connection and processes one request at a time.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineRequest>,
    next_live_id: Arc<AtomicU64>,
    path: Option<PathBuf>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("path", &self.path)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EngineHandle {
    /// Starts the engine. When `path` names an existing image it is restored
    /// into memory before the first request is served.
    pub async fn open(path: Option<PathBuf>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let actor_path = path.clone();

        thread::Builder::new()
            .name("replisync-engine".to_string())
            .spawn(move || match EngineActor::start(actor_path) {
                Ok(actor) => {
                    let _ = ready_tx.send(Ok(()));
                    actor.run(rx);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })?;

        ready_rx.await??;
        event!(Level::DEBUG, path = ?path, "replica engine started");

        Ok(Self {
            tx,
            next_live_id: Arc::new(AtomicU64::new(1)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| SyncError::Closed)?;
        rx.await?
    }

    /// Round trip proving the engine accepts queries.
    pub async fn ping(&self) -> Result<()> {
        self.request(|reply| EngineRequest::Ping { reply }).await
    }

    pub async fn query(&self, statement: Statement) -> Result<QueryResult> {
        self.request(|reply| EngineRequest::Query { statement, reply })
            .await
    }

    pub async fn execute(&self, statement: Statement) -> Result<usize> {
        self.request(|reply| EngineRequest::Execute { statement, reply })
            .await
    }

    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.request(|reply| EngineRequest::ExecuteBatch { sql, reply })
            .await
    }

    /// Runs every step in one transaction and returns the number of steps
    /// executed. A failing step rolls everything back.
    pub async fn transaction(&self, steps: Vec<TxStep>) -> Result<usize> {
        self.request(|reply| EngineRequest::Transaction { steps, reply })
            .await
    }

    /// Applies a change batch in one transaction; returns affected rows.
    pub async fn apply_changes(&self, batch: ChangeBatch) -> Result<usize> {
        self.request(|reply| EngineRequest::ApplyChanges { batch, reply })
            .await
    }

    pub async fn truncate(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.request(|reply| EngineRequest::TruncateTable { table, reply })
            .await
    }

    /// Writes the in-memory image to durable storage. No-op for purely
    /// in-memory engines.
    pub async fn persist(&self) -> Result<()> {
        self.request(|reply| EngineRequest::Persist { reply }).await
    }

    /// Subscribes to a query. The stream yields the current result first and
    /// a fresh one after every write that changes it.
    pub async fn live_query(&self, statement: Statement) -> Result<LiveQuery> {
        let id = self.next_live_id.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::unbounded_channel();
        self.request(|reply| EngineRequest::Subscribe {
            id,
            statement,
            sender,
            reply,
        })
        .await?;

        Ok(LiveQuery {
            id,
            rx,
            engine: self.tx.clone(),
            closed: false,
        })
    }

    /// Stops the actor. Other clones observe `SyncError::Closed` afterwards.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Stream of results for one live query.
///
/// Closing (or dropping) the stream unsubscribes inside the engine and
/// discards anything still buffered.
pub struct LiveQuery {
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<Vec<Row>>>,
    engine: mpsc::UnboundedSender<EngineRequest>,
    closed: bool,
}

impl LiveQuery {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        let _ = self.engine.send(EngineRequest::Unsubscribe { id: self.id });
    }
}

impl Stream for LiveQuery {
    type Item = Result<Vec<Row>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tables a write touched.
enum Touched {
    All,
    Tables(BTreeSet<String>),
}

impl Touched {
    fn from_statement(statement: &Statement) -> Self {
        if statement.tables().is_empty() {
            Self::All
        } else {
            Self::Tables(statement.tables().clone())
        }
    }

    fn table(name: &str) -> Self {
        Self::Tables(BTreeSet::from([name.to_string()]))
    }

    fn merge(self, other: Touched) -> Self {
        match (self, other) {
            (Self::Tables(mut a), Self::Tables(b)) => {
                a.extend(b);
                Self::Tables(a)
            }
            _ => Self::All,
        }
    }

    fn affects(&self, statement: &Statement) -> bool {
        match self {
            Self::All => true,
            Self::Tables(tables) => {
                statement.tables().is_empty() || !tables.is_disjoint(statement.tables())
            }
        }
    }
}

struct LiveSubscription {
    statement: Statement,
    sender: LiveSender,
    last: Option<Vec<Row>>,
}

struct EngineActor {
    conn: Connection,
    path: Option<PathBuf>,
    live: HashMap<u64, LiveSubscription>,
}

impl EngineActor {
    fn start(path: Option<PathBuf>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        if let Some(image) = path.as_ref().filter(|p| p.exists()) {
            conn.restore(DatabaseName::Main, image, None::<fn(rusqlite::backup::Progress)>)?;
            event!(Level::INFO, path = %image.display(), "replica image restored");
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn,
            path,
            live: HashMap::new(),
        })
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineRequest>) {
        while let Some(request) = rx.blocking_recv() {
            match request {
                EngineRequest::Ping { reply } => {
                    let result = self
                        .conn
                        .query_row("SELECT 1", [], |_| Ok(()))
                        .map_err(SyncError::from);
                    let _ = reply.send(result);
                }
                EngineRequest::Query { statement, reply } => {
                    let _ = reply.send(run_query(&self.conn, &statement));
                }
                EngineRequest::Execute { statement, reply } => {
                    let touched = Touched::from_statement(&statement);
                    let result = self
                        .conn
                        .execute(statement.sql(), params_from_iter(statement.params()))
                        .map_err(SyncError::from);
                    self.finish_write(result, touched, reply);
                }
                EngineRequest::ExecuteBatch { sql, reply } => {
                    let result = self.conn.execute_batch(&sql).map_err(SyncError::from);
                    self.finish_write(result, Touched::All, reply);
                }
                EngineRequest::Transaction { steps, reply } => {
                    let touched = steps
                        .iter()
                        .map(TxStep::touched)
                        .reduce(Touched::merge)
                        .unwrap_or(Touched::Tables(BTreeSet::new()));
                    let result = self.run_transaction(&steps);
                    self.finish_write(result, touched, reply);
                }
                EngineRequest::ApplyChanges { batch, reply } => {
                    let touched = Touched::table(&batch.table);
                    let result = self.apply_changes(&batch);
                    self.finish_write(result, touched, reply);
                }
                EngineRequest::TruncateTable { table, reply } => {
                    let touched = Touched::table(&table);
                    let result = quote_ident(&table).and_then(|quoted| {
                        self.conn
                            .execute(&format!("DELETE FROM {}", quoted), [])
                            .map(|_| ())
                            .map_err(SyncError::from)
                    });
                    self.finish_write(result, touched, reply);
                }
                EngineRequest::Persist { reply } => {
                    let _ = reply.send(self.persist());
                }
                EngineRequest::Subscribe {
                    id,
                    statement,
                    sender,
                    reply,
                } => match run_query(&self.conn, &statement) {
                    Ok(result) => {
                        let rows = result.into_rows();
                        if sender.send(Ok(rows.clone())).is_ok() {
                            self.live.insert(
                                id,
                                LiveSubscription {
                                    statement,
                                    sender,
                                    last: Some(rows),
                                },
                            );
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                },
                EngineRequest::Unsubscribe { id } => {
                    self.live.remove(&id);
                }
                EngineRequest::Shutdown { reply } => {
                    self.live.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        event!(Level::DEBUG, "replica engine stopped");
    }

    fn finish_write<T>(&mut self, result: Result<T>, touched: Touched, reply: Reply<T>) {
        let succeeded = result.is_ok();
        let _ = reply.send(result);
        if succeeded {
            self.refresh_live(&touched);
        }
    }

    fn refresh_live(&mut self, touched: &Touched) {
        let conn = &self.conn;
        self.live.retain(|id, subscription| {
            if subscription.sender.is_closed() {
                return false;
            }
            if !touched.affects(&subscription.statement) {
                return true;
            }
            let delivery = match run_query(conn, &subscription.statement) {
                Ok(result) => {
                    let rows = result.into_rows();
                    if subscription.last.as_ref() == Some(&rows) {
                        return true;
                    }
                    subscription.last = Some(rows.clone());
                    Ok(rows)
                }
                Err(err) => {
                    event!(Level::WARN, live_id = *id, error = %err, "live query refresh failed");
                    subscription.last = None;
                    Err(err)
                }
            };
            subscription.sender.send(delivery).is_ok()
        });
    }

    fn run_transaction(&mut self, steps: &[TxStep]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for (index, step) in steps.iter().enumerate() {
            let outcome = match step {
                TxStep::Batch(sql) => tx.execute_batch(sql),
                TxStep::Statement(statement) => tx
                    .execute(statement.sql(), params_from_iter(statement.params()))
                    .map(|_| ()),
            };
            if let Err(err) = outcome {
                return Err(SyncError::TransactionStep {
                    index,
                    message: err.to_string(),
                });
            }
        }
        tx.commit()?;
        Ok(steps.len())
    }

    fn apply_changes(&mut self, batch: &ChangeBatch) -> Result<usize> {
        let table = quote_ident(&batch.table)?;
        let primary_key = batch
            .primary_key
            .iter()
            .map(|col| quote_ident(col))
            .collect::<Result<Vec<_>>>()?;
        if primary_key.is_empty() {
            return Err(SyncError::Protocol(format!(
                "table '{}' has no primary key",
                batch.table
            )));
        }

        let tx = self.conn.transaction()?;
        let mut affected = 0;

        if batch.truncate {
            affected += tx.execute(&format!("DELETE FROM {}", table), [])?;
        }

        for change in &batch.changes {
            match change {
                RowChange::Upsert(row) => {
                    let sql = upsert_sql(&table, &batch.primary_key, &primary_key, row)?;
                    affected += tx.execute(&sql, params_from_iter(row.values()))?;
                }
                RowChange::Delete(key) => {
                    let mut clauses = Vec::with_capacity(primary_key.len());
                    let mut params = Vec::with_capacity(primary_key.len());
                    for (raw, quoted) in batch.primary_key.iter().zip(&primary_key) {
                        let value = key.get(raw).ok_or_else(|| {
                            SyncError::Protocol(format!(
                                "delete on '{}' is missing key column '{}'",
                                batch.table, raw
                            ))
                        })?;
                        params.push(value);
                        clauses.push(format!("{} = ?{}", quoted, params.len()));
                    }
                    let sql = format!("DELETE FROM {} WHERE {}", table, clauses.join(" AND "));
                    affected += tx.execute(&sql, params_from_iter(params))?;
                }
            }
        }

        tx.commit()?;
        Ok(affected)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        // Back up into a sibling temp file, then rename over the image.
        let temp = NamedTempFile::new_in(dir)?;
        self.conn.backup(DatabaseName::Main, temp.path(), None)?;
        temp.persist(path).map_err(|err| SyncError::Io(err.error.to_string()))?;

        event!(Level::DEBUG, path = %path.display(), "replica persisted");
        Ok(())
    }
}

fn upsert_sql(
    table: &str,
    raw_key: &[String],
    quoted_key: &[String],
    row: &BTreeMap<String, Value>,
) -> Result<String> {
    if row.is_empty() {
        return Err(SyncError::Protocol(format!("empty row for table {}", table)));
    }

    let columns = row
        .keys()
        .map(|col| quote_ident(col))
        .collect::<Result<Vec<_>>>()?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

    let updates: Vec<String> = row
        .keys()
        .zip(&columns)
        .filter(|(raw, _)| !raw_key.contains(*raw))
        .map(|(_, quoted)| format!("{} = excluded.{}", quoted, quoted))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table,
        columns.join(", "),
        placeholders.join(", "),
        quoted_key.join(", "),
        conflict
    ))
}

fn run_query(conn: &Connection, statement: &Statement) -> Result<QueryResult> {
    let mut stmt = conn.prepare_cached(statement.sql())?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let shared: Arc<[String]> = Arc::from(columns.clone());

    let mut rows = stmt.query(params_from_iter(statement.params()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..shared.len())
            .map(|idx| row.get_ref(idx).map(Value::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(Row::new(Arc::clone(&shared), values));
    }

    Ok(QueryResult::new(columns, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn engine_with_chats() -> EngineHandle {
        let engine = EngineHandle::open(None).await.unwrap();
        engine
            .execute_batch("CREATE TABLE chats (id TEXT PRIMARY KEY, title TEXT, user_id TEXT);")
            .await
            .unwrap();
        engine
    }

    fn chat(id: &str, title: &str) -> RowChange {
        RowChange::Upsert(BTreeMap::from([
            ("id".to_string(), Value::from(id)),
            ("title".to_string(), Value::from(title)),
            ("user_id".to_string(), Value::from("u1")),
        ]))
    }

    #[tokio::test]
    async fn test_ping_and_query() {
        let engine = engine_with_chats().await;
        engine.ping().await.unwrap();
        engine
            .execute(Statement::new("INSERT INTO chats VALUES (?1, ?2, ?3)").bind("c1").bind("Hi").bind("u1"))
            .await
            .unwrap();

        let result = engine.query(Statement::new("SELECT id, title FROM chats")).await.unwrap();
        assert_eq!(result.columns, vec!["id", "title"]);
        assert_eq!(result.rows[0].get_str("title"), Some("Hi"));
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_failed_step() {
        let engine = engine_with_chats().await;
        let err = engine
            .transaction(vec![
                TxStep::Batch("INSERT INTO chats VALUES ('a', 'A', 'u1');".into()),
                TxStep::Batch("INSERT INTO missing VALUES (1);".into()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransactionStep { index: 1, .. }));

        let result = engine.query(Statement::new("SELECT * FROM chats")).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_apply_changes_upserts_and_deletes() {
        let engine = engine_with_chats().await;
        let pk = vec!["id".to_string()];

        let mut batch = ChangeBatch::new("chats", &pk);
        batch.changes = vec![chat("c1", "First"), chat("c2", "Second"), chat("c1", "Renamed")];
        engine.apply_changes(batch).await.unwrap();

        let mut batch = ChangeBatch::new("chats", &pk);
        batch.changes = vec![RowChange::Delete(BTreeMap::from([(
            "id".to_string(),
            Value::from("c2"),
        )]))];
        engine.apply_changes(batch).await.unwrap();

        let result = engine.query(Statement::new("SELECT id, title FROM chats")).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0].get_str("title"), Some("Renamed"));
    }

    #[tokio::test]
    async fn test_live_query_delivers_after_relevant_writes() {
        let engine = engine_with_chats().await;
        let statement = Statement::raw("SELECT id FROM chats ORDER BY id", vec![], ["chats"]);
        let mut live = engine.live_query(statement).await.unwrap();

        let initial = live.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        let mut batch = ChangeBatch::new("chats", &["id".to_string()]);
        batch.changes = vec![chat("c1", "First")];
        engine.apply_changes(batch).await.unwrap();

        let update = timeout(Duration::from_secs(1), live.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(update.len(), 1);

        live.close();
        assert!(live.next().await.is_none());
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REPLICA_FILE);

        let engine = EngineHandle::open(Some(path.clone())).await.unwrap();
        engine
            .execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY); INSERT INTO notes VALUES (42);")
            .await
            .unwrap();
        engine.persist().await.unwrap();
        engine.close().await;
        assert!(engine.ping().await.is_err());

        let reopened = EngineHandle::open(Some(path)).await.unwrap();
        let result = reopened.query(Statement::new("SELECT id FROM notes")).await.unwrap();
        assert_eq!(result.rows[0].get_i64("id"), Some(42));
    }
}
