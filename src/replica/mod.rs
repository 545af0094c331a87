pub mod engine;
pub mod manager;
pub mod query;

pub use engine::{ChangeBatch, EngineHandle, LiveQuery, REPLICA_FILE, RowChange, TxStep};
pub use manager::{ReplicaManager, ReplicaPhase, SessionHandle};
pub use query::{Direction, Filter, QueryBuilder, SelectBuilder, Statement, quote_ident};
