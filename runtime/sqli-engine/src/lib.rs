//! Asynchronous SQL query engine for single-threaded hosts.
//!
//! The host thread posts requests; one worker thread per [`QueryEngine`]
//! drains them through a dual-buffer queue and runs them against SQLite.
//! Outcomes come back as events scheduled on the host loop: a completion on
//! the [`ResultHandle`], or an error on the engine itself.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sqli_engine::{EngineConfig, QueryEngine, SimHost};
//!
//! let host = Arc::new(SimHost::new());
//! host.define_function("onRows", |host, args| {
//!     let id = args[0].parse().unwrap();
//!     let rows = sqli_engine::find_as::<sqli_engine::ResultHandle>(host, id).unwrap();
//!     while rows.next_record().unwrap() {
//!         println!("{}", rows.field_value_str("name").unwrap());
//!     }
//! });
//! let engine = QueryEngine::new(host.clone(), EngineConfig::default()).unwrap();
//! engine.initialize("app.db").unwrap();
//! host.run_until(Duration::from_secs(1), || engine.is_initialized());
//! engine.post_select("SELECT name FROM users;", Some("onRows"), None).unwrap();
//! host.wait_for_events(Duration::from_secs(1));
//! ```

pub mod config;
mod engine;
mod envelope;
mod error;
pub mod host;
mod queue;
mod result_handle;
mod row_sink;
mod sweeper;
mod sync;

pub use config::{DEFAULT_CLEANUP_HOOK, EngineConfig};
pub use engine::{EngineState, QueryEngine, live_engine_count};
pub use envelope::{QueryRequest, Request, RequestKind, TABLE_DUMP_SQL};
pub use error::{Result, SqliError};
pub use host::{Event, Host, HostObject, ObjectId, SimHost, find_as};
pub use queue::RequestQueue;
pub use result_handle::{CallbackSpec, FieldRef, ResultHandle};
pub use row_sink::RowSink;
pub use sqli_db::{DbError, SqliteOpenMode};
