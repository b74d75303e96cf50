use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use sqli_db::{DbError, RowFlow, SqliteConn, is_memory_path};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::envelope::{QueryRequest, Request, RequestKind, TABLE_DUMP_SQL};
use crate::error::{Result, SqliError};
use crate::host::{Event, Host, HostObject, ObjectId, find_as};
use crate::queue::RequestQueue;
use crate::result_handle::{CallbackSpec, ResultHandle};
use crate::sweeper;

static LIVE_ENGINES: AtomicUsize = AtomicUsize::new(0);

/// Number of [`QueryEngine`]s currently alive in this process.
pub fn live_engine_count() -> usize {
    LIVE_ENGINES.load(Ordering::SeqCst)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Opening,
    Running,
    Draining,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EngineState::Opening,
            2 => EngineState::Running,
            3 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Stopped => 0,
            EngineState::Opening => 1,
            EngineState::Running => 2,
            EngineState::Draining => 3,
        }
    }
}

/// State shared between the host-side engine object and its worker thread.
pub struct EngineShared {
    id: OnceLock<ObjectId>,
    host: Weak<dyn Host>,
    config: EngineConfig,
    cleanup_hook: Arc<str>,
    queue: RequestQueue,
    /// Execution lock: held for the length of one database call.
    connection: Mutex<Option<SqliteConn>>,
    state: AtomicU8,
    initialized: AtomicBool,
    started: AtomicBool,
    shutting_down: AtomicBool,
    debug: AtomicBool,
    submit_counter: AtomicU64,
    /// Submit counter of the request being dispatched, 0 when idle.
    in_flight: AtomicU64,
    handles: Mutex<Vec<Weak<ResultHandle>>>,
}

impl EngineShared {
    pub fn id(&self) -> ObjectId {
        self.id.get().copied().unwrap_or(ObjectId::NONE)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    pub(crate) fn tracked_handles(&self) -> &Mutex<Vec<Weak<ResultHandle>>> {
        &self.handles
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn host(&self) -> Result<Arc<dyn Host>> {
        self.host.upgrade().ok_or_else(|| {
            warn!(engine = %self.id(), "host is gone");
            SqliError::ShuttingDown
        })
    }

    /// Schedules `event` for `target` at the host's current time.
    fn notify(&self, target: ObjectId, event: Event) {
        match self.host.upgrade() {
            Some(host) => host.schedule_event(target, event, host.now_ms()),
            None => warn!(engine = %self.id(), ?event, "host is gone; reply dropped"),
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_shutting_down() {
            warn!(engine = %self.id(), "request rejected: engine is shutting down");
            return Err(SqliError::ShuttingDown);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            warn!(engine = %self.id(), "request rejected: engine is not initialized");
            return Err(SqliError::NotInitialized);
        }
        Ok(())
    }

    fn create_handle(
        self: &Arc<Self>,
        host: &dyn Host,
        sql: &str,
        callback: Option<CallbackSpec>,
    ) -> Arc<ResultHandle> {
        let handle = Arc::new(ResultHandle::new(
            self.id(),
            Arc::downgrade(self),
            Arc::from(sql),
            callback,
            Arc::clone(&self.cleanup_hook),
            host.now_ms(),
        ));
        host.register_object(handle.clone());
        self.handles.lock().push(Arc::downgrade(&handle));
        handle
    }

    fn post(&self, request: Request) -> Result<()> {
        self.ensure_accepting()?;
        let counter = self.submit_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let request = request.with_submit_counter(counter);
        if self.is_debug() {
            debug!(engine = %self.id(), kind = %request.kind(), counter, "request posted");
        }
        self.queue.post(request);
        Ok(())
    }

    fn worker_main(self: Arc<Self>, path: PathBuf) {
        self.set_state(EngineState::Opening);
        let opened = if is_memory_path(&path) {
            SqliteConn::open_in_memory()
        } else {
            SqliteConn::open(&path, self.config.open_mode, self.config.busy_timeout())
        };
        match opened {
            Ok(conn) => {
                *self.connection.lock() = Some(conn);
                self.initialized.store(true, Ordering::SeqCst);
                self.set_state(EngineState::Running);
                info!(engine = %self.id(), path = %path.display(), "database opened");
                self.notify(self.id(), Event::Initialized);
            }
            Err(err) => {
                error!(
                    engine = %self.id(),
                    path = %path.display(),
                    code = err.code(),
                    message = %err.message(),
                    "can't open database"
                );
                self.set_state(EngineState::Stopped);
                self.notify(
                    self.id(),
                    Event::OpenFailed {
                        code: err.code(),
                        message: err.message(),
                    },
                );
                return;
            }
        }
        self.process_loop();
    }

    fn process_loop(&self) {
        while !self.is_shutting_down() {
            let Some(batch) = self.queue.drain(&self.shutting_down) else {
                break;
            };
            let total = batch.len();
            for (done, request) in batch.into_iter().enumerate() {
                if self.is_shutting_down() {
                    warn!(
                        engine = %self.id(),
                        discarded = total - done,
                        "shutdown requested; rest of batch dropped"
                    );
                    break;
                }
                self.dispatch(request);
            }
        }
        debug!(engine = %self.id(), "worker loop exited");
    }

    fn dispatch(&self, request: Request) {
        let kind = request.kind();
        if self.is_debug() {
            debug!(
                engine = %self.id(),
                %kind,
                counter = request.submit_counter(),
                "processing request"
            );
        }
        self.in_flight
            .store(request.submit_counter(), Ordering::SeqCst);
        let reply = {
            let connection = self.connection.lock();
            let Some(conn) = connection.as_ref() else {
                warn!(engine = %self.id(), %kind, "no open connection; request dropped");
                self.in_flight.store(0, Ordering::SeqCst);
                return;
            };
            match request {
                Request::Stub => {
                    debug!(engine = %self.id(), "stub request");
                    None
                }
                Request::Exclusive(query) => {
                    warn!(
                        engine = %self.id(),
                        sql = %query.sql,
                        "exclusive request reached the queue; use execute_exclusive. Treated as done"
                    );
                    query.handle.map(|handle| {
                        handle.set_outcome(Ok(()));
                        (handle.id(), Event::QueryCompleted)
                    })
                }
                Request::Generic(query)
                | Request::Select(query)
                | Request::Update(query)
                | Request::TableDump(query) => self.run_queued(conn, kind, &query),
            }
        };
        self.in_flight.store(0, Ordering::SeqCst);
        // Replies go out after the execution lock is released.
        if let Some((target, event)) = reply {
            self.notify(target, event);
        }
    }

    fn run_queued(
        &self,
        conn: &SqliteConn,
        kind: RequestKind,
        query: &QueryRequest,
    ) -> Option<(ObjectId, Event)> {
        match self.execute(conn, kind, query) {
            Ok(()) => query
                .handle
                .as_ref()
                .map(|handle| (handle.id(), Event::QueryCompleted)),
            Err(err) => {
                error!(
                    engine = %self.id(),
                    %kind,
                    code = err.code(),
                    message = %err.message(),
                    sql = %query.sql,
                    "statement failed"
                );
                Some((
                    self.id(),
                    Event::QueryFailed {
                        code: err.code(),
                        message: err.message(),
                        sql: Arc::clone(&query.sql),
                        handle: query.handle.as_ref().map(|handle| handle.id()),
                    },
                ))
            }
        }
    }

    /// Runs one statement with the execution lock already held and records
    /// the outcome on the request's handle.
    fn execute(
        &self,
        conn: &SqliteConn,
        kind: RequestKind,
        query: &QueryRequest,
    ) -> std::result::Result<(), DbError> {
        let verbose = self.is_debug();
        let handle = query.handle.as_deref();
        let outcome = conn.exec(&query.sql, |columns, values| {
            if verbose {
                for (name, value) in columns.iter().zip(values) {
                    debug!(
                        handle = %handle.map_or(ObjectId::NONE, ResultHandle::id),
                        column = %name,
                        value = value.as_deref().unwrap_or("NULL"),
                        "row"
                    );
                }
            }
            if kind == RequestKind::TableDump {
                let name = values.first().and_then(Option::as_deref).unwrap_or("");
                let schema = values.get(1).and_then(Option::as_deref).unwrap_or("");
                info!(engine = %self.id(), table = name, schema, "table");
            }
            match handle {
                Some(handle) => handle.ingest_row(columns, values),
                None => RowFlow::Continue,
            }
        });
        if let Some(handle) = handle {
            let captures_changes = matches!(
                kind,
                RequestKind::Generic | RequestKind::Update | RequestKind::Exclusive
            );
            if outcome.is_ok() && captures_changes {
                handle.record_changes(conn.last_insert_id(), conn.changes());
            }
            handle.set_outcome(outcome.clone());
        }
        outcome
    }

    fn outstanding_handles(&self) -> usize {
        match self.host.upgrade() {
            Some(host) => sweeper::live_handles(self, host.as_ref()).len(),
            None => {
                let mut tracked = self.handles.lock();
                tracked.retain(|handle| handle.strong_count() > 0);
                tracked.len()
            }
        }
    }
}

/// Asynchronous SQL engine: one database connection, one worker thread.
///
/// Lives in the host registry; replies arrive on the host thread through
/// scheduled events. Dropping it, or deleting it from the host, shuts the
/// worker down.
pub struct QueryEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueryEngine {
    /// Creates an engine and registers it with `host`. The database is not
    /// opened until [`QueryEngine::initialize`].
    pub fn new(host: Arc<dyn Host>, config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let shared = Arc::new(EngineShared {
            id: OnceLock::new(),
            host: Arc::downgrade(&host),
            cleanup_hook: Arc::from(config.cleanup_hook.as_str()),
            debug: AtomicBool::new(config.debug),
            config,
            queue: RequestQueue::new(),
            connection: Mutex::new(None),
            state: AtomicU8::new(EngineState::Stopped.as_u8()),
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            submit_counter: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(QueryEngine {
            shared,
            worker: Mutex::new(None),
        });
        LIVE_ENGINES.fetch_add(1, Ordering::SeqCst);
        host.register_object(engine.clone());
        sweeper::schedule_next(&engine.shared, host.as_ref());
        debug!(engine = %engine.id(), "query engine created");
        Ok(engine)
    }

    pub fn id(&self) -> ObjectId {
        self.shared.id()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn is_debug(&self) -> bool {
        self.shared.is_debug()
    }

    pub fn set_debug(&self, debug: bool) {
        self.shared.debug.store(debug, Ordering::SeqCst);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Starts the worker, which opens `path` and replies with
    /// [`Event::Initialized`] or [`Event::OpenFailed`].
    pub fn initialize(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.shared.is_shutting_down() {
            return Err(SqliError::ShuttingDown);
        }
        if !is_memory_path(path) && !self.shared.config.create_if_missing && !path.is_file() {
            error!(engine = %self.id(), path = %path.display(), "can't find database file");
            return Err(SqliError::DatabaseNotFound(path.to_path_buf()));
        }
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(engine = %self.id(), "initialize called twice");
            return Err(SqliError::AlreadyInitialized);
        }
        let shared = Arc::clone(&self.shared);
        let owned_path = path.to_path_buf();
        let worker = thread::Builder::new()
            .name(self.shared.config.worker_thread_name.clone())
            .spawn(move || shared.worker_main(owned_path))
            .map_err(|err| {
                self.shared.started.store(false, Ordering::SeqCst);
                SqliError::WorkerSpawn(err)
            })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Queues a prepared request. Rejected, with a log line, before
    /// initialization and after shutdown.
    pub fn post(&self, request: Request) -> Result<()> {
        self.shared.post(request)
    }

    /// Queues a statement and records last insert id and affected rows.
    pub fn post_query(
        &self,
        sql: &str,
        callback: Option<&str>,
        target: Option<ObjectId>,
    ) -> Result<ObjectId> {
        self.post_with(Request::Generic, sql, callback, target)
    }

    /// Queues a read; nothing but rows is recorded.
    pub fn post_select(
        &self,
        sql: &str,
        callback: Option<&str>,
        target: Option<ObjectId>,
    ) -> Result<ObjectId> {
        self.post_with(Request::Select, sql, callback, target)
    }

    pub fn post_update(
        &self,
        sql: &str,
        callback: Option<&str>,
        target: Option<ObjectId>,
    ) -> Result<ObjectId> {
        self.post_with(Request::Update, sql, callback, target)
    }

    /// Queues a listing of every table (`name`, `sql`), logged as it is read.
    pub fn post_table_dump(
        &self,
        callback: Option<&str>,
        target: Option<ObjectId>,
    ) -> Result<ObjectId> {
        self.post_with(Request::TableDump, TABLE_DUMP_SQL, callback, target)
    }

    fn post_with(
        &self,
        wrap: fn(QueryRequest) -> Request,
        sql: &str,
        callback: Option<&str>,
        target: Option<ObjectId>,
    ) -> Result<ObjectId> {
        self.shared.ensure_accepting()?;
        let host = self.shared.host()?;
        let callback = match callback.filter(|name| !name.is_empty()) {
            Some(name) => Some(CallbackSpec::new(name, target)),
            None => {
                if target.is_some() {
                    debug!(engine = %self.id(), "callback target given without a callback name; ignored");
                }
                None
            }
        };
        let handle = self.shared.create_handle(host.as_ref(), sql, callback);
        let id = handle.id();
        if let Err(err) = self
            .shared
            .post(wrap(QueryRequest::new(sql, Some(handle))))
        {
            host.delete_object(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Runs `sql` on the calling thread, holding the execution lock the
    /// worker uses. No reply event is scheduled: the returned handle is
    /// ready immediately and `succeeded()` tells the outcome.
    pub fn execute_exclusive(&self, sql: &str) -> Result<ObjectId> {
        self.shared.ensure_accepting()?;
        let host = self.shared.host()?;
        let handle = self.shared.create_handle(host.as_ref(), sql, None);
        let id = handle.id();
        let mut query = QueryRequest::new(sql, Some(Arc::clone(&handle)));
        query.submit_counter = self.shared.submit_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let connection = self.shared.connection.lock();
            match connection.as_ref() {
                Some(conn) => {
                    if let Err(err) = self.shared.execute(conn, RequestKind::Exclusive, &query) {
                        error!(
                            engine = %self.id(),
                            code = err.code(),
                            message = %err.message(),
                            sql,
                            "exclusive statement failed"
                        );
                    }
                }
                None => {
                    warn!(engine = %self.id(), "exclusive request without an open connection");
                    handle.set_outcome(Err(DbError::Statement {
                        code: sqli_db::SQLITE_ERROR,
                        message: "database is not open".to_string(),
                    }));
                }
            }
        }
        handle.set_busy(false);
        Ok(id)
    }

    /// Looks up a result handle this engine created.
    pub fn result(&self, id: ObjectId) -> Option<Arc<ResultHandle>> {
        let host = self.shared.host.upgrade()?;
        find_as::<ResultHandle>(host.as_ref(), id).filter(|handle| handle.engine_id() == self.id())
    }

    /// Result handles created here and still registered with the host.
    pub fn outstanding_handles(&self) -> usize {
        self.shared.outstanding_handles()
    }

    /// Requests not yet picked up by the worker.
    pub fn pending_requests(&self) -> usize {
        self.shared.queue.pending()
    }

    /// Stops the worker after the statement it is running, drops whatever is
    /// still queued and closes the connection. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.shared.set_state(EngineState::Draining);
        self.shared.queue.wake();
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst);
        if in_flight != 0 {
            debug!(engine = %self.id(), counter = in_flight, "waiting for the request in flight");
        }
        if let Some(worker) = self.worker.lock().take() {
            // The last host reference can be released from the worker itself.
            if worker.thread().id() == thread::current().id() {
                warn!(engine = %self.id(), "shutdown from the worker thread; not joining");
            } else if worker.join().is_err() {
                error!(engine = %self.id(), "worker thread panicked");
            }
        }
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            warn!(engine = %self.id(), dropped, "queued requests dropped at shutdown");
        }
        if let Some(conn) = self.shared.connection.lock().take() {
            if let Err(err) = conn.close() {
                error!(
                    engine = %self.id(),
                    code = err.code(),
                    message = %err.message(),
                    "closing database failed"
                );
            }
        }
        self.shared.initialized.store(false, Ordering::SeqCst);
        let outstanding = self.shared.outstanding_handles();
        if outstanding > 0 {
            info!(
                engine = %self.id(),
                outstanding,
                "result handles still registered at shutdown"
            );
        }
        self.shared.set_state(EngineState::Stopped);
        debug!(engine = %self.id(), "query engine shut down");
    }

    fn on_initialized(&self, host: &dyn Host) {
        let id = self.id();
        if host.is_callable_method(id, "onInitialized") {
            host.invoke_callback(Some(id), "onInitialized", &[]);
        } else {
            info!(engine = %id, "query engine initialized");
        }
    }

    fn on_open_failed(&self, host: &dyn Host, code: i32, message: String) {
        let id = self.id();
        if host.is_callable_method(id, "onOpenFailed") {
            host.invoke_callback(Some(id), "onOpenFailed", &[code.to_string(), message]);
        } else {
            let failure = SqliError::OpenFailure { code, message };
            error!(engine = %id, code, error = %failure, "query engine is unusable");
        }
    }

    fn on_query_failed(
        &self,
        host: &dyn Host,
        code: i32,
        message: String,
        sql: &str,
        handle: Option<ObjectId>,
    ) {
        let id = self.id();
        // The worker is done with the handle; hand it back so the host can read or delete it.
        if let Some(result) = handle.and_then(|handle| find_as::<ResultHandle>(host, handle)) {
            result.set_busy(false);
        }
        if host.is_callable_method(id, "onError") {
            let handle = handle.unwrap_or(ObjectId::NONE).to_string();
            host.invoke_callback(Some(id), "onError", &[code.to_string(), message, handle]);
        } else {
            let failure = SqliError::StatementFailure { code, message };
            error!(engine = %id, code, error = %failure, sql, "query failed");
        }
    }
}

impl HostObject for QueryEngine {
    fn class_name(&self) -> &'static str {
        "QueryEngine"
    }

    fn on_register(&self, id: ObjectId) {
        let _ = self.shared.id.set(id);
    }

    fn on_remove(&self) {
        self.shutdown();
    }

    fn process_event(&self, host: &dyn Host, event: Event) {
        match event {
            Event::Initialized => self.on_initialized(host),
            Event::OpenFailed { code, message } => self.on_open_failed(host, code, message),
            Event::QueryFailed {
                code,
                message,
                sql,
                handle,
            } => self.on_query_failed(host, code, message, &sql, handle),
            Event::ExpirySweep => {
                sweeper::sweep(&self.shared, host);
                if !self.shared.is_shutting_down() {
                    sweeper::schedule_next(&self.shared, host);
                }
            }
            Event::QueryCompleted => {
                debug!(engine = %self.id(), "completion addressed to the engine ignored");
            }
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        self.shutdown();
        LIVE_ENGINES.fetch_sub(1, Ordering::SeqCst);
    }
}
