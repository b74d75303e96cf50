use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard};
use sqli_db::{DbError, RowFlow};
use tracing::{debug, error, warn};

use crate::engine::EngineShared;
use crate::error::{Result, SqliError};
use crate::host::{Event, Host, HostObject, ObjectId};
use crate::row_sink::RowSink;

/// Who to call once a queued request completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackSpec {
    pub name: String,
    /// Object to call the method on; `None` means a global function.
    pub target: Option<ObjectId>,
}

impl CallbackSpec {
    pub fn new(name: impl Into<String>, target: Option<ObjectId>) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// Field selector for [`ResultHandle::field_value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Index(usize),
    Name(&'a str),
}

struct RecordState {
    sink: Option<RowSink>,
    /// `None` before the first `next_record`; `Some(row_count)` once exhausted.
    current: Option<usize>,
    first_record: bool,
    succeeded: bool,
    last_insert_id: i64,
    affected_rows: u64,
    last_expiry_check: u64,
    expiry_warnings: u32,
    error: Option<DbError>,
}

/// Host-visible outcome of one query.
///
/// The worker is the only writer while the handle is busy. Once the reply
/// event fires the handle belongs to the host thread, and only then do the
/// accessors answer; before that they fail with [`SqliError::Busy`].
pub struct ResultHandle {
    id: OnceLock<ObjectId>,
    engine_id: ObjectId,
    engine: Weak<EngineShared>,
    sql: Arc<str>,
    callback: Option<CallbackSpec>,
    cleanup_hook: Arc<str>,
    created_at: u64,
    busy: AtomicBool,
    ignore_expiry: AtomicBool,
    state: Mutex<RecordState>,
}

impl ResultHandle {
    pub(crate) fn new(
        engine_id: ObjectId,
        engine: Weak<EngineShared>,
        sql: Arc<str>,
        callback: Option<CallbackSpec>,
        cleanup_hook: Arc<str>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: OnceLock::new(),
            engine_id,
            engine,
            sql,
            callback,
            cleanup_hook,
            created_at: now_ms,
            busy: AtomicBool::new(true),
            ignore_expiry: AtomicBool::new(false),
            state: Mutex::new(RecordState {
                sink: None,
                current: None,
                first_record: true,
                succeeded: false,
                last_insert_id: 0,
                affected_rows: 0,
                last_expiry_check: now_ms,
                expiry_warnings: 0,
                error: None,
            }),
        }
    }

    /// Registry id, or [`ObjectId::NONE`] before registration.
    pub fn id(&self) -> ObjectId {
        self.id.get().copied().unwrap_or(ObjectId::NONE)
    }

    pub fn engine_id(&self) -> ObjectId {
        self.engine_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn callback(&self) -> Option<&CallbackSpec> {
        self.callback.as_ref()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_ignore_expiry(&self, ignore: bool) {
        self.ignore_expiry.store(ignore, Ordering::SeqCst);
    }

    pub fn expiry_warnings(&self) -> u32 {
        self.state.lock().expiry_warnings
    }

    fn ready(&self) -> Result<MutexGuard<'_, RecordState>> {
        if self.is_busy() {
            return Err(SqliError::Busy(self.id()));
        }
        Ok(self.state.lock())
    }

    /// Moves to the next record. False when there are no (more) rows.
    pub fn next_record(&self) -> Result<bool> {
        let mut state = self.ready()?;
        let rows = state.sink.as_ref().map_or(0, RowSink::row_count);
        if rows == 0 {
            return Ok(false);
        }
        let next = state.current.map_or(0, |current| current + 1);
        state.first_record = false;
        if next < rows {
            state.current = Some(next);
            Ok(true)
        } else {
            state.current = Some(rows);
            Ok(false)
        }
    }

    pub fn rewind(&self) -> Result<()> {
        let mut state = self.ready()?;
        state.current = None;
        state.first_record = true;
        Ok(())
    }

    /// True until `next_record` has moved onto a row.
    pub fn is_before_first(&self) -> Result<bool> {
        Ok(self.ready()?.first_record)
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.ready()?.sink.as_ref().map_or(0, RowSink::row_count))
    }

    pub fn field_count(&self) -> Result<usize> {
        Ok(self.ready()?.sink.as_ref().map_or(0, RowSink::column_count))
    }

    pub fn field_name(&self, index: usize) -> Result<String> {
        let state = self.ready()?;
        let columns = state.sink.as_ref().map_or(&[][..], RowSink::columns);
        columns
            .get(index)
            .cloned()
            .ok_or(SqliError::FieldOutOfRange {
                index,
                count: columns.len(),
            })
    }

    /// Value in the current record. SQL NULL reads as an empty string;
    /// use [`ResultHandle::field`] to tell the two apart.
    pub fn field_value(&self, field: FieldRef<'_>) -> Result<String> {
        let state = self.ready()?;
        let index = match field {
            FieldRef::Index(index) => index,
            FieldRef::Name(name) => state
                .sink
                .as_ref()
                .and_then(|sink| sink.column_index(name))
                .ok_or_else(|| SqliError::UnknownField(name.to_string()))?,
        };
        Ok(current_value(&state, index)?.unwrap_or_default())
    }

    /// Script-style lookup: text starting with a letter names a column,
    /// anything else is parsed as an index.
    pub fn field_value_str(&self, field: &str) -> Result<String> {
        let field = field.trim();
        if field.chars().next().is_some_and(char::is_alphabetic) {
            return self.field_value(FieldRef::Name(field));
        }
        let index = field
            .parse::<usize>()
            .map_err(|_| SqliError::UnknownField(field.to_string()))?;
        self.field_value(FieldRef::Index(index))
    }

    /// Tri-state value in the current record: `None` is SQL NULL.
    pub fn field(&self, index: usize) -> Result<Option<String>> {
        let state = self.ready()?;
        current_value(&state, index)
    }

    pub fn affected_rows(&self) -> Result<u64> {
        Ok(self.ready()?.affected_rows)
    }

    pub fn last_insert_id(&self) -> Result<i64> {
        Ok(self.ready()?.last_insert_id)
    }

    pub fn succeeded(&self) -> Result<bool> {
        Ok(self.ready()?.succeeded)
    }

    /// Why the statement failed, as a [`SqliError::StatementFailure`].
    pub fn last_error(&self) -> Result<Option<SqliError>> {
        Ok(self.ready()?.error.as_ref().map(SqliError::from_statement))
    }

    /// Read access to the collected rows.
    pub fn with_rows<R>(&self, read: impl FnOnce(Option<&RowSink>) -> R) -> Result<R> {
        let state = self.ready()?;
        Ok(read(state.sink.as_ref()))
    }

    pub(crate) fn ingest_row(&self, columns: &[String], values: &[Option<String>]) -> RowFlow {
        let mut state = self.state.lock();
        RowSink::ingest(&mut state.sink, columns, values)
    }

    pub(crate) fn record_changes(&self, last_insert_id: i64, affected_rows: u64) {
        let mut state = self.state.lock();
        state.last_insert_id = last_insert_id;
        state.affected_rows = affected_rows;
    }

    pub(crate) fn set_outcome(&self, outcome: std::result::Result<(), DbError>) {
        let mut state = self.state.lock();
        match outcome {
            Ok(()) => {
                state.succeeded = true;
                state.error = None;
            }
            Err(err) => {
                state.succeeded = false;
                state.error = Some(err);
            }
        }
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    fn is_debug(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.is_debug())
    }

    /// Delivers the completion to whoever asked for it. Every path either
    /// hands the handle to a callback or deletes it from the registry.
    pub(crate) fn process_reply(&self, host: &dyn Host) {
        let id = self.id();
        let args = [id.to_string()];
        let Some(callback) = &self.callback else {
            if host.is_function(&self.cleanup_hook) {
                host.invoke_callback(None, &self.cleanup_hook, &args);
            } else {
                debug!(handle = %id, "no callback and no cleanup hook; result cleared");
                host.delete_object(id);
            }
            return;
        };

        match callback.target {
            Some(target) => {
                let Some(object) = host.find_object(target) else {
                    error!(
                        handle = %id,
                        engine = %self.engine_id,
                        target_id = %target,
                        "callback target not found (deleted?); result cleared"
                    );
                    warn!(sql = %self.sql, "request was");
                    host.delete_object(id);
                    return;
                };
                if target == id {
                    warn!(
                        handle = %id,
                        "callback runs on the result handle itself; deleting it from inside the callback is unsafe, target the engine instead"
                    );
                }
                if !host.is_callable_method(target, &callback.name) {
                    error!(
                        handle = %id,
                        engine = %self.engine_id,
                        target_id = %target,
                        class = object.class_name(),
                        method = %callback.name,
                        "callback method not found; result cleared"
                    );
                    warn!(sql = %self.sql, "request was");
                    host.delete_object(id);
                    return;
                }
                host.invoke_callback(Some(target), &callback.name, &args);
            }
            None => {
                if !host.is_function(&callback.name) {
                    error!(
                        handle = %id,
                        engine = %self.engine_id,
                        function = %callback.name,
                        "callback function not found; result cleared"
                    );
                    warn!(sql = %self.sql, "request was");
                    host.delete_object(id);
                    return;
                }
                host.invoke_callback(None, &callback.name, &args);
            }
        }
    }

    /// Warns when the handle has gone undisposed for longer than
    /// `threshold_ms` since the previous warning (or creation). Never deletes.
    pub(crate) fn check_expiry(&self, now_ms: u64, threshold_ms: u64) -> bool {
        if self.ignore_expiry.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        let elapsed = now_ms.saturating_sub(state.last_expiry_check);
        if elapsed <= threshold_ms {
            return false;
        }
        state.last_expiry_check = now_ms;
        state.expiry_warnings += 1;
        warn!(
            handle = %self.id(),
            engine = %self.engine_id,
            age_ms = now_ms.saturating_sub(self.created_at),
            warnings = state.expiry_warnings,
            busy = self.is_busy(),
            "result handle left undisposed"
        );
        if self.is_debug() {
            if let (Some(sink), Some(row)) = (state.sink.as_ref(), state.current) {
                if let Some(values) = sink.row(row) {
                    for (name, value) in sink.columns().iter().zip(values) {
                        debug!(
                            handle = %self.id(),
                            field = %name,
                            value = value.as_deref().unwrap_or("NULL"),
                            "current record"
                        );
                    }
                }
            }
            debug!(handle = %self.id(), sql = %self.sql, "expired handle request");
        }
        true
    }
}

fn current_value(state: &RecordState, index: usize) -> Result<Option<String>> {
    let sink = state.sink.as_ref().ok_or(SqliError::NoCurrentRecord)?;
    let row = state
        .current
        .and_then(|current| sink.row(current))
        .ok_or(SqliError::NoCurrentRecord)?;
    row.get(index)
        .cloned()
        .ok_or(SqliError::FieldOutOfRange {
            index,
            count: sink.column_count(),
        })
}

impl HostObject for ResultHandle {
    fn class_name(&self) -> &'static str {
        "ResultHandle"
    }

    fn on_register(&self, id: ObjectId) {
        let _ = self.id.set(id);
    }

    fn process_event(&self, host: &dyn Host, event: Event) {
        match event {
            Event::QueryCompleted => {
                self.set_busy(false);
                self.process_reply(host);
            }
            other => debug!(handle = %self.id(), event = ?other, "result handle ignores event"),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
