use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqli_engine::{
    DEFAULT_CLEANUP_HOOK, EngineConfig, EngineState, FieldRef, Host, ObjectId, QueryEngine,
    SimHost, SqliError,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Fixture {
    host: Arc<SimHost>,
    engine: Arc<QueryEngine>,
    _dir: TempDir,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(SimHost::new());
    let engine = QueryEngine::new(host.clone(), config).expect("engine");
    engine
        .initialize(dir.path().join("scenario.db"))
        .expect("initialize");
    assert!(host.run_until(TIMEOUT, || engine.is_initialized()));
    assert_eq!(engine.state(), EngineState::Running);
    Fixture {
        host,
        engine,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig {
        create_if_missing: true,
        ..EngineConfig::default()
    })
}

/// Registers a global function that records the handle id it is called with.
fn collect_ids(host: &SimHost, name: &str) -> Arc<Mutex<Vec<ObjectId>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    host.define_function(name, move |_, args| {
        sink.lock().push(args[0].parse().expect("handle id"));
    });
    seen
}

fn wait_for_reply(fx: &Fixture, seen: &Arc<Mutex<Vec<ObjectId>>>, id: ObjectId) {
    assert!(
        fx.host.run_until(TIMEOUT, || seen.lock().contains(&id)),
        "no reply for {id}"
    );
}

#[test]
fn select_sees_rows_from_earlier_requests() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE t(a, b);", None, None)
        .expect("create");
    fx.engine
        .post_query("INSERT INTO t VALUES (1, 'x');", None, None)
        .expect("insert");
    let select = fx
        .engine
        .post_select("SELECT a, b FROM t;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);

    let rows = fx.engine.result(select).expect("handle");
    assert!(!rows.is_busy());
    assert_eq!(rows.record_count().expect("count"), 1);
    assert!(rows.next_record().expect("next"));
    assert_eq!(rows.field_value(FieldRef::Index(0)).expect("a"), "1");
    assert_eq!(rows.field_value(FieldRef::Index(1)).expect("b"), "x");
    assert_eq!(rows.field_value_str("B").expect("by name"), "x");
    assert_eq!(rows.sql(), "SELECT a, b FROM t;");
    assert!(!rows.next_record().expect("end"));
}

#[test]
fn insert_reports_row_id_and_changes() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE t(a, b);", None, None)
        .expect("create");
    let insert = fx
        .engine
        .post_update("INSERT INTO t VALUES (1, 'x');", Some("onDone"), None)
        .expect("insert");
    wait_for_reply(&fx, &done, insert);

    let result = fx.engine.result(insert).expect("handle");
    assert!(result.succeeded().expect("succeeded"));
    assert_eq!(result.last_insert_id().expect("id"), 1);
    assert_eq!(result.affected_rows().expect("changes"), 1);
    assert!(!result.next_record().expect("no rows"));
}

#[test]
fn select_does_not_record_changes() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE t(a); INSERT INTO t VALUES (5);", None, None)
        .expect("setup");
    let select = fx
        .engine
        .post_select("SELECT a FROM t;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);
    let result = fx.engine.result(select).expect("handle");
    assert_eq!(result.last_insert_id().expect("id"), 0);
    assert_eq!(result.affected_rows().expect("changes"), 0);
    assert!(result.succeeded().expect("succeeded"));
}

#[test]
fn bad_statement_reports_to_the_engine_and_the_worker_keeps_going() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        assert!(fx.host.define_method(fx.engine.id(), "onError", move |_, args| {
            errors.lock().push(args.to_vec());
        }));
    }
    let bad = fx
        .engine
        .post_query("SELEKT nonsense;", Some("onDone"), None)
        .expect("bad");
    let good = fx
        .engine
        .post_select("SELECT 1 AS one;", Some("onDone"), None)
        .expect("good");
    wait_for_reply(&fx, &done, good);
    assert!(fx.host.run_until(TIMEOUT, || !errors.lock().is_empty()));

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    let code: i32 = errors[0][0].parse().expect("code");
    assert_ne!(code, 0);
    assert!(!errors[0][1].is_empty());
    assert_eq!(errors[0][2], bad.to_string());
    assert!(!done.lock().contains(&bad));

    let failed = fx.engine.result(bad).expect("failed handle");
    assert!(!failed.is_busy());
    assert!(!failed.succeeded().expect("outcome"));
    let err = failed.last_error().expect("error").expect("failure recorded");
    assert!(matches!(err, SqliError::StatementFailure { .. }));
    assert_eq!(err.code(), Some(code));

    let ok = fx.engine.result(good).expect("good handle");
    assert!(ok.next_record().expect("row"));
    assert_eq!(ok.field_value_str("one").expect("one"), "1");
}

#[test]
fn posts_before_initialize_produce_nothing() {
    init_tracing();
    let host = Arc::new(SimHost::new());
    let engine = QueryEngine::new(host.clone(), EngineConfig::default()).expect("engine");
    assert!(matches!(
        engine.post_query("SELECT 1;", Some("onDone"), None),
        Err(SqliError::NotInitialized)
    ));
    assert!(matches!(
        engine.execute_exclusive("SELECT 1;"),
        Err(SqliError::NotInitialized)
    ));
    assert_eq!(host.process_events(), 0);
    assert_eq!(host.object_count(), 1);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn requests_run_in_post_order() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE seq(n INTEGER);", None, None)
        .expect("create");
    for n in 0..64 {
        fx.engine
            .post_query(&format!("INSERT INTO seq VALUES ({n});"), None, None)
            .expect("insert");
    }
    let select = fx
        .engine
        .post_select("SELECT n FROM seq ORDER BY rowid;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);

    let rows = fx.engine.result(select).expect("handle");
    let mut seen = Vec::new();
    while rows.next_record().expect("next") {
        seen.push(rows.field_value(FieldRef::Index(0)).expect("n"));
    }
    let expected: Vec<String> = (0..64).map(|n: i32| n.to_string()).collect();
    assert_eq!(seen, expected);
}

#[test]
fn exclusive_queries_block_and_skip_the_event_loop() {
    let fx = fixture();
    fx.host.process_events();
    let create = fx
        .engine
        .execute_exclusive("CREATE TABLE e(x); INSERT INTO e VALUES (7);")
        .expect("create");
    let created = fx.engine.result(create).expect("handle");
    assert!(!created.is_busy());
    assert!(created.succeeded().expect("succeeded"));
    assert_eq!(created.last_insert_id().expect("id"), 1);

    let select = fx
        .engine
        .execute_exclusive("SELECT x FROM e;")
        .expect("select");
    let rows = fx.engine.result(select).expect("handle");
    assert!(rows.next_record().expect("row"));
    assert_eq!(rows.field_value_str("x").expect("x"), "7");

    let broken = fx.engine.execute_exclusive("SELEKT;").expect("posted");
    let broken = fx.engine.result(broken).expect("handle");
    assert!(!broken.succeeded().expect("outcome"));
    assert!(broken.last_error().expect("error").is_some());

    assert_eq!(fx.host.process_events(), 0);
    assert!(fx.host.contains(create));
}

#[test]
fn reply_to_a_deleted_target_clears_the_result() {
    let fx = fixture();
    let listener = fx.host.create_object("Listener");
    let called = Arc::new(Mutex::new(false));
    {
        let called = Arc::clone(&called);
        fx.host.define_method(listener, "onDone", move |_, _| {
            *called.lock() = true;
        });
    }
    let select = fx
        .engine
        .post_select("SELECT 1;", Some("onDone"), Some(listener))
        .expect("select");
    assert!(fx.host.delete_object(listener));
    assert!(fx.host.run_until(TIMEOUT, || !fx.host.contains(select)));
    assert!(!*called.lock());
}

#[test]
fn method_callbacks_run_on_their_target() {
    let fx = fixture();
    let listener = fx.host.create_object("Listener");
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        fx.host.define_method(listener, "onRows", move |host, args| {
            let id: ObjectId = args[0].parse().expect("id");
            let rows = sqli_engine::find_as::<sqli_engine::ResultHandle>(host, id).expect("rows");
            seen.lock().push(rows.record_count().expect("count"));
            host.delete_object(id);
        });
    }
    let select = fx
        .engine
        .post_select("SELECT 1 UNION ALL SELECT 2;", Some("onRows"), Some(listener))
        .expect("select");
    assert!(fx.host.run_until(TIMEOUT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![2]);
    assert!(!fx.host.contains(select));
}

#[test]
fn results_without_a_callback_go_to_the_cleanup_hook() {
    let fx = fixture();
    let cleared = collect_ids(&fx.host, DEFAULT_CLEANUP_HOOK);
    let id = fx
        .engine
        .post_query("SELECT 1;", None, None)
        .expect("query");
    wait_for_reply(&fx, &cleared, id);
    assert!(fx.host.contains(id));
}

#[test]
fn results_without_any_hook_are_deleted() {
    let fx = fixture();
    let id = fx
        .engine
        .post_query("SELECT 1;", None, None)
        .expect("query");
    assert!(fx.host.run_until(TIMEOUT, || !fx.host.contains(id)));
}

#[test]
fn forgotten_results_are_flagged_but_kept() {
    let fx = fixture_with(EngineConfig {
        create_if_missing: true,
        expiry_timeout_ms: 1000,
        sweep_interval_ms: 500,
        ..EngineConfig::default()
    });
    let done = collect_ids(&fx.host, "keep");
    let id = fx
        .engine
        .post_select("SELECT 1;", Some("keep"), None)
        .expect("select");
    wait_for_reply(&fx, &done, id);
    let result = fx.engine.result(id).expect("handle");

    fx.host.advance(600);
    fx.host.process_events();
    assert_eq!(result.expiry_warnings(), 0);

    fx.host.advance(600);
    fx.host.process_events();
    assert_eq!(result.expiry_warnings(), 1);
    assert!(fx.host.contains(id));
    assert_eq!(fx.engine.outstanding_handles(), 1);

    result.set_ignore_expiry(true);
    fx.host.advance(5000);
    fx.host.process_events();
    assert_eq!(result.expiry_warnings(), 1);
}

#[test]
fn open_failure_is_reported_and_the_engine_stays_unusable() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(SimHost::new());
    let config = EngineConfig {
        create_if_missing: true,
        ..EngineConfig::default()
    };
    let engine = QueryEngine::new(host.clone(), config).expect("engine");
    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        host.define_method(engine.id(), "onOpenFailed", move |_, args| {
            failures.lock().push(args.to_vec());
        });
    }
    engine
        .initialize(dir.path().join("no").join("such").join("dir.db"))
        .expect("worker starts");
    assert!(host.run_until(TIMEOUT, || !failures.lock().is_empty()));

    let code: i32 = failures.lock()[0][0].parse().expect("code");
    assert_eq!(code, sqli_db::SQLITE_CANTOPEN);
    assert!(!engine.is_initialized());
    assert!(matches!(
        engine.post_select("SELECT 1;", None, None),
        Err(SqliError::NotInitialized)
    ));
}

#[test]
fn initialized_callback_fires_on_the_engine() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(SimHost::new());
    let config = EngineConfig {
        create_if_missing: true,
        ..EngineConfig::default()
    };
    let engine = QueryEngine::new(host.clone(), config).expect("engine");
    let ready = Arc::new(Mutex::new(false));
    {
        let ready = Arc::clone(&ready);
        host.define_method(engine.id(), "onInitialized", move |_, _| {
            *ready.lock() = true;
        });
    }
    engine
        .initialize(dir.path().join("fresh.db"))
        .expect("initialize");
    assert!(host.run_until(TIMEOUT, || *ready.lock()));
    assert!(engine.is_initialized());
}

#[test]
fn empty_selects_never_leave_the_first_record() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE t(a);", None, None)
        .expect("create");
    let select = fx
        .engine
        .post_select("SELECT a FROM t;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);
    let rows = fx.engine.result(select).expect("handle");
    assert_eq!(rows.record_count().expect("count"), 0);
    assert!(!rows.next_record().expect("next"));
    assert!(rows.is_before_first().expect("first"));
    assert_eq!(rows.field_count().expect("fields"), 0);
}

#[test]
fn table_dump_lists_tables() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    fx.engine
        .post_query("CREATE TABLE alpha(a); CREATE TABLE beta(b);", None, None)
        .expect("create");
    let dump = fx
        .engine
        .post_table_dump(Some("onDone"), None)
        .expect("dump");
    wait_for_reply(&fx, &done, dump);
    let rows = fx.engine.result(dump).expect("handle");
    let mut names = Vec::new();
    while rows.next_record().expect("next") {
        names.push(rows.field_value_str("name").expect("name"));
    }
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
}

#[test]
fn null_values_read_as_empty_text_but_stay_distinct() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    let select = fx
        .engine
        .post_select("SELECT NULL AS missing, '' AS blank;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);
    let rows = fx.engine.result(select).expect("handle");
    assert!(rows.next_record().expect("row"));
    assert_eq!(rows.field_value_str("missing").expect("missing"), "");
    assert_eq!(rows.field_value_str("blank").expect("blank"), "");
    assert_eq!(rows.field(0).expect("missing"), None);
    assert_eq!(rows.field(1).expect("blank"), Some(String::new()));
}

#[test]
fn deleting_the_engine_from_the_host_shuts_it_down() {
    let fx = fixture();
    let done = collect_ids(&fx.host, "onDone");
    let select = fx
        .engine
        .post_select("SELECT 1;", Some("onDone"), None)
        .expect("select");
    wait_for_reply(&fx, &done, select);
    assert!(fx.host.delete_object(fx.engine.id()));
    assert_eq!(fx.engine.state(), EngineState::Stopped);
    assert!(!fx.engine.is_initialized());
    assert!(matches!(
        fx.engine.post_query("SELECT 1;", None, None),
        Err(SqliError::ShuttingDown)
    ));
    // Handles outlive their engine.
    let rows = sqli_engine::find_as::<sqli_engine::ResultHandle>(fx.host.as_ref(), select)
        .expect("handle");
    assert_eq!(rows.record_count().expect("count"), 1);
}
