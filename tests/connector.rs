mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use hcrpc::{
    CancelToken, ClientError, Connector, RetryPolicy, TableDef,
    protocol::{CommandId, RemoteError, RemoteErrorKind, TableId},
    sim::write_result,
    table::TableInfo,
};

use common::*;

const ANSWER: CommandId = CommandId(100);
const FLAKY: CommandId = CommandId(101);

#[test]
fn retry_bound_matches_schedule() {
    init_logging();
    let dialer = RefusingDialer::default();
    let dials = dialer.dials.clone();
    let server = server();
    let mut config = config(&server, PASSWORD);
    config.retry = RetryPolicy::from_millis(&[0, 1, 2]);

    let connector = Connector::builder(config).dialer(dialer).build().unwrap();
    let err = connector.ping().unwrap_err();

    assert!(matches!(
        err,
        ClientError::Request {
            attempts: 4,
            command: CommandId::PING,
            ..
        }
    ));
    assert!(matches!(err.cause(), ClientError::Connection(_)));
    assert_eq!(dials.load(Ordering::SeqCst), 4);
}

#[test]
fn disallowed_retry_makes_one_attempt() {
    init_logging();
    let dialer = RefusingDialer::default();
    let dials = dialer.dials.clone();
    let server = server();

    let connector = Connector::builder(config(&server, PASSWORD))
        .dialer(dialer)
        .build()
        .unwrap();
    let err = connector.test_connect().unwrap_err();

    assert!(matches!(err, ClientError::Request { attempts: 1, .. }));
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[test]
fn bad_password_fails_immediately() {
    let server = server();
    let connector = Connector::builder(config(&server, "wrong")).build().unwrap();

    let err = connector.ping().unwrap_err();
    assert!(matches!(err, ClientError::Request { attempts: 1, .. }));
    assert!(matches!(err.cause(), ClientError::ImmediateFail(_)));
    assert_eq!(server.handshakes(), 1);
    assert_eq!(server.requests(), 0);
    assert_eq!(connector.connector_id(), None);
}

#[test]
fn handshake_assigns_connector_id_once() {
    let server = server();
    let connector = connector(&server);

    connector.ping().unwrap();
    let id = connector.connector_id().unwrap();
    connector.test_connect().unwrap();
    assert_eq!(connector.connector_id(), Some(id));
    assert_eq!(connector.pool_stats().connects, 1);
}

#[test]
fn int_query_applies_invalidation_list() {
    let server = server();
    server.handle(ANSWER, |ex| {
        write_result(&mut ex.output, &42i32, Some(&[TableId(3), TableId(7)][..]))
    });

    let names = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7"];
    let mut builder = builder(&server);
    let ids = names
        .iter()
        .map(|name| builder.table(TableDef::<Zone>::new(*name, "id")))
        .collect::<Vec<_>>();
    let connector = builder.build().unwrap();
    for id in &ids {
        server.set_rows(*id, rows(vec![Zone::new(1, "only", None)]));
    }

    let calls = Arc::new(Mutex::new(Vec::new()));
    for id in &ids {
        let table = connector.table::<Zone>(*id).unwrap();
        table.get_rows().unwrap();
        let weak = Arc::downgrade(&table);
        let seen = calls.clone();
        let listener = move |info: &TableInfo| {
            let loaded = weak.upgrade().is_some_and(|t| t.is_loaded());
            seen.lock().unwrap().push((info.id, loaded));
        };
        table.add_table_listener(Arc::new(listener), Duration::ZERO).unwrap();
    }

    let value = connector.request_int_query_il(true, ANSWER, &[]).unwrap();
    assert_eq!(value, 42);

    for id in &ids {
        let loaded = connector.table::<Zone>(*id).unwrap().is_loaded();
        assert_eq!(loaded, !(id.0 == 3 || id.0 == 7), "table {id}");
    }
    assert!(wait_until(|| calls.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(100));

    let mut calls = calls.lock().unwrap().clone();
    calls.sort_by_key(|(id, _)| *id);
    assert_eq!(calls, vec![(TableId(3), false), (TableId(7), false)]);
}

#[test]
fn failed_connections_are_never_pooled() {
    let server = server();
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    server.handle(FLAKY, move |ex| {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(ClientError::protocol("dropping connection"));
        }
        ex.done()?;
        ex.output.write_long(7)
    });
    let connector = connector(&server);

    assert_eq!(connector.request_long_query(true, FLAKY, &[]).unwrap(), 7);
    let stats = connector.pool_stats();
    assert_eq!(stats.aborts, 2);
    assert_eq!(stats.connects, 3);
    assert_eq!(stats.idle, 1);
    assert_eq!(server.handshakes(), 3);

    assert_eq!(connector.request_long_query(true, FLAKY, &[]).unwrap(), 7);
    assert_eq!(server.handshakes(), 3);
}

#[test]
fn remote_errors_are_retried_then_wrapped() {
    let server = server();
    server.handle(FLAKY, |ex| {
        ex.error(&RemoteError::new(RemoteErrorKind::Sql, "deadlock detected"))
    });
    let connector = connector(&server);

    let err = connector.request_update(true, FLAKY, &[]).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Request {
            attempts: 3,
            last_status: Some(4),
            ..
        }
    ));
    assert!(matches!(err.cause(), ClientError::Remote { .. }));
    // Error frames leave the connection usable, but any failure aborts it.
    assert_eq!(connector.pool_stats().aborts, 3);
}

#[test]
fn unsupported_commands_are_not_retried() {
    let server = server();
    let connector = connector(&server);

    let err = connector.request_update(true, CommandId(200), &[]).unwrap_err();
    assert!(matches!(err, ClientError::Request { attempts: 1, .. }));
    assert!(matches!(err.cause(), ClientError::Unsupported(_)));
    assert_eq!(connector.pool_stats().connects, 1);
}

#[test]
fn invalidate_round_trip_clears_table() {
    let server = server();
    let mut builder = builder(&server);
    let id = builder.table(TableDef::<Zone>::new("zones", "id"));
    let connector = builder.build().unwrap();
    server.set_rows(id, rows(vec![Zone::new(1, "com", None)]));

    let table = connector.table::<Zone>(id).unwrap();
    table.get_rows().unwrap();
    assert!(table.is_loaded());

    connector.invalidate(id).unwrap();
    assert!(!table.is_loaded());
}

#[test]
fn cancellation_stops_retry_sleep() {
    init_logging();
    let server = server();
    let mut config = config(&server, PASSWORD);
    config.retry = RetryPolicy::from_millis(&[10_000, 10_000]);
    let connector = Connector::builder(config)
        .dialer(RefusingDialer::default())
        .build()
        .unwrap();

    let token = CancelToken::new();
    let _guard = token.enter();
    let canceller = token.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let start = Instant::now();
    let err = connector.ping().unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(matches!(err.cause(), ClientError::Cancelled));
    handle.join().unwrap();
}

#[test]
fn unknown_table_ids_are_ignored() {
    let server = server();
    let mut builder = builder(&server);
    let id = builder.table(TableDef::<Zone>::new("zones", "id"));
    let connector = builder.build().unwrap();
    server.set_rows(id, rows(vec![Zone::new(1, "com", None)]));
    let table = connector.table::<Zone>(id).unwrap();
    table.get_rows().unwrap();

    connector.dispatch_invalidation(&[TableId(42), id]);
    assert!(!table.is_loaded());
}

#[test]
fn builder_rejects_unknown_references() {
    let server = server();
    let mut builder = builder(&server);
    builder.table(TableDef::<Site>::new("sites", "id").references("zone", "zones"));
    assert!(matches!(builder.build(), Err(ClientError::Config(_))));

    let mut builder = common::builder(&server);
    builder.table(TableDef::<Zone>::new("zones", "id"));
    builder.table(TableDef::<Zone>::new("zones", "id"));
    assert!(matches!(builder.build(), Err(ClientError::Config(_))));
}
