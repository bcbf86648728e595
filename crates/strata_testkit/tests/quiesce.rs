//! Integration tests for quiescing the engine.

use std::thread;
use std::time::Duration;

use strata_core::{CoreError, OpenMode};
use strata_testkit::prelude::*;

#[test]
fn quiesced_engine_refuses_new_work_but_not_nested_readers() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let parent = engine.start_transaction("parent").unwrap();

    engine.quiesce(Duration::from_millis(100)).unwrap();
    assert!(engine.is_quiesced());
    assert!(matches!(
        engine.start_transaction("late"),
        Err(CoreError::Quiesced)
    ));
    assert!(matches!(
        engine.start_internal_transaction(),
        Err(CoreError::Quiesced)
    ));

    {
        let p = parent.lock();
        let reader = engine
            .start_nested_read_only_user_transaction(&p, "reader")
            .unwrap();
        let mut r = reader.lock();
        let handle = r.open_container(key, OpenMode::NONE).unwrap().unwrap();
        assert_eq!(r.fetch(&handle, row(key, 1)).unwrap(), None);
        r.commit().unwrap();
    }

    {
        let mut p = parent.lock();
        assert!(matches!(
            p.open_container(key, OpenMode::NONE),
            Err(CoreError::Quiesced)
        ));
    }

    engine.unquiesce();
    assert!(!engine.is_quiesced());
    engine.commit_row(key, 1, b"after");
    assert_eq!(engine.read_row(key, 1), Some(b"after".to_vec()));
}

#[test]
fn quiesce_times_out_on_a_busy_transaction() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let busy = engine.pending_row(key, 1, b"busy");

    let err = engine.quiesce(Duration::from_millis(30)).unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(!engine.is_quiesced());

    busy.lock().commit().unwrap();
    engine.quiesce(Duration::from_millis(30)).unwrap();
    engine.unquiesce();
}

#[test]
fn quiesce_waits_for_busy_transactions_to_finish() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let busy = engine.pending_row(key, 1, b"finishing");

    thread::scope(|scope| {
        let worker = scope.spawn(move || {
            thread::sleep(Duration::from_millis(50));
            busy.lock().commit().unwrap();
        });
        engine.quiesce(Duration::from_secs(10)).unwrap();
        worker.join().unwrap();
    });

    assert!(engine.is_quiesced());
    assert!(engine.no_active_update_transaction());
    engine.unquiesce();
    assert_eq!(engine.read_row(key, 1), Some(b"finishing".to_vec()));
}
