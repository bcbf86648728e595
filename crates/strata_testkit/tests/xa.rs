//! Integration tests for global (XA) transactions.

use strata_core::{
    CommitFlags, CoreError, GlobalTransactionId, OpenMode, SavepointKind, XactState, TMENDRSCAN,
    TMNOFLAGS, TMSTARTRSCAN, XA_OK, XA_RDONLY,
};
use strata_testkit::prelude::*;

fn gid(name: &[u8]) -> GlobalTransactionId {
    GlobalTransactionId::new(7, name.to_vec(), b"branch".to_vec()).unwrap()
}

#[test]
fn prepared_branch_survives_a_crash_and_commits() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let xact = engine.start_global_transaction(7, b"commit-me", b"branch").unwrap();
    {
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        t.insert(&handle, row(key, 1), b"global".to_vec()).unwrap();
        assert_eq!(t.xa_prepare().unwrap(), XA_OK);
        assert_eq!(t.state(), XactState::Prepared);
    }

    let engine = engine.crash();
    drop(xact);
    assert_eq!(engine.recovery_summary().in_doubt, 1);
    assert_eq!(engine.recovery_summary().rolled_back, 0);

    let rm = engine.xa_resource_manager();
    assert_eq!(rm.recover(TMSTARTRSCAN), vec![gid(b"commit-me")]);
    assert!(rm.recover(TMNOFLAGS).is_empty());
    assert!(rm.recover(TMENDRSCAN).is_empty());

    let recovered = engine.find_transaction(&gid(b"commit-me")).unwrap();
    assert!(recovered.lock().is_prepared());
    drop(recovered);

    rm.commit(&gid(b"commit-me"), false).unwrap();
    assert!(engine.in_doubt_transactions().is_empty());
    assert!(engine.find_transaction(&gid(b"commit-me")).is_none());
    assert_eq!(engine.read_row(key, 1), Some(b"global".to_vec()));

    let engine = engine.crash();
    assert_eq!(engine.recovery_summary().in_doubt, 0);
    assert_eq!(engine.read_row(key, 1), Some(b"global".to_vec()));
}

#[test]
fn prepared_branch_only_takes_xa_completion() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let xact = engine.start_global_transaction(7, b"local", b"branch").unwrap();
    {
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        t.insert(&handle, row(key, 1), b"prepared".to_vec()).unwrap();
        assert_eq!(t.xa_prepare().unwrap(), XA_OK);

        assert!(matches!(t.commit(), Err(CoreError::ProtocolViolation { .. })));
        assert!(matches!(
            t.commit_no_sync(CommitFlags::NONE),
            Err(CoreError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            t.set_savepoint("sp", SavepointKind::Jdbc),
            Err(CoreError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            t.insert(&handle, row(key, 2), b"late".to_vec()),
            Err(CoreError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            t.open_container(key, OpenMode::NONE),
            Err(CoreError::ProtocolViolation { .. })
        ));
        assert_eq!(t.state(), XactState::Prepared);
    }

    let engine = engine.crash();
    drop(xact);
    let recovered = engine.find_transaction(&gid(b"local")).unwrap();
    assert!(matches!(
        recovered.lock().commit(),
        Err(CoreError::ProtocolViolation { .. })
    ));
    drop(recovered);

    engine.xa_resource_manager().rollback(&gid(b"local")).unwrap();
    assert!(engine.in_doubt_transactions().is_empty());
    assert_eq!(engine.read_row(key, 1), None);
}

#[test]
fn in_doubt_branch_can_be_rolled_back() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    engine.commit_row(key, 1, b"before");
    let xact = engine.start_global_transaction(7, b"undo-me", b"branch").unwrap();
    {
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        t.update(&handle, row(key, 1), b"after".to_vec()).unwrap();
        assert_eq!(t.xa_prepare().unwrap(), XA_OK);
    }

    let engine = engine.crash();
    drop(xact);
    let rm = engine.xa_resource_manager();
    rm.rollback(&gid(b"undo-me")).unwrap();
    assert!(engine.in_doubt_transactions().is_empty());
    assert_eq!(engine.read_row(key, 1), Some(b"before".to_vec()));
    assert!(matches!(
        rm.rollback(&gid(b"undo-me")),
        Err(CoreError::XaNotFound { .. })
    ));
}

#[test]
fn live_branch_commits_in_two_phases() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let xact = engine.start_global_transaction(7, b"live", b"branch").unwrap();
    {
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        t.insert(&handle, row(key, 1), b"two-phase".to_vec()).unwrap();
        assert!(matches!(
            t.xa_commit(false),
            Err(CoreError::ProtocolViolation { .. })
        ));
        assert_eq!(t.xa_prepare().unwrap(), XA_OK);
        assert!(matches!(
            t.xa_commit(true),
            Err(CoreError::ProtocolViolation { .. })
        ));
    }

    let rm = engine.xa_resource_manager();
    assert_eq!(rm.recover(TMSTARTRSCAN), vec![gid(b"live")]);
    rm.commit(&gid(b"live"), false).unwrap();
    drop(xact);
    assert_eq!(engine.read_row(key, 1), Some(b"two-phase".to_vec()));
}

#[test]
fn one_phase_commit_skips_prepare() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let xact = engine.start_global_transaction(7, b"one-phase", b"branch").unwrap();
    {
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        t.insert(&handle, row(key, 1), b"fast".to_vec()).unwrap();
    }
    engine
        .xa_resource_manager()
        .commit(&gid(b"one-phase"), true)
        .unwrap();
    drop(xact);
    assert_eq!(engine.read_row(key, 1), Some(b"fast".to_vec()));
}

#[test]
fn untouched_branch_votes_read_only() {
    let engine = TestEngine::new();
    let xact = engine.start_global_transaction(7, b"reader", b"branch").unwrap();
    let mut t = xact.lock();
    assert_eq!(t.xa_prepare().unwrap(), XA_RDONLY);
    assert!(t.is_idle());
    drop(t);
    assert!(engine
        .xa_resource_manager()
        .recover(TMSTARTRSCAN)
        .is_empty());
}

#[test]
fn forget_has_nothing_to_forget() {
    let engine = TestEngine::new();
    let rm = engine.xa_resource_manager();
    assert!(matches!(
        rm.forget(&gid(b"unknown")),
        Err(CoreError::XaNotFound { .. })
    ));

    let _xact = engine.start_global_transaction(7, b"known", b"branch").unwrap();
    assert!(matches!(
        rm.forget(&gid(b"known")),
        Err(CoreError::XaProtocol { .. })
    ));
}

#[test]
fn local_transaction_can_become_global() {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let xact = engine.start_transaction("local").unwrap();
    let mut t = xact.lock();
    engine
        .create_xa_transaction_from_local(&mut t, 7, b"promoted", b"branch")
        .unwrap();
    assert_eq!(t.global_id(), Some(&gid(b"promoted")));
    let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
    t.insert(&handle, row(key, 1), b"promoted".to_vec()).unwrap();
    assert_eq!(t.xa_prepare().unwrap(), XA_OK);
    drop(t);

    let engine = engine.crash();
    drop(xact);
    assert_eq!(
        engine.xa_resource_manager().recover(TMSTARTRSCAN),
        vec![gid(b"promoted")]
    );
}
