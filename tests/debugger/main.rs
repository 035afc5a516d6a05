
mod dispatch;
mod stopgo;
mod triage;

use crate::common::{FakeRuntime, MockTarget, TestHooks};
use oopdbg::debugger::transport::loopback;
use oopdbg::debugger::{Error, ProcessBuilder, Session};
use serial_test::serial;
use std::sync::Arc;

#[test]
#[serial]
fn test_engine_graceful_shutdown() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();
        process.stop(Some(common::WAIT)).unwrap();
        process.continue_debugee(false).unwrap();
        assert!(common::wait_until(|| !runtime.is_stopped()));
    });
}

#[test]
#[serial]
fn test_attach_rejects_incompatible_runtime() {
    let (transport, endpoint) = loopback();
    let _runtime = FakeRuntime::start(endpoint);
    let target = Arc::new(MockTarget::default());
    target.load_runtime((1, 1));

    let result = ProcessBuilder::new(Arc::new(TestHooks::default())).attach(
        common::pid(),
        Arc::new(transport),
        target,
    );
    let err = result.err().unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::ProtocolMismatch { .. }));
}

#[test]
#[serial]
fn test_process_exit_reported_once() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        runtime.endpoint().signal_terminated();
        let process = session.process().clone();
        assert!(common::wait_until(|| process.is_terminated()));
        assert!(matches!(process.stop(None), Err(Error::ProcessTerminated)));
        assert!(matches!(process.continue_debugee(false), Err(Error::ProcessTerminated)));
        assert_eq!(hooks.exits(), vec![0]);
    });
}

#[test]
#[serial]
fn test_session_without_runtime_thread_leak() {
    let (transport, endpoint) = loopback();
    let _runtime = FakeRuntime::start(endpoint);
    let process = ProcessBuilder::new(Arc::new(TestHooks::default()))
        .attach(common::pid(), Arc::new(transport), Arc::new(MockTarget::default()))
        .unwrap();
    let session = Session::start(process.clone()).unwrap();
    drop(session);
    // engine threads are gone, the process object is ours alone
    assert_eq!(Arc::strong_count(&process), 1);
}
