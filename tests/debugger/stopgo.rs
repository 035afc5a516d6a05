use crate::common::{self, TestHooks};
use crate::engine_env;
use oopdbg::debugger::transport::message::{IpcEventKind, IpcEventType};
use nix::unistd::Pid;
use oopdbg::debugger::{DebuggerConfig, Error};
use serial_test::serial;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_stop_before_runtime_load_sends_nothing() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: false, interop: true,
        runtime, target, pump, _hooks, session, {
        target.set_threads(&[101, 102]);
        let process = session.process().clone();

        process.stop(None).unwrap();
        assert!(process.is_synchronized());
        assert_eq!(process.stop_count(), 1);
        assert_eq!(pump.suspended().len(), 2);

        process.continue_debugee(false).unwrap();
        assert!(!process.is_synchronized());
        assert_eq!(process.stop_count(), 0);
        assert!(pump.suspended().is_empty());

        thread::sleep(Duration::from_millis(30));
        assert!(runtime.requests().is_empty());
    });
}

#[test]
#[serial]
fn test_superfluous_continue() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();
        assert!(matches!(process.continue_debugee(false), Err(Error::SuperfluousContinue)));
        assert_eq!(process.stop_count(), 0);

        process.stop(Some(common::WAIT)).unwrap();
        process.continue_debugee(false).unwrap();
        assert!(matches!(process.continue_debugee(false), Err(Error::SuperfluousContinue)));
        assert_eq!(process.stop_count(), 0);
        assert!(!process.is_synchronized());
        assert!(common::wait_until(|| runtime.continues() == vec![1]));
    });
}

#[test]
#[serial]
fn test_nested_stops() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();

        process.stop(Some(common::WAIT)).unwrap();
        process.stop(Some(common::WAIT)).unwrap();
        assert_eq!(process.stop_count(), 2);
        assert_eq!(runtime.count_requests(IpcEventType::AsyncBreak), 1);

        process.continue_debugee(false).unwrap();
        assert!(process.is_synchronized());
        thread::sleep(Duration::from_millis(30));
        assert!(runtime.continues().is_empty());

        process.continue_debugee(false).unwrap();
        assert!(!process.is_synchronized());
        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert_eq!(process.continue_counter(), 1);
    });
}

#[test]
#[serial]
fn test_stop_timeout() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        runtime.ignore_async_break();
        let process = session.process().clone();

        let err = process.stop(Some(Duration::from_millis(50))).unwrap_err();
        assert!(err.is_transient());
        assert!(!process.is_synchronized());
        assert_eq!(process.stop_count(), 0);
        assert!(!process.is_unrecoverable());
    });
}

#[test]
#[serial]
fn test_stop_default_uses_configured_timeout() {
    let config = DebuggerConfig::parse("stop_timeout_ms = 50").unwrap();
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        config: config, runtime, _target, _pump, _hooks, session, {
        runtime.ignore_async_break();
        let process = session.process().clone();

        let started = Instant::now();
        let err = process.stop_default().unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(50)));
        assert!(started.elapsed() < common::WAIT);
        assert!(!process.is_synchronized());
    });
}

#[test]
#[serial]
fn test_stop_wakes_on_sync_complete_raised_by_runtime() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        runtime.ignore_async_break();
        let process = session.process().clone();

        for round in 1..=10 {
            let stopper = {
                let process = Arc::clone(&process);
                thread::spawn(move || process.stop(Some(common::WAIT)))
            };
            assert!(common::wait_until(|| {
                runtime.count_requests(IpcEventType::AsyncBreak) == round
            }));
            // runtime stops on its own while the break request is ignored
            runtime.raise(vec![]);

            stopper.join().unwrap().unwrap();
            assert!(process.is_synchronized());
            assert_eq!(process.stop_count(), 1);
            process.continue_debugee(false).unwrap();
            assert!(common::wait_until(|| runtime.continues().len() == round));
        }
    });
}

#[test]
#[serial]
fn test_stop_skips_exited_thread() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: false, interop: true,
        _runtime, target, pump, _hooks, session, {
        target.set_threads(&[101, 102, 103]);
        pump.thread_exited(102);
        let process = session.process().clone();

        process.stop(None).unwrap();
        assert_eq!(
            pump.suspended(),
            HashSet::from([Pid::from_raw(101), Pid::from_raw(103)])
        );

        process.continue_debugee(false).unwrap();
        assert!(pump.suspended().is_empty());
    });
}

#[test]
#[serial]
fn test_failed_suspend_resumes_other_threads() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: false, interop: true,
        _runtime, target, pump, _hooks, session, {
        target.set_threads(&[101, 102]);
        pump.deny_suspend(102);
        let process = session.process().clone();

        assert!(matches!(process.stop(None), Err(Error::NativePump(_))));
        assert!(pump.suspended().is_empty());
        assert!(!process.is_synchronized());
        assert_eq!(process.stop_count(), 0);
        assert!(matches!(process.continue_debugee(false), Err(Error::SuperfluousContinue)));
    });
}

#[test]
#[serial]
fn test_concurrent_stop_continue() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let process = Arc::clone(&process);
                thread::spawn(move || {
                    for _ in 0..20 {
                        process.stop(Some(common::WAIT)).unwrap();
                        assert!(process.is_synchronized());
                        assert!(process.stop_count() >= 1);
                        process.continue_debugee(false).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(process.stop_count(), 0);
        assert!(!process.is_synchronized());
        let resumes = process.continue_counter();
        assert!(resumes >= 1);
        assert!(common::wait_until(|| runtime.continues().len() == resumes as usize));
    });
}

#[test]
#[serial]
fn test_stop_inside_callback_nests() {
    let hooks = TestHooks::with_callback(|process, _| {
        // process is synchronized during dispatch, nested stop only counts
        process.stop(Some(common::WAIT)).unwrap();
        assert!(process.is_synchronized());
        process.continue_debugee(false).unwrap();
        process.continue_debugee(false).unwrap();
    });
    engine_env!(hooks: hooks, runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        runtime.raise(vec![IpcEventKind::UserBreak]);
        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert_eq!(hooks.seen().len(), 1);
        assert_eq!(session.process().stop_count(), 0);
    });
}

#[test]
#[serial]
fn test_unrecoverable_reported_once() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        let process = session.process().clone();
        runtime.endpoint().notify_raw(bytes::Bytes::from_static(&[0xFF; 24]));
        runtime.endpoint().notify_raw(bytes::Bytes::from_static(&[0xFF; 24]));

        assert!(common::wait_until(|| process.is_unrecoverable()));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hooks.unrecoverable_count(), 1);
        assert!(matches!(process.stop(None), Err(Error::Unrecoverable(_))));
        assert!(matches!(
            process.continue_debugee(false),
            Err(Error::Unrecoverable(_))
        ));
    });
}
