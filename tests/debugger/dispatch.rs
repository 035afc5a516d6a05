use crate::common::{self, exception, Seen, TestHooks};
use crate::engine_env;
use oopdbg::debugger::address::RemoteAddress;
use oopdbg::debugger::native::ExceptionCode;
use oopdbg::debugger::target::RemoteThreadInfo;
use oopdbg::debugger::transport::message::{IpcEventKind, IpcEventType};
use oopdbg::debugger::{DebuggerConfig, Error};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn breakpoint(addr: u64) -> IpcEventKind {
    IpcEventKind::Breakpoint {
        address: RemoteAddress::from(addr),
    }
}

#[test]
#[serial]
fn test_managed_event_dispatch() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        runtime.raise(vec![breakpoint(0x1000)]);

        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert_eq!(hooks.seen(), vec![Seen::Managed(IpcEventType::Breakpoint)]);
        let process = session.process();
        assert!(!process.is_synchronized());
        assert_eq!(process.stop_count(), 0);
        assert_eq!(process.queued_managed_events(), 0);
    });
}

#[test]
#[serial]
fn test_queued_events_dispatched_in_order_with_single_resume() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        runtime.raise(vec![
            breakpoint(0x1000),
            IpcEventKind::StepComplete { address: RemoteAddress::from(0x1004_u64) },
            IpcEventKind::UserBreak,
        ]);

        assert!(common::wait_until(|| hooks.seen().len() == 3));
        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert_eq!(
            hooks.seen(),
            vec![
                Seen::Managed(IpcEventType::Breakpoint),
                Seen::Managed(IpcEventType::StepComplete),
                Seen::Managed(IpcEventType::UserBreak),
            ]
        );
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runtime.continues(), vec![1]);
        assert_eq!(session.process().continue_counter(), 1);
    });
}

#[derive(Default, Debug)]
struct Observed {
    synchronized_after_continue: bool,
    stop_count_after_continue: u32,
    resumed_inside: bool,
    second_continue: Option<String>,
}

#[test]
#[serial]
fn test_continue_inside_callback_defers_resume() {
    let observed = Arc::new(Mutex::new(Observed::default()));

    let obs = observed.clone();
    let hooks = TestHooks::with_callback(move |process, _| {
        process.continue_debugee(false).unwrap();
        thread::sleep(Duration::from_millis(30));

        let mut obs = obs.lock();
        obs.synchronized_after_continue = process.is_synchronized();
        obs.stop_count_after_continue = process.stop_count();
        obs.resumed_inside = process.continue_counter() > 0;
        obs.second_continue = process
            .continue_debugee(false)
            .err()
            .map(|e| e.to_string());
    });

    engine_env!(hooks: hooks, runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        runtime.raise(vec![breakpoint(0x1000)]);
        assert!(common::wait_until(|| runtime.continues() == vec![1]));

        let obs = observed.lock();
        assert!(obs.synchronized_after_continue);
        assert_eq!(obs.stop_count_after_continue, 1);
        assert!(!obs.resumed_inside);
        assert_eq!(
            obs.second_continue.as_deref(),
            Some(Error::SuperfluousContinue.to_string().as_str())
        );
        assert!(!session.process().is_dispatching());
    });
}

#[test]
#[serial]
fn test_continue_from_another_thread() {
    let hooks = TestHooks::with_callback(|_, _| {});
    engine_env!(hooks: hooks, runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        let process = session.process().clone();
        runtime.raise(vec![IpcEventKind::UserBreak]);

        assert!(common::wait_until(|| hooks.seen().len() == 1 && !process.is_dispatching()));
        assert!(process.is_synchronized());
        assert_eq!(process.stop_count(), 1);
        thread::sleep(Duration::from_millis(30));
        assert!(runtime.continues().is_empty());

        process.continue_debugee(false).unwrap();
        assert!(common::wait_until(|| runtime.continues() == vec![1]));
    });
}

#[test]
#[serial]
fn test_runtime_startup_loads_offsets() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: false, interop: false,
        runtime, target, _pump, hooks, session, {
        let process = session.process().clone();
        assert!(!process.is_runtime_initialized());

        target.load_runtime((2, 2));
        runtime.raise(vec![IpcEventKind::RuntimeStartup]);

        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert!(process.is_runtime_initialized());
        assert_eq!(process.runtime_offsets(), Some(common::sample_offsets()));
        assert_eq!(hooks.seen(), vec![Seen::Managed(IpcEventType::RuntimeStartup)]);
    });
}

#[test]
#[serial]
fn test_runtime_exit_notification() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        let process = session.process().clone();
        runtime.raise(vec![IpcEventKind::ExitProcess { code: 3 }]);
        assert!(common::wait_until(|| hooks.seen().len() == 1));

        runtime.endpoint().signal_terminated();
        assert!(common::wait_until(|| process.is_terminated()));
        assert_eq!(hooks.exits(), vec![3]);
    });
}

#[test]
#[serial]
fn test_cleanup_sweeps_after_resume() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();
        let module = process.register_object(None, Some(0xAA)).unwrap();
        let function = process.register_object(Some(module), None).unwrap();
        let kept = process.register_object(None, Some(0xBB)).unwrap();

        process.release_object(function).unwrap();
        process.release_object(module).unwrap();
        assert!(!process.is_object_neutered(module));

        process.stop(Some(common::WAIT)).unwrap();
        process.continue_debugee(false).unwrap();

        assert_eq!(runtime.released(), vec![0xAA]);
        assert!(process.is_object_neutered(function));
        assert!(process.is_object_neutered(module));
        assert!(!process.is_object_neutered(kept));
        assert!(matches!(process.add_object_ref(module), Err(Error::ObjectNeutered(_))));
    });
}

#[test]
#[serial]
fn test_detach() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();
        let object = process.register_object(None, None).unwrap();
        assert!(matches!(process.detach(), Err(Error::NotSynchronized)));

        process.stop(Some(common::WAIT)).unwrap();
        process.detach().unwrap();

        assert!(process.is_detached());
        assert!(process.is_object_neutered(object));
        assert_eq!(runtime.count_requests(IpcEventType::Detach), 1);
        assert!(matches!(process.stop(None), Err(Error::Detached)));
    });
}

#[test]
#[serial]
fn test_detach_with_failed_reply() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();
        process.stop(Some(common::WAIT)).unwrap();
        runtime.fail_next_reply(-1);

        let err = process.detach().unwrap_err();
        assert!(matches!(err, Error::ReplyStatus { status: -1, .. }));
        assert!(!process.is_unrecoverable());
        assert!(!process.is_detached());
    });
}

#[test]
#[serial]
fn test_helper_death_during_detach() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        runtime, _target, _pump, hooks, session, {
        let process = session.process().clone();
        process.stop(Some(common::WAIT)).unwrap();
        // detach request is never acknowledged
        runtime.hold_next_reply();

        let endpoint = runtime.endpoint().clone();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            endpoint.signal_helper_dead();
        });
        let err = process.detach().unwrap_err();
        killer.join().unwrap();

        assert!(matches!(err, Error::HelperThreadDead));
        assert_eq!(runtime.count_requests(IpcEventType::Detach), 1);
        assert!(process.is_unrecoverable());
        assert!(common::wait_until(|| hooks.unrecoverable_count() == 1));
        assert!(!process.is_detached());
    });
}

#[test]
#[serial]
fn test_late_reply_not_taken_for_next_exchange() {
    let config = DebuggerConfig::parse("reply_timeout_ms = 50").unwrap();
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: false,
        config: config, runtime, _target, _pump, _hooks, session, {
        let process = session.process().clone();

        let first = process.register_object(None, Some(1)).unwrap();
        process.release_object(first).unwrap();
        runtime.hold_next_reply();
        process.stop(Some(common::WAIT)).unwrap();
        // release of the first handle times out
        process.continue_debugee(false).unwrap();
        assert_eq!(runtime.released(), vec![1]);
        assert!(!process.is_unrecoverable());

        // its acknowledgement arrives right before the one for the second handle
        let second = process.register_object(None, Some(2)).unwrap();
        process.release_object(second).unwrap();
        process.stop(Some(common::WAIT)).unwrap();
        process.continue_debugee(false).unwrap();
        assert_eq!(runtime.released(), vec![1, 2]);

        process.stop(Some(common::WAIT)).unwrap();
        process.detach().unwrap();
        assert!(process.is_detached());
        assert!(!process.is_unrecoverable());
    });
}

fn cant_stop_thread() -> RemoteThreadInfo {
    RemoteThreadInfo {
        cant_stop: 1,
        ..Default::default()
    }
}

#[test]
#[serial]
fn test_out_of_band_callback_restrictions() {
    let errors = Arc::new(Mutex::new(vec![]));

    let errs = errors.clone();
    let hooks = TestHooks::with_callback(move |process, seen| {
        if !matches!(seen, Seen::Native { out_of_band: true, .. }) {
            return;
        }
        let mut errs = errs.lock();
        errs.push(process.stop(Some(common::WAIT)).err().map(|e| e.to_string()));
        errs.push(process.continue_debugee(false).err().map(|e| e.to_string()));
        process.continue_debugee(true).unwrap();
    });
    engine_env!(hooks: hooks, runtime_loaded: true, interop: true,
        runtime, target, pump, _hooks, session, {
        target.set_thread_info(9, cant_stop_thread());
        pump.push(exception(9, ExceptionCode::ACCESS_VIOLATION, 0x9000));

        assert!(common::wait_until(|| pump.continued_len() == 1));
        assert_eq!(
            *errors.lock(),
            vec![
                Some(Error::StopOnDispatchThread.to_string()),
                Some(Error::InBandContinueFromOutOfBand.to_string()),
            ]
        );
        assert_eq!(runtime.count_requests(IpcEventType::AsyncBreak), 0);
        assert_eq!(session.process().stop_count(), 0);
        assert!(!session.process().is_dispatching());
    });
}

#[test]
#[serial]
fn test_detach_with_pending_out_of_band_event() {
    let hooks = TestHooks::with_callback(|_, _| {});
    engine_env!(hooks: hooks, runtime_loaded: true, interop: true,
        runtime, target, pump, hooks, session, {
        target.set_thread_info(9, cant_stop_thread());
        let process = session.process().clone();
        process.stop(Some(common::WAIT)).unwrap();

        pump.push(exception(9, ExceptionCode::ACCESS_VIOLATION, 0x9000));
        assert!(common::wait_until(|| hooks.seen().len() == 1));
        assert!(matches!(process.detach(), Err(Error::OutOfBandPending)));
        assert!(process.is_synchronized());
        assert_eq!(runtime.count_requests(IpcEventType::Detach), 0);

        process.continue_debugee(true).unwrap();
        assert!(common::wait_until(|| pump.continued_len() == 1));
        process.detach().unwrap();
        assert!(process.is_detached());
    });
}
