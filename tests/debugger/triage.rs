use crate::common::{self, exception, Seen, TestHooks, BP};
use crate::engine_env;
use nix::unistd::Pid;
use oopdbg::debugger::address::RemoteAddress;
use oopdbg::debugger::native::{ContinueStatus, ExceptionCode, NativeEvent, ThreadContext};
use oopdbg::debugger::runtime::Flare;
use oopdbg::debugger::target::{AddressKind, RemoteThreadInfo};
use oopdbg::debugger::transport::message::IpcEventType;
use oopdbg::debugger::triage::{triage, Reaction, ThreadFacts, TriageInput};
use serial_test::serial;

fn statuses(continued: &[(NativeEvent, ContinueStatus)]) -> Vec<ContinueStatus> {
    continued.iter().map(|(_, status)| *status).collect()
}

fn context_at(pc: u64) -> ThreadContext {
    ThreadContext {
        pc,
        sp: 0x7FFF_0000,
        ..Default::default()
    }
}

#[test]
fn test_triage_is_deterministic() {
    let codes = [
        ExceptionCode::BREAKPOINT,
        ExceptionCode::SINGLE_STEP,
        ExceptionCode::ACCESS_VIOLATION,
        ExceptionCode::STACK_OVERFLOW,
    ];
    let addresses = [
        (0x1000_u64, AddressKind::Unrecognized, true),
        (0x3000, AddressKind::RuntimeCode, false),
        (0x9000, AddressKind::Unrecognized, false),
    ];

    for code in codes {
        for (addr, kind, in_patch) in addresses {
            for cant_stop in [false, true] {
                for synchronized in [false, true] {
                    let event = exception(1, code, addr);
                    let input = TriageInput {
                        event: &event,
                        thread: ThreadFacts {
                            cant_stop,
                            ..Default::default()
                        },
                        flare: None,
                        in_patch_table: in_patch,
                        address_kind: kind,
                        synchronized,
                        runtime_loaded: true,
                    };
                    let first = triage(&input);
                    for _ in 0..16 {
                        assert_eq!(triage(&input.clone()), first);
                    }
                }
            }
        }
    }
}

#[test]
fn test_patch_breakpoint_in_non_runtime_code_is_in_band() {
    let event = exception(1, ExceptionCode::BREAKPOINT, 0x1000);
    let input = TriageInput {
        event: &event,
        thread: ThreadFacts::default(),
        flare: None,
        in_patch_table: true,
        address_kind: AddressKind::Unrecognized,
        synchronized: false,
        runtime_loaded: true,
    };
    assert_eq!(triage(&input), Reaction::InBand);

    let input = TriageInput {
        flare: Some(Flare::SyncComplete),
        ..input
    };
    assert_eq!(triage(&input), Reaction::Ignore);
}

#[test]
#[serial]
fn test_cleared_patch_breakpoint_not_redelivered() {
    engine_env!(hooks: TestHooks::clearing(), runtime_loaded: true, interop: true,
        runtime, target, pump, hooks, session, {
        target.put(0x1000, &[0x90, 0xC3]);
        target.install_patches(&[(0x1000, 0x90)]);
        pump.set_thread_context(7, context_at(0x1000));

        let bp = exception(7, ExceptionCode::BREAKPOINT, 0x1000);
        pump.push(bp.clone());

        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        assert!(matches!(
            hooks.seen().as_slice(),
            [Seen::Native { out_of_band: false, .. }]
        ));
        assert_eq!(runtime.count_requests(IpcEventType::AsyncBreak), 1);

        // thread is back at the breakpoint, stepping over the original instruction
        let ctx = pump.context(7);
        assert_eq!(ctx.pc, 0x1000);
        assert!(ctx.single_step);
        assert_eq!(target.get(0x1000, 1), vec![0x90]);
        assert_eq!(pump.continued(), vec![(bp, ContinueStatus::Handled)]);

        pump.push(exception(7, ExceptionCode::SINGLE_STEP, 0x1001));
        assert!(common::wait_until(|| pump.continued_len() == 2));
        assert_eq!(target.get(0x1000, 1), vec![BP]);
        assert!(!pump.context(7).single_step);
        assert!(statuses(&pump.continued())
            .iter()
            .all(|s| *s == ContinueStatus::Handled));
        assert!(!session.process().is_synchronized());
    });
}

#[test]
#[serial]
fn test_uncleared_exception_retriggers() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        runtime, target, pump, _hooks, session, {
        target.put(0x1000, &[0x90, 0xC3]);
        target.install_patches(&[(0x1000, 0x90)]);
        pump.set_thread_context(7, context_at(0x1000));

        let bp = exception(7, ExceptionCode::BREAKPOINT, 0x1000);
        pump.push(bp.clone());
        assert!(common::wait_until(|| runtime.continues() == vec![1]));

        let ctx = pump.context(7);
        assert_eq!(ctx, context_at(0x1000));
        assert_eq!(target.get(0x1000, 1), vec![BP]);

        // breakpoint raised again after un-hijack goes to the debugee
        pump.push(bp.clone());
        assert!(common::wait_until(|| pump.continued_len() == 2));
        assert_eq!(
            statuses(&pump.continued()),
            vec![ContinueStatus::Handled, ContinueStatus::NotHandled]
        );
        assert_eq!(session.process().queued_in_band_events(), 0);
    });
}

#[test]
#[serial]
fn test_cant_stop_thread_dispatched_out_of_band() {
    engine_env!(hooks: TestHooks::clearing(), runtime_loaded: true, interop: true,
        runtime, target, pump, hooks, session, {
        target.set_thread_info(9, RemoteThreadInfo {
            cant_stop: 1,
            ..Default::default()
        });
        let av = exception(9, ExceptionCode::ACCESS_VIOLATION, 0x9000);
        pump.push(av.clone());

        assert!(common::wait_until(|| pump.continued_len() == 1));
        assert_eq!(pump.continued(), vec![(av, ContinueStatus::Handled)]);
        assert!(matches!(
            hooks.seen().as_slice(),
            [Seen::Native { out_of_band: true, .. }]
        ));
        assert_eq!(runtime.count_requests(IpcEventType::AsyncBreak), 0);
        assert!(!session.process().is_synchronized());
        assert_eq!(session.process().stop_count(), 0);
    });
}

#[test]
#[serial]
fn test_exception_not_for_runtime_becomes_in_band() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        runtime, _target, pump, hooks, session, {
        pump.set_thread_context(5, context_at(0x9000));
        let av = exception(5, ExceptionCode::ACCESS_VIOLATION, 0x9000);
        pump.push(av.clone());

        // first chance exception is shown to the runtime first
        assert!(common::wait_until(|| pump.context(5).pc == 0x5000));
        assert_eq!(pump.context(5).gpr[0], 1);
        assert!(hooks.seen().is_empty());

        let flare = exception(5, ExceptionCode::BREAKPOINT, 0x5150);
        pump.push(flare.clone());

        assert!(common::wait_until(|| runtime.continues() == vec![1]));
        match hooks.seen().as_slice() {
            [Seen::Native { event, out_of_band: false, .. }] => assert_eq!(*event, av),
            seen => panic!("unexpected dispatch: {seen:?}"),
        }
        assert_eq!(pump.context(5), context_at(0x9000));
        assert_eq!(
            pump.continued(),
            vec![
                (av.clone(), ContinueStatus::Handled),
                (flare, ContinueStatus::Handled)
            ]
        );

        pump.push(av);
        assert!(common::wait_until(|| pump.continued_len() == 3));
        assert_eq!(pump.continued()[2].1, ContinueStatus::NotHandled);
        assert_eq!(session.process().stop_count(), 0);
    });
}

#[test]
#[serial]
fn test_runtime_handled_exception_completes_hijack() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        runtime, _target, pump, hooks, _session, {
        pump.set_thread_context(6, context_at(0x9100));
        let av = exception(6, ExceptionCode::ACCESS_VIOLATION, 0x9100);
        pump.push(av.clone());
        assert!(common::wait_until(|| pump.context(6).pc == 0x5000));

        pump.push(exception(6, ExceptionCode::BREAKPOINT, 0x5110));
        pump.push(exception(6, ExceptionCode::BREAKPOINT, 0x5140));
        assert!(common::wait_until(|| pump.continued_len() == 3));
        assert_eq!(pump.context(6), context_at(0x9100));

        pump.push(av);
        assert!(common::wait_until(|| pump.continued_len() == 4));
        assert_eq!(
            statuses(&pump.continued()),
            vec![
                ContinueStatus::Handled,
                ContinueStatus::Handled,
                ContinueStatus::Handled,
                ContinueStatus::NotHandled,
            ]
        );
        assert!(hooks.seen().is_empty());
        assert_eq!(runtime.count_requests(IpcEventType::AsyncBreak), 0);
    });
}

#[test]
#[serial]
fn test_runtime_owned_events() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        _runtime, target, pump, hooks, _session, {
        target.add_runtime_code(0x3000..0x4000);
        let in_runtime = exception(4, ExceptionCode::BREAKPOINT, 0x3010);
        let sync_flare = exception(4, ExceptionCode::BREAKPOINT, 0x5100);
        pump.push(in_runtime.clone());
        pump.push(sync_flare.clone());

        assert!(common::wait_until(|| pump.continued_len() == 2));
        assert_eq!(
            pump.continued(),
            vec![
                (in_runtime, ContinueStatus::NotHandled),
                (sync_flare, ContinueStatus::Handled)
            ]
        );
        assert!(hooks.seen().is_empty());
    });
}

#[test]
#[serial]
fn test_native_event_before_runtime_load() {
    engine_env!(hooks: TestHooks::clearing(), runtime_loaded: false, interop: true,
        runtime, _target, pump, hooks, session, {
        let av = exception(3, ExceptionCode::ACCESS_VIOLATION, 0x9000);
        pump.push(av.clone());

        assert!(common::wait_until(|| pump.continued_len() == 1));
        assert_eq!(pump.continued(), vec![(av, ContinueStatus::Handled)]);
        assert_eq!(hooks.seen().len(), 1);
        assert!(runtime.requests().is_empty());
        assert_eq!(session.process().queued_in_band_events(), 0);
    });
}

#[test]
#[serial]
fn test_native_process_exit() {
    engine_env!(hooks: TestHooks::default(), runtime_loaded: true, interop: true,
        _runtime, _target, pump, hooks, session, {
        pump.push(NativeEvent {
            process: common::pid(),
            thread: Pid::from_raw(1),
            kind: oopdbg::debugger::NativeEventKind::ExitProcess { code: 7 },
        });
        let process = session.process().clone();
        assert!(common::wait_until(|| process.is_terminated()));
        assert_eq!(hooks.exits(), vec![7]);
        assert!(process
            .read_memory(RemoteAddress::from(0x1000_u64), &mut [0u8; 1])
            .is_err());
    });
}
