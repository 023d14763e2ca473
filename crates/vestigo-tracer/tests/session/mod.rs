use test_log::test;
use vestigo_tracer::Error;
use vestigo_tracer::engine::InstrumentDecision;
use vestigo_tracer::format::PrintOptions;
use vestigo_tracer::tracer::{AttachOptions, AttachStatus, SessionStatus};

use crate::common::{BODY, ENTRY, Fixture, HandlerFailure, INVALID, LIBC_BASE};
use crate::common::{RecordingHandler, THREAD, TRAMPOLINE, addresses};

fn limited(n: usize) -> AttachOptions {
    AttachOptions {
        instruction_limit: Some(n),
        ..Default::default()
    }
}

fn excluding(pattern: &str) -> AttachOptions {
    AttachOptions {
        module_exclusions: vec![pattern.to_owned()],
        ..Default::default()
    }
}

#[test]
fn attach_is_exclusive() {
    let fixture = Fixture::new();
    let (handler, _) = RecordingHandler::new();

    let status = fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();

    assert_eq!(status, AttachStatus::Started);
    assert_eq!(status.code(), 0);
    assert!(fixture.engine.has_hook(ENTRY));
    assert_eq!(fixture.session.status(), SessionStatus::Idle);

    assert!(fixture.enter());

    // the entry hook is one-shot
    assert!(!fixture.engine.has_hook(ENTRY));
    assert!(fixture.engine.is_following(THREAD));

    let active = fixture.session.status();
    assert_eq!(
        active,
        SessionStatus::Active {
            thread_id: THREAD,
            start_address: ENTRY,
            instruction_count: 0,
            instruction_limit: None,
        }
    );

    let (other, other_traced) = RecordingHandler::new();
    let status = fixture
        .session
        .attach(LIBC_BASE, other, AttachOptions::default())
        .unwrap();

    assert_eq!(status, AttachStatus::AlreadyTracing);
    assert_eq!(status.code(), 1);
    assert!(!fixture.engine.has_hook(LIBC_BASE));
    assert_eq!(fixture.session.status(), active);

    fixture.run(&TRAMPOLINE).unwrap();
    fixture.run(&BODY).unwrap();
    assert!(other_traced.lock().unwrap().is_empty());
}

#[test]
fn concurrent_entry_loses_the_race() {
    let fixture = Fixture::new();
    let (first, first_traced) = RecordingHandler::new();
    let (second, second_traced) = RecordingHandler::new();

    let options = AttachOptions::default();
    assert_eq!(
        fixture.session.attach(ENTRY, first, options.clone()).unwrap(),
        AttachStatus::Started
    );
    assert_eq!(
        fixture.session.attach(LIBC_BASE, second, options).unwrap(),
        AttachStatus::Started
    );

    assert!(fixture.enter());
    assert_eq!(fixture.process.subscriber_count(), 1);

    // another thread reaches the second entry
    fixture.process.set_thread(THREAD + 1);
    assert!(fixture.engine.reach(&Fixture::regs(LIBC_BASE)));
    fixture.process.set_thread(THREAD);

    assert!(!fixture.engine.has_hook(LIBC_BASE));
    assert!(!fixture.engine.is_following(THREAD + 1));
    assert_eq!(fixture.process.subscriber_count(), 1);
    assert!(matches!(
        fixture.session.status(),
        SessionStatus::Active {
            thread_id: THREAD,
            start_address: ENTRY,
            ..
        }
    ));

    fixture.run(&TRAMPOLINE).unwrap();
    fixture.run(&BODY).unwrap();

    assert_eq!(addresses(&first_traced), BODY);
    assert!(second_traced.lock().unwrap().is_empty());
}

#[test]
fn engine_failure_is_reported() {
    let fixture = Fixture::new();
    let (handler, _) = RecordingHandler::new();

    fixture.engine.refuse_intercepts();

    let err = fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap_err();

    assert!(matches!(err, Error::Engine(_)));
    assert_eq!(err.to_string(), "engine refused to intercept 0x401000");
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
}

#[test]
fn trampoline_is_not_traced() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.enter();

    assert_eq!(fixture.run(&TRAMPOLINE).unwrap(), 0);
    assert_eq!(fixture.run(&BODY).unwrap(), BODY.len());

    // the entry itself only ran relocated, within the trampoline
    assert_eq!(addresses(&traced), BODY);
    assert_eq!(
        traced
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.mnemonic.as_str())
            .collect::<Vec<_>>(),
        ["mov", "sub", "xor", "mov", "pop", "ret"]
    );
}

#[test]
fn instruction_limit() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, limited(3)).unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let decisions = fixture.engine.compile(THREAD, &BODY).unwrap();

    assert_eq!(
        decisions
            .iter()
            .map(InstrumentDecision::is_callout)
            .collect::<Vec<_>>(),
        [true, true, true, false, false, false]
    );

    // the trace ended as soon as the limit was reached
    assert_eq!(fixture.engine.unfollowed(), [THREAD]);
    assert_eq!(fixture.session.status(), SessionStatus::Idle);

    // but the instructions already instrumented are still reported
    for (&addr, decision) in BODY.iter().zip(decisions) {
        if let InstrumentDecision::Callout(callout) = decision {
            callout.invoke(&Fixture::regs(addr)).unwrap();
        }
    }

    assert_eq!(addresses(&traced), BODY[..3]);
    assert_eq!(fixture.run(&BODY).unwrap(), 0);
    assert!(fixture.console.lines().is_empty());
}

#[test]
fn zero_limit_traces_nothing() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, limited(0)).unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    assert_eq!(fixture.run(&BODY).unwrap(), 0);
    assert!(traced.lock().unwrap().is_empty());
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
}

#[test]
fn excluded_entry_module_is_never_traced() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, excluding("app")).unwrap();
    fixture.enter();

    assert_eq!(fixture.run(&TRAMPOLINE).unwrap(), 0);
    assert_eq!(fixture.run(&BODY).unwrap(), 0);
    assert!(traced.lock().unwrap().is_empty());

    // exclusion does not end the trace
    assert!(matches!(
        fixture.session.status(),
        SessionStatus::Active {
            instruction_count: 0,
            ..
        }
    ));
}

#[test]
fn exclusion_skips_rest_of_block() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, excluding("libc")).unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let block = [BODY[0], BODY[1], LIBC_BASE, LIBC_BASE + 1, BODY[2]];
    assert_eq!(fixture.run(&block).unwrap(), 2);
    assert_eq!(addresses(&traced), BODY[..2]);

    // the next block is instrumented again
    assert_eq!(fixture.run(&BODY[2..4]).unwrap(), 2);
    assert_eq!(addresses(&traced), BODY[..4]);
}

#[test]
fn modules_loaded_while_tracing_are_filtered() {
    const LIBFOO_BASE: u64 = 0x7100_0000;

    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, excluding("libfoo")).unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    assert_eq!(fixture.process.subscriber_count(), 1);

    fixture
        .process
        .load_module("/usr/lib/libfoo.so", LIBFOO_BASE, vec![0xc3; 0x100]);

    assert_eq!(fixture.run(&[LIBFOO_BASE]).unwrap(), 0);
    assert_eq!(fixture.run(&BODY[..1]).unwrap(), 1);
    assert_eq!(addresses(&traced), BODY[..1]);

    fixture.session.detach();
    assert_eq!(fixture.process.subscriber_count(), 0);
}

#[test]
fn modules_loaded_from_another_thread() {
    const LIBFOO_BASE: u64 = 0x7100_0000;
    const LIBFOO_COUNT: u64 = 16;

    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture.session.attach(ENTRY, handler, excluding("libfoo")).unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    std::thread::scope(|s| {
        let process = &fixture.process;

        s.spawn(move || {
            for i in 0..LIBFOO_COUNT {
                let path = format!("/usr/lib/libfoo{i}.so");
                process.load_module(&path, LIBFOO_BASE + i * 0x1000, vec![0xc3; 0x100]);
            }
        });

        for _ in 0..50 {
            assert_eq!(fixture.run(&BODY).unwrap(), BODY.len());
        }
    });

    for i in 0..LIBFOO_COUNT {
        assert_eq!(fixture.run(&[LIBFOO_BASE + i * 0x1000]).unwrap(), 0);
    }

    assert_eq!(fixture.run(&BODY).unwrap(), BODY.len());
    assert_eq!(traced.lock().unwrap().len(), 51 * BODY.len());
    assert_eq!(
        fixture.session.status(),
        SessionStatus::Active {
            thread_id: THREAD,
            start_address: ENTRY,
            instruction_count: 51 * BODY.len(),
            instruction_limit: None,
        }
    );
}

#[test]
fn loops_are_reported_once_per_iteration() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let block = [BODY[1], BODY[2]];
    for _ in 0..3 {
        assert_eq!(fixture.run(&block).unwrap(), 2);
    }

    assert_eq!(
        addresses(&traced),
        [BODY[1], BODY[2], BODY[1], BODY[2], BODY[1], BODY[2]]
    );
    assert!(matches!(
        fixture.session.status(),
        SessionStatus::Active {
            instruction_count: 6,
            ..
        }
    ));
}

#[test]
fn unexpected_callout_aborts_the_trace() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let callout = match fixture.engine.compile(THREAD, &BODY[..1]).unwrap().pop() {
        Some(InstrumentDecision::Callout(callout)) => callout,
        other => panic!("unexpected decision: {other:?}"),
    };

    // callout fired for an address which was never instrumented
    callout.invoke(&Fixture::regs(BODY[3])).unwrap();

    assert!(traced.lock().unwrap().is_empty());
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
    assert_eq!(fixture.engine.unfollowed(), [THREAD]);

    let lines = fixture.console.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("unexpected callout at 0x40100a"));

    // callouts of the aborted trace are ignored
    callout.invoke(&Fixture::regs(BODY[0])).unwrap();
    assert!(traced.lock().unwrap().is_empty());
    assert_eq!(fixture.console.lines().len(), 1);
}

#[test]
fn callout_is_consumed_once() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let callout = match fixture.engine.compile(THREAD, &BODY[..1]).unwrap().pop() {
        Some(InstrumentDecision::Callout(callout)) => callout,
        other => panic!("unexpected decision: {other:?}"),
    };

    callout.invoke(&Fixture::regs(BODY[0])).unwrap();
    assert_eq!(addresses(&traced), BODY[..1]);
    assert!(fixture.console.lines().is_empty());

    // a second firing without recompiling the block is a violation
    callout.invoke(&Fixture::regs(BODY[0])).unwrap();
    assert_eq!(addresses(&traced), BODY[..1]);
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
    assert_eq!(fixture.console.lines().len(), 1);
}

#[test]
fn handler_can_detach() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler.detaching_after(2), AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    // the block was fully instrumented before the handler detached
    assert_eq!(fixture.run(&BODY).unwrap(), BODY.len());

    assert_eq!(addresses(&traced), BODY[..2]);
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
    assert_eq!(fixture.engine.unfollowed(), [THREAD]);
    assert!(fixture.console.lines().is_empty());

    // detaching again is a no-op
    fixture.session.detach();
    assert_eq!(fixture.engine.unfollowed(), [THREAD]);
    assert_eq!(fixture.run(&BODY).unwrap(), 0);
}

#[test]
fn detach_when_idle_is_a_noop() {
    let fixture = Fixture::new();

    fixture.session.detach();

    assert_eq!(fixture.session.status(), SessionStatus::Idle);
    assert!(fixture.engine.unfollowed().is_empty());
}

#[test]
fn detach_before_entry_is_reached() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.session.detach();

    // the armed entry still starts a trace
    assert!(fixture.enter());
    fixture.run(&TRAMPOLINE).unwrap();
    fixture.run(&BODY[..1]).unwrap();

    assert_eq!(addresses(&traced), BODY[..1]);
}

#[test]
fn handler_errors_reach_the_engine() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler.failing_at(BODY[1]), AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let err = fixture.run(&BODY).unwrap_err();

    assert_eq!(err.to_string(), "handler failed at 0x401004");
    assert!(err.0.downcast_ref::<HandlerFailure>().is_some());
    assert_eq!(addresses(&traced), BODY[..2]);

    // the trace goes on
    assert!(matches!(
        fixture.session.status(),
        SessionStatus::Active { .. }
    ));

    fixture.session.detach();
    assert_eq!(fixture.session.status(), SessionStatus::Idle);
    assert_eq!(fixture.engine.unfollowed(), [THREAD]);
}

#[test]
fn undecodable_instruction_is_skipped() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    fixture
        .session
        .attach(ENTRY, handler, AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    assert_eq!(fixture.run(&[BODY[0], INVALID]).unwrap(), 2);
    assert_eq!(addresses(&traced), BODY[..1]);
    assert!(matches!(
        fixture.session.status(),
        SessionStatus::Active { .. }
    ));
}

#[test]
fn printed_lines_are_deterministic() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    let options = PrintOptions::default().details(true).annotation("t");

    fixture
        .session
        .attach(ENTRY, handler.printing(options), AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();
    fixture.run(&BODY).unwrap();

    let lines = fixture.console.lines();
    assert_eq!(lines.len(), BODY.len());

    let expected = format!(
        "{:<28}{:<7}{:<30}@t\n    rbp = 0x7ffe0200 >> 0x0\n    rsp = 0x7ffe0100 >> 0x0",
        "0x401001 4889e5", "mov", "rbp, rsp"
    );
    assert_eq!(lines[0], expected);

    // eax is not part of a 64-bit snapshot
    assert_eq!(
        lines[2],
        format!("{:<28}{:<7}{:<30}@t", "0x401008 31c0", "xor", "eax, eax")
    );

    // rendering twice yields the same text
    let rendered = traced
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.text.clone())
        .collect::<Vec<_>>();
    assert_eq!(rendered, lines);
}
