use test_log::test;
use vestigo_capstone::{Arch, CapstoneDecoder};
use vestigo_tracer::engine::{Decoder, Process, Register};
use vestigo_tracer::filter::ModuleFilter;
use vestigo_tracer::format::{Formatter, PrintOptions, Telescoped, Telescoper};
use vestigo_tracer::tracer::AttachOptions;

use crate::common::{BODY, CALL_ENTRY, CALL_RAX, ENTRY, Fixture, INVALID, STRING_OK};
use crate::common::{RecordingHandler, THREAD, TRAMPOLINE};

#[test]
fn resolve_pointers() {
    let fixture = Fixture::new();
    let decoder = CapstoneDecoder::new(Arch::X86_64);
    let telescoper = Telescoper::new(&*fixture.process, &decoder);

    assert_eq!(
        telescoper.resolve(STRING_OK, false),
        Some(Telescoped::StringLiteral("ok".to_owned()))
    );

    assert_eq!(
        telescoper.resolve(BODY[5], true),
        Some(Telescoped::Disassembled {
            mnemonic: "ret".to_owned(),
            operands: String::new(),
            location: Some("app#0xe".to_owned()),
        })
    );

    assert_eq!(
        telescoper.resolve(BODY[0], true),
        Some(Telescoped::Disassembled {
            mnemonic: "mov".to_owned(),
            operands: "rbp, rsp".to_owned(),
            location: Some("app#0x1".to_owned()),
        })
    );

    assert_eq!(telescoper.resolve(INVALID, true), None);
    assert_eq!(telescoper.resolve(0xdead_0000, false), None);
    assert_eq!(telescoper.resolve(0xdead_0000, true), None);
}

#[test]
fn details_telescope_registers() {
    let fixture = Fixture::new();
    let decoder = CapstoneDecoder::new(Arch::X86_64);
    let modules = ModuleFilter::new(Vec::<String>::new(), fixture.process.modules());
    let formatter = Formatter::new(&*fixture.process, &decoder, &modules);

    let insn = decoder.decode(BODY[3], &[0x48, 0x89, 0xc7]).unwrap();
    let details = formatter.format_details(&insn, &Fixture::regs(BODY[3]), false);

    assert_eq!(details, "    rdi = 0x600000 >> \"ok\"\n    rax = 0x0");
}

#[test]
fn indirect_call_target_is_disassembled() {
    let fixture = Fixture::new();
    let (handler, traced) = RecordingHandler::new();

    let options = PrintOptions::default().details(true);

    fixture
        .session
        .attach(ENTRY, handler.printing(options), AttachOptions::default())
        .unwrap();
    fixture.enter();
    fixture.run(&TRAMPOLINE).unwrap();

    let invoked = fixture
        .engine
        .run(THREAD, &[CALL_RAX], |pc| {
            Fixture::regs(pc).with(Register::Rax, BODY[5])
        })
        .unwrap();
    assert_eq!(invoked, 1);

    let traced = traced.lock().unwrap();
    assert_eq!(traced.len(), 1);
    assert_eq!(traced[0].mnemonic, "call");
    assert!(traced[0].text.ends_with("\n    rax = 0x40100e >> ret (app#0xe)"));
}

#[test]
fn direct_call_target_is_located() {
    let fixture = Fixture::new();
    let decoder = CapstoneDecoder::new(Arch::X86_64);
    let modules = ModuleFilter::new(Vec::<String>::new(), fixture.process.modules());
    let formatter = Formatter::new(&*fixture.process, &decoder, &modules);

    let insn = decoder
        .decode(CALL_ENTRY, &[0xe8, 0xe8, 0xff, 0xff, 0xff])
        .unwrap();

    let line = formatter.format_line(&insn, false, "", false);
    assert_eq!(
        line,
        format!("{:<28}{:<7}{}", "0x401013 e8e8ffffff", "call", "0x401000 (app#0x0)")
    );

    // the register block supersedes the location
    let line = formatter.format_line(&insn, true, "", false);
    assert!(line.ends_with("0x401000"));
}
