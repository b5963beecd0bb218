#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use pretty_assertions::assert_eq;
use std::result::Result;

use iced_x86::code_asm::{self, CodeAssembler};
use tapeflow::backend::compiler::{compile, CompilerError};
use tapeflow::backend::elf::{
    compile_to_elf, LabelMap, PhdrFlags, Segment, SegmentBuilder,
};
use tapeflow::frontend::{self, Config};
use tapeflow::segment;
use tapeflow::test_helpers::{create_and_run_bin, create_and_run_bin_with_input};

fn build(source: &str) -> Vec<u8> {
    let module = frontend::compile(&source.into(), &Config::default()).unwrap();
    compile(&module).unwrap()
}

#[test]
fn hello_world_segments() {
    const HELLO: &[u8] = b"Hello world!\n";

    struct DataSegment;

    impl SegmentBuilder for DataSegment {
        fn code(&self, _labels: &LabelMap) -> Result<Segment, CompilerError> {
            let mut a = CodeAssembler::new(64)?;

            let mut hello = a.create_label();
            a.set_label(&mut hello)?;
            a.db(HELLO)?;

            Ok(segment![a, hello])
        }

        fn flags(&self) -> PhdrFlags {
            PhdrFlags::R | PhdrFlags::W
        }
    }

    struct TextSegment;

    impl SegmentBuilder for TextSegment {
        fn code(&self, labels: &LabelMap) -> Result<Segment, CompilerError> {
            use code_asm as asm;

            let hello = labels.get("hello")?;

            let mut a = CodeAssembler::new(64)?;

            let mut _start = a.create_label();
            a.set_label(&mut _start)?;

            a.mov(asm::rax, 1u64)?;
            a.mov(asm::rdi, 1u64)?;
            a.mov(asm::rsi, hello)?;
            a.mov(asm::rdx, HELLO.len() as u64)?;
            a.syscall()?;

            a.mov(asm::rax, 60u64)?;
            a.mov(asm::rdi, 0u64)?;
            a.syscall()?;

            Ok(segment![a, _start])
        }

        fn flags(&self) -> PhdrFlags {
            PhdrFlags::R | PhdrFlags::X
        }
    }

    let binary = compile_to_elf(&[&DataSegment, &TextSegment]).unwrap();
    let output = create_and_run_bin(&binary[..]);

    assert_eq!(output.stdout, HELLO);
}

#[test]
fn increment_then_print() {
    let output = create_and_run_bin(&build("+."));

    assert_eq!(output.stdout, vec![1]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn decrement_wraps_to_255() {
    let output = create_and_run_bin(&build("-."));

    assert_eq!(output.stdout, vec![255]);
}

#[test]
fn countdown_loop_halts() {
    let output = create_and_run_bin(&build("+[-]."));

    assert_eq!(output.stdout, vec![0]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn hello_world_program() {
    let output = create_and_run_bin(&build(
        "++++++++[>++++[>++>+++>+++>+<<<<-]>+>+>->>+[<]<-]>>.>---.+++++++..+++.>>.<-.<.+++.------.--------.>>+.>++.",
    ));

    assert_eq!(output.stdout, b"Hello World!\n");
}

#[test]
fn echoes_input() {
    let output = create_and_run_bin_with_input(&build(",.>,.>,.>,."), b"tape");

    assert_eq!(output.stdout, b"tape");
}
