//! x86-64 code generation for a [`Module`].
//!
//! Every SSA value lives in an 8 byte slot of a static frame placed in the
//! data segment, next to the storage for `alloca`s. RBX holds the frame base
//! for the whole program; RAX, RCX, RDX, RSI and RDI are scratch.

use std::collections::HashMap;

use iced_x86::{
    code_asm::{self, AsmRegister64, CodeAssembler, CodeLabel},
    IcedError,
};
use thiserror::Error;

use crate::{
    ir::{Function, Inst, Intrinsic, Module, Operand, Terminator, Type, Value},
    segment,
};

use super::elf::{compile_to_elf, LabelMap, PhdrFlags, Segment, SegmentBuilder};

use code_asm as asm;

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("could not generate asm: {0}")]
    Assemble(#[from] IcedError),
    #[error("missing patch")]
    MissingPatch,
    #[error("missing _start label")]
    MissingEntryPoint,
    #[error("missing label: {0}")]
    MissingLabel(&'static str),
    #[error("module has no `main` function")]
    MissingMain,
    #[error("frame of {0} bytes does not fit in a 32-bit displacement")]
    FrameTooLarge(u64),
    #[error("cannot lower {0}")]
    Unsupported(String),
    #[error("ELF output requires a little-endian host")]
    BigEndianHost,
}

// one byte of I/O buffer, padded to keep slots aligned
const SCRATCH: u32 = 0;
const SCRATCH_SIZE: u64 = 8;

const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;
const SYS_EXIT: u64 = 60;

struct Frame {
    allocas: HashMap<Value, u32>,
    values: u32,
    size: u32,
}

impl Frame {
    fn layout(function: &Function) -> Result<Self, CompilerError> {
        let mut offset = SCRATCH_SIZE;
        let mut allocas = HashMap::new();

        for inst in function.blocks.iter().flat_map(|b| &b.insts) {
            if let Inst::Alloca { dst, ty } = inst {
                allocas.insert(*dst, offset);
                offset = ty
                    .size()
                    .checked_next_multiple_of(8)
                    .and_then(|n| offset.checked_add(n))
                    .ok_or(CompilerError::FrameTooLarge(ty.size()))?;
            }
        }

        let values = offset;
        let size = (function.value_count() as u64)
            .checked_mul(8)
            .and_then(|n| values.checked_add(n))
            .ok_or(CompilerError::FrameTooLarge(values))?;
        if size > i32::MAX as u64 {
            return Err(CompilerError::FrameTooLarge(size));
        }

        Ok(Frame {
            allocas: allocas
                .into_iter()
                .map(|(v, off)| (v, off as u32))
                .collect(),
            values: values as u32,
            size: size as u32,
        })
    }

    fn slot(&self, value: Value) -> u32 {
        self.values + 8 * value.0
    }
}

fn emit_operand(
    a: &mut CodeAssembler,
    frame: &Frame,
    reg: AsmRegister64,
    operand: Operand,
) -> Result<(), IcedError> {
    match operand {
        Operand::Const(_, v) => a.mov(reg, v as u64),
        Operand::Value(v) => a.mov(reg, asm::qword_ptr(asm::rbx + frame.slot(v))),
    }
}

fn emit_truncate(a: &mut CodeAssembler, ty: Type) -> Result<(), IcedError> {
    match ty.size() {
        1 => a.movzx(asm::eax, asm::al),
        4 => a.mov(asm::eax, asm::eax),
        _ => Ok(()),
    }
}

fn emit_define(
    a: &mut CodeAssembler,
    frame: &Frame,
    dst: Value,
) -> Result<(), IcedError> {
    a.mov(asm::qword_ptr(asm::rbx + frame.slot(dst)), asm::rax)
}

fn emit_load(
    a: &mut CodeAssembler,
    frame: &Frame,
    dst: Value,
    ty: Type,
    ptr: Value,
) -> Result<(), CompilerError> {
    a.mov(asm::rcx, asm::qword_ptr(asm::rbx + frame.slot(ptr)))?;
    match ty.size() {
        1 => a.movzx(asm::eax, asm::byte_ptr(asm::rcx))?,
        4 => a.mov(asm::eax, asm::dword_ptr(asm::rcx))?,
        8 => a.mov(asm::rax, asm::qword_ptr(asm::rcx))?,
        _ => return Err(CompilerError::Unsupported(format!("load of {ty}"))),
    }
    emit_define(a, frame, dst)?;

    Ok(())
}

fn emit_store(
    a: &mut CodeAssembler,
    frame: &Frame,
    ty: Type,
    value: Operand,
    ptr: Value,
) -> Result<(), CompilerError> {
    emit_operand(a, frame, asm::rax, value)?;
    a.mov(asm::rcx, asm::qword_ptr(asm::rbx + frame.slot(ptr)))?;
    match ty.size() {
        1 => a.mov(asm::byte_ptr(asm::rcx), asm::al)?,
        4 => a.mov(asm::dword_ptr(asm::rcx), asm::eax)?,
        8 => a.mov(asm::qword_ptr(asm::rcx), asm::rax)?,
        _ => return Err(CompilerError::Unsupported(format!("store of {ty}"))),
    }

    Ok(())
}

// RAX = lhs, RDX = rhs, both cut down to the width of `ty`
fn emit_binary_operands(
    a: &mut CodeAssembler,
    frame: &Frame,
    ty: Type,
    lhs: Operand,
    rhs: Operand,
) -> Result<(), IcedError> {
    emit_operand(a, frame, asm::rax, rhs)?;
    emit_truncate(a, ty)?;
    a.mov(asm::rdx, asm::rax)?;
    emit_operand(a, frame, asm::rax, lhs)?;
    emit_truncate(a, ty)
}

fn emit_syscall_byte(
    a: &mut CodeAssembler,
    number: u64,
    fd: u64,
) -> Result<(), IcedError> {
    a.mov(asm::rax, number)?;
    a.mov(asm::rdi, fd)?;
    a.lea(asm::rsi, asm::rbx + SCRATCH)?;
    a.mov(asm::rdx, 1u64)?;
    a.syscall()
}

fn emit_call(
    a: &mut CodeAssembler,
    frame: &Frame,
    dst: Option<Value>,
    callee: Intrinsic,
    args: &[Operand],
) -> Result<(), CompilerError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(CompilerError::Unsupported(format!(
                "call to {} with {} arguments",
                callee.name(),
                args.len()
            )))
        }
    };

    match callee {
        Intrinsic::PutChar => {
            arity(1)?;
            emit_operand(a, frame, asm::rax, args[0])?;
            a.mov(asm::byte_ptr(asm::rbx + SCRATCH), asm::al)?;
            emit_syscall_byte(a, SYS_WRITE, 1)?;
        }
        Intrinsic::GetChar => {
            arity(0)?;
            // left in place when read hits end of input
            a.mov(asm::byte_ptr(asm::rbx + SCRATCH), 0xFFu32)?;
            emit_syscall_byte(a, SYS_READ, 0)?;
        }
        Intrinsic::MemSet => {
            arity(3)?;
            emit_operand(a, frame, asm::rax, args[2])?;
            a.mov(asm::rcx, asm::rax)?;
            emit_operand(a, frame, asm::rax, args[0])?;
            a.mov(asm::rdi, asm::rax)?;
            emit_operand(a, frame, asm::rax, args[1])?;
            a.rep().stosb()?;
        }
    }

    if let Some(dst) = dst {
        a.movzx(asm::eax, asm::byte_ptr(asm::rbx + SCRATCH))?;
        emit_define(a, frame, dst)?;
    }

    Ok(())
}

fn emit_inst(
    a: &mut CodeAssembler,
    frame: &Frame,
    inst: &Inst,
) -> Result<(), CompilerError> {
    match inst {
        Inst::Alloca { dst, .. } => {
            let offset = frame.allocas[dst];
            a.lea(asm::rax, asm::rbx + offset)?;
            emit_define(a, frame, *dst)?;
        }
        Inst::Load { dst, ty, ptr } => emit_load(a, frame, *dst, *ty, *ptr)?,
        Inst::Store { ty, value, ptr } => emit_store(a, frame, *ty, *value, *ptr)?,
        Inst::Add { dst, ty, lhs, rhs } => {
            emit_binary_operands(a, frame, *ty, *lhs, *rhs)?;
            a.add(asm::rax, asm::rdx)?;
            emit_truncate(a, *ty)?;
            emit_define(a, frame, *dst)?;
        }
        Inst::ElementPtr {
            dst, base, index, ..
        } => {
            emit_binary_operands(a, frame, Type::Ptr, Operand::Value(*base), *index)?;
            a.add(asm::rax, asm::rdx)?;
            emit_define(a, frame, *dst)?;
        }
        Inst::ICmpNe { dst, ty, lhs, rhs } => {
            emit_binary_operands(a, frame, *ty, *lhs, *rhs)?;
            a.cmp(asm::rax, asm::rdx)?;
            a.setne(asm::al)?;
            a.movzx(asm::eax, asm::al)?;
            emit_define(a, frame, *dst)?;
        }
        Inst::Call { dst, callee, args } => emit_call(a, frame, *dst, *callee, args)?,
    }

    Ok(())
}

fn emit_terminator(
    a: &mut CodeAssembler,
    frame: &Frame,
    labels: &[CodeLabel],
    terminator: &Terminator,
) -> Result<(), IcedError> {
    match terminator {
        Terminator::CondBr {
            cond,
            then,
            otherwise,
        } => {
            emit_operand(a, frame, asm::rax, Operand::Value(*cond))?;
            a.test(asm::rax, asm::rax)?;
            a.jne(labels[then.index()])?;
            a.jmp(labels[otherwise.index()])?;
        }
        Terminator::Ret { value } => {
            emit_operand(a, frame, asm::rax, *value)?;
            a.mov(asm::rdi, asm::rax)?;
            a.mov(asm::rax, SYS_EXIT)?;
            a.syscall()?;
        }
    }

    Ok(())
}

struct DataSegment<'m> {
    frame: &'m Frame,
}

impl SegmentBuilder for DataSegment<'_> {
    fn code(&self, _labels: &LabelMap) -> Result<Segment, CompilerError> {
        let mut a = CodeAssembler::new(64)?;

        let mut frame = a.create_label();
        a.set_label(&mut frame)?;
        a.db(&vec![0u8; self.frame.size as usize])?;

        Ok(segment!(a, frame))
    }

    fn flags(&self) -> PhdrFlags {
        PhdrFlags::R | PhdrFlags::W
    }
}

struct TextSegment<'m> {
    function: &'m Function,
    frame: &'m Frame,
}

impl SegmentBuilder for TextSegment<'_> {
    fn code(&self, labels: &LabelMap) -> Result<Segment, CompilerError> {
        let mut a = CodeAssembler::new(64)?;

        let mut _start = a.create_label();
        a.set_label(&mut _start)?;

        // setup
        a.mov(asm::rbx, labels.get("frame")?)?;

        let mut block_labels: Vec<CodeLabel> = self
            .function
            .blocks
            .iter()
            .map(|_| a.create_label())
            .collect();

        for (i, block) in self.function.blocks.iter().enumerate() {
            a.set_label(&mut block_labels[i])?;

            for inst in &block.insts {
                emit_inst(&mut a, self.frame, inst)?;
            }

            let terminator = block.terminator.as_ref().ok_or_else(|| {
                CompilerError::Unsupported(format!("open block `{}`", block.label))
            })?;
            emit_terminator(&mut a, self.frame, &block_labels, terminator)?;
        }

        Ok(segment!(a, _start))
    }

    fn flags(&self) -> PhdrFlags {
        PhdrFlags::X | PhdrFlags::R
    }
}

/// Lowers the `main` function of `module` to a static x86-64 Linux executable.
/// Returning from `main` exits the process with the returned status.
pub fn compile(module: &Module) -> Result<Vec<u8>, CompilerError> {
    let main = module.find_function("main").ok_or(CompilerError::MissingMain)?;
    let function = module.function(main);
    let frame = Frame::layout(function)?;

    let ds = DataSegment { frame: &frame };
    let ts = TextSegment {
        function,
        frame: &frame,
    };

    compile_to_elf(&[&ds, &ts])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{compile as translate, Config};
    use crate::ir::IrBuilder;

    #[test]
    fn frame_holds_allocas_then_values() {
        let module = translate(&"+".into(), &Config { tape_size: 10 }).unwrap();
        let frame = Frame::layout(&module.functions[0]).unwrap();

        // tape rounded up to 16, data pointer 8
        assert_eq!(frame.allocas[&Value(0)], 8);
        assert_eq!(frame.allocas[&Value(1)], 24);
        assert_eq!(frame.values, 32);
        assert_eq!(frame.size, 32 + 8 * module.functions[0].value_count() as u32);
    }

    #[test]
    fn emits_an_elf_image() {
        let module = translate(&"+[-].".into(), &Config::default()).unwrap();
        let binary = compile(&module).unwrap();

        assert_eq!(&binary[..4], b"\x7FELF");
        assert_eq!(binary.len() % 0x1000, 0);
    }

    #[test]
    fn oversized_alloca_is_rejected() {
        let mut module = Module::new();
        let main = module.create_function("main", Type::I32);
        let entry = module.create_block(main, "entry");
        module.alloca(entry, Type::Bytes(u64::MAX)).unwrap();
        module.ret(entry, Operand::int(Type::I32, 0)).unwrap();

        assert!(matches!(
            compile(&module),
            Err(CompilerError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn module_without_main_is_rejected() {
        assert!(matches!(
            compile(&Module::new()),
            Err(CompilerError::MissingMain)
        ));
    }
}
