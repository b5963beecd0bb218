//! Textual LLVM IR for a [`Module`], ready for `clang` or `llc`.

use std::fmt::{self, Display, Formatter};

use itertools::Itertools;

use crate::ir::{Function, Inst, Intrinsic, Module, Operand, Terminator, Type};

struct Op(Operand);

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            Operand::Value(v) => write!(f, "%v{}", v.index()),
            Operand::Const(_, c) => write!(f, "{c}"),
        }
    }
}

fn ret_type(ty: Option<Type>) -> String {
    ty.map_or_else(|| "void".to_owned(), |t| t.to_string())
}

fn write_declaration(f: &mut Formatter<'_>, callee: Intrinsic) -> fmt::Result {
    let params = callee
        .params()
        .iter()
        .map(|(name, ty)| format!("{ty} %{name}"))
        .join(", ");

    writeln!(f, "declare {} @{}({params})", ret_type(callee.ret()), callee.name())
}

fn write_inst(f: &mut Formatter<'_>, inst: &Inst) -> fmt::Result {
    match inst {
        Inst::Alloca { dst, ty } => writeln!(f, "  %v{} = alloca {ty}", dst.index()),
        Inst::Load { dst, ty, ptr } => {
            writeln!(f, "  %v{} = load {ty}, ptr %v{}", dst.index(), ptr.index())
        }
        Inst::Store { ty, value, ptr } => {
            writeln!(f, "  store {ty} {}, ptr %v{}", Op(*value), ptr.index())
        }
        Inst::Add { dst, ty, lhs, rhs } => writeln!(
            f,
            "  %v{} = add {ty} {}, {}",
            dst.index(),
            Op(*lhs),
            Op(*rhs)
        ),
        Inst::ElementPtr {
            dst,
            array,
            base,
            index,
        } => writeln!(
            f,
            "  %v{} = getelementptr {array}, ptr %v{}, i64 0, i64 {}",
            dst.index(),
            base.index(),
            Op(*index)
        ),
        Inst::ICmpNe { dst, ty, lhs, rhs } => writeln!(
            f,
            "  %v{} = icmp ne {ty} {}, {}",
            dst.index(),
            Op(*lhs),
            Op(*rhs)
        ),
        Inst::Call { dst, callee, args } => {
            let args = callee
                .params()
                .iter()
                .zip(args)
                .map(|((_, ty), arg)| format!("{ty} {}", Op(*arg)))
                .join(", ");
            let call = format!("call {} @{}({args})", ret_type(callee.ret()), callee.name());

            match dst {
                Some(dst) => writeln!(f, "  %v{} = {call}", dst.index()),
                None => writeln!(f, "  {call}"),
            }
        }
    }
}

fn write_function(f: &mut Formatter<'_>, function: &Function) -> fmt::Result {
    writeln!(f, "define {} @{}() {{", function.ret, function.name)?;

    for (i, block) in function.blocks.iter().enumerate() {
        if i > 0 {
            writeln!(f)?;
        }
        writeln!(f, "{}:", block.label)?;

        for inst in &block.insts {
            write_inst(f, inst)?;
        }

        match &block.terminator {
            Some(Terminator::CondBr {
                cond,
                then,
                otherwise,
            }) => writeln!(
                f,
                "  br i1 %v{}, label %{}, label %{}",
                cond.index(),
                function.blocks[then.index()].label,
                function.blocks[otherwise.index()].label
            )?,
            Some(Terminator::Ret { value }) => {
                writeln!(f, "  ret {} {}", function.ret, Op(*value))?
            }
            None => {}
        }
    }

    writeln!(f, "}}")
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for callee in &self.declarations {
            write_declaration(f, *callee)?;
        }

        for function in &self.functions {
            writeln!(f)?;
            write_function(f, function)?;
        }

        Ok(())
    }
}
