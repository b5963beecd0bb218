//! Reference interpreter for [`Module`]s.
//!
//! Runs the block graph directly, so generated programs can be checked
//! without a native toolchain. Memory accesses are bounds checked.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ir::{Inst, Intrinsic, Module, Operand, Terminator, Type, Value};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("access of {len} bytes at address {addr} is out of bounds")]
    OutOfBounds { addr: u64, len: u64 },
    #[error("%v{0} used before it was defined")]
    Undefined(usize),
    #[error("block `{0}` has no terminator")]
    Unterminated(String),
    #[error("cannot allocate {0} bytes")]
    OutOfMemory(u64),
    #[error("stopped after {0} blocks")]
    OutOfFuel(u64),
    #[error("no function named `{0}`")]
    MissingFunction(String),
    #[error("cannot evaluate {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Value returned by the entry function.
    pub status: i32,
    /// How often each block of the entry function was entered, by block index.
    pub visits: Vec<u64>,
}

fn mask(ty: Type, v: u64) -> u64 {
    match ty {
        Type::I1 => v & 1,
        Type::I8 => v & 0xff,
        Type::I32 => v & 0xffff_ffff,
        _ => v,
    }
}

struct Machine<'io> {
    memory: Vec<u8>,
    values: Vec<Option<u64>>,
    input: &'io mut dyn Read,
    output: &'io mut dyn Write,
}

impl Machine<'_> {
    fn value(&self, v: Value) -> Result<u64, EvalError> {
        self.values
            .get(v.index())
            .copied()
            .flatten()
            .ok_or(EvalError::Undefined(v.index()))
    }

    fn operand(&self, op: Operand) -> Result<u64, EvalError> {
        match op {
            Operand::Value(v) => self.value(v),
            Operand::Const(ty, c) => Ok(mask(ty, c as u64)),
        }
    }

    fn define(&mut self, v: Value, x: u64) {
        if self.values.len() <= v.index() {
            self.values.resize(v.index() + 1, None);
        }
        self.values[v.index()] = Some(x);
    }

    fn range(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>, EvalError> {
        let end = addr.checked_add(len).filter(|&e| e <= self.memory.len() as u64);
        match end {
            Some(end) => Ok(addr as usize..end as usize),
            None => Err(EvalError::OutOfBounds { addr, len }),
        }
    }

    fn load(&self, ty: Type, addr: u64) -> Result<u64, EvalError> {
        let range = self.range(addr, ty.size())?;
        let mut bytes = [0u8; 8];
        match bytes.get_mut(..range.len()) {
            Some(dst) => dst.copy_from_slice(&self.memory[range]),
            None => return Err(EvalError::Unsupported(format!("load of {ty}"))),
        }
        Ok(u64::from_le_bytes(bytes))
    }

    fn store(&mut self, ty: Type, addr: u64, x: u64) -> Result<(), EvalError> {
        let range = self.range(addr, ty.size())?;
        let bytes = x.to_le_bytes();
        match bytes.get(..range.len()) {
            Some(src) => self.memory[range].copy_from_slice(src),
            None => return Err(EvalError::Unsupported(format!("store of {ty}"))),
        }
        Ok(())
    }

    fn call(&mut self, callee: Intrinsic, args: &[Operand]) -> Result<u64, EvalError> {
        let args = args
            .iter()
            .map(|a| self.operand(*a))
            .collect::<Result<Vec<_>, _>>()?;

        match (callee, &args[..]) {
            (Intrinsic::GetChar, []) => {
                let mut byte = [0u8];
                match self.input.read(&mut byte)? {
                    0 => Ok(0xff),
                    _ => Ok(byte[0].into()),
                }
            }
            (Intrinsic::PutChar, [c]) => {
                self.output.write_all(&[*c as u8])?;
                Ok(*c & 0xff)
            }
            (Intrinsic::MemSet, [ptr, val, len]) => {
                let range = self.range(*ptr, *len)?;
                self.memory[range].fill(*val as u8);
                Ok(0)
            }
            _ => Err(EvalError::Unsupported(format!(
                "call to {} with {} arguments",
                callee.name(),
                args.len()
            ))),
        }
    }

    fn exec(&mut self, inst: &Inst) -> Result<(), EvalError> {
        match inst {
            Inst::Alloca { dst, ty } => {
                let addr = self.memory.len() as u64;
                let end = usize::try_from(ty.size())
                    .ok()
                    .and_then(|n| self.memory.len().checked_add(n))
                    .ok_or(EvalError::OutOfMemory(ty.size()))?;
                self.memory
                    .try_reserve(end - self.memory.len())
                    .map_err(|_| EvalError::OutOfMemory(ty.size()))?;
                self.memory.resize(end, 0);
                self.define(*dst, addr);
            }
            Inst::Load { dst, ty, ptr } => {
                let x = self.load(*ty, self.value(*ptr)?)?;
                self.define(*dst, x);
            }
            Inst::Store { ty, value, ptr } => {
                let x = self.operand(*value)?;
                self.store(*ty, self.value(*ptr)?, x)?;
            }
            Inst::Add { dst, ty, lhs, rhs } => {
                let x = self.operand(*lhs)?.wrapping_add(self.operand(*rhs)?);
                self.define(*dst, mask(*ty, x));
            }
            Inst::ElementPtr {
                dst, base, index, ..
            } => {
                let x = self.value(*base)?.wrapping_add(self.operand(*index)?);
                self.define(*dst, x);
            }
            Inst::ICmpNe { dst, ty, lhs, rhs } => {
                let ne = mask(*ty, self.operand(*lhs)?) != mask(*ty, self.operand(*rhs)?);
                self.define(*dst, ne as u64);
            }
            Inst::Call { dst, callee, args } => {
                let x = self.call(*callee, args)?;
                if let Some(dst) = dst {
                    self.define(*dst, x);
                }
            }
        }

        Ok(())
    }
}

pub struct Interpreter<'m> {
    module: &'m Module,
    fuel: Option<u64>,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Interpreter { module, fuel: None }
    }

    /// Gives up after entering `blocks` blocks.
    pub fn with_fuel(mut self, blocks: u64) -> Self {
        self.fuel = Some(blocks);
        self
    }

    /// Runs `main` to completion.
    pub fn run(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<Outcome, EvalError> {
        let main = self
            .module
            .find_function("main")
            .ok_or_else(|| EvalError::MissingFunction("main".into()))?;
        let function = self.module.function(main);

        let mut machine = Machine {
            memory: vec![],
            values: vec![None; function.value_count()],
            input,
            output,
        };
        let mut visits = vec![0u64; function.blocks.len()];
        let mut entered = 0u64;
        let mut current = 0usize;

        let status = loop {
            if self.fuel.is_some_and(|fuel| entered >= fuel) {
                return Err(EvalError::OutOfFuel(entered));
            }
            entered += 1;
            visits[current] += 1;

            let block = &function.blocks[current];
            for inst in &block.insts {
                machine.exec(inst)?;
            }

            match &block.terminator {
                Some(Terminator::CondBr {
                    cond,
                    then,
                    otherwise,
                }) => {
                    current = if machine.value(*cond)? != 0 {
                        then.index()
                    } else {
                        otherwise.index()
                    };
                }
                Some(Terminator::Ret { value }) => {
                    break machine.operand(*value)? as u32 as i32;
                }
                None => return Err(EvalError::Unterminated(block.label.clone())),
            }
        };

        machine.output.flush()?;

        Ok(Outcome { status, visits })
    }
}
