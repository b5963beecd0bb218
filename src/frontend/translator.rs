use thiserror::Error;

use crate::ir::{
    BlockId, BuildError, FuncId, Intrinsic, IrBuilder, Module, Operand, Type,
};

use super::{
    parser::{Command, Program},
    tape::{Tape, DEFAULT_TAPE_SIZE, MAX_TAPE_SIZE},
};

#[derive(Error, Debug, PartialEq)]
pub enum TranslateError {
    #[error("unmatched `]` at byte {position}")]
    UnmatchedClose { position: usize },
    #[error("unmatched `[` at byte {position}")]
    UnmatchedOpen { position: usize },
    #[error("tape size {0} is outside 1..={max}", max = MAX_TAPE_SIZE)]
    TapeSize(u64),
    #[error("could not build IR: {0}")]
    Build(#[from] BuildError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of cells on the tape.
    pub tape_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tape_size: DEFAULT_TAPE_SIZE,
        }
    }
}

/// One `[` still waiting for its `]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopFrame {
    pub body: BlockId,
    pub end: BlockId,
    opened_at: usize,
}

/// Single-pass translation of a command stream into basic blocks.
pub struct Translator<'b, B: IrBuilder> {
    builder: &'b mut B,
    func: FuncId,
    tape: Tape,
    loops: Vec<LoopFrame>,
    opened: usize,
}

impl<'b, B: IrBuilder> Translator<'b, B> {
    pub fn new(builder: &'b mut B, func: FuncId, tape: Tape) -> Self {
        Translator {
            builder,
            func,
            tape,
            loops: vec![],
            opened: 0,
        }
    }

    /// Loops opened and not yet closed, innermost last.
    pub fn open_loops(&self) -> &[LoopFrame] {
        &self.loops
    }

    /// Appends one command at `cursor` and returns the block to continue in.
    pub fn step(
        &mut self,
        cursor: BlockId,
        position: usize,
        command: Command,
    ) -> Result<BlockId, TranslateError> {
        use Command as C;

        let b = &mut *self.builder;
        match command {
            C::Inc => self.tape.grow_cell(b, cursor, 1)?,
            C::Dec => self.tape.grow_cell(b, cursor, -1)?,
            C::Right => self.tape.move_pointer(b, cursor, 1)?,
            C::Left => self.tape.move_pointer(b, cursor, -1)?,
            C::Output => self.tape.read_cell(b, cursor)?,
            C::Input => self.tape.write_cell(b, cursor)?,
            C::Open => return self.open_loop(cursor, position),
            C::Close => return self.close_loop(cursor, position),
        }

        Ok(cursor)
    }

    fn open_loop(&mut self, cursor: BlockId, position: usize) -> Result<BlockId, TranslateError> {
        let guard = self.tape.cell_is_nonzero(&mut *self.builder, cursor)?;

        let n = self.opened;
        self.opened += 1;
        let body = self.builder.create_block(self.func, &format!("body.{n}"));
        let end = self.builder.create_block(self.func, &format!("end.{n}"));

        self.builder.cond_br(cursor, guard, body, end)?;
        self.loops.push(LoopFrame {
            body,
            end,
            opened_at: position,
        });

        Ok(body)
    }

    fn close_loop(&mut self, cursor: BlockId, position: usize) -> Result<BlockId, TranslateError> {
        let frame = self
            .loops
            .pop()
            .ok_or(TranslateError::UnmatchedClose { position })?;

        let guard = self.tape.cell_is_nonzero(&mut *self.builder, cursor)?;
        self.builder.cond_br(cursor, guard, frame.body, frame.end)?;

        Ok(frame.end)
    }

    /// Runs the whole program starting at `cursor`; returns the final cursor,
    /// which is left without a terminator.
    pub fn translate(
        &mut self,
        mut cursor: BlockId,
        program: &Program,
    ) -> Result<BlockId, TranslateError> {
        for (position, command) in program.commands() {
            cursor = self.step(cursor, position, command)?;
        }

        match self.loops.last() {
            Some(frame) => Err(TranslateError::UnmatchedOpen {
                position: frame.opened_at,
            }),
            None => Ok(cursor),
        }
    }
}

/// Compiles `program` into a verified module exporting `i32 @main()`.
pub fn compile(program: &Program, config: &Config) -> Result<Module, TranslateError> {
    if !(1..=MAX_TAPE_SIZE).contains(&config.tape_size) {
        return Err(TranslateError::TapeSize(config.tape_size));
    }

    let mut module = Module::new();

    for intrinsic in [Intrinsic::GetChar, Intrinsic::PutChar, Intrinsic::MemSet] {
        module.declare(intrinsic);
    }

    let main = module.create_function("main", Type::I32);
    let entry = module.create_block(main, "entry");
    let tape = Tape::allocate(&mut module, entry, config.tape_size)?;

    let last = Translator::new(&mut module, main, tape).translate(entry, program)?;
    module.ret(last, Operand::int(Type::I32, 0))?;
    module.verify()?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Terminator;
    use pretty_assertions::assert_eq;

    fn labels(m: &Module) -> Vec<&str> {
        m.functions[0].blocks.iter().map(|b| b.label.as_str()).collect()
    }

    #[test]
    fn straight_line_stays_in_entry() {
        let m = compile(&"+-><.,".into(), &Config::default()).unwrap();

        assert_eq!(labels(&m), vec!["entry"]);
    }

    #[test]
    fn nested_loops_get_distinct_blocks() {
        let m = compile(&"[[]]".into(), &Config::default()).unwrap();
        let blocks = &m.functions[0].blocks;

        assert_eq!(labels(&m), vec!["entry", "body.0", "end.0", "body.1", "end.1"]);

        let target = |i: usize| match blocks[i].terminator {
            Some(Terminator::CondBr { then, otherwise, .. }) => (then.index(), otherwise.index()),
            ref t => panic!("unexpected terminator {t:?}"),
        };

        // entry opens the outer loop, the outer body opens the inner one
        assert_eq!(target(0), (1, 2));
        assert_eq!(target(1), (3, 4));
        // the inner close loops back into the inner body, then continues in end.1
        assert_eq!(target(3), (3, 4));
        assert_eq!(target(4), (1, 2));
        assert!(matches!(blocks[2].terminator, Some(Terminator::Ret { .. })));
    }

    #[test]
    fn unmatched_close_reports_its_position() {
        let err = compile(&"+ ]".into(), &Config::default()).unwrap_err();

        assert_eq!(err, TranslateError::UnmatchedClose { position: 2 });
    }

    #[test]
    fn unmatched_open_reports_the_innermost_loop() {
        let err = compile(&"[ [] [".into(), &Config::default()).unwrap_err();

        assert_eq!(err, TranslateError::UnmatchedOpen { position: 5 });
    }

    #[test]
    fn tape_size_is_range_checked() {
        for size in [0, MAX_TAPE_SIZE + 1, u64::MAX] {
            let err = compile(&"+".into(), &Config { tape_size: size }).unwrap_err();

            assert_eq!(err, TranslateError::TapeSize(size));
        }

        assert!(compile(&"+".into(), &Config { tape_size: MAX_TAPE_SIZE }).is_ok());
    }

    #[test]
    fn step_threads_the_cursor() {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");
        let tape = Tape::allocate(&mut m, entry, 8).unwrap();
        let mut t = Translator::new(&mut m, f, tape);

        let body = t.step(entry, 0, Command::Open).unwrap();
        assert_ne!(body, entry);
        assert_eq!(t.step(body, 1, Command::Inc).unwrap(), body);
        assert_eq!(t.open_loops().len(), 1);

        let end = t.step(body, 2, Command::Close).unwrap();
        assert_eq!(end, BlockId { func: 0, index: 2 });
        assert!(t.open_loops().is_empty());
    }
}
