use crate::ir::{BlockId, BuildError, Intrinsic, IrBuilder, Operand, Type, Value};

pub const DEFAULT_TAPE_SIZE: u64 = 30_000;

/// Largest tape a program may ask for; keeps every cell addressable with a
/// 32-bit displacement.
pub const MAX_TAPE_SIZE: u64 = 1 << 30;

/// The byte tape and data pointer of a running program, as seen from the IR.
///
/// None of these operations create blocks or branches: they append to the
/// block they are given and nothing else.
#[derive(Clone, Copy, Debug)]
pub struct Tape {
    size: u64,
    cells: Value,
    pointer: Value,
}

impl Tape {
    /// Emits the tape and data pointer allocations into `block`, zeroing both.
    pub fn allocate<B: IrBuilder>(
        b: &mut B,
        block: BlockId,
        size: u64,
    ) -> Result<Self, BuildError> {
        let len = i64::try_from(size).map_err(|_| BuildError::SizeOutOfRange(size))?;
        let cells = b.alloca(block, Type::Bytes(size))?;
        let pointer = b.alloca(block, Type::I64)?;
        b.store(block, Type::I64, Operand::int(Type::I64, 0), pointer)?;

        let tape = Tape {
            size,
            cells,
            pointer,
        };

        let start = b.element_ptr(
            block,
            tape.array(),
            cells,
            Operand::int(Type::I64, 0),
        )?;
        b.call(
            block,
            Intrinsic::MemSet,
            &[
                start.into(),
                Operand::int(Type::I8, 0),
                Operand::int(Type::I64, len),
            ],
        )?;

        Ok(tape)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn array(&self) -> Type {
        Type::Bytes(self.size)
    }

    // address of the cell under the data pointer
    fn slot<B: IrBuilder>(&self, b: &mut B, block: BlockId) -> Result<Value, BuildError> {
        let index = b.load(block, Type::I64, self.pointer)?;
        b.element_ptr(block, self.array(), self.cells, index.into())
    }

    /// `+` / `-`: adds `delta` to the current cell, wrapping at 8 bits.
    pub fn grow_cell<B: IrBuilder>(
        &self,
        b: &mut B,
        block: BlockId,
        delta: i8,
    ) -> Result<(), BuildError> {
        let slot = self.slot(b, block)?;
        let cell = b.load(block, Type::I8, slot)?;
        let sum = b.add(block, Type::I8, cell.into(), Operand::int(Type::I8, delta.into()))?;
        b.store(block, Type::I8, sum.into(), slot)
    }

    /// `>` / `<`. The pointer is not bounds checked.
    pub fn move_pointer<B: IrBuilder>(
        &self,
        b: &mut B,
        block: BlockId,
        delta: i64,
    ) -> Result<(), BuildError> {
        let index = b.load(block, Type::I64, self.pointer)?;
        let moved = b.add(block, Type::I64, index.into(), Operand::int(Type::I64, delta))?;
        b.store(block, Type::I64, moved.into(), self.pointer)
    }

    /// `.`: hands the current cell to the output primitive.
    pub fn read_cell<B: IrBuilder>(&self, b: &mut B, block: BlockId) -> Result<(), BuildError> {
        let cell = self.load_cell(b, block)?;
        b.call(block, Intrinsic::PutChar, &[cell.into()])?;
        Ok(())
    }

    /// `,`: stores one byte from the input primitive into the current cell.
    pub fn write_cell<B: IrBuilder>(&self, b: &mut B, block: BlockId) -> Result<(), BuildError> {
        let byte = b
            .call(block, Intrinsic::GetChar, &[])?
            .ok_or(BuildError::NoResult(Intrinsic::GetChar.name()))?;
        let slot = self.slot(b, block)?;
        b.store(block, Type::I8, byte.into(), slot)
    }

    pub fn load_cell<B: IrBuilder>(&self, b: &mut B, block: BlockId) -> Result<Value, BuildError> {
        let slot = self.slot(b, block)?;
        b.load(block, Type::I8, slot)
    }

    /// Loop guard: `cell != 0` as an `i1`.
    pub fn cell_is_nonzero<B: IrBuilder>(
        &self,
        b: &mut B,
        block: BlockId,
    ) -> Result<Value, BuildError> {
        let cell = self.load_cell(b, block)?;
        b.icmp_ne(block, Type::I8, cell.into(), Operand::int(Type::I8, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Inst, Module};
    use pretty_assertions::assert_eq;

    fn setup() -> (Module, BlockId, Tape) {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");
        let tape = Tape::allocate(&mut m, entry, 16).unwrap();
        (m, entry, tape)
    }

    #[test]
    fn allocation_zeroes_the_tape() {
        let (m, entry, tape) = setup();
        let insts = &m.block(entry).unwrap().insts;

        assert_eq!(tape.size(), 16);
        assert_eq!(insts[0], Inst::Alloca { dst: Value(0), ty: Type::Bytes(16) });
        assert_eq!(insts[1], Inst::Alloca { dst: Value(1), ty: Type::I64 });
        assert!(matches!(
            insts.last(),
            Some(Inst::Call { callee: Intrinsic::MemSet, dst: None, .. })
        ));
    }

    #[test]
    fn tape_length_must_fit_an_i64() {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");

        assert_eq!(
            Tape::allocate(&mut m, entry, u64::MAX).unwrap_err(),
            BuildError::SizeOutOfRange(u64::MAX)
        );
    }

    #[test]
    fn grow_cell_is_load_add_store() {
        let (mut m, entry, tape) = setup();
        let before = m.block(entry).unwrap().insts.len();

        tape.grow_cell(&mut m, entry, -1).unwrap();

        let insts = &m.block(entry).unwrap().insts[before..];
        assert_eq!(insts.len(), 5);
        assert!(matches!(insts[2], Inst::Load { ty: Type::I8, .. }));
        assert!(matches!(
            insts[3],
            Inst::Add { ty: Type::I8, rhs: Operand::Const(Type::I8, -1), .. }
        ));
        assert!(matches!(insts[4], Inst::Store { ty: Type::I8, .. }));
    }

    #[test]
    fn move_pointer_touches_only_the_pointer() {
        let (mut m, entry, tape) = setup();
        let before = m.block(entry).unwrap().insts.len();

        tape.move_pointer(&mut m, entry, 1).unwrap();

        let insts = &m.block(entry).unwrap().insts[before..];
        assert_eq!(
            insts,
            &[
                Inst::Load { dst: Value(3), ty: Type::I64, ptr: Value(1) },
                Inst::Add {
                    dst: Value(4),
                    ty: Type::I64,
                    lhs: Operand::Value(Value(3)),
                    rhs: Operand::Const(Type::I64, 1),
                },
                Inst::Store {
                    ty: Type::I64,
                    value: Operand::Value(Value(4)),
                    ptr: Value(1),
                },
            ]
        );
    }

    #[test]
    fn io_goes_through_intrinsics() {
        let (mut m, entry, tape) = setup();

        tape.read_cell(&mut m, entry).unwrap();
        tape.write_cell(&mut m, entry).unwrap();

        assert_eq!(
            m.declarations,
            vec![Intrinsic::MemSet, Intrinsic::PutChar, Intrinsic::GetChar]
        );
        assert!(m.block(entry).unwrap().terminator.is_none());
    }
}
