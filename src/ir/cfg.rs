use super::{
    BlockId, BuildError, FuncId, Inst, Intrinsic, IrBuilder, Operand, Terminator,
    Type, Value,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub label: String,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub blocks: Vec<Block>,
    values: u32,
}

impl Function {
    fn new(name: &str, ret: Type) -> Self {
        Function {
            name: name.to_owned(),
            ret,
            blocks: vec![],
            values: 0,
        }
    }

    /// Number of SSA values defined in this function.
    pub fn value_count(&self) -> usize {
        self.values as usize
    }
}

/// A whole compiled program: intrinsic declarations plus function bodies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub declarations: Vec<Intrinsic>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.functions
            .get(id.func as usize)
            .and_then(|f| f.blocks.get(id.index()))
    }

    /// Checks that every block carries exactly one terminator and that every
    /// branch stays inside its own function.
    pub fn verify(&self) -> Result<(), BuildError> {
        for (fi, function) in self.functions.iter().enumerate() {
            for block in &function.blocks {
                let terminator = block
                    .terminator
                    .as_ref()
                    .ok_or_else(|| BuildError::Unterminated(block.label.clone()))?;

                for target in terminator.successors() {
                    if target.func() != FuncId(fi as u32) {
                        return Err(BuildError::ForeignTarget {
                            from: block.label.clone(),
                        });
                    }
                    if target.index() >= function.blocks.len() {
                        return Err(BuildError::UnknownBlock(target));
                    }
                }
            }
        }

        Ok(())
    }

    fn open_block(&mut self, id: BlockId) -> Result<&mut Block, BuildError> {
        let block = self
            .functions
            .get_mut(id.func as usize)
            .and_then(|f| f.blocks.get_mut(id.index()))
            .ok_or(BuildError::UnknownBlock(id))?;

        match block.terminator {
            Some(_) => Err(BuildError::Terminated(block.label.clone())),
            None => Ok(block),
        }
    }

    fn fresh_value(&mut self, id: BlockId) -> Value {
        let function = &mut self.functions[id.func as usize];
        let value = Value(function.values);
        function.values += 1;
        value
    }

    fn push(&mut self, id: BlockId, make: impl FnOnce(Value) -> Inst) -> Result<Value, BuildError> {
        self.open_block(id)?;
        let dst = self.fresh_value(id);
        self.open_block(id)?.insts.push(make(dst));
        Ok(dst)
    }

    fn terminate(&mut self, id: BlockId, terminator: Terminator) -> Result<(), BuildError> {
        self.open_block(id)?.terminator = Some(terminator);
        Ok(())
    }
}

impl IrBuilder for Module {
    fn declare(&mut self, callee: Intrinsic) {
        if !self.declarations.contains(&callee) {
            self.declarations.push(callee);
        }
    }

    fn create_function(&mut self, name: &str, ret: Type) -> FuncId {
        self.functions.push(Function::new(name, ret));
        FuncId(self.functions.len() as u32 - 1)
    }

    fn create_block(&mut self, func: FuncId, label: &str) -> BlockId {
        let blocks = &mut self.functions[func.index()].blocks;
        blocks.push(Block {
            label: label.to_owned(),
            insts: vec![],
            terminator: None,
        });

        BlockId {
            func: func.0,
            index: blocks.len() as u32 - 1,
        }
    }

    fn alloca(&mut self, block: BlockId, ty: Type) -> Result<Value, BuildError> {
        self.push(block, |dst| Inst::Alloca { dst, ty })
    }

    fn load(&mut self, block: BlockId, ty: Type, ptr: Value) -> Result<Value, BuildError> {
        self.push(block, |dst| Inst::Load { dst, ty, ptr })
    }

    fn store(
        &mut self,
        block: BlockId,
        ty: Type,
        value: Operand,
        ptr: Value,
    ) -> Result<(), BuildError> {
        self.open_block(block)?
            .insts
            .push(Inst::Store { ty, value, ptr });
        Ok(())
    }

    fn add(
        &mut self,
        block: BlockId,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Value, BuildError> {
        self.push(block, |dst| Inst::Add { dst, ty, lhs, rhs })
    }

    fn element_ptr(
        &mut self,
        block: BlockId,
        array: Type,
        base: Value,
        index: Operand,
    ) -> Result<Value, BuildError> {
        self.push(block, |dst| Inst::ElementPtr {
            dst,
            array,
            base,
            index,
        })
    }

    fn icmp_ne(
        &mut self,
        block: BlockId,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Value, BuildError> {
        self.push(block, |dst| Inst::ICmpNe { dst, ty, lhs, rhs })
    }

    fn call(
        &mut self,
        block: BlockId,
        callee: Intrinsic,
        args: &[Operand],
    ) -> Result<Option<Value>, BuildError> {
        self.declare(callee);
        let args = args.to_vec();

        match callee.ret() {
            Some(_) => self
                .push(block, |dst| Inst::Call {
                    dst: Some(dst),
                    callee,
                    args,
                })
                .map(Some),
            None => {
                self.open_block(block)?.insts.push(Inst::Call {
                    dst: None,
                    callee,
                    args,
                });
                Ok(None)
            }
        }
    }

    fn cond_br(
        &mut self,
        block: BlockId,
        cond: Value,
        then: BlockId,
        otherwise: BlockId,
    ) -> Result<(), BuildError> {
        self.terminate(
            block,
            Terminator::CondBr {
                cond,
                then,
                otherwise,
            },
        )
    }

    fn ret(&mut self, block: BlockId, value: Operand) -> Result<(), BuildError> {
        self.terminate(block, Terminator::Ret { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn second_terminator_is_rejected() {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");

        m.ret(entry, Operand::int(Type::I32, 0)).unwrap();

        assert_eq!(
            m.ret(entry, Operand::int(Type::I32, 1)),
            Err(BuildError::Terminated("entry".into()))
        );
        assert_eq!(
            m.alloca(entry, Type::I64),
            Err(BuildError::Terminated("entry".into()))
        );
    }

    #[test]
    fn verify_reports_open_blocks() {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");
        let dangling = m.create_block(f, "body.0");
        let cond = m
            .icmp_ne(entry, Type::I8, Operand::int(Type::I8, 1), Operand::int(Type::I8, 0))
            .unwrap();
        m.cond_br(entry, cond, dangling, dangling).unwrap();

        assert_eq!(m.verify(), Err(BuildError::Unterminated("body.0".into())));

        m.ret(dangling, Operand::int(Type::I32, 0)).unwrap();
        assert_eq!(m.verify(), Ok(()));
    }

    #[test]
    fn verify_rejects_branches_into_other_functions() {
        let mut m = Module::new();
        let main = m.create_function("main", Type::I32);
        let other = m.create_function("other", Type::I32);
        let entry = m.create_block(main, "entry");
        let foreign = m.create_block(other, "entry");
        m.ret(foreign, Operand::int(Type::I32, 0)).unwrap();

        let cond = m
            .icmp_ne(entry, Type::I8, Operand::int(Type::I8, 1), Operand::int(Type::I8, 0))
            .unwrap();
        m.cond_br(entry, cond, foreign, foreign).unwrap();

        assert_eq!(foreign.func(), other);
        assert_eq!(
            m.verify(),
            Err(BuildError::ForeignTarget {
                from: "entry".into()
            })
        );
    }

    #[test]
    fn verify_rejects_missing_targets() {
        let mut m = Module::new();
        let main = m.create_function("main", Type::I32);
        let entry = m.create_block(main, "entry");
        let missing = BlockId { func: 0, index: 7 };

        let cond = m
            .icmp_ne(entry, Type::I8, Operand::int(Type::I8, 1), Operand::int(Type::I8, 0))
            .unwrap();
        m.cond_br(entry, cond, entry, missing).unwrap();

        assert_eq!(m.verify(), Err(BuildError::UnknownBlock(missing)));
    }

    #[test]
    fn values_are_numbered_per_function() {
        let mut m = Module::new();
        let f = m.create_function("main", Type::I32);
        let entry = m.create_block(f, "entry");

        let a = m.alloca(entry, Type::I64).unwrap();
        m.store(entry, Type::I64, Operand::int(Type::I64, 0), a).unwrap();
        let b = m.load(entry, Type::I64, a).unwrap();
        let none = m
            .call(entry, Intrinsic::MemSet, &[a.into(), Operand::int(Type::I8, 0), Operand::int(Type::I64, 8)])
            .unwrap();

        assert_eq!((a, b, none), (Value(0), Value(1), None));
        assert_eq!(m.function(f).value_count(), 2);
        assert_eq!(m.declarations, vec![Intrinsic::MemSet]);
    }
}
