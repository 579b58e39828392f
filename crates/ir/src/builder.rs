//! A straightforward builder for constructing functions block by block.
use super::{
    func_cursor::{CursorLocation, InsnInserter},
    Block, BinaryOp, Function, Immediate, Insn, InsnData, Signature, Type, UnaryOp, Value,
};

#[derive(Debug)]
pub struct FunctionBuilder {
    func: Function,
    loc: CursorLocation,
}

macro_rules! impl_binary_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: Value, rhs: Value) -> Value {
            self.insert_binary($code, lhs, rhs)
        }
    };
}

impl FunctionBuilder {
    pub fn new(sig: Signature) -> Self {
        let func = Function::new(sig);
        Self {
            func,
            loc: CursorLocation::NoWhere,
        }
    }

    pub fn build(self) -> Function {
        self.func
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn append_block(&mut self) -> Block {
        let block = self.func.dfg.make_block();
        self.func.layout.append_block(block);
        block
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.loc = CursorLocation::BlockBottom(block);
    }

    pub fn current_block(&self) -> Option<Block> {
        match self.loc {
            CursorLocation::BlockBottom(block) => Some(block),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.func.arg_values
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> Value
    where
        Imm: Into<Immediate>,
    {
        self.func.dfg.make_imm_value(imm)
    }

    impl_binary_insn!(add, BinaryOp::Add);
    impl_binary_insn!(sub, BinaryOp::Sub);
    impl_binary_insn!(mul, BinaryOp::Mul);
    impl_binary_insn!(lt, BinaryOp::Lt);
    impl_binary_insn!(gt, BinaryOp::Gt);
    impl_binary_insn!(slt, BinaryOp::Slt);
    impl_binary_insn!(sgt, BinaryOp::Sgt);
    impl_binary_insn!(le, BinaryOp::Le);
    impl_binary_insn!(ge, BinaryOp::Ge);
    impl_binary_insn!(sle, BinaryOp::Sle);
    impl_binary_insn!(sge, BinaryOp::Sge);
    impl_binary_insn!(eq, BinaryOp::Eq);
    impl_binary_insn!(ne, BinaryOp::Ne);
    impl_binary_insn!(and, BinaryOp::And);
    impl_binary_insn!(or, BinaryOp::Or);
    impl_binary_insn!(xor, BinaryOp::Xor);

    pub fn not(&mut self, value: Value) -> Value {
        self.insert_insn_with_result(InsnData::unary(UnaryOp::Not, value))
    }

    pub fn neg(&mut self, value: Value) -> Value {
        self.insert_insn_with_result(InsnData::unary(UnaryOp::Neg, value))
    }

    pub fn select(&mut self, cond: Value, then: Value, else_: Value) -> Value {
        self.insert_insn_with_result(InsnData::select(cond, then, else_))
    }

    /// Allocates an array of `len` elements of `elem`, returning a pointer to
    /// the array.
    pub fn alloca_array(&mut self, elem: Type, len: usize) -> Value {
        let array_ty = self.func.dfg.types.make_array(elem, len);
        self.insert_insn_with_result(InsnData::Alloca { ty: array_ty })
    }

    pub fn alloca(&mut self, ty: Type) -> Value {
        self.insert_insn_with_result(InsnData::Alloca { ty })
    }

    pub fn gep(&mut self, base: Value, index: Value) -> Value {
        self.insert_insn_with_result(InsnData::Gep { args: [base, index] })
    }

    pub fn load(&mut self, addr: Value) -> Value {
        let addr_ty = self.func.dfg.value_ty(addr);
        let ty = self
            .func
            .dfg
            .types
            .deref(addr_ty)
            .expect("load from a non-pointer value");
        self.insert_insn_with_result(InsnData::Load { args: [addr], ty })
    }

    pub fn store(&mut self, value: Value, addr: Value) -> Insn {
        self.insert_insn(InsnData::Store { args: [value, addr] })
    }

    pub fn jump(&mut self, dest: Block) -> Insn {
        self.insert_insn(InsnData::jump(dest))
    }

    pub fn br(&mut self, cond: Value, then: Block, else_: Block) -> Insn {
        self.insert_insn(InsnData::branch(cond, then, else_))
    }

    pub fn ret(&mut self, value: Option<Value>) -> Insn {
        self.insert_insn(InsnData::Return { args: value })
    }

    pub fn phi(&mut self, ty: Type, args: &[(Value, Block)]) -> Value {
        let mut data = InsnData::phi(ty);
        for (value, block) in args {
            data.append_phi_arg(*value, *block);
        }
        self.insert_insn_with_result(data)
    }

    pub fn append_phi_arg(&mut self, phi: Value, value: Value, block: Block) {
        let insn = self
            .func
            .dfg
            .value_insn(phi)
            .expect("value is not defined by a phi");
        self.func.dfg.append_phi_arg(insn, value, block);
    }

    fn insert_binary(&mut self, code: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.insert_insn_with_result(InsnData::binary(code, lhs, rhs))
    }

    fn insert_insn(&mut self, data: InsnData) -> Insn {
        let mut inserter = InsnInserter::new(&mut self.func, self.loc);
        inserter.insert_insn_data(data)
    }

    fn insert_insn_with_result(&mut self, data: InsnData) -> Value {
        let mut inserter = InsnInserter::new(&mut self.func, self.loc);
        let (_, value) = inserter.insert_insn_data_with_result(data);
        value
    }
}
