//! A small reference evaluator for Veil IR functions.
//!
//! The machine executes one function over concrete arguments and exposes the
//! per-block visit counters it accumulated, so callers can observe both the
//! returned value and the number of times each block ran.
use cranelift_entity::SecondaryMap;
use thiserror::Error;

use super::{
    Block, BinaryOp, Function, Immediate, Insn, InsnData, UnaryOp, Value, ValueData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalValue {
    Imm(Immediate),
    /// An address into the machine's flat cell memory.
    Addr(usize),
    #[default]
    Undef,
}

impl EvalValue {
    pub fn imm(&self) -> Option<Immediate> {
        match self {
            Self::Imm(imm) => Some(*imm),
            _ => None,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Self::Undef)
    }
}

impl From<Immediate> for EvalValue {
    fn from(imm: Immediate) -> Self {
        Self::Imm(imm)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("function has no entry block")]
    NoEntryBlock,

    #[error("execution exceeded the step limit")]
    StepLimitExceeded,

    #[error("branch condition is undefined")]
    UndefBranchCond,

    #[error("memory access through an undefined or non-pointer address")]
    InvalidAddress,

    #[error("access to the address {0} is out of bounds")]
    OutOfBounds(usize),

    #[error("phi has no incoming value for the predecessor block")]
    MissingPhiArg,

    #[error("block falls through without a terminator")]
    MissingTerminator,
}

enum Action {
    Continue,
    JumpTo(Block),
    Return(EvalValue),
}

pub struct Machine<'a> {
    func: &'a Function,
    locals: SecondaryMap<Value, EvalValue>,
    memory: Vec<EvalValue>,
    block_visits: SecondaryMap<Block, u64>,
    prev_block: Option<Block>,
    step_limit: usize,
}

impl<'a> Machine<'a> {
    const DEFAULT_STEP_LIMIT: usize = 1_000_000;

    pub fn new(func: &'a Function) -> Self {
        Self {
            func,
            locals: SecondaryMap::new(),
            memory: Vec::new(),
            block_visits: SecondaryMap::new(),
            prev_block: None,
            step_limit: Self::DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Runs the function over `args` until it returns.
    pub fn run(&mut self, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
        debug_assert_eq!(args.len(), self.func.arg_values.len());

        let mut block = self
            .func
            .layout
            .entry_block()
            .ok_or(EvalError::NoEntryBlock)?;
        let mut steps = 0;

        loop {
            self.block_visits[block] += 1;
            self.eval_phis(block, args)?;

            let mut action = Action::Continue;
            for insn in self.func.layout.iter_insn(block) {
                if self.func.dfg.is_phi(insn) {
                    continue;
                }

                steps += 1;
                if steps > self.step_limit {
                    return Err(EvalError::StepLimitExceeded);
                }

                action = self.step(insn, args)?;
                if !matches!(action, Action::Continue) {
                    break;
                }
            }

            match action {
                Action::JumpTo(dest) => {
                    self.prev_block = Some(block);
                    block = dest;
                }
                Action::Return(value) => return Ok(value),
                Action::Continue => return Err(EvalError::MissingTerminator),
            }
        }
    }

    /// Number of times `block` was entered during the last run.
    pub fn block_visits(&self, block: Block) -> u64 {
        self.block_visits[block]
    }

    pub fn load_cell(&self, addr: usize) -> Result<EvalValue, EvalError> {
        self.memory
            .get(addr)
            .copied()
            .ok_or(EvalError::OutOfBounds(addr))
    }

    /// All phis of a block read their operands before any of them writes, so
    /// the updates are gathered first and committed afterwards.
    fn eval_phis(&mut self, block: Block, args: &[EvalValue]) -> Result<(), EvalError> {
        let Some(prev_block) = self.prev_block else {
            return Ok(());
        };

        let mut updates = Vec::new();
        for insn in self.func.layout.iter_insn(block) {
            if !self.func.dfg.is_phi(insn) {
                continue;
            }

            let value = self
                .func
                .dfg
                .insn_data(insn)
                .phi_arg_for(prev_block)
                .ok_or(EvalError::MissingPhiArg)?;
            let result = self
                .func
                .dfg
                .insn_result(insn)
                .ok_or(EvalError::MissingPhiArg)?;
            updates.push((result, self.eval_value(value, args)?));
        }

        for (result, value) in updates {
            self.locals[result] = value;
        }
        Ok(())
    }

    fn step(&mut self, insn: Insn, args: &[EvalValue]) -> Result<Action, EvalError> {
        let dfg = &self.func.dfg;

        match dfg.insn_data(insn) {
            InsnData::Unary { code, args: ops } => {
                let arg = self.eval_value(ops[0], args)?;
                let result = match arg {
                    EvalValue::Imm(imm) => EvalValue::Imm(match code {
                        UnaryOp::Not => !imm,
                        UnaryOp::Neg => -imm,
                    }),
                    _ => EvalValue::Undef,
                };
                self.write_result(insn, result);
                Ok(Action::Continue)
            }

            InsnData::Binary { code, args: ops } => {
                let lhs = self.eval_value(ops[0], args)?;
                let rhs = self.eval_value(ops[1], args)?;
                let result = match (lhs, rhs) {
                    (EvalValue::Imm(lhs), EvalValue::Imm(rhs)) => {
                        EvalValue::Imm(eval_binary(*code, lhs, rhs))
                    }
                    _ => EvalValue::Undef,
                };
                self.write_result(insn, result);
                Ok(Action::Continue)
            }

            InsnData::Select { args: ops } => {
                let cond = self.eval_value(ops[0], args)?;
                let result = match cond {
                    EvalValue::Imm(imm) if imm.is_true() => self.eval_value(ops[1], args)?,
                    EvalValue::Imm(_) => self.eval_value(ops[2], args)?,
                    _ => EvalValue::Undef,
                };
                self.write_result(insn, result);
                Ok(Action::Continue)
            }

            InsnData::Alloca { ty } => {
                let size = match self.func.dfg.types.array_def(*ty) {
                    Some((_, len)) => len,
                    None => 1,
                };
                let addr = self.memory.len();
                self.memory.resize(addr + size, EvalValue::Undef);
                self.write_result(insn, EvalValue::Addr(addr));
                Ok(Action::Continue)
            }

            InsnData::Gep { args: ops } => {
                let base = self.eval_value(ops[0], args)?;
                let index = self.eval_value(ops[1], args)?;
                let result = match (base, index) {
                    (EvalValue::Addr(base), EvalValue::Imm(index)) => {
                        EvalValue::Addr(base.wrapping_add(index.as_usize()))
                    }
                    _ => return Err(EvalError::InvalidAddress),
                };
                self.write_result(insn, result);
                Ok(Action::Continue)
            }

            InsnData::Load { args: ops, .. } => {
                let addr = self.eval_value(ops[0], args)?;
                let EvalValue::Addr(addr) = addr else {
                    return Err(EvalError::InvalidAddress);
                };
                let value = self.load_cell(addr)?;
                self.write_result(insn, value);
                Ok(Action::Continue)
            }

            InsnData::Store { args: ops } => {
                let value = self.eval_value(ops[0], args)?;
                let addr = self.eval_value(ops[1], args)?;
                let EvalValue::Addr(addr) = addr else {
                    return Err(EvalError::InvalidAddress);
                };
                if addr >= self.memory.len() {
                    return Err(EvalError::OutOfBounds(addr));
                }
                self.memory[addr] = value;
                Ok(Action::Continue)
            }

            InsnData::Jump { dests } => Ok(Action::JumpTo(dests[0])),

            InsnData::Branch { args: ops, dests } => {
                let cond = self.eval_value(ops[0], args)?;
                let EvalValue::Imm(imm) = cond else {
                    return Err(EvalError::UndefBranchCond);
                };
                let dest = if imm.is_true() { dests[0] } else { dests[1] };
                Ok(Action::JumpTo(dest))
            }

            InsnData::Phi { .. } => Ok(Action::Continue),

            InsnData::Return { args: ret } => {
                let value = match ret {
                    Some(value) => self.eval_value(*value, args)?,
                    None => EvalValue::Undef,
                };
                Ok(Action::Return(value))
            }
        }
    }

    fn eval_value(&self, value: Value, args: &[EvalValue]) -> Result<EvalValue, EvalError> {
        match self.func.dfg.value_data(value) {
            ValueData::Immediate { imm, .. } => Ok(EvalValue::Imm(*imm)),
            ValueData::Arg { idx, .. } => Ok(args[*idx]),
            ValueData::Inst { .. } => Ok(self.locals[value]),
        }
    }

    fn write_result(&mut self, insn: Insn, value: EvalValue) {
        if let Some(result) = self.func.dfg.insn_result(insn) {
            self.locals[result] = value;
        }
    }
}

fn eval_binary(code: BinaryOp, lhs: Immediate, rhs: Immediate) -> Immediate {
    match code {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Lt => lhs.lt(rhs),
        BinaryOp::Gt => lhs.gt(rhs),
        BinaryOp::Le => lhs.le(rhs),
        BinaryOp::Ge => lhs.ge(rhs),
        BinaryOp::Slt => lhs.slt(rhs),
        BinaryOp::Sgt => lhs.sgt(rhs),
        BinaryOp::Sle => lhs.sle(rhs),
        BinaryOp::Sge => lhs.sge(rhs),
        BinaryOp::Eq => lhs.imm_eq(rhs),
        BinaryOp::Ne => lhs.imm_ne(rhs),
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
    }
}
