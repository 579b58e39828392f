//! This module contains Veil IR instruction definitions.
use std::fmt;

use smallvec::SmallVec;

use super::{dfg::Block, types::Type, value::Value, DataFlowGraph};

/// An opaque reference to [`InsnData`].
#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct Insn(pub u32);
cranelift_entity::entity_impl!(Insn);

/// An instruction data definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InsnData {
    /// Unary instructions.
    Unary { code: UnaryOp, args: [Value; 1] },

    /// Binary instructions, including comparisons.
    Binary { code: BinaryOp, args: [Value; 2] },

    /// Ternary data selection: `args == [cond, then, else]`.
    /// The predication primitive; selects without branching.
    Select { args: [Value; 3] },

    /// Allocate a fixed-size object on the stack frame.
    /// The result is a pointer to `ty`.
    Alloca { ty: Type },

    /// Address computation: `args == [base, index]`. The result points to the
    /// `index`-th element of the array behind `base`.
    Gep { args: [Value; 2] },

    /// Load a value of type `ty` from memory.
    Load { args: [Value; 1], ty: Type },

    /// Store a value to memory: `args == [value, addr]`.
    Store { args: [Value; 2] },

    /// Unconditional jump instruction.
    Jump { dests: [Block; 1] },

    /// Conditional jump instruction. `dests[0]` is taken when the condition
    /// is non-zero.
    Branch { args: [Value; 1], dests: [Block; 2] },

    /// Phi function.
    Phi {
        values: SmallVec<[Value; 8]>,
        blocks: SmallVec<[Block; 8]>,
        ty: Type,
    },

    /// Return.
    Return { args: Option<Value> },
}

impl InsnData {
    pub fn unary(code: UnaryOp, arg: Value) -> Self {
        Self::Unary { code, args: [arg] }
    }

    pub fn binary(code: BinaryOp, lhs: Value, rhs: Value) -> Self {
        Self::Binary {
            code,
            args: [lhs, rhs],
        }
    }

    pub fn select(cond: Value, then: Value, else_: Value) -> Self {
        Self::Select {
            args: [cond, then, else_],
        }
    }

    pub fn jump(dest: Block) -> Self {
        Self::Jump { dests: [dest] }
    }

    pub fn branch(cond: Value, then: Block, else_: Block) -> Self {
        Self::Branch {
            args: [cond],
            dests: [then, else_],
        }
    }

    pub fn phi(ty: Type) -> Self {
        Self::Phi {
            values: SmallVec::new(),
            blocks: SmallVec::new(),
            ty,
        }
    }

    pub fn analyze_branch(&self) -> BranchInfo {
        match self {
            Self::Jump { dests } => BranchInfo::Jump { dest: dests[0] },

            Self::Branch { args, dests } => BranchInfo::Br {
                cond: args[0],
                dests,
            },

            _ => BranchInfo::NotBranch,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. } | Self::Branch { .. } | Self::Return { .. }
        )
    }

    pub fn remove_branch_dest(&mut self, dest: Block) {
        match self {
            Self::Jump { .. } => panic!("can't remove destination from `Jump` insn"),

            Self::Branch { dests, .. } => {
                let remain = if dests[0] == dest {
                    dests[1]
                } else if dests[1] == dest {
                    dests[0]
                } else {
                    panic!("no dests found in the branch destination")
                };
                *self = Self::jump(remain);
            }

            _ => panic!("not a branch"),
        }
    }

    pub fn rewrite_branch_dest(&mut self, from: Block, to: Block) {
        match self {
            Self::Jump { dests } => {
                if dests[0] == from {
                    dests[0] = to
                }
            }

            Self::Branch { dests, .. } => {
                for block in dests.iter_mut() {
                    if *block == from {
                        *block = to;
                    }
                }
            }

            _ => {}
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            Self::Binary { args, .. } | Self::Store { args, .. } | Self::Gep { args } => args,
            Self::Unary { args, .. } | Self::Load { args, .. } | Self::Branch { args, .. } => args,
            Self::Select { args } => args,
            Self::Phi { values: args, .. } => args,
            Self::Return { args } => args.as_slice(),
            _ => &[],
        }
    }

    pub fn args_mut(&mut self) -> &mut [Value] {
        match self {
            Self::Binary { args, .. } | Self::Store { args, .. } | Self::Gep { args } => args,
            Self::Unary { args, .. } | Self::Load { args, .. } | Self::Branch { args, .. } => args,
            Self::Select { args } => args,
            Self::Phi { values: args, .. } => args,
            Self::Return { args } => args.as_mut_slice(),
            _ => &mut [],
        }
    }

    pub fn replace_arg(&mut self, new_arg: Value, idx: usize) {
        self.args_mut()[idx] = new_arg;
    }

    pub fn append_phi_arg(&mut self, value: Value, block: Block) {
        match self {
            Self::Phi { values, blocks, .. } => {
                values.push(value);
                blocks.push(block)
            }
            _ => panic!("expects `InsnData::Phi` but got `{:?}`", self),
        }
    }

    /// Removes the phi argument coming from `from`, returning its value.
    pub fn remove_phi_arg(&mut self, from: Block) -> Value {
        match self {
            Self::Phi { values, blocks, .. } => {
                let pos = blocks
                    .iter()
                    .position(|block| *block == from)
                    .expect("no phi arg from the block");
                blocks.remove(pos);
                values.remove(pos)
            }
            _ => panic!("expects `InsnData::Phi` but got `{:?}`", self),
        }
    }

    /// Relabels the phi argument coming from `from` to come from `to`.
    pub fn rewrite_phi_block(&mut self, from: Block, to: Block) {
        match self {
            Self::Phi { blocks, .. } => {
                for block in blocks.iter_mut() {
                    if *block == from {
                        *block = to;
                    }
                }
            }
            _ => panic!("expects `InsnData::Phi` but got `{:?}`", self),
        }
    }

    /// Returns the phi argument coming from `from` if it exists.
    pub fn phi_arg_for(&self, from: Block) -> Option<Value> {
        match self {
            Self::Phi { values, blocks, .. } => blocks
                .iter()
                .position(|block| *block == from)
                .map(|pos| values[pos]),
            _ => None,
        }
    }

    pub fn phi_blocks(&self) -> &[Block] {
        match self {
            Self::Phi { blocks, .. } => blocks,
            _ => &[],
        }
    }

    pub fn has_side_effect(&self) -> bool {
        // We assume `Load` has side effect because it may cause trap.
        matches!(
            self,
            Self::Load { .. } | Self::Store { .. } | Self::Alloca { .. } | Self::Return { .. }
        )
    }

    pub(crate) fn result_type(&self, dfg: &DataFlowGraph) -> Option<Type> {
        match self {
            Self::Unary { args, .. } => Some(dfg.value_ty(args[0])),
            Self::Binary { code, args } => Some(code.result_type(dfg, args)),
            Self::Select { args } => Some(dfg.value_ty(args[1])),
            Self::Load { ty, .. } => Some(*ty),
            Self::Phi { ty, .. } => Some(*ty),
            // `Alloca` and `Gep` types are derived in the dfg, where the type
            // store is reachable mutably.
            _ => None,
        }
    }
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Neg => "neg",
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Lt,
    Gt,
    Slt,
    Sgt,
    Le,
    Ge,
    Sle,
    Sge,
    Eq,
    Ne,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::Eq | Self::Ne
        )
    }

    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Gt
                | Self::Slt
                | Self::Sgt
                | Self::Le
                | Self::Ge
                | Self::Sle
                | Self::Sge
        )
    }

    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Slt => "slt",
            Self::Sgt => "sgt",
            Self::Le => "le",
            Self::Ge => "ge",
            Self::Sle => "sle",
            Self::Sge => "sge",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }

    fn result_type(self, dfg: &DataFlowGraph, args: &[Value; 2]) -> Type {
        if self.is_cmp() {
            Type::I1
        } else {
            dfg.value_ty(args[0])
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy)]
pub enum BranchInfo<'a> {
    NotBranch,

    /// Unconditional jump.
    Jump { dest: Block },

    /// Conditional jump.
    Br { cond: Value, dests: &'a [Block] },
}

impl<'a> BranchInfo<'a> {
    pub fn iter_dests(self) -> BranchDestIter<'a> {
        BranchDestIter {
            branch_info: self,
            idx: 0,
        }
    }

    pub fn dests_num(self) -> usize {
        match self {
            Self::NotBranch => 0,
            Self::Jump { .. } => 1,
            Self::Br { dests, .. } => dests.len(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct BranchDestIter<'a> {
    branch_info: BranchInfo<'a>,
    idx: usize,
}

impl Iterator for BranchDestIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.branch_info.dests_num() {
            return None;
        }

        match self.branch_info {
            BranchInfo::Jump { dest } => {
                self.idx += 1;
                Some(dest)
            }

            BranchInfo::Br { dests, .. } => {
                let dest = dests[self.idx];
                self.idx += 1;
                Some(dest)
            }

            BranchInfo::NotBranch => None,
        }
    }
}
