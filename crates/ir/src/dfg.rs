//! This module contains a data flow graph definition.
use std::collections::BTreeSet;

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;

use super::{
    insn::{BranchInfo, InsnData},
    types::TypeStore,
    Immediate, Insn, Type, Value, ValueData,
};

/// An opaque reference to [`BlockData`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct Block(pub u32);
entity_impl!(Block, "block");

/// A block data definition.
/// A Block data doesn't hold any information for layout of a program. It is
/// managed by [`super::layout::Layout`].
#[derive(Debug, Clone, Default)]
pub struct BlockData {}

#[derive(Debug, Clone, Default)]
pub struct DataFlowGraph {
    pub types: TypeStore,
    blocks: PrimaryMap<Block, BlockData>,
    insns: PrimaryMap<Insn, InsnData>,
    values: PrimaryMap<Value, ValueData>,
    insn_results: SecondaryMap<Insn, PackedOption<Value>>,
    immediates: FxHashMap<Immediate, Value>,
    users: SecondaryMap<Value, BTreeSet<Insn>>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    pub fn make_insn(&mut self, insn: InsnData) -> Insn {
        let insn = self.insns.push(insn);
        self.attach_user(insn);
        insn
    }

    pub fn make_value(&mut self, value: ValueData) -> Value {
        self.values.push(value)
    }

    /// Creates a result value for `insn` if the instruction produces one.
    pub fn make_result(&mut self, insn: Insn) -> Option<Value> {
        let ty = self.result_type(insn)?;
        let value_data = ValueData::Inst { insn, ty };
        Some(self.make_value(value_data))
    }

    pub fn attach_result(&mut self, insn: Insn, value: Value) {
        debug_assert!(self.insn_results[insn].is_none());
        self.insn_results[insn] = value.into();
    }

    pub fn make_arg_value(&mut self, ty: Type, idx: usize) -> Value {
        self.make_value(ValueData::Arg { ty, idx })
    }

    /// Returns the interned value for `imm`, creating it on first use.
    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> Value
    where
        Imm: Into<Immediate>,
    {
        let imm: Immediate = imm.into();
        if let Some(&value) = self.immediates.get(&imm) {
            return value;
        }

        let ty = imm.ty();
        let value_data = ValueData::Immediate { imm, ty };
        let value = self.make_value(value_data);
        self.immediates.insert(imm, value);
        value
    }

    pub fn replace_insn(&mut self, insn: Insn, insn_data: InsnData) {
        self.remove_user(insn);
        self.insns[insn] = insn_data;
        self.attach_user(insn);
    }

    /// Replaces the `idx`-th argument of `insn` with `new_arg`, maintaining
    /// the user sets of both the old and new argument.
    pub fn replace_insn_arg(&mut self, insn: Insn, new_arg: Value, idx: usize) -> Value {
        let data = &mut self.insns[insn];
        let old_arg = data.args()[idx];
        data.replace_arg(new_arg, idx);
        self.users[new_arg].insert(insn);
        if !self.insns[insn].args().contains(&old_arg) {
            self.users[old_arg].remove(&insn);
        }
        old_arg
    }

    /// Rewrites every use of `old` to `new`.
    pub fn replace_uses(&mut self, old: Value, new: Value) {
        let users: Vec<Insn> = self.users[old].iter().copied().collect();
        for insn in users {
            let positions: Vec<usize> = self.insns[insn]
                .args()
                .iter()
                .enumerate()
                .filter_map(|(idx, arg)| (*arg == old).then_some(idx))
                .collect();
            for idx in positions {
                self.replace_insn_arg(insn, new, idx);
            }
        }
    }

    pub fn users(&self, value: Value) -> impl Iterator<Item = &Insn> {
        self.users[value].iter()
    }

    pub fn users_num(&self, value: Value) -> usize {
        self.users[value].len()
    }

    pub fn remove_user(&mut self, insn: Insn) {
        for arg in self.insns[insn].args().to_vec() {
            self.users[arg].remove(&insn);
        }
    }

    fn attach_user(&mut self, insn: Insn) {
        for arg in self.insns[insn].args().to_vec() {
            self.users[arg].insert(insn);
        }
    }

    pub fn block_data(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    pub fn blocks_num(&self) -> usize {
        self.blocks.len()
    }

    pub fn value_data(&self, value: Value) -> &ValueData {
        &self.values[value]
    }

    pub fn value_ty(&self, value: Value) -> Type {
        match &self.values[value] {
            ValueData::Inst { ty, .. }
            | ValueData::Arg { ty, .. }
            | ValueData::Immediate { ty, .. } => *ty,
        }
    }

    /// Returns the instruction defining `value`, if `value` is an
    /// instruction result.
    pub fn value_insn(&self, value: Value) -> Option<Insn> {
        match self.value_data(value) {
            ValueData::Inst { insn, .. } => Some(*insn),
            _ => None,
        }
    }

    pub fn value_imm(&self, value: Value) -> Option<Immediate> {
        match self.value_data(value) {
            ValueData::Immediate { imm, .. } => Some(*imm),
            _ => None,
        }
    }

    pub fn is_imm(&self, value: Value) -> bool {
        self.value_imm(value).is_some()
    }

    pub fn is_arg(&self, value: Value) -> bool {
        matches!(self.value_data(value), ValueData::Arg { .. })
    }

    pub fn insn_data(&self, insn: Insn) -> &InsnData {
        &self.insns[insn]
    }

    pub fn insn_data_mut(&mut self, insn: Insn) -> &mut InsnData {
        &mut self.insns[insn]
    }

    pub fn insn_args(&self, insn: Insn) -> &[Value] {
        self.insns[insn].args()
    }

    pub fn insn_arg(&self, insn: Insn, idx: usize) -> Value {
        self.insns[insn].args()[idx]
    }

    pub fn insn_result(&self, insn: Insn) -> Option<Value> {
        self.insn_results[insn].expand()
    }

    pub fn branch_info(&self, insn: Insn) -> BranchInfo {
        self.insns[insn].analyze_branch()
    }

    pub fn is_phi(&self, insn: Insn) -> bool {
        matches!(self.insns[insn], InsnData::Phi { .. })
    }

    pub fn is_branch(&self, insn: Insn) -> bool {
        matches!(self.insns[insn], InsnData::Branch { .. })
    }

    pub fn is_return(&self, insn: Insn) -> bool {
        matches!(self.insns[insn], InsnData::Return { .. })
    }

    pub fn is_terminator(&self, insn: Insn) -> bool {
        self.insns[insn].is_terminator()
    }

    pub fn has_side_effect(&self, insn: Insn) -> bool {
        self.insns[insn].has_side_effect()
    }

    pub fn append_phi_arg(&mut self, insn: Insn, value: Value, block: Block) {
        self.insns[insn].append_phi_arg(value, block);
        self.users[value].insert(insn);
    }

    pub fn remove_phi_arg(&mut self, insn: Insn, from: Block) -> Value {
        let value = self.insns[insn].remove_phi_arg(from);
        if !self.insns[insn].args().contains(&value) {
            self.users[value].remove(&insn);
        }
        value
    }

    pub fn rewrite_phi_block(&mut self, insn: Insn, from: Block, to: Block) {
        self.insns[insn].rewrite_phi_block(from, to);
    }

    pub fn phi_blocks(&self, insn: Insn) -> &[Block] {
        self.insns[insn].phi_blocks()
    }

    pub fn rewrite_branch_dest(&mut self, insn: Insn, from: Block, to: Block) {
        self.insns[insn].rewrite_branch_dest(from, to);
    }

    pub fn remove_branch_dest(&mut self, insn: Insn, dest: Block) {
        // A conditional branch degenerates into a jump, which drops its
        // condition operand, so the user sets must be rebuilt.
        self.remove_user(insn);
        self.insns[insn].remove_branch_dest(dest);
        self.attach_user(insn);
    }

    fn result_type(&mut self, insn: Insn) -> Option<Type> {
        let pointee = match &self.insns[insn] {
            InsnData::Alloca { ty } => *ty,
            InsnData::Gep { args } => {
                let base_ty = self.value_ty(args[0]);
                let pointee = self.types.deref(base_ty)?;
                match self.types.array_def(pointee) {
                    Some((elem, _)) => elem,
                    None => pointee,
                }
            }
            data => return data.result_type(self),
        };
        Some(self.types.make_ptr(pointee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_refs_format_with_prefixes() {
        assert_eq!(Block(3).to_string(), "block3");
        assert_eq!(format!("{:?}", Block(3)), "block3");
        assert_eq!(Value(7).to_string(), "v7");
        assert_eq!(format!("{:?}", Value(7)), "v7");
    }
}
