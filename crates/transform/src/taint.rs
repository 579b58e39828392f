//! Forward taint closure over the def-use graph.
//!
//! The closure is seeded from the function arguments and grows through use
//! edges: every instruction using a tainted value is tainted, and so is its
//! result. The resulting set is captured before any rewriting, since CFG
//! mutation invalidates the use edges the closure was built from.
use std::collections::VecDeque;

use indexmap::IndexSet;
use veil_ir::{Function, Insn, Value};

#[derive(Debug, Default, Clone)]
pub struct TaintSet {
    values: IndexSet<Value>,
    insns: IndexSet<Insn>,
}

impl TaintSet {
    /// Computes the closure seeded from the function's arguments.
    pub fn compute(func: &Function) -> Self {
        Self::compute_from(func, &func.arg_values)
    }

    /// Computes the closure seeded from arbitrary values. Used by the loop
    /// relaxation to obtain the use-closure of an array index.
    pub fn compute_from(func: &Function, seeds: &[Value]) -> Self {
        let mut set = Self::default();
        let mut worklist: VecDeque<Value> = VecDeque::new();

        for &seed in seeds {
            if set.values.insert(seed) {
                worklist.push_back(seed);
            }
        }

        while let Some(value) = worklist.pop_front() {
            for &user in func.dfg.users(value) {
                if !set.insns.insert(user) {
                    continue;
                }
                if let Some(result) = func.dfg.insn_result(user) {
                    if set.values.insert(result) {
                        worklist.push_back(result);
                    }
                }
            }
        }

        set
    }

    pub fn contains_value(&self, value: Value) -> bool {
        self.values.contains(&value)
    }

    pub fn contains_insn(&self, insn: Insn) -> bool {
        self.insns.contains(&insn)
    }

    /// Tainted values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.insns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_num(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn closure_through_arith() {
        let mut builder = FunctionBuilder::new(Signature::new("test_func", &[Type::I32], Type::I32));
        let entry = builder.append_block();
        builder.switch_to_block(entry);

        let arg = builder.args()[0];
        let two = builder.make_imm_value(2i32);
        let v0 = builder.mul(arg, two);
        let v1 = builder.add(v0, two);
        // Not derived from the argument.
        let v2 = builder.add(two, two);
        builder.ret(Some(v1));
        let func = builder.build();

        let taint = TaintSet::compute(&func);
        assert!(taint.contains_value(arg));
        assert!(taint.contains_value(v0));
        assert!(taint.contains_value(v1));
        assert!(!taint.contains_value(v2));
        assert!(!taint.contains_value(two));
    }

    #[test]
    fn closure_includes_insns_without_results() {
        let mut builder = FunctionBuilder::new(Signature::new("test_func", &[Type::I64], Type::Unit));
        let entry = builder.append_block();
        builder.switch_to_block(entry);

        let arg = builder.args()[0];
        let array = builder.alloca_array(Type::I32, 4);
        let ptr = builder.gep(array, arg);
        let one = builder.make_imm_value(1i32);
        let store = builder.store(one, ptr);
        builder.ret(None);
        let func = builder.build();

        let taint = TaintSet::compute(&func);
        assert!(taint.contains_value(ptr));
        assert!(taint.contains_insn(store));
        assert!(!taint.contains_value(array));
    }

    #[test]
    fn branch_on_secret_is_tainted() {
        let mut builder = FunctionBuilder::new(Signature::new("test_func", &[Type::I32], Type::Unit));
        let entry = builder.append_block();
        let then_block = builder.append_block();
        let merge_block = builder.append_block();
        builder.switch_to_block(entry);

        let arg = builder.args()[0];
        let ten = builder.make_imm_value(10i32);
        let cond = builder.sgt(arg, ten);
        let br = builder.br(cond, then_block, merge_block);

        builder.switch_to_block(then_block);
        builder.jump(merge_block);
        builder.switch_to_block(merge_block);
        builder.ret(None);
        let func = builder.build();

        let taint = TaintSet::compute(&func);
        assert!(taint.contains_value(cond));
        assert!(taint.contains_insn(br));
    }

    #[test]
    fn empty_seed_gives_empty_set() {
        let mut builder = FunctionBuilder::new(Signature::new("test_func", &[], Type::I32));
        let entry = builder.append_block();
        builder.switch_to_block(entry);
        let one = builder.make_imm_value(1i32);
        let two = builder.make_imm_value(2i32);
        let v = builder.add(one, two);
        builder.ret(Some(v));
        let func = builder.build();

        let taint = TaintSet::compute(&func);
        assert!(taint.is_empty());
        assert!(!taint.contains_value(v));
    }

    #[test]
    fn insertion_order_is_deterministic() {
        let mut builder = FunctionBuilder::new(Signature::new("test_func", &[Type::I32], Type::I32));
        let entry = builder.append_block();
        builder.switch_to_block(entry);

        let arg = builder.args()[0];
        let one = builder.make_imm_value(1i32);
        let v0 = builder.add(arg, one);
        let v1 = builder.mul(v0, v0);
        builder.ret(Some(v1));
        let func = builder.build();

        let taint = TaintSet::compute(&func);
        let order: Vec<_> = taint.values().copied().collect();
        assert_eq!(order, vec![arg, v0, v1]);
    }
}
