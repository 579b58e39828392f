//! End-to-end tests running whole functions through the transformation and
//! checking the observable properties: identical results, secret-independent
//! trip counts, and a valid CFG afterwards.
use quickcheck::quickcheck;
use veil_ir::{
    interpret::{EvalValue, Machine},
    Function, FunctionBuilder, Immediate, Signature, Type, Value,
};
use veil_transform::{cfg::ControlFlowGraph, SecretFlowSolver, TaintSet};

fn imm32(v: i32) -> EvalValue {
    EvalValue::Imm(Immediate::I32(v))
}

fn conditional_branch_num(func: &Function) -> usize {
    func.layout
        .iter_block()
        .flat_map(|block| func.layout.iter_insn(block))
        .filter(|insn| func.dfg.is_branch(*insn))
        .count()
}

/// `foo(a): if a > 10 { x = a + 8 } else { x = 1; 7 times: x = x * a }`
fn branch_or_loop() -> Function {
    let mut builder = FunctionBuilder::new(Signature::new("foo", &[Type::I32], Type::I32));
    let entry = builder.append_block();
    let then_block = builder.append_block();
    let header = builder.append_block();
    let body = builder.append_block();
    let loop_exit = builder.append_block();
    let merge = builder.append_block();

    let a = builder.args()[0];
    builder.switch_to_block(entry);
    let ten = builder.make_imm_value(10i32);
    let cond = builder.sgt(a, ten);
    builder.br(cond, then_block, header);

    builder.switch_to_block(then_block);
    let eight = builder.make_imm_value(8i32);
    let x0 = builder.add(a, eight);
    builder.jump(merge);

    builder.switch_to_block(header);
    let zero = builder.make_imm_value(0i32);
    let one = builder.make_imm_value(1i32);
    let i = builder.phi(Type::I32, &[(zero, entry)]);
    let x = builder.phi(Type::I32, &[(one, entry)]);
    let seven = builder.make_imm_value(7i32);
    let loop_cond = builder.slt(i, seven);
    builder.br(loop_cond, body, loop_exit);

    builder.switch_to_block(body);
    let x_next = builder.mul(x, a);
    let i_next = builder.add(i, one);
    builder.append_phi_arg(i, i_next, body);
    builder.append_phi_arg(x, x_next, body);
    builder.jump(header);

    builder.switch_to_block(loop_exit);
    builder.jump(merge);

    builder.switch_to_block(merge);
    let out = builder.phi(Type::I32, &[(x0, then_block), (x, loop_exit)]);
    builder.ret(Some(out));

    builder.build()
}

/// `fill(a): for i in 0..a { arr[i] = i * 2 }; return 0` over an 8 element
/// stack array.
fn fill_array() -> Function {
    let mut builder = FunctionBuilder::new(Signature::new("fill", &[Type::I32], Type::I32));
    let entry = builder.append_block();
    let header = builder.append_block();
    let body = builder.append_block();
    let exit = builder.append_block();

    let a = builder.args()[0];
    builder.switch_to_block(entry);
    let arr = builder.alloca_array(Type::I32, 8);
    let zero = builder.make_imm_value(0i32);
    builder.jump(header);

    builder.switch_to_block(header);
    let i = builder.phi(Type::I32, &[(zero, entry)]);
    let cond = builder.slt(i, a);
    builder.br(cond, body, exit);

    builder.switch_to_block(body);
    let two = builder.make_imm_value(2i32);
    let double = builder.mul(i, two);
    let ptr = builder.gep(arr, i);
    builder.store(double, ptr);
    let one = builder.make_imm_value(1i32);
    let next = builder.add(i, one);
    builder.append_phi_arg(i, next, body);
    builder.jump(header);

    builder.switch_to_block(exit);
    builder.ret(Some(zero));

    builder.build()
}

/// `nest(a): for j in 0..2 { for i in 0..a { arr[i] = i + j } }; return arr[1]`
/// over an 8 element stack array.
fn nested_fill() -> Function {
    let mut builder = FunctionBuilder::new(Signature::new("nest", &[Type::I32], Type::I32));
    let entry = builder.append_block();
    let outer_header = builder.append_block();
    let preheader = builder.append_block();
    let inner_header = builder.append_block();
    let inner_body = builder.append_block();
    let outer_latch = builder.append_block();
    let exit = builder.append_block();

    let a = builder.args()[0];
    builder.switch_to_block(entry);
    let arr = builder.alloca_array(Type::I32, 8);
    let zero = builder.make_imm_value(0i32);
    builder.jump(outer_header);

    builder.switch_to_block(outer_header);
    let j = builder.phi(Type::I32, &[(zero, entry)]);
    let two = builder.make_imm_value(2i32);
    let outer_cond = builder.slt(j, two);
    builder.br(outer_cond, preheader, exit);

    builder.switch_to_block(preheader);
    builder.jump(inner_header);

    builder.switch_to_block(inner_header);
    let i = builder.phi(Type::I32, &[(zero, preheader)]);
    let inner_cond = builder.slt(i, a);
    builder.br(inner_cond, inner_body, outer_latch);

    builder.switch_to_block(inner_body);
    let sum = builder.add(i, j);
    let ptr = builder.gep(arr, i);
    builder.store(sum, ptr);
    let one = builder.make_imm_value(1i32);
    let i_next = builder.add(i, one);
    builder.append_phi_arg(i, i_next, inner_body);
    builder.jump(inner_header);

    builder.switch_to_block(outer_latch);
    let j_next = builder.add(j, one);
    builder.append_phi_arg(j, j_next, outer_latch);
    builder.jump(outer_header);

    builder.switch_to_block(exit);
    let ptr1 = builder.gep(arr, one);
    let out = builder.load(ptr1);
    builder.ret(Some(out));

    builder.build()
}

/// `once(a): do { arr[i] = i * 2; i += 1 } while (i < a); return arr[5]` —
/// a single-block loop whose exit test runs after the body.
fn do_while_fill() -> Function {
    let mut builder = FunctionBuilder::new(Signature::new("once", &[Type::I32], Type::I32));
    let entry = builder.append_block();
    let loop_block = builder.append_block();
    let exit = builder.append_block();

    let a = builder.args()[0];
    builder.switch_to_block(entry);
    let arr = builder.alloca_array(Type::I32, 8);
    let zero = builder.make_imm_value(0i32);
    builder.jump(loop_block);

    builder.switch_to_block(loop_block);
    let i = builder.phi(Type::I32, &[(zero, entry)]);
    let two = builder.make_imm_value(2i32);
    let double = builder.mul(i, two);
    let ptr = builder.gep(arr, i);
    builder.store(double, ptr);
    let one = builder.make_imm_value(1i32);
    let i_next = builder.add(i, one);
    builder.append_phi_arg(i, i_next, loop_block);
    let cond = builder.slt(i_next, a);
    builder.br(cond, loop_block, exit);

    builder.switch_to_block(exit);
    let five = builder.make_imm_value(5i32);
    let ptr5 = builder.gep(arr, five);
    let out = builder.load(ptr5);
    builder.ret(Some(out));

    builder.build()
}

#[test]
fn branch_or_loop_scenario() {
    let orig = branch_or_loop();
    let mut func = branch_or_loop();
    SecretFlowSolver::new().transform(&mut func).unwrap();

    // The only conditional branch left is the (secret-independent) loop exit.
    assert_eq!(conditional_branch_num(&func), 1);

    for a in [-4, 0, 2, 5, 10, 11, 15, 40] {
        let mut before = Machine::new(&orig);
        let mut after = Machine::new(&func);
        assert_eq!(before.run(&[imm32(a)]), after.run(&[imm32(a)]), "a = {a}");
    }
}

#[test]
fn fill_array_trip_count_is_constant() {
    let mut func = fill_array();
    SecretFlowSolver::new().transform(&mut func).unwrap();

    let body = func.layout.iter_block().nth(2).unwrap();
    let mut visits = Vec::new();
    for a in 0..=8 {
        let mut machine = Machine::new(&func);
        machine.run(&[imm32(a)]).unwrap();
        visits.push(machine.block_visits(body));
    }
    assert!(visits.iter().all(|&v| v == 8), "visits = {visits:?}");
}

#[test]
fn fill_array_contents_are_preserved() {
    let orig = fill_array();
    let mut func = fill_array();
    SecretFlowSolver::new().transform(&mut func).unwrap();

    for a in 0..=8 {
        let mut before = Machine::new(&orig);
        let mut after = Machine::new(&func);
        before.run(&[imm32(a)]).unwrap();
        after.run(&[imm32(a)]).unwrap();

        // The array is the first allocation, so its cells start at address 0.
        for idx in 0..a as usize {
            assert_eq!(
                before.load_cell(idx),
                after.load_cell(idx),
                "a = {a}, arr[{idx}]"
            );
        }
    }
}

#[test]
fn nested_secret_loop_inside_fixed_outer() {
    let orig = nested_fill();
    let mut func = nested_fill();
    let report = SecretFlowSolver::new().transform(&mut func).unwrap();

    // Only the inner loop is secret-bounded; the widened inner exit must not
    // count as an unrelaxed exit of the outer loop.
    assert_eq!(report.relaxed_loops, 1);
    assert_eq!(report.unrelaxed_loops, 0);

    let inner_body = func.layout.iter_block().nth(4).unwrap();
    for a in 0..=8 {
        let mut before = Machine::new(&orig);
        let mut after = Machine::new(&func);
        assert_eq!(before.run(&[imm32(a)]), after.run(&[imm32(a)]), "a = {a}");
        // 8 inner iterations per outer iteration, whatever the bound was.
        assert_eq!(after.block_visits(inner_body), 16, "a = {a}");
    }
}

#[test]
fn single_block_loop_trip_count_is_constant() {
    let orig = do_while_fill();
    let mut func = do_while_fill();
    let report = SecretFlowSolver::new().transform(&mut func).unwrap();
    assert_eq!(report.relaxed_loops, 1);

    let loop_block = func.layout.iter_block().nth(1).unwrap();
    for a in 0..=8 {
        let mut before = Machine::new(&orig);
        let mut after = Machine::new(&func);
        assert_eq!(before.run(&[imm32(a)]), after.run(&[imm32(a)]), "a = {a}");
        assert_eq!(after.block_visits(loop_block), 8, "a = {a}");
    }
}

#[test]
fn cfg_is_valid_after_transform() {
    let mut func = branch_or_loop();
    SecretFlowSolver::new().transform(&mut func).unwrap();

    let mut cfg = ControlFlowGraph::new();
    cfg.compute(&func);

    // No unreachable blocks remain.
    let reachable = cfg.post_order().count();
    assert_eq!(reachable, func.layout.iter_block().count());

    // Every remaining phi's incoming blocks match its block's predecessors.
    for block in func.layout.iter_block() {
        for insn in func.layout.iter_insn(block) {
            if !func.dfg.is_phi(insn) {
                continue;
            }
            let mut incomings: Vec<_> = func.dfg.phi_blocks(insn).to_vec();
            let mut preds: Vec<_> = cfg.preds_of(block).copied().collect();
            incomings.sort_unstable();
            preds.sort_unstable();
            assert_eq!(incomings, preds, "phi in {block}");
        }
    }
}

#[test]
fn secret_independent_code_is_untouched() {
    let mut builder = FunctionBuilder::new(Signature::new("mix", &[Type::I32], Type::I32));
    let entry = builder.append_block();
    builder.switch_to_block(entry);
    let a = builder.args()[0];
    let three = builder.make_imm_value(3i32);
    let v0 = builder.mul(a, three);
    let v1 = builder.add(v0, a);
    builder.ret(Some(v1));

    let mut func = builder.build();
    let before = func.to_string();
    SecretFlowSolver::new().transform(&mut func).unwrap();
    assert_eq!(func.to_string(), before);
}

/// Builds a straight-line function whose instruction operands are picked by
/// the generator, then checks the closure against a brute-force pass.
fn closure_matches_brute_force(picks: Vec<(u8, u8)>) -> bool {
    let mut builder = FunctionBuilder::new(Signature::new("gen", &[Type::I64], Type::I64));
    let entry = builder.append_block();
    builder.switch_to_block(entry);

    let arg = builder.args()[0];
    let c0 = builder.make_imm_value(3i64);
    let c1 = builder.make_imm_value(11i64);

    // Pool of candidate operands: the argument, two constants, and every
    // result built so far.
    let mut pool: Vec<Value> = vec![arg, c0, c1];
    for (lhs_pick, rhs_pick) in picks.iter().take(24) {
        let lhs = pool[*lhs_pick as usize % pool.len()];
        let rhs = pool[*rhs_pick as usize % pool.len()];
        let result = builder.add(lhs, rhs);
        pool.push(result);
    }
    let ret = *pool.last().unwrap();
    builder.ret(Some(ret));
    let func = builder.build();

    let taint = TaintSet::compute(&func);

    // Brute force: defs precede uses in a straight-line block, so a single
    // forward pass computes the transitive closure.
    let mut tainted: Vec<Value> = vec![arg];
    for insn in func.layout.iter_insn(entry) {
        if func.dfg.is_return(insn) {
            continue;
        }
        if func.dfg.insn_args(insn).iter().any(|op| tainted.contains(op)) {
            if let Some(result) = func.dfg.insn_result(insn) {
                tainted.push(result);
            }
        }
    }

    pool.iter()
        .all(|value| taint.contains_value(*value) == tainted.contains(value))
}

quickcheck! {
    fn taint_closure_soundness(picks: Vec<(u8, u8)>) -> bool {
        closure_matches_brute_force(picks)
    }
}
