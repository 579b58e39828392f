//! Loop bound relaxation.
//!
//! For each natural loop whose exit test depends on a secret value and whose
//! induction variable indexes a fixed-size stack array, the exit test is
//! widened to the array's static extent. A masking predicate cloned from the
//! original comparison keeps the loop's memory effects and loop-carried
//! values identical to the unrelaxed function, so the loop always runs a
//! secret-independent number of iterations while computing the same result.
use veil_ir::{
    func_cursor::{CursorLocation, FuncCursor, InsnInserter},
    BinaryOp, Block, Function, Immediate, Insn, InsnData, Value,
};

use super::{
    cfg::ControlFlowGraph,
    domtree::DomTree,
    loop_analysis::{Loop, LoopTree},
    taint::TaintSet,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelaxReport {
    /// Loops whose bound was widened to an array extent.
    pub relaxed: usize,
    /// Loops with a secret-dependent exit that no array was found to bound.
    /// These stay observable; linearization still handles their diamonds.
    pub unrelaxed: usize,
}

#[derive(Debug, Default)]
pub struct RelaxSolver {
    cfg: ControlFlowGraph,
    domtree: DomTree,
    lpt: LoopTree,
}

struct InputBr {
    cond: Value,
    block: Block,
    continue_on_true: bool,
}

impl RelaxSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.cfg.clear();
        self.domtree.clear();
        self.lpt.clear();
    }

    pub fn run(&mut self, func: &mut Function, taint: &TaintSet) -> RelaxReport {
        self.clear();
        self.cfg.compute(func);
        self.domtree.compute(&self.cfg);
        self.lpt.compute(&self.cfg, &self.domtree);

        let mut report = RelaxReport::default();
        let mut taint = taint.clone();

        // Innermost loops first. Widening a bound and predicating the body
        // never changes loop membership, and removing a guard only deletes a
        // loop-skipping edge, so the loop tree stays valid across iterations.
        let loops: Vec<Loop> = self.lpt.loops().collect();
        for lp in loops.into_iter().rev() {
            match self.relax_loop(func, &taint, lp) {
                RelaxOutcome::Relaxed => {
                    report.relaxed += 1;
                    // The widened exit no longer derives from the secret
                    // bound; an enclosing loop must not treat it as one of
                    // its own input branches.
                    taint = TaintSet::compute(func);
                }
                RelaxOutcome::NoSecretExit => {}
                RelaxOutcome::NoBoundingArray => report.unrelaxed += 1,
            }
        }

        report
    }

    fn relax_loop(&mut self, func: &mut Function, taint: &TaintSet, lp: Loop) -> RelaxOutcome {
        let header = self.lpt.loop_header(lp);
        let (Some(latch), Some(preheader)) = (
            self.lpt.latch_of(&self.cfg, lp),
            self.lpt.preheader_of(&self.cfg, lp),
        ) else {
            return RelaxOutcome::NoBoundingArray;
        };

        let blocks: Vec<Block> = func
            .layout
            .iter_block()
            .filter(|block| self.lpt.is_in_loop(*block, lp))
            .collect();

        let input_brs = self.collect_input_brs(func, taint, lp, &blocks);
        if input_brs.is_empty() {
            return RelaxOutcome::NoSecretExit;
        }

        // Find an address computation whose index reaches one of the
        // secret-dependent exit conditions.
        for &block in &blocks {
            let geps: Vec<Insn> = func
                .layout
                .iter_insn(block)
                .filter(|insn| matches!(func.dfg.insn_data(*insn), InsnData::Gep { .. }))
                .collect();

            for gep in geps {
                let base = func.dfg.insn_arg(gep, 0);
                let index = func.dfg.insn_arg(gep, 1);

                let Some(extent) = array_extent(func, base) else {
                    continue;
                };

                let closure = TaintSet::compute_from(func, &[index]);
                let Some(input_br) = input_brs
                    .iter()
                    .find(|br| closure.contains_value(br.cond))
                else {
                    continue;
                };

                if self.widen_bound(
                    func, taint, lp, input_br, &closure, extent, header, latch, preheader,
                ) {
                    self.remove_guard(func, taint, preheader);
                    return RelaxOutcome::Relaxed;
                }
            }
        }

        RelaxOutcome::NoBoundingArray
    }

    fn collect_input_brs(
        &self,
        func: &Function,
        taint: &TaintSet,
        lp: Loop,
        blocks: &[Block],
    ) -> Vec<InputBr> {
        let mut input_brs = Vec::new();

        for &block in blocks {
            let Some(term) = func.layout.last_insn_of(block) else {
                continue;
            };
            let InsnData::Branch { args, dests } = func.dfg.insn_data(term) else {
                continue;
            };
            if !taint.contains_insn(term) {
                continue;
            }
            // A branch whose both targets leave the loop carries no trip
            // count information.
            if dests.iter().all(|dest| !self.lpt.is_in_loop(*dest, lp)) {
                continue;
            }

            input_brs.push(InputBr {
                cond: args[0],
                block,
                continue_on_true: self.lpt.is_in_loop(dests[0], lp),
            });
        }

        input_brs
    }

    /// Rewrites the exit comparison so the loop runs over the array's whole
    /// extent, then predicates the body so masked iterations are no-ops.
    #[allow(clippy::too_many_arguments)]
    fn widen_bound(
        &self,
        func: &mut Function,
        taint: &TaintSet,
        lp: Loop,
        input_br: &InputBr,
        index_closure: &TaintSet,
        extent: usize,
        header: Block,
        latch: Block,
        preheader: Block,
    ) -> bool {
        let Some(cmp_insn) = func.dfg.value_insn(input_br.cond) else {
            return false;
        };
        let InsnData::Binary { code, args } = func.dfg.insn_data(cmp_insn).clone() else {
            return false;
        };
        if !code.is_cmp() {
            return false;
        }

        // Normalize the comparison so it reads `index op bound`.
        let idx_in_lhs = index_closure.contains_value(args[0]);
        let idx_in_rhs = index_closure.contains_value(args[1]);
        let (index_op, bound_op, bound_pos, op) = match (idx_in_lhs, idx_in_rhs) {
            (true, false) => (args[0], args[1], 1, code),
            (false, true) => (args[1], args[0], 0, mirror(code)),
            _ => return false,
        };

        // The sense the loop continues with: `continue while index cont_op bound`.
        let cont_op = if input_br.continue_on_true {
            op
        } else {
            negate(op)
        };
        let Some(dir) = direction_of(cont_op) else {
            return false;
        };
        let n = extent as i64;

        let induction_phi = self.find_induction_phi(func, header, index_op);

        // Plan the whole rewrite before mutating anything; a declined rewrite
        // must leave the comparison and the phi untouched.
        let widen_to = if taint.contains_value(bound_op) && !index_closure.contains_value(bound_op)
        {
            Some(match (dir, cont_op) {
                (Direction::Up, BinaryOp::Lt | BinaryOp::Slt) => n,
                (Direction::Up, _) => n - 1,
                (Direction::Down, _) => 0,
            })
        } else {
            None
        };

        let mut phi_info = None;
        if let Some(phi) = induction_phi {
            let Some(pos) = func
                .dfg
                .phi_blocks(phi)
                .iter()
                .position(|block| *block == preheader)
            else {
                return false;
            };
            phi_info = Some((phi, pos, func.dfg.insn_arg(phi, pos)));
        }
        let replace_init = matches!(
            phi_info,
            Some((.., init)) if taint.contains_value(init) && !func.dfg.is_imm(init)
        );

        if widen_to.is_none() && !replace_init {
            return false;
        }

        // Groups of comparison terms: the terms within a group are Or-ed and
        // the groups are And-ed into the final mask.
        let mut mask_groups: Vec<Vec<InsnData>> = Vec::new();

        if widen_to.is_some() {
            // The mask must hold exactly on the iterations the original loop
            // executed, so the cloned comparison is rebuilt in the continue
            // sense over values of the current iteration.
            if input_br.block == header && header != latch {
                // Exit tested before the body runs.
                mask_groups.push(vec![InsnData::binary(cont_op, index_op, bound_op)]);
            } else if input_br.block == latch {
                // Exit tested after the body: the test that admitted this
                // iteration ran in the previous one, over the value now held
                // by the induction phi, and the first iteration always ran.
                let Some((phi, _, init)) = phi_info else {
                    return false;
                };
                let Some(phi_result) = func.dfg.insn_result(phi) else {
                    return false;
                };
                let Some(latch_pos) = func
                    .dfg
                    .phi_blocks(phi)
                    .iter()
                    .position(|block| *block == latch)
                else {
                    return false;
                };
                if index_op != func.dfg.insn_arg(phi, latch_pos) || replace_init {
                    return false;
                }
                mask_groups.push(vec![
                    InsnData::binary(cont_op, phi_result, bound_op),
                    InsnData::binary(BinaryOp::Eq, phi_result, init),
                ]);
            } else {
                // Exit tested mid-body; the iterations before and after the
                // test would need different masks.
                return false;
            }
        }

        // (b) Replace the secret-derived bound with a constant chosen so the
        // relaxed test still continues for every index inside the array.
        if let Some(widened) = widen_to {
            let ty = func.dfg.value_ty(bound_op);
            let widened = func.dfg.make_imm_value(Immediate::from_i64(widened, ty));
            func.dfg.replace_insn_arg(cmp_insn, widened, bound_pos);
        }

        // (c) A secret initial value of the induction phi is widened
        // symmetrically to the start of the array.
        if replace_init {
            let (phi, pos, init) = phi_info.expect("init replacement implies an induction phi");
            let start = match dir {
                Direction::Up => 0,
                Direction::Down => n - 1,
            };
            let ty = func.dfg.value_ty(init);
            let start = func.dfg.make_imm_value(Immediate::from_i64(start, ty));
            let phi_result = func
                .dfg
                .insn_result(phi)
                .expect("phi always produces a value");
            func.dfg.replace_insn_arg(phi, start, pos);

            // Iterations the original never ran are those before the secret
            // start.
            let started = match dir {
                Direction::Up => started_op(cont_op),
                Direction::Down => mirror(started_op(cont_op)),
            };
            mask_groups.push(vec![InsnData::binary(started, phi_result, init)]);
        }

        let mask = self.insert_mask(func, header, mask_groups);
        self.predicate_stores(func, lp, mask);
        self.predicate_carried_phis(func, header, latch, induction_phi, mask);

        true
    }

    /// The loop-header phi whose value chain produces the comparison's index
    /// operand.
    fn find_induction_phi(&self, func: &Function, header: Block, index_op: Value) -> Option<Insn> {
        for insn in func.layout.iter_insn(header) {
            if !func.dfg.is_phi(insn) {
                continue;
            }
            let result = func.dfg.insn_result(insn)?;
            if result == index_op {
                return Some(insn);
            }
            let closure = TaintSet::compute_from(func, &[result]);
            if closure.contains_value(index_op) {
                return Some(insn);
            }
        }
        None
    }

    /// Materializes the masking predicate right after the header phis, so it
    /// dominates every body instruction including single-block loops. Terms
    /// within a group are Or-ed, groups are And-ed.
    fn insert_mask(&self, func: &mut Function, header: Block, groups: Vec<Vec<InsnData>>) -> Value {
        let last_phi = func
            .layout
            .iter_insn(header)
            .take_while(|insn| func.dfg.is_phi(*insn))
            .last();
        let loc = match last_phi {
            Some(insn) => CursorLocation::At(insn),
            None => CursorLocation::BlockTop(header),
        };

        let mut inserter = InsnInserter::new(func, loc);
        let fold = |inserter: &mut InsnInserter, acc: Option<Value>, term: InsnData, op| {
            let (insn, value) = inserter.insert_insn_data_with_result(term);
            inserter.set_loc(CursorLocation::At(insn));
            match acc {
                None => value,
                Some(prev) => {
                    let (insn, value) = inserter
                        .insert_insn_data_with_result(InsnData::binary(op, prev, value));
                    inserter.set_loc(CursorLocation::At(insn));
                    value
                }
            }
        };

        let mut mask: Option<Value> = None;
        for group in groups {
            let mut group_val: Option<Value> = None;
            for term in group {
                group_val = Some(fold(&mut inserter, group_val, term, BinaryOp::Or));
            }
            let group_val = group_val.expect("mask groups are never empty");
            mask = Some(match mask {
                None => group_val,
                Some(prev) => {
                    let (insn, value) = inserter.insert_insn_data_with_result(InsnData::binary(
                        BinaryOp::And,
                        prev,
                        group_val,
                    ));
                    inserter.set_loc(CursorLocation::At(insn));
                    value
                }
            });
        }

        mask.expect("mask groups are never empty")
    }

    /// Every store in the loop becomes `store (select mask new old)`, so a
    /// masked iteration rewrites the old cell contents.
    fn predicate_stores(&self, func: &mut Function, lp: Loop, mask: Value) {
        let stores: Vec<Insn> = func
            .layout
            .iter_block()
            .filter(|block| self.lpt.is_in_loop(*block, lp))
            .flat_map(|block| func.layout.iter_insn(block))
            .filter(|insn| matches!(func.dfg.insn_data(*insn), InsnData::Store { .. }))
            .collect();

        for store in stores {
            let value = func.dfg.insn_arg(store, 0);
            let addr = func.dfg.insn_arg(store, 1);
            let ty = func.dfg.value_ty(value);

            let loc = match func.layout.prev_insn_of(store) {
                Some(prev) => CursorLocation::At(prev),
                None => CursorLocation::BlockTop(func.layout.insn_block(store)),
            };
            let mut inserter = InsnInserter::new(func, loc);
            let (load, old) =
                inserter.insert_insn_data_with_result(InsnData::Load { args: [addr], ty });
            inserter.set_loc(CursorLocation::At(load));
            let (_, selected) =
                inserter.insert_insn_data_with_result(InsnData::select(mask, value, old));

            func.dfg.replace_insn_arg(store, selected, 0);
        }
    }

    /// Loop-carried phis other than the induction phi keep their previous
    /// value through masked iterations.
    fn predicate_carried_phis(
        &self,
        func: &mut Function,
        header: Block,
        latch: Block,
        induction_phi: Option<Insn>,
        mask: Value,
    ) {
        let phis: Vec<Insn> = func
            .layout
            .iter_insn(header)
            .filter(|insn| func.dfg.is_phi(*insn))
            .filter(|insn| Some(*insn) != induction_phi)
            .collect();

        for phi in phis {
            let Some(pos) = func
                .dfg
                .phi_blocks(phi)
                .iter()
                .position(|block| *block == latch)
            else {
                continue;
            };
            let latch_val = func.dfg.insn_arg(phi, pos);
            let Some(phi_result) = func.dfg.insn_result(phi) else {
                continue;
            };
            if latch_val == phi_result {
                continue;
            }

            let loc = match func
                .layout
                .last_insn_of(latch)
                .and_then(|term| func.layout.prev_insn_of(term))
            {
                Some(prev) => CursorLocation::At(prev),
                None => CursorLocation::BlockTop(latch),
            };
            let mut inserter = InsnInserter::new(func, loc);
            let (_, selected) =
                inserter.insert_insn_data_with_result(InsnData::select(mask, latch_val, phi_result));

            func.dfg.replace_insn_arg(phi, selected, pos);
        }
    }

    /// A secret guard in front of a relaxed loop is deleted: the widened loop
    /// runs a fixed number of real or masked iterations, so skipping it no
    /// longer carries information.
    fn remove_guard(&mut self, func: &mut Function, taint: &TaintSet, preheader: Block) {
        let preds: Vec<Block> = self.cfg.preds_of(preheader).copied().collect();
        let [guard] = preds.as_slice() else {
            return;
        };
        let guard = *guard;

        let Some(term) = func.layout.last_insn_of(guard) else {
            return;
        };
        let InsnData::Branch { dests, .. } = func.dfg.insn_data(term) else {
            return;
        };
        if !taint.contains_insn(term) {
            return;
        }
        let skipped = if dests[0] == preheader {
            dests[1]
        } else if dests[1] == preheader {
            dests[0]
        } else {
            return;
        };

        // Phis in the skipped block lose their incoming edge from the guard.
        let phis: Vec<Insn> = func
            .layout
            .iter_insn(skipped)
            .filter(|insn| func.dfg.is_phi(*insn))
            .collect();
        for phi in phis {
            if func.dfg.phi_blocks(phi).contains(&guard) {
                func.dfg.remove_phi_arg(phi, guard);
            }
        }

        func.dfg.remove_branch_dest(term, skipped);
        self.cfg.remove_edge(guard, skipped);
    }
}

enum RelaxOutcome {
    Relaxed,
    NoSecretExit,
    NoBoundingArray,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Counting direction implied by the continue-sense of the exit comparison.
/// Only the four orderings are relaxable; an `Ne` continue test holds past
/// the true bound as well, so no mask derived from it can cancel the extra
/// iterations.
fn direction_of(op: BinaryOp) -> Option<Direction> {
    match op {
        BinaryOp::Lt | BinaryOp::Slt | BinaryOp::Le | BinaryOp::Sle => Some(Direction::Up),
        BinaryOp::Gt | BinaryOp::Sgt | BinaryOp::Ge | BinaryOp::Sge => Some(Direction::Down),
        _ => None,
    }
}

/// Swaps the operand order of a comparison.
fn mirror(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Ge => BinaryOp::Le,
        BinaryOp::Slt => BinaryOp::Sgt,
        BinaryOp::Sgt => BinaryOp::Slt,
        BinaryOp::Sle => BinaryOp::Sge,
        BinaryOp::Sge => BinaryOp::Sle,
        other => other,
    }
}

fn negate(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Ge,
        BinaryOp::Ge => BinaryOp::Lt,
        BinaryOp::Gt => BinaryOp::Le,
        BinaryOp::Le => BinaryOp::Gt,
        BinaryOp::Slt => BinaryOp::Sge,
        BinaryOp::Sge => BinaryOp::Slt,
        BinaryOp::Sgt => BinaryOp::Sle,
        BinaryOp::Sle => BinaryOp::Sgt,
        BinaryOp::Eq => BinaryOp::Ne,
        BinaryOp::Ne => BinaryOp::Eq,
        other => other,
    }
}

/// `index started_op(cmp) secret_start` holds exactly for the iterations the
/// original loop would have executed, given an up-counting comparison.
fn started_op(op: BinaryOp) -> BinaryOp {
    if matches!(
        op,
        BinaryOp::Slt | BinaryOp::Sle | BinaryOp::Sgt | BinaryOp::Sge
    ) {
        BinaryOp::Sge
    } else {
        BinaryOp::Ge
    }
}

/// Static element count of the array behind `base`, if `base` is a pointer
/// to a fixed-size array.
fn array_extent(func: &Function, base: Value) -> Option<usize> {
    let base_ty = func.dfg.value_ty(base);
    let pointee = func.dfg.types.deref(base_ty)?;
    let (_, len) = func.dfg.types.array_def(pointee)?;
    Some(len)
}
