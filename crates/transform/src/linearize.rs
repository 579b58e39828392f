//! Control flow linearization.
//!
//! Serializes secret-dependent branching into one chain of unconditionally
//! connected blocks. The information a branch used to carry moves into the
//! data flow: phi merges become select chains keyed by the branch conditions
//! that used to pick the path. Loops survive as back-edges, and a loop guard
//! with a secret-independent condition stays conditional.
use rustc_hash::FxHashSet;
use veil_ir::{
    func_cursor::{CursorLocation, FuncCursor, InsnInserter},
    Block, Function, Insn, InsnData, Value,
};

use super::{
    cfg::ControlFlowGraph, domtree::DomTree, loop_analysis::LoopTree, post_domtree::PostDomTree,
    taint::TaintSet, TransformError,
};

#[derive(Debug, Default)]
pub struct LinearizeSolver {
    cfg: ControlFlowGraph,
    domtree: DomTree,
    post_domtree: PostDomTree,
    lpt: LoopTree,
}

impl LinearizeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.cfg.clear();
        self.domtree.clear();
        self.post_domtree.clear();
        self.lpt.clear();
    }

    pub fn run(&mut self, func: &mut Function, taint: &TaintSet) -> Result<(), TransformError> {
        self.clear();
        self.cfg.compute(func);
        self.domtree.compute(&self.cfg);
        self.post_domtree.compute(func);
        self.lpt.compute(&self.cfg, &self.domtree);

        let entry = func
            .layout
            .entry_block()
            .ok_or(TransformError::NoEntryBlock)?;

        self.verify_simplified()?;

        let mut order = Vec::new();
        let mut visited = FxHashSet::default();
        let mut kept = FxHashSet::default();
        self.serialize(func, taint, entry, None, &mut order, &mut visited, &mut kept)?;

        let edges = self.surviving_edges(func, &order, &kept);
        self.reduce_phis(func, &order, &edges)?;
        self.rewrite_terminators(func, &order, &kept);
        self.remove_dead_blocks(func, &visited);

        Ok(())
    }

    /// Every loop must have a unique latch and a unique out-of-loop entry
    /// edge. Anything else would force block duplication during
    /// serialization.
    fn verify_simplified(&self) -> Result<(), TransformError> {
        for lp in self.lpt.loops() {
            if self.lpt.latch_of(&self.cfg, lp).is_none()
                || self.lpt.preheader_of(&self.cfg, lp).is_none()
            {
                return Err(TransformError::LoopNotSimplified(self.lpt.loop_header(lp)));
            }
        }
        Ok(())
    }

    /// Depth-first serialization. Pushes blocks in the order they will be
    /// chained, recording which conditional terminators stay conditional.
    #[allow(clippy::too_many_arguments)]
    fn serialize(
        &self,
        func: &Function,
        taint: &TaintSet,
        start: Block,
        stop: Option<Block>,
        order: &mut Vec<Block>,
        visited: &mut FxHashSet<Block>,
        kept: &mut FxHashSet<Insn>,
    ) -> Result<(), TransformError> {
        let mut current = start;
        loop {
            if Some(current) == stop || !visited.insert(current) {
                return Ok(());
            }
            order.push(current);

            let Some(term) = func.layout.last_insn_of(current) else {
                return Ok(());
            };
            match *func.dfg.insn_data(term) {
                InsnData::Jump { dests } => current = dests[0],

                InsnData::Branch { dests, .. } => {
                    // A loop exit branch keeps the back-edge alive; recurse
                    // into the loop body, then continue at the exit.
                    if let Some(lp) = self.lpt.loop_of_block(current) {
                        let in0 = self.lpt.is_in_loop(dests[0], lp);
                        let in1 = self.lpt.is_in_loop(dests[1], lp);
                        if in0 != in1 {
                            kept.insert(term);
                            let (inside, outside) =
                                if in0 { (dests[0], dests[1]) } else { (dests[1], dests[0]) };
                            self.serialize(func, taint, inside, stop, order, visited, kept)?;
                            current = outside;
                            continue;
                        }
                    }

                    match self.post_domtree.real_post_dom_of(current) {
                        Some(reconv) => {
                            // A secret-independent guard jumping straight to
                            // the reconvergence point stays intact; only the
                            // guarded region itself is serialized.
                            if !taint.contains_insn(term)
                                && (dests[0] == reconv || dests[1] == reconv)
                            {
                                kept.insert(term);
                                let arm = if dests[0] == reconv { dests[1] } else { dests[0] };
                                self.serialize(
                                    func,
                                    taint,
                                    arm,
                                    Some(reconv),
                                    order,
                                    visited,
                                    kept,
                                )?;
                                current = reconv;
                                continue;
                            }

                            self.serialize(
                                func,
                                taint,
                                dests[0],
                                Some(reconv),
                                order,
                                visited,
                                kept,
                            )?;
                            self.serialize(
                                func,
                                taint,
                                dests[1],
                                Some(reconv),
                                order,
                                visited,
                                kept,
                            )?;
                            current = reconv;
                        }

                        None => {
                            // No reconvergence point. Tolerable only when the
                            // divergence carries no secret, e.g. two arms
                            // that both return.
                            if taint.contains_insn(term) {
                                return Err(TransformError::UnresolvedReconvergence(current));
                            }
                            kept.insert(term);
                            self.serialize(func, taint, dests[0], stop, order, visited, kept)?;
                            current = dests[1];
                        }
                    }
                }

                // Return ends the chain.
                _ => return Ok(()),
            }
        }
    }

    /// Predicts the edge set of the rewritten CFG without mutating anything.
    /// Used to decide which phis keep all their incoming edges.
    fn surviving_edges(
        &self,
        func: &Function,
        order: &[Block],
        kept: &FxHashSet<Insn>,
    ) -> FxHashSet<(Block, Block)> {
        let mut edges = FxHashSet::default();
        for (idx, &block) in order.iter().enumerate() {
            let Some(term) = func.layout.last_insn_of(block) else {
                continue;
            };
            if kept.contains(&term) {
                if let InsnData::Branch { dests, .. } = func.dfg.insn_data(term) {
                    edges.insert((block, dests[0]));
                    edges.insert((block, dests[1]));
                }
                continue;
            }
            match *func.dfg.insn_data(term) {
                // A jump to a dominator is a back-edge and is never rewritten.
                InsnData::Jump { dests } if self.domtree.dominates(dests[0], block) => {
                    edges.insert((block, dests[0]));
                }
                InsnData::Jump { .. } | InsnData::Branch { .. } => {
                    if let Some(&next) = order.get(idx + 1) {
                        edges.insert((block, next));
                    }
                }
                _ => {}
            }
        }
        edges
    }

    /// Eliminates every phi that will lose an incoming edge, folding its
    /// incoming values into a select chain keyed by the branch conditions of
    /// the nearest common dominators.
    fn reduce_phis(
        &self,
        func: &mut Function,
        order: &[Block],
        edges: &FxHashSet<(Block, Block)>,
    ) -> Result<(), TransformError> {
        for &block in order {
            let phis: Vec<Insn> = func
                .layout
                .iter_insn(block)
                .filter(|insn| func.dfg.is_phi(*insn))
                .collect();

            for phi in phis {
                let incomings = func.dfg.phi_blocks(phi).to_vec();

                // A loop header phi survives; serialization may have changed
                // which block falls through into the header, so the entry
                // side label is rewired to the new predecessor.
                if incomings
                    .iter()
                    .any(|from| self.domtree.dominates(block, *from))
                {
                    self.rewire_header_phi(func, block, phi, &incomings, edges);
                    continue;
                }

                if incomings.len() >= 2
                    && incomings.iter().all(|from| edges.contains(&(*from, block)))
                {
                    continue;
                }

                if incomings.len() == 1 {
                    let value = func.dfg.insn_arg(phi, 0);
                    if let Some(result) = func.dfg.insn_result(phi) {
                        func.dfg.replace_uses(result, value);
                    }
                    func.dfg.remove_user(phi);
                    func.layout.remove_insn(phi);
                    continue;
                }

                self.fold_phi_to_selects(func, block, phi)?;
            }
        }
        Ok(())
    }

    fn rewire_header_phi(
        &self,
        func: &mut Function,
        block: Block,
        phi: Insn,
        incomings: &[Block],
        edges: &FxHashSet<(Block, Block)>,
    ) {
        for &from in incomings {
            if edges.contains(&(from, block)) {
                continue;
            }
            let new_pred = edges
                .iter()
                .find(|(pred, to)| *to == block && !incomings.contains(pred))
                .map(|(pred, _)| *pred);
            if let Some(new_pred) = new_pred {
                func.dfg.rewrite_phi_block(phi, from, new_pred);
            }
        }
    }

    /// Merges incoming values pairwise, deepest reconvergence first, so
    /// nested diamonds fold inner selects before outer ones.
    fn fold_phi_to_selects(
        &self,
        func: &mut Function,
        block: Block,
        phi: Insn,
    ) -> Result<(), TransformError> {
        let mut pending: Vec<(Value, Block)> = func
            .dfg
            .insn_args(phi)
            .iter()
            .copied()
            .zip(func.dfg.phi_blocks(phi).iter().copied())
            .collect();

        let ambiguous = TransformError::AmbiguousPhiMerge(block);

        while pending.len() > 1 {
            let (lhs, rhs, ncd) = self
                .deepest_pair(&pending)
                .ok_or_else(|| ambiguous.clone())?;
            let (acc_val, acc_block) = pending[lhs];
            let (val, from) = pending[rhs];

            let term = func
                .layout
                .last_insn_of(ncd)
                .ok_or_else(|| ambiguous.clone())?;
            let InsnData::Branch { args, dests } = *func.dfg.insn_data(term) else {
                return Err(ambiguous);
            };
            let cond = args[0];

            let acc_side = self.side_of(dests[0], dests[1], acc_block);
            let new_side = self.side_of(dests[0], dests[1], from);
            let (then_val, else_val) = match (acc_side, new_side) {
                (Some(Side::Then), Some(Side::Else))
                | (Some(Side::Then), None)
                | (None, Some(Side::Else)) => (acc_val, val),
                (Some(Side::Else), Some(Side::Then))
                | (Some(Side::Else), None)
                | (None, Some(Side::Then)) => (val, acc_val),
                _ => return Err(ambiguous),
            };
            let select = InsnData::select(cond, then_val, else_val);

            if pending.len() == 2 {
                // The last select takes the phi's place so the phi's result
                // value and its users stay valid.
                func.dfg.replace_insn(phi, select);
                return Ok(());
            }

            let loc = match func.layout.prev_insn_of(phi) {
                Some(prev) => CursorLocation::At(prev),
                None => CursorLocation::BlockTop(block),
            };
            let mut inserter = InsnInserter::new(func, loc);
            let (_, value) = inserter.insert_insn_data_with_result(select);

            pending.remove(rhs.max(lhs));
            pending.remove(rhs.min(lhs));
            pending.push((value, ncd));
        }

        Ok(())
    }

    /// The pair of pending incomings whose nearest common dominator sits
    /// deepest in the dominator tree.
    fn deepest_pair(&self, pending: &[(Value, Block)]) -> Option<(usize, usize, Block)> {
        let mut best: Option<(usize, usize, Block, usize)> = None;
        for lhs in 0..pending.len() {
            for rhs in lhs + 1..pending.len() {
                let Some(ncd) = self.nearest_common_dom(pending[lhs].1, pending[rhs].1) else {
                    continue;
                };
                let depth = self.dom_depth(ncd);
                if best.map_or(true, |(.., best_depth)| depth > best_depth) {
                    best = Some((lhs, rhs, ncd, depth));
                }
            }
        }
        best.map(|(lhs, rhs, ncd, _)| (lhs, rhs, ncd))
    }

    fn dom_depth(&self, block: Block) -> usize {
        let mut depth = 0;
        let mut finger = block;
        while let Some(idom) = self.domtree.idom_of(finger) {
            depth += 1;
            finger = idom;
        }
        depth
    }

    /// Which arm of the branch at the nearest common dominator reaches
    /// `block`.
    fn side_of(&self, then_dest: Block, else_dest: Block, block: Block) -> Option<Side> {
        if block == then_dest || self.domtree.strictly_dominates(then_dest, block) {
            Some(Side::Then)
        } else if block == else_dest || self.domtree.strictly_dominates(else_dest, block) {
            Some(Side::Else)
        } else {
            None
        }
    }

    fn nearest_common_dom(&self, block1: Block, block2: Block) -> Option<Block> {
        let mut finger = block1;
        loop {
            if self.domtree.dominates(finger, block2) {
                return Some(finger);
            }
            finger = self.domtree.idom_of(finger)?;
        }
    }

    /// Chains the serialized blocks: serialized conditional branches become
    /// jumps to the next block in order, serialized jumps are redirected
    /// there, back-edges and kept branches stay as they are.
    fn rewrite_terminators(&self, func: &mut Function, order: &[Block], kept: &FxHashSet<Insn>) {
        for (idx, &block) in order.iter().enumerate() {
            let Some(term) = func.layout.last_insn_of(block) else {
                continue;
            };
            if kept.contains(&term) {
                continue;
            }
            match *func.dfg.insn_data(term) {
                InsnData::Jump { dests } => {
                    if self.domtree.dominates(dests[0], block) {
                        continue;
                    }
                    if let Some(&next) = order.get(idx + 1) {
                        if dests[0] != next {
                            func.dfg.rewrite_branch_dest(term, dests[0], next);
                        }
                    }
                }
                InsnData::Branch { .. } => {
                    if let Some(&next) = order.get(idx + 1) {
                        func.dfg.replace_insn(term, InsnData::jump(next));
                    }
                }
                _ => {}
            }
        }
    }

    fn remove_dead_blocks(&self, func: &mut Function, visited: &FxHashSet<Block>) {
        let dead: Vec<Block> = func
            .layout
            .iter_block()
            .filter(|block| !visited.contains(block))
            .collect();
        for block in dead {
            let mut inserter = InsnInserter::new(func, CursorLocation::BlockTop(block));
            inserter.remove_block();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Then,
    Else,
}
