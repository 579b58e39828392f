//! This module contains implementation of `Post Dominator Tree`.

use veil_ir::{Block, Function};

use super::{
    cfg::ControlFlowGraph,
    domtree::{DFSet, DomTree},
};

#[derive(Debug)]
pub struct PostDomTree {
    /// Dummy entry block, required to handle functions with multiple exits
    /// uniformly.
    entry: Block,
    /// Canonical dummy exit block. All blocks ending with `return` have an
    /// edge to this block.
    exit: Block,

    /// Reverse control flow graph of the function.
    rcfg: ControlFlowGraph,

    /// Dominator tree of reverse control flow graph.
    domtree: DomTree,
}

impl Default for PostDomTree {
    fn default() -> Self {
        Self {
            entry: Block(0),
            exit: Block(0),
            rcfg: ControlFlowGraph::default(),
            domtree: DomTree::default(),
        }
    }
}

impl PostDomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, func: &Function) {
        self.clear();

        self.rcfg.compute(func);
        let Some(real_entry) = self.rcfg.entry() else {
            return;
        };

        self.entry = Block(func.dfg.blocks_num() as u32);
        self.exit = Block(self.entry.0 + 1);

        // Add edges from dummy entry block to real entry block and dummy exit block.
        self.rcfg.add_edge(self.entry, real_entry);
        self.rcfg.add_edge(self.entry, self.exit);

        // Add edges from real exit blocks to dummy exit block.
        let real_exits = std::mem::take(&mut self.rcfg.exits);
        for exit in &real_exits {
            self.rcfg.add_edge(*exit, self.exit);
        }

        self.rcfg.reverse_edges(self.exit, &[self.entry]);
        self.domtree.compute(&self.rcfg);
    }

    pub fn idom_of(&self, block: Block) -> Option<PDTIdom> {
        match self.domtree.idom_of(block)? {
            block if block == self.entry => Some(PDTIdom::DummyEntry(self.entry)),
            block if block == self.exit => Some(PDTIdom::DummyExit(self.exit)),
            other => Some(PDTIdom::Real(other)),
        }
    }

    /// Walks up the post dominator tree and returns the nearest real post
    /// dominator of `block`, if one exists.
    pub fn real_post_dom_of(&self, block: Block) -> Option<Block> {
        match self.idom_of(block)? {
            PDTIdom::Real(block) => Some(block),
            PDTIdom::DummyEntry(_) | PDTIdom::DummyExit(_) => None,
        }
    }

    /// Returns `true` if `block1` post dominates `block2`.
    pub fn post_dominates(&self, block1: Block, block2: Block) -> bool {
        self.domtree.dominates(block1, block2)
    }

    pub fn clear(&mut self) {
        self.rcfg.clear();
        self.domtree.clear();
    }

    /// Compute post dominance frontiers of each blocks.
    pub fn compute_df(&self) -> PDFSet {
        let df_set = self.domtree.compute_df(&self.rcfg);

        PDFSet {
            entry: self.entry,
            exit: self.exit,
            df_set,
        }
    }

    /// Returns `true` if block is reachable from the exit blocks.
    pub fn is_reachable(&self, block: Block) -> bool {
        self.domtree.is_reachable(block)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PDTIdom {
    DummyEntry(Block),
    DummyExit(Block),
    Real(Block),
}

/// Post Dominance frontiers of each blocks.
#[derive(Debug)]
pub struct PDFSet {
    /// Dummy entry block of the post dominator tree.
    entry: Block,

    /// Canonical dummy exit block of the post dominator tree.
    exit: Block,

    df_set: DFSet,
}

impl PDFSet {
    pub fn frontiers(&self, block: Block) -> impl Iterator<Item = &Block> {
        self.df_set
            .frontiers(block)
            .filter(|block| **block != self.entry && **block != self.exit)
    }

    pub fn in_frontier_of(&self, block: Block, of: Block) -> bool {
        self.df_set.in_frontier_of(block, of)
    }

    pub fn frontier_num_of(&self, of: Block) -> usize {
        self.frontiers(of).count()
    }

    pub fn clear(&mut self) {
        self.df_set.clear();
    }
}

impl Default for PDFSet {
    fn default() -> Self {
        Self {
            entry: Block(0),
            exit: Block(0),
            df_set: DFSet::default(),
        }
    }
}
