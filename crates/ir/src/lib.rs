pub mod builder;
pub mod dfg;
pub mod func_cursor;
pub mod function;
pub mod insn;
pub mod interpret;
pub mod layout;
pub mod types;
pub mod value;

pub use builder::FunctionBuilder;
pub use dfg::{Block, BlockData, DataFlowGraph};
pub use function::{Function, Signature};
pub use insn::{BinaryOp, BranchInfo, Insn, InsnData, UnaryOp};
pub use layout::Layout;
pub use types::{CompoundType, CompoundTypeRef, Type, TypeStore};
pub use value::{Immediate, Value, ValueData};
