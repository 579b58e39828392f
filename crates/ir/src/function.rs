use std::fmt;

use smallvec::SmallVec;

use super::{DataFlowGraph, Insn, InsnData, Layout, Type, Value, ValueData};

#[derive(Debug, Clone)]
pub struct Signature {
    name: String,
    args: Vec<Type>,
    ret: Type,
}

impl Signature {
    pub fn new(name: &str, args: &[Type], ret: Type) -> Self {
        Self {
            name: name.to_string(),
            args: args.to_vec(),
            ret,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Type] {
        &self.args
    }

    pub fn ret_ty(&self) -> Type {
        self.ret
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub sig: Signature,
    pub arg_values: SmallVec<[Value; 8]>,
    pub dfg: DataFlowGraph,
    pub layout: Layout,
}

impl Function {
    pub fn new(sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let arg_values = sig
            .args()
            .iter()
            .enumerate()
            .map(|(idx, ty)| dfg.make_arg_value(*ty, idx))
            .collect();

        Self {
            sig,
            arg_values,
            dfg,
            layout: Layout::new(),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "func %{}(", self.sig.name())?;
        let mut delim = "";
        for (value, ty) in self.arg_values.iter().zip(self.sig.args()) {
            write!(f, "{delim}{value}.{ty}")?;
            delim = ", ";
        }
        writeln!(f, ") -> {}:", self.sig.ret_ty())?;

        for block in self.layout.iter_block() {
            writeln!(f, "    {block}:")?;
            for insn in self.layout.iter_insn(block) {
                write!(f, "        ")?;
                if let Some(result) = self.dfg.insn_result(insn) {
                    write!(f, "{result}.{} = ", self.dfg.value_ty(result))?;
                }
                write_insn(f, self, insn)?;
                writeln!(f, ";")?;
            }
        }

        Ok(())
    }
}

fn write_insn(f: &mut fmt::Formatter, func: &Function, insn: Insn) -> fmt::Result {
    let dfg = &func.dfg;
    match dfg.insn_data(insn) {
        InsnData::Unary { code, args } => {
            write!(f, "{code} ")?;
            write_value(f, func, args[0])
        }
        InsnData::Binary { code, args } => {
            write!(f, "{code} ")?;
            write_value(f, func, args[0])?;
            write!(f, " ")?;
            write_value(f, func, args[1])
        }
        InsnData::Select { args } => {
            write!(f, "select ")?;
            write_values(f, func, args)
        }
        InsnData::Alloca { ty } => write!(f, "alloca {ty}"),
        InsnData::Gep { args } => {
            write!(f, "gep ")?;
            write_values(f, func, args)
        }
        InsnData::Load { args, .. } => {
            write!(f, "load ")?;
            write_value(f, func, args[0])
        }
        InsnData::Store { args } => {
            write!(f, "store ")?;
            write_values(f, func, args)
        }
        InsnData::Jump { dests } => write!(f, "jump {}", dests[0]),
        InsnData::Branch { args, dests } => {
            write!(f, "br ")?;
            write_value(f, func, args[0])?;
            write!(f, " {} {}", dests[0], dests[1])
        }
        InsnData::Phi { values, blocks, .. } => {
            write!(f, "phi")?;
            for (value, block) in values.iter().zip(blocks.iter()) {
                write!(f, " (")?;
                write_value(f, func, *value)?;
                write!(f, " {block})")?;
            }
            Ok(())
        }
        InsnData::Return { args } => match args {
            Some(value) => {
                write!(f, "return ")?;
                write_value(f, func, *value)
            }
            None => write!(f, "return"),
        },
    }
}

fn write_value(f: &mut fmt::Formatter, func: &Function, value: Value) -> fmt::Result {
    match func.dfg.value_data(value) {
        ValueData::Immediate { imm, ty } => write!(f, "{imm}.{ty}"),
        _ => write!(f, "{value}"),
    }
}

fn write_values(f: &mut fmt::Formatter, func: &Function, values: &[Value]) -> fmt::Result {
    let mut delim = "";
    for value in values {
        write!(f, "{delim}")?;
        write_value(f, func, *value)?;
        delim = " ";
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;

    #[test]
    fn display_simple_func() {
        let mut builder = FunctionBuilder::new(Signature::new("add2", &[Type::I32], Type::I32));
        let entry = builder.append_block();
        builder.switch_to_block(entry);
        let arg = builder.args()[0];
        let two = builder.make_imm_value(2i32);
        let ret = builder.add(arg, two);
        builder.ret(Some(ret));

        let func = builder.build();
        let text = func.to_string();
        assert!(text.contains("func %add2(v0.i32) -> i32:"));
        assert!(text.contains("add v0 2.i32"));
    }
}
