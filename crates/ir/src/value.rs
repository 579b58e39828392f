//! This module contains Veil IR value definitions.
use core::fmt;
use std::ops;

use cranelift_entity::entity_impl;

use super::{Insn, Type};

/// An opaque reference to [`ValueData`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct Value(pub u32);
entity_impl!(Value, "v");

/// A value data definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueData {
    /// The value is defined by an instruction.
    Inst { insn: Insn, ty: Type },

    /// The value is a function argument.
    Arg { ty: Type, idx: usize },

    /// The value is an immediate value.
    Immediate { imm: Immediate, ty: Type },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    I1(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl Immediate {
    pub fn ty(&self) -> Type {
        match self {
            Self::I1(..) => Type::I1,
            Self::I8(..) => Type::I8,
            Self::I16(..) => Type::I16,
            Self::I32(..) => Type::I32,
            Self::I64(..) => Type::I64,
        }
    }

    pub fn lt(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| ((lhs as u64) < rhs as u64).into())
    }

    pub fn gt(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs as u64 > rhs as u64).into())
    }

    pub fn le(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs as u64 <= rhs as u64).into())
    }

    pub fn ge(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs as u64 >= rhs as u64).into())
    }

    pub fn slt(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs < rhs).into())
    }

    pub fn sgt(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs > rhs).into())
    }

    pub fn sle(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs <= rhs).into())
    }

    pub fn sge(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs >= rhs).into())
    }

    pub fn imm_eq(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs == rhs).into())
    }

    pub fn imm_ne(self, rhs: Self) -> Self {
        self.apply_binop_raw(rhs, |lhs, rhs| (lhs != rhs).into())
    }

    pub fn zero(ty: Type) -> Self {
        Self::from_i64(0, ty)
    }

    pub fn one(ty: Type) -> Self {
        Self::from_i64(1, ty)
    }

    pub fn is_zero(self) -> bool {
        self.as_i64() == 0
    }

    pub fn is_true(self) -> bool {
        self.as_i64() != 0
    }

    /// Sign-extends the immediate to an `i64`.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::I1(val) => val as i64,
            Self::I8(val) => val as i64,
            Self::I16(val) => val as i64,
            Self::I32(val) => val as i64,
            Self::I64(val) => val,
        }
    }

    pub fn as_usize(self) -> usize {
        self.as_i64() as usize
    }

    /// Truncates `val` into the given integral type.
    pub fn from_i64(val: i64, ty: Type) -> Self {
        match ty {
            Type::I1 => Self::I1(val & 1 != 0),
            Type::I8 => Self::I8(val as i8),
            Type::I16 => Self::I16(val as i16),
            Type::I32 => Self::I32(val as i32),
            Type::I64 => Self::I64(val),
            _ => unreachable!("immediate must have an integral type"),
        }
    }

    fn apply_binop<F>(self, rhs: Self, f: F) -> Self
    where
        F: FnOnce(i64, i64) -> i64,
    {
        debug_assert_eq!(self.ty(), rhs.ty());
        Self::from_i64(f(self.as_i64(), rhs.as_i64()), self.ty())
    }

    fn apply_binop_raw<F>(self, rhs: Self, f: F) -> Self
    where
        F: FnOnce(i64, i64) -> bool,
    {
        debug_assert_eq!(self.ty(), rhs.ty());
        Self::I1(f(self.as_i64(), rhs.as_i64()))
    }

    fn apply_unop<F>(self, f: F) -> Self
    where
        F: FnOnce(i64) -> i64,
    {
        Self::from_i64(f(self.as_i64()), self.ty())
    }
}

impl ops::Add for Immediate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.apply_binop(rhs, i64::wrapping_add)
    }
}

impl ops::Sub for Immediate {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.apply_binop(rhs, i64::wrapping_sub)
    }
}

impl ops::Mul for Immediate {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.apply_binop(rhs, i64::wrapping_mul)
    }
}

impl ops::BitAnd for Immediate {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.apply_binop(rhs, ops::BitAnd::bitand)
    }
}

impl ops::BitOr for Immediate {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.apply_binop(rhs, ops::BitOr::bitor)
    }
}

impl ops::BitXor for Immediate {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        self.apply_binop(rhs, ops::BitXor::bitxor)
    }
}

impl ops::Not for Immediate {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::I1(val) => Self::I1(!val),
            other => other.apply_unop(ops::Not::not),
        }
    }
}

impl ops::Neg for Immediate {
    type Output = Self;

    fn neg(self) -> Self {
        self.apply_unop(i64::wrapping_neg)
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1(v) => write!(f, "{}", *v as u8),
            Self::I8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! imm_from_primary {
    ($prim_ty:ty, $inner_ty:ty, $immediate_variant:expr) => {
        impl From<$prim_ty> for Immediate {
            fn from(imm: $prim_ty) -> Self {
                $immediate_variant(imm as $inner_ty)
            }
        }
    };
}

imm_from_primary!(bool, bool, Immediate::I1);
imm_from_primary!(i8, i8, Immediate::I8);
imm_from_primary!(u8, i8, Immediate::I8);
imm_from_primary!(i16, i16, Immediate::I16);
imm_from_primary!(u16, i16, Immediate::I16);
imm_from_primary!(i32, i32, Immediate::I32);
imm_from_primary!(u32, i32, Immediate::I32);
imm_from_primary!(i64, i64, Immediate::I64);
imm_from_primary!(u64, i64, Immediate::I64);
