// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! SSA program representation run on devices.

use std::fmt;

use crate::literal::Literal;
use crate::shape::Shape;

pub mod print;
pub mod verify;

pub use print::format_computation;
pub use verify::{verify_computation, IrVerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Debug, Clone)]
pub enum Instr {
    Parameter { dst: ValueId, index: usize, shape: Shape },
    Constant(ValueId, Literal),
    Unary { dst: ValueId, op: UnaryOp, src: ValueId },
    BinOp { dst: ValueId, op: BinOp, lhs: ValueId, rhs: ValueId },
    Tuple { dst: ValueId, elements: Vec<ValueId> },
    GetTupleElement { dst: ValueId, src: ValueId, index: usize },
    /// Index of the executing replica as an s32 scalar.
    ReplicaId(ValueId),
    /// Element-wise sum of `src` over every replica of the run.
    CrossReplicaSum { dst: ValueId, src: ValueId },
    Infeed { dst: ValueId, shape: Shape },
    Outfeed { src: ValueId },
    CustomCall {
        dst: ValueId,
        target: String,
        operands: Vec<ValueId>,
        shape: Shape,
    },
    Output(ValueId),
}

/// The value an instruction defines, if any.
pub fn instruction_dst(instr: &Instr) -> Option<ValueId> {
    match instr {
        Instr::Parameter { dst, .. }
        | Instr::Constant(dst, _)
        | Instr::Unary { dst, .. }
        | Instr::BinOp { dst, .. }
        | Instr::Tuple { dst, .. }
        | Instr::GetTupleElement { dst, .. }
        | Instr::ReplicaId(dst)
        | Instr::CrossReplicaSum { dst, .. }
        | Instr::Infeed { dst, .. }
        | Instr::CustomCall { dst, .. } => Some(*dst),
        Instr::Outfeed { .. } | Instr::Output(_) => None,
    }
}

/// Values an instruction reads.
pub fn instruction_operands(instr: &Instr) -> Vec<ValueId> {
    match instr {
        Instr::Parameter { .. } | Instr::Constant(..) | Instr::ReplicaId(_) | Instr::Infeed { .. } => {
            Vec::new()
        }
        Instr::Unary { src, .. }
        | Instr::GetTupleElement { src, .. }
        | Instr::CrossReplicaSum { src, .. }
        | Instr::Outfeed { src } => vec![*src],
        Instr::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
        Instr::Tuple { elements, .. } => elements.clone(),
        Instr::CustomCall { operands, .. } => operands.clone(),
        Instr::Output(id) => vec![*id],
    }
}

/// A named program. Build it with the helper methods, which allocate fresh
/// SSA ids and append instructions in order.
#[derive(Debug, Clone)]
pub struct Computation {
    pub name: String,
    pub instrs: Vec<Instr>,
    pub next_id: usize,
}

impl Computation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instrs: Vec::new(),
            next_id: 0,
        }
    }

    pub fn fresh(&mut self) -> ValueId {
        let id = self.next_id;
        self.next_id += 1;
        ValueId(id)
    }

    fn define(&mut self, build: impl FnOnce(ValueId) -> Instr) -> ValueId {
        let dst = self.fresh();
        self.instrs.push(build(dst));
        dst
    }

    pub fn parameter(&mut self, index: usize, shape: Shape) -> ValueId {
        self.define(|dst| Instr::Parameter { dst, index, shape })
    }

    pub fn constant(&mut self, literal: Literal) -> ValueId {
        self.define(|dst| Instr::Constant(dst, literal))
    }

    pub fn unary(&mut self, op: UnaryOp, src: ValueId) -> ValueId {
        self.define(|dst| Instr::Unary { dst, op, src })
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.define(|dst| Instr::BinOp { dst, op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Div, lhs, rhs)
    }

    pub fn tuple(&mut self, elements: Vec<ValueId>) -> ValueId {
        self.define(|dst| Instr::Tuple { dst, elements })
    }

    pub fn get_tuple_element(&mut self, src: ValueId, index: usize) -> ValueId {
        self.define(|dst| Instr::GetTupleElement { dst, src, index })
    }

    pub fn replica_id(&mut self) -> ValueId {
        self.define(Instr::ReplicaId)
    }

    pub fn cross_replica_sum(&mut self, src: ValueId) -> ValueId {
        self.define(|dst| Instr::CrossReplicaSum { dst, src })
    }

    pub fn infeed(&mut self, shape: Shape) -> ValueId {
        self.define(|dst| Instr::Infeed { dst, shape })
    }

    pub fn outfeed(&mut self, src: ValueId) {
        self.instrs.push(Instr::Outfeed { src });
    }

    pub fn custom_call(
        &mut self,
        target: impl Into<String>,
        operands: Vec<ValueId>,
        shape: Shape,
    ) -> ValueId {
        let target = target.into();
        self.define(|dst| Instr::CustomCall {
            dst,
            target,
            operands,
            shape,
        })
    }

    pub fn output(&mut self, value: ValueId) {
        self.instrs.push(Instr::Output(value));
    }

    /// Number of `Parameter` instructions.
    pub fn parameter_count(&self) -> usize {
        self.instrs
            .iter()
            .filter(|instr| matches!(instr, Instr::Parameter { .. }))
            .count()
    }

    pub fn result(&self) -> Option<ValueId> {
        self.instrs.iter().find_map(|instr| match instr {
            Instr::Output(id) => Some(*id),
            _ => None,
        })
    }
}
