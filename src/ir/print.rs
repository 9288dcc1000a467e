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

use std::fmt;

use crate::ir::{BinOp, Computation, Instr, UnaryOp, ValueId};

/// Format a [`Computation`] into a stable, human-readable string.
pub fn format_computation(computation: &Computation) -> String {
    computation.to_string()
}

impl fmt::Display for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "computation {} {{", self.name)?;
        for instr in &self.instrs {
            write!(f, "  ")?;
            format_instr(instr, f)?;
            writeln!(f)?;
        }
        writeln!(f, "}}  // next_id = {}", self.next_id)
    }
}

fn format_instr(instr: &Instr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match instr {
        Instr::Parameter { dst, index, shape } => {
            write!(f, "{} = parameter {} {}", value_name(*dst), index, shape)
        }
        Instr::Constant(dst, literal) => {
            write!(f, "{} = constant {}", value_name(*dst), literal)
        }
        Instr::Unary { dst, op, src } => {
            write!(
                f,
                "{} = {} {}",
                value_name(*dst),
                format_unary(*op),
                value_name(*src)
            )
        }
        Instr::BinOp { dst, op, lhs, rhs } => write!(
            f,
            "{} = {} {}, {}",
            value_name(*dst),
            format_binop(*op),
            value_name(*lhs),
            value_name(*rhs)
        ),
        Instr::Tuple { dst, elements } => {
            write!(f, "{} = tuple {}", value_name(*dst), value_list(elements))
        }
        Instr::GetTupleElement { dst, src, index } => write!(
            f,
            "{} = get_tuple_element {} index={}",
            value_name(*dst),
            value_name(*src),
            index
        ),
        Instr::ReplicaId(dst) => write!(f, "{} = replica_id", value_name(*dst)),
        Instr::CrossReplicaSum { dst, src } => write!(
            f,
            "{} = cross_replica_sum {}",
            value_name(*dst),
            value_name(*src)
        ),
        Instr::Infeed { dst, shape } => write!(f, "{} = infeed {}", value_name(*dst), shape),
        Instr::Outfeed { src } => write!(f, "outfeed {}", value_name(*src)),
        Instr::CustomCall {
            dst,
            target,
            operands,
            shape,
        } => write!(
            f,
            "{} = custom_call \"{}\" {} -> {}",
            value_name(*dst),
            target,
            value_list(operands),
            shape
        ),
        Instr::Output(id) => write!(f, "output {}", value_name(*id)),
    }
}

fn value_name(id: ValueId) -> String {
    format!("%{}", id.0)
}

fn value_list(values: &[ValueId]) -> String {
    let names: Vec<String> = values.iter().map(|v| value_name(*v)).collect();
    format!("({})", names.join(", "))
}

fn format_unary(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Abs => "abs",
    }
}

fn format_binop(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Max => "max",
        BinOp::Min => "min",
    }
}
