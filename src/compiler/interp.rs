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

use std::collections::HashMap;

use rayon::prelude::*;

use crate::compiler::collective::CollectiveHub;
use crate::compiler::custom_call::CustomCallRegistry;
use crate::device::DeviceFeeds;
use crate::error::{LocalError, Result};
use crate::ir::{BinOp, Computation, Instr, UnaryOp, ValueId};
use crate::literal::{ArrayLiteral, Literal, NativeType};
use crate::shape::PrimitiveType;

/// Everything a running replica can observe besides its arguments.
pub(crate) struct EvalContext<'a> {
    pub replica: usize,
    pub replica_count: usize,
    pub device_ordinal: usize,
    pub run_id: u64,
    pub pool: &'a rayon::ThreadPool,
    pub collectives: &'a CollectiveHub,
    pub feeds: &'a DeviceFeeds,
    pub custom_calls: &'a CustomCallRegistry,
}

trait Element: NativeType + Copy {
    fn binary(op: BinOp, a: Self, b: Self) -> std::result::Result<Self, String>;
    fn unary(op: UnaryOp, a: Self) -> Self;
}

macro_rules! signed_element {
    ($t:ty) => {
        impl Element for $t {
            fn binary(op: BinOp, a: Self, b: Self) -> std::result::Result<Self, String> {
                Ok(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div if b == 0 => return Err("integer division by zero".to_string()),
                    BinOp::Div => a.wrapping_div(b),
                    BinOp::Max => a.max(b),
                    BinOp::Min => a.min(b),
                })
            }

            fn unary(op: UnaryOp, a: Self) -> Self {
                match op {
                    UnaryOp::Neg => a.wrapping_neg(),
                    UnaryOp::Abs => a.wrapping_abs(),
                }
            }
        }
    };
}

signed_element!(i32);
signed_element!(i64);

impl Element for u32 {
    fn binary(op: BinOp, a: Self, b: Self) -> std::result::Result<Self, String> {
        Ok(match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div if b == 0 => return Err("integer division by zero".to_string()),
            BinOp::Div => a / b,
            BinOp::Max => a.max(b),
            BinOp::Min => a.min(b),
        })
    }

    fn unary(op: UnaryOp, a: Self) -> Self {
        match op {
            UnaryOp::Neg => a.wrapping_neg(),
            UnaryOp::Abs => a,
        }
    }
}

macro_rules! float_element {
    ($t:ty) => {
        impl Element for $t {
            fn binary(op: BinOp, a: Self, b: Self) -> std::result::Result<Self, String> {
                Ok(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Max => a.max(b),
                    BinOp::Min => a.min(b),
                })
            }

            fn unary(op: UnaryOp, a: Self) -> Self {
                match op {
                    UnaryOp::Neg => -a,
                    UnaryOp::Abs => a.abs(),
                }
            }
        }
    };
}

float_element!(f32);
float_element!(f64);

fn binary_typed<T: Element>(
    pool: &rayon::ThreadPool,
    op: BinOp,
    lhs: &ArrayLiteral,
    rhs: &ArrayLiteral,
) -> Result<ArrayLiteral> {
    let a = lhs.to_vec::<T>()?;
    let b = rhs.to_vec::<T>()?;
    let lhs_scalar = lhs.dims().is_empty();
    let rhs_scalar = rhs.dims().is_empty();
    let dims = if lhs_scalar { rhs.dims() } else { lhs.dims() }.to_vec();
    if !lhs_scalar && !rhs_scalar && lhs.dims() != rhs.dims() {
        return Err(LocalError::execution(format!(
            "operand dimensions {:?} and {:?} differ",
            lhs.dims(),
            rhs.dims()
        )));
    }
    let n: usize = dims.iter().product();
    let out: Vec<T> = pool
        .install(|| {
            (0..n)
                .into_par_iter()
                .map(|i| {
                    let x = if lhs_scalar { a[0] } else { a[i] };
                    let y = if rhs_scalar { b[0] } else { b[i] };
                    T::binary(op, x, y)
                })
                .collect::<std::result::Result<Vec<T>, String>>()
        })
        .map_err(LocalError::execution)?;
    ArrayLiteral::new(T::TYPE, dims, bytemuck::cast_slice(&out).to_vec())
}

/// Applies `op` element-wise, broadcasting a rank-0 operand.
pub(crate) fn elementwise_binary(
    pool: &rayon::ThreadPool,
    op: BinOp,
    lhs: &ArrayLiteral,
    rhs: &ArrayLiteral,
) -> Result<ArrayLiteral> {
    if lhs.element_type() != rhs.element_type() {
        return Err(LocalError::execution(format!(
            "operand types {} and {} differ",
            lhs.element_type(),
            rhs.element_type()
        )));
    }
    match lhs.element_type() {
        PrimitiveType::S32 => binary_typed::<i32>(pool, op, lhs, rhs),
        PrimitiveType::S64 => binary_typed::<i64>(pool, op, lhs, rhs),
        PrimitiveType::U32 => binary_typed::<u32>(pool, op, lhs, rhs),
        PrimitiveType::F32 => binary_typed::<f32>(pool, op, lhs, rhs),
        PrimitiveType::F64 => binary_typed::<f64>(pool, op, lhs, rhs),
        PrimitiveType::Pred => Err(LocalError::execution("arithmetic on pred values")),
    }
}

fn unary_typed<T: Element>(
    pool: &rayon::ThreadPool,
    op: UnaryOp,
    src: &ArrayLiteral,
) -> Result<ArrayLiteral> {
    let values = src.to_vec::<T>()?;
    let out: Vec<T> = pool.install(|| values.par_iter().map(|v| T::unary(op, *v)).collect());
    ArrayLiteral::new(T::TYPE, src.dims().to_vec(), bytemuck::cast_slice(&out).to_vec())
}

fn elementwise_unary(
    pool: &rayon::ThreadPool,
    op: UnaryOp,
    src: &ArrayLiteral,
) -> Result<ArrayLiteral> {
    match src.element_type() {
        PrimitiveType::S32 => unary_typed::<i32>(pool, op, src),
        PrimitiveType::S64 => unary_typed::<i64>(pool, op, src),
        PrimitiveType::U32 => unary_typed::<u32>(pool, op, src),
        PrimitiveType::F32 => unary_typed::<f32>(pool, op, src),
        PrimitiveType::F64 => unary_typed::<f64>(pool, op, src),
        PrimitiveType::Pred => Err(LocalError::execution("arithmetic on pred values")),
    }
}

fn operand<'v>(vals: &'v HashMap<ValueId, Literal>, id: ValueId) -> Result<&'v Literal> {
    vals.get(&id)
        .ok_or_else(|| LocalError::execution(format!("value %{id} is not defined")))
}

fn array_operand<'v>(vals: &'v HashMap<ValueId, Literal>, id: ValueId) -> Result<&'v ArrayLiteral> {
    operand(vals, id)?
        .as_array()
        .ok_or_else(|| LocalError::execution(format!("value %{id} is a tuple")))
}

/// Runs `computation` on host literals. Parameter `i` binds `args[i]`.
pub(crate) fn evaluate(
    computation: &Computation,
    args: Vec<Literal>,
    ctx: &EvalContext<'_>,
) -> Result<Literal> {
    let mut args: Vec<Option<Literal>> = args.into_iter().map(Some).collect();
    let mut vals: HashMap<ValueId, Literal> = HashMap::new();

    for instr in &computation.instrs {
        match instr {
            Instr::Parameter { dst, index, .. } => {
                let value = args.get_mut(*index).and_then(Option::take).ok_or_else(|| {
                    LocalError::execution(format!("parameter {index} was not supplied"))
                })?;
                vals.insert(*dst, value);
            }
            Instr::Constant(dst, literal) => {
                vals.insert(*dst, literal.clone());
            }
            Instr::Unary { dst, op, src } => {
                let out = elementwise_unary(ctx.pool, *op, array_operand(&vals, *src)?)?;
                vals.insert(*dst, Literal::Array(out));
            }
            Instr::BinOp { dst, op, lhs, rhs } => {
                let out = elementwise_binary(
                    ctx.pool,
                    *op,
                    array_operand(&vals, *lhs)?,
                    array_operand(&vals, *rhs)?,
                )?;
                vals.insert(*dst, Literal::Array(out));
            }
            Instr::Tuple { dst, elements } => {
                let elements = elements
                    .iter()
                    .map(|id| operand(&vals, *id).cloned())
                    .collect::<Result<Vec<_>>>()?;
                vals.insert(*dst, Literal::Tuple(elements));
            }
            Instr::GetTupleElement { dst, src, index } => {
                let element = operand(&vals, *src)?
                    .tuple_elements()
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| {
                        LocalError::execution(format!("value %{src} has no tuple element {index}"))
                    })?;
                vals.insert(*dst, element);
            }
            Instr::ReplicaId(dst) => {
                vals.insert(*dst, Literal::scalar(ctx.replica as i32));
            }
            Instr::CrossReplicaSum { dst, src } => {
                let value = operand(&vals, *src)?.clone();
                let sum = ctx.collectives.cross_replica_sum(
                    (ctx.run_id, dst.0),
                    ctx.replica,
                    ctx.replica_count,
                    value,
                    ctx.pool,
                )?;
                vals.insert(*dst, sum);
            }
            Instr::Infeed { dst, shape } => {
                let value = ctx.feeds.infeed(ctx.device_ordinal)?.pop();
                if !value.shape().compatible(shape) {
                    return Err(LocalError::execution(format!(
                        "infeed on device {} produced {} but the program expects {shape}",
                        ctx.device_ordinal,
                        value.shape()
                    )));
                }
                vals.insert(*dst, value);
            }
            Instr::Outfeed { src } => {
                let value = operand(&vals, *src)?.clone();
                ctx.feeds.outfeed(ctx.device_ordinal)?.push(value);
            }
            Instr::CustomCall {
                dst,
                target,
                operands,
                shape,
            } => {
                let function = ctx.custom_calls.lookup(target).ok_or_else(|| {
                    LocalError::execution(format!("custom call target '{target}' is not registered"))
                })?;
                let inputs = operands
                    .iter()
                    .map(|id| operand(&vals, *id).cloned())
                    .collect::<Result<Vec<_>>>()?;
                let value = function(&inputs).map_err(|message| {
                    LocalError::execution(format!("custom call '{target}' failed: {message}"))
                })?;
                if !value.shape().compatible(shape) {
                    return Err(LocalError::execution(format!(
                        "custom call '{target}' returned {} instead of {shape}",
                        value.shape()
                    )));
                }
                vals.insert(*dst, value);
            }
            Instr::Output(id) => {
                return vals
                    .remove(id)
                    .ok_or_else(|| LocalError::execution(format!("value %{id} is not defined")));
            }
        }
    }

    Err(LocalError::execution(format!(
        "computation {} finished without an output",
        computation.name
    )))
}
