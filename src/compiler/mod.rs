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

//! Program compiler and device program runner.
//!
//! Compilation verifies a [`Computation`], infers its program shape, checks
//! the laid-out argument and result shapes against it and produces a
//! [`CompiledProgram`]. Running a compiled program reads its arguments from
//! device memory, evaluates it on the host and writes the result into a new
//! device allocation in the compiled result layout.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::transfer::{allocate_shaped_buffer, read_literal, write_literal};
use crate::device::{DeviceAssignment, DeviceFeeds, DeviceMemoryAllocator};
use crate::device::{ScopedShapedBuffer, ShapedBuffer};
use crate::error::{LocalError, Result};
use crate::ir::{verify_computation, Computation, Instr, ValueId};
use crate::shape::{ArrayShape, PrimitiveType, Shape};

pub mod collective;
pub mod custom_call;
pub(crate) mod interp;

pub use collective::CollectiveHub;
pub use custom_call::{CustomCallRegistry, CustomCallTarget};

use interp::{evaluate, EvalContext};

/// Parameter and result shapes of a computation, without layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramShape {
    pub parameters: Vec<Shape>,
    pub result: Shape,
}

/// Options controlling how a computation is built into an executable.
#[derive(Debug, Clone)]
pub struct ExecutableBuildOptions {
    result_layout: Option<Shape>,
    num_replicas: usize,
}

impl Default for ExecutableBuildOptions {
    fn default() -> Self {
        Self {
            result_layout: None,
            num_replicas: 1,
        }
    }
}

impl ExecutableBuildOptions {
    pub fn with_result_layout(mut self, shape: Shape) -> Self {
        self.result_layout = Some(shape);
        self
    }

    pub fn with_num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn result_layout(&self) -> Option<&Shape> {
        self.result_layout.as_ref()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }
}

/// Per-launch context handed to a compiled program.
#[derive(Clone)]
pub struct ExecutableRunOptions {
    pub device_ordinal: usize,
    pub allocator: Arc<DeviceMemoryAllocator>,
    pub intra_op_pool: Arc<rayon::ThreadPool>,
    pub device_assignment: Arc<DeviceAssignment>,
    /// Shared by every replica of one launch; keys collective rendezvous.
    pub run_id: u64,
}

/// Services a running program can reach: collectives, feeds and host
/// callbacks. One instance per backend.
pub struct ExecutionServices {
    pub collectives: CollectiveHub,
    pub feeds: DeviceFeeds,
    pub custom_calls: CustomCallRegistry,
}

impl ExecutionServices {
    pub fn new(device_count: usize) -> Self {
        Self {
            collectives: CollectiveHub::default(),
            feeds: DeviceFeeds::new(device_count),
            custom_calls: CustomCallRegistry::default(),
        }
    }
}

pub struct Compiler {
    services: Arc<ExecutionServices>,
}

impl Compiler {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        Self { services }
    }

    /// Builds a program for fully laid-out argument and result shapes.
    pub fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        result_layout: &Shape,
        replica_count: usize,
    ) -> Result<CompiledProgram> {
        let program_shape = infer_program_shape(computation, &self.services.custom_calls)?;

        if argument_layouts.len() != program_shape.parameters.len() {
            return Err(LocalError::Compilation(format!(
                "{} takes {} arguments but {} argument shapes were given",
                computation.name,
                program_shape.parameters.len(),
                argument_layouts.len()
            )));
        }
        for (i, (given, expected)) in argument_layouts
            .iter()
            .zip(&program_shape.parameters)
            .enumerate()
        {
            if !given.compatible(expected) {
                return Err(LocalError::Compilation(format!(
                    "argument {i} has shape {given} but parameter {i} is {expected}"
                )));
            }
            require_layout(given, "argument")?;
        }
        if !result_layout.compatible(&program_shape.result) {
            return Err(LocalError::Compilation(format!(
                "result layout {result_layout} does not match the result shape {}",
                program_shape.result
            )));
        }
        require_layout(result_layout, "result")?;

        tracing::debug!(
            computation = %computation.name,
            parameters = argument_layouts.len(),
            result = %result_layout,
            replica_count,
            "compiled computation"
        );
        Ok(CompiledProgram {
            computation: computation.clone(),
            program_shape,
            argument_layouts: argument_layouts.to_vec(),
            result_layout: result_layout.clone(),
            replica_count,
            services: Arc::clone(&self.services),
        })
    }
}

fn require_layout(shape: &Shape, what: &str) -> Result<()> {
    shape
        .validate()
        .map_err(|err| LocalError::Compilation(format!("{what} shape {shape}: {err}")))?;
    if !shape.has_layout() {
        return Err(LocalError::Compilation(format!(
            "{what} shape {shape} has no layout"
        )));
    }
    Ok(())
}

fn numeric_array<'s>(shape: &'s Shape, what: &str) -> Result<&'s ArrayShape> {
    let array = shape
        .as_array()
        .ok_or_else(|| LocalError::Compilation(format!("{what} expects an array, got {shape}")))?;
    if array.element_type == PrimitiveType::Pred {
        return Err(LocalError::Compilation(format!(
            "{what} does not accept pred operands"
        )));
    }
    Ok(array)
}

fn without_layout(shape: &Shape) -> Shape {
    let mut shape = shape.clone();
    shape.clear_layout();
    shape
}

/// Verifies and type-checks `computation` and returns its program shape.
pub fn infer_program_shape(
    computation: &Computation,
    custom_calls: &CustomCallRegistry,
) -> Result<ProgramShape> {
    verify_computation(computation)
        .map_err(|err| LocalError::Compilation(format!("{}: {err}", computation.name)))?;
    let mut shapes: HashMap<ValueId, Shape> = HashMap::new();
    let mut parameters: Vec<Option<Shape>> = vec![None; computation.parameter_count()];
    let mut result = None;

    let lookup = |shapes: &HashMap<ValueId, Shape>, id: ValueId| -> Result<Shape> {
        shapes
            .get(&id)
            .cloned()
            .ok_or_else(|| LocalError::Compilation(format!("value %{id} has no shape")))
    };

    for instr in &computation.instrs {
        match instr {
            Instr::Parameter { dst, index, shape } => {
                let shape = without_layout(shape);
                if let Some(slot) = parameters.get_mut(*index) {
                    *slot = Some(shape.clone());
                }
                shapes.insert(*dst, shape);
            }
            Instr::Constant(dst, literal) => {
                shapes.insert(*dst, without_layout(&literal.shape()));
            }
            Instr::Unary { dst, src, op } => {
                let src_shape = lookup(&shapes, *src)?;
                let array = numeric_array(&src_shape, &format!("{op:?}"))?;
                shapes.insert(*dst, Shape::array(array.element_type, array.dims.clone()));
            }
            Instr::BinOp { dst, op, lhs, rhs } => {
                let (lhs_shape, rhs_shape) = (lookup(&shapes, *lhs)?, lookup(&shapes, *rhs)?);
                let what = format!("{op:?}");
                let a = numeric_array(&lhs_shape, &what)?;
                let b = numeric_array(&rhs_shape, &what)?;
                if a.element_type != b.element_type {
                    return Err(LocalError::Compilation(format!(
                        "{what} operands have different types {} and {}",
                        a.element_type, b.element_type
                    )));
                }
                let dims = if a.dims.is_empty() {
                    b.dims.clone()
                } else if b.dims.is_empty() || a.dims == b.dims {
                    a.dims.clone()
                } else {
                    return Err(LocalError::Compilation(format!(
                        "{what} operands have incompatible shapes {lhs_shape} and {rhs_shape}"
                    )));
                };
                shapes.insert(*dst, Shape::array(a.element_type, dims));
            }
            Instr::Tuple { dst, elements } => {
                let elements = elements
                    .iter()
                    .map(|id| lookup(&shapes, *id))
                    .collect::<Result<Vec<_>>>()?;
                shapes.insert(*dst, Shape::tuple(elements));
            }
            Instr::GetTupleElement { dst, src, index } => {
                let src_shape = lookup(&shapes, *src)?;
                let element = src_shape.tuple_elements().get(*index).cloned().ok_or_else(|| {
                    LocalError::Compilation(format!(
                        "get_tuple_element {index} out of range for {src_shape}"
                    ))
                })?;
                shapes.insert(*dst, element);
            }
            Instr::ReplicaId(dst) => {
                shapes.insert(*dst, Shape::scalar(PrimitiveType::S32));
            }
            Instr::CrossReplicaSum { dst, src } => {
                let src_shape = lookup(&shapes, *src)?;
                let array = numeric_array(&src_shape, "CrossReplicaSum")?;
                shapes.insert(*dst, Shape::array(array.element_type, array.dims.clone()));
            }
            Instr::Infeed { dst, shape } => {
                shapes.insert(*dst, without_layout(shape));
            }
            Instr::Outfeed { src } => {
                lookup(&shapes, *src)?;
            }
            Instr::CustomCall {
                dst, target, shape, ..
            } => {
                if !custom_calls.contains(target) {
                    return Err(LocalError::Compilation(format!(
                        "unknown custom call target '{target}'"
                    )));
                }
                shapes.insert(*dst, without_layout(shape));
            }
            Instr::Output(id) => {
                result = Some(lookup(&shapes, *id)?);
            }
        }
    }

    let parameters = parameters
        .into_iter()
        .enumerate()
        .map(|(i, shape)| {
            shape.ok_or_else(|| LocalError::Compilation(format!("parameter {i} is not declared")))
        })
        .collect::<Result<Vec<_>>>()?;
    let result = result.ok_or_else(|| {
        LocalError::Compilation(format!("{} has no output", computation.name))
    })?;
    Ok(ProgramShape { parameters, result })
}

/// An immutable program ready to run on any device of its platform.
pub struct CompiledProgram {
    computation: Computation,
    program_shape: ProgramShape,
    argument_layouts: Vec<Shape>,
    result_layout: Shape,
    replica_count: usize,
    services: Arc<ExecutionServices>,
}

impl CompiledProgram {
    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    pub fn program_shape(&self) -> &ProgramShape {
        &self.program_shape
    }

    pub fn argument_layouts(&self) -> &[Shape] {
        &self.argument_layouts
    }

    pub fn result_layout(&self) -> &Shape {
        &self.result_layout
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Runs the program on `options.device_ordinal`. The returned buffer owns
    /// a fresh allocation on that device.
    pub fn run(
        &self,
        arguments: &[&ShapedBuffer],
        options: &ExecutableRunOptions,
    ) -> Result<ScopedShapedBuffer> {
        let ordinal = options.device_ordinal;
        let replica = options
            .device_assignment
            .replica_for_device(ordinal)
            .ok_or_else(|| {
                LocalError::InvalidArgument(format!(
                    "device {ordinal} is not part of device assignment {}",
                    options.device_assignment
                ))
            })?;
        let _span = tracing::debug_span!(
            "CompiledProgram::run",
            computation = %self.computation.name,
            device_ordinal = ordinal,
            replica
        )
        .entered();

        if arguments.len() != self.argument_layouts.len() {
            return Err(LocalError::InvalidArgument(format!(
                "{} expects {} arguments, got {}",
                self.computation.name,
                self.argument_layouts.len(),
                arguments.len()
            )));
        }
        let mut literals = Vec::with_capacity(arguments.len());
        for (i, (argument, layout)) in arguments.iter().zip(&self.argument_layouts).enumerate() {
            if argument.device_ordinal() != ordinal {
                return Err(LocalError::InvalidArgument(format!(
                    "argument {i} lives on device {} but the program runs on device {ordinal}",
                    argument.device_ordinal()
                )));
            }
            if argument.on_device_shape() != layout {
                return Err(LocalError::InvalidArgument(format!(
                    "argument {i} has on-device shape {} but the program was compiled for {layout}",
                    argument.on_device_shape()
                )));
            }
            literals.push(read_literal(&options.allocator, argument)?);
        }

        let ctx = EvalContext {
            replica,
            replica_count: options.device_assignment.replica_count(),
            device_ordinal: ordinal,
            run_id: options.run_id,
            pool: &options.intra_op_pool,
            collectives: &self.services.collectives,
            feeds: &self.services.feeds,
            custom_calls: &self.services.custom_calls,
        };
        let value = evaluate(&self.computation, literals, &ctx)?;

        let result = allocate_shaped_buffer(
            &options.allocator,
            &self.result_layout,
            &self.result_layout,
            ordinal,
        )
        .map_err(|err| LocalError::execution(format!("allocating the result: {err}")))?;
        write_literal(&options.allocator, &value, &result)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ComputationPlacer;
    use crate::literal::Literal;
    use crate::shape::Layout;

    fn compiler() -> (Compiler, Arc<ExecutionServices>) {
        let services = Arc::new(ExecutionServices::new(1));
        (Compiler::new(Arc::clone(&services)), services)
    }

    fn laid_out(mut shape: Shape) -> Shape {
        shape
            .for_each_array_mut(|array| {
                array.layout = Some(Layout::default_for_rank(array.rank()));
                Ok(())
            })
            .unwrap();
        shape
    }

    #[test]
    fn infers_tuple_result() {
        let (_, services) = compiler();
        let mut c = Computation::new("pair");
        let x = c.parameter(0, Shape::array(PrimitiveType::F64, vec![2]));
        let r = c.replica_id();
        let t = c.tuple(vec![x, r]);
        c.output(t);
        let shape = infer_program_shape(&c, &services.custom_calls).unwrap();
        assert_eq!(shape.parameters, vec![Shape::array(PrimitiveType::F64, vec![2])]);
        assert_eq!(shape.result.to_string(), "(f64[2], s32[])");
    }

    #[test]
    fn type_errors_are_compilation_errors() {
        let (compiler, _) = compiler();
        let mut c = Computation::new("mixed");
        let a = c.constant(Literal::scalar(1i32));
        let b = c.constant(Literal::scalar(1.0f32));
        let s = c.add(a, b);
        c.output(s);
        let result = laid_out(Shape::scalar(PrimitiveType::S32));
        assert!(matches!(
            compiler.compile(&c, &[], &result, 1),
            Err(LocalError::Compilation(_))
        ));
    }

    #[test]
    fn unknown_custom_call_is_rejected() {
        let (compiler, _) = compiler();
        let mut c = Computation::new("cc");
        let v = c.custom_call("nowhere", vec![], Shape::scalar(PrimitiveType::F32));
        c.output(v);
        let err = compiler
            .compile(&c, &[], &laid_out(Shape::scalar(PrimitiveType::F32)), 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn run_reads_and_writes_device_memory() {
        let (compiler, _) = compiler();
        let mut c = Computation::new("double");
        let x = c.parameter(0, Shape::array(PrimitiveType::S32, vec![3]));
        let y = c.add(x, x);
        c.output(y);
        let arg = laid_out(Shape::array(PrimitiveType::S32, vec![3]));
        let program = compiler.compile(&c, &[arg.clone()], &arg, 1).unwrap();

        let allocator = Arc::new(DeviceMemoryAllocator::new("cpu", 1, None));
        let input = allocate_shaped_buffer(&allocator, &arg, &arg, 0).unwrap();
        write_literal(&allocator, &Literal::vector(&[1i32, 2, 3]), &input).unwrap();
        let options = ExecutableRunOptions {
            device_ordinal: 0,
            allocator: Arc::clone(&allocator),
            intra_op_pool: Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()),
            device_assignment: Arc::new(ComputationPlacer::new(1).assign_devices(1, 1).unwrap()),
            run_id: 1,
        };
        let output = program.run(&[&input], &options).unwrap();
        assert_eq!(
            read_literal(&allocator, &output).unwrap().to_vec::<i32>().unwrap(),
            vec![2, 4, 6]
        );

        let wrong = laid_out(Shape::array(PrimitiveType::S32, vec![4]));
        let other = allocate_shaped_buffer(&allocator, &wrong, &wrong, 0).unwrap();
        assert!(matches!(
            program.run(&[&other], &options),
            Err(LocalError::InvalidArgument(_))
        ));
    }
}
