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

use std::collections::BTreeSet;

use crate::ir::{instruction_dst, instruction_operands, Computation, Instr, ValueId};

/// Structured errors returned by the IR verifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IrVerifyError {
    /// Multiple instructions attempted to define the same SSA value.
    #[error("duplicate definition for value %{0}")]
    DuplicateDefinition(ValueId),
    /// A value was referenced before it had been defined.
    #[error("use of undefined value %{value} at instruction {instr_index}")]
    UseBeforeDefinition { value: ValueId, instr_index: usize },
    #[error("computation is missing an Output instruction")]
    MissingOutput,
    #[error("computation has more than one Output instruction (second at {instr_index})")]
    MultipleOutputs { instr_index: usize },
    /// Parameter indices must be exactly `0..n`, each used once.
    #[error("parameter indices {found:?} are not 0..{expected}")]
    ParameterIndices { found: Vec<usize>, expected: usize },
    #[error("next_id {found} is smaller than required {expected}")]
    NextIdOutOfSync { found: usize, expected: usize },
    #[error("invalid operand in instruction {instr_index}: {message}")]
    InvalidOperand { instr_index: usize, message: String },
}

/// Checks SSA discipline, the single output and parameter numbering.
pub fn verify_computation(computation: &Computation) -> Result<(), IrVerifyError> {
    let mut defined: BTreeSet<ValueId> = BTreeSet::new();
    let mut parameters: Vec<usize> = Vec::new();
    let mut saw_output = false;
    let mut max_seen = 0usize;

    for (idx, instr) in computation.instrs.iter().enumerate() {
        for value in instruction_operands(instr) {
            if !defined.contains(&value) {
                return Err(IrVerifyError::UseBeforeDefinition {
                    value,
                    instr_index: idx,
                });
            }
        }
        validate_operands(idx, instr)?;

        if let Some(dst) = instruction_dst(instr) {
            if !defined.insert(dst) {
                return Err(IrVerifyError::DuplicateDefinition(dst));
            }
            max_seen = max_seen.max(dst.0 + 1);
        }

        match instr {
            Instr::Parameter { index, .. } => parameters.push(*index),
            Instr::Output(_) if saw_output => {
                return Err(IrVerifyError::MultipleOutputs { instr_index: idx });
            }
            Instr::Output(_) => saw_output = true,
            _ => {}
        }
    }

    if !saw_output {
        return Err(IrVerifyError::MissingOutput);
    }

    let mut sorted = parameters.clone();
    sorted.sort_unstable();
    if sorted.iter().enumerate().any(|(i, index)| i != *index) {
        return Err(IrVerifyError::ParameterIndices {
            found: parameters,
            expected: sorted.len(),
        });
    }

    if computation.next_id < max_seen {
        return Err(IrVerifyError::NextIdOutOfSync {
            found: computation.next_id,
            expected: max_seen,
        });
    }

    Ok(())
}

fn validate_operands(instr_index: usize, instr: &Instr) -> Result<(), IrVerifyError> {
    let invalid = |message: &str| {
        Err(IrVerifyError::InvalidOperand {
            instr_index,
            message: message.to_string(),
        })
    };
    match instr {
        Instr::CustomCall { target, .. } if target.trim().is_empty() => {
            invalid("custom call target must not be empty")
        }
        Instr::Parameter { shape, .. } | Instr::Infeed { shape, .. } | Instr::CustomCall { shape, .. } => {
            match shape.validate() {
                Ok(()) => Ok(()),
                Err(err) => invalid(&err.to_string()),
            }
        }
        _ => Ok(()),
    }
}
