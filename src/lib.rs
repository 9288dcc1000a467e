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

//! MIND local device client.
//!
//! Opens a device platform, moves host values into device buffers and back,
//! compiles programs against a replica-to-device assignment and runs them on
//! one or many replicas.
//!
//! ```no_run
//! use mind_local::{ExecutableBuildOptions, Computation, Literal, LocalClient, PrimitiveType, Shape};
//!
//! let client = LocalClient::open("cpu")?;
//! let mut c = Computation::new("double");
//! let x = c.parameter(0, Shape::scalar(PrimitiveType::F32));
//! let y = c.add(x, x);
//! c.output(y);
//! let exe = client.compile(&c, &[Shape::scalar(PrimitiveType::F32)], &ExecutableBuildOptions::default())?;
//! let arg = client.transfer_to_device(&Literal::scalar(1.5f32), 0)?;
//! let out = exe.execute(&[&arg])?.to_literal()?;
//! assert_eq!(out.get_scalar::<f32>()?, 3.0);
//! # Ok::<(), mind_local::LocalError>(())
//! ```

pub mod buffer;
pub mod buffer_tree;
pub mod client;
pub mod compiler;
pub mod config;
pub mod device;
pub mod error;
pub mod executable;
pub mod ir;
pub mod literal;
pub mod shape;
pub mod worker;

pub use buffer::LocalBuffer;
pub use buffer_tree::{to_buffer_tree, BufferTree};
pub use client::LocalClient;
pub use compiler::{ExecutableBuildOptions, ExecutableRunOptions, ProgramShape};
pub use config::{PlatformConfig, RuntimeConfig};
pub use device::DeviceAssignment;
pub use error::{LocalError, Result};
pub use executable::LocalExecutable;
pub use ir::{BinOp, Computation, UnaryOp, ValueId};
pub use literal::{ArrayLiteral, Literal, NativeType};
pub use shape::{ArrayShape, Layout, PrimitiveType, Shape};
