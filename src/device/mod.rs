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

//! Host-emulated device platform: memory, streams, transfers and placement.

pub mod feed;
pub mod memory;
pub mod placer;
pub mod platform;
pub mod shaped_buffer;
pub mod stream;
pub mod transfer;

pub use feed::{DeviceFeeds, FeedQueue};
pub use memory::{DeviceMemoryAllocator, DeviceMemoryBase};
pub use placer::{ComputationPlacer, DeviceAssignment};
pub use platform::{lookup_platform, Backend};
pub use shaped_buffer::{ScopedShapedBuffer, ShapeTree, ShapedBuffer};
pub use stream::{BorrowedStream, Stream, StreamPool};
pub use transfer::{LayoutPreference, RowMajorLayout, TransferManager};
