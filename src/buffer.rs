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

//! Device buffer handles and the host-to-device transfer pipeline.

use std::sync::Arc;

use crate::buffer_tree::{to_buffer_tree, BufferTree};
use crate::client::LocalClient;
use crate::device::{ScopedShapedBuffer, ShapedBuffer, Stream, TransferManager};
use crate::error::{LocalError, Result};
use crate::literal::Literal;
use crate::shape::Shape;

/// Owns one device-resident value.
///
/// A handle becomes empty after [`release`](Self::release) or a successful
/// [`destructure_tuple`](Self::destructure_tuple); every later access fails
/// with [`LocalError::InvalidArgument`].
pub struct LocalBuffer {
    shaped_buffer: Option<ScopedShapedBuffer>,
    client: LocalClient,
}

impl std::fmt::Debug for LocalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("shaped_buffer", &self.shaped_buffer)
            .finish()
    }
}

/// Enqueues the whole transfer of `tree` onto `stream`: allocation, tuple
/// index tables, then every leaf in pre-order.
fn transfer_tree_async(
    transfer_manager: &TransferManager,
    tree: &BufferTree,
    device_ordinal: usize,
    stream: &Stream,
) -> Result<ScopedShapedBuffer> {
    let shape = transfer_manager.choose_compact_layout_for_shape(&tree.shape, device_ordinal)?;
    tracing::debug!(%shape, device_ordinal, "transfer to device");
    let buffer = transfer_manager.allocate_scoped_shaped_buffer(&shape, device_ordinal)?;
    transfer_manager.write_tuple_index_tables_async(stream, &buffer)?;

    let leaves = shape.leaf_shapes();
    if leaves.len() != tree.leaf_count() {
        return Err(LocalError::Transfer(format!(
            "{shape} has {} leaves but the buffer tree has {}",
            leaves.len(),
            tree.leaf_count()
        )));
    }
    for (leaf, bytes) in leaves.iter().zip(&tree.leaves) {
        let dest = buffer.sub_buffer(&leaf.index)?;
        transfer_manager.transfer_array_to_device_async(stream, Arc::clone(bytes), &dest)?;
    }
    Ok(buffer)
}

impl LocalBuffer {
    pub(crate) fn new(shaped_buffer: ScopedShapedBuffer, client: LocalClient) -> Self {
        Self {
            shaped_buffer: Some(shaped_buffer),
            client,
        }
    }

    /// Copies `literal` to `device_ordinal` and waits for the copy to land.
    pub fn from_literal(client: &LocalClient, literal: &Literal, device_ordinal: usize) -> Result<Self> {
        let _span = tracing::debug_span!("LocalBuffer::from_literal", device_ordinal).entered();
        let tree = to_buffer_tree(literal)?;
        let stream = client.borrow_stream(device_ordinal)?;
        let buffer = transfer_tree_async(
            client.backend().transfer_manager(),
            &tree,
            device_ordinal,
            &stream,
        )?;
        stream.block_host_until_done()?;
        Ok(Self::new(buffer, client.clone()))
    }

    /// Copies every `(literal, device_ordinal)` pair concurrently. No handle
    /// is returned until every stream involved has drained.
    pub fn from_literals(client: &LocalClient, items: &[(Literal, usize)]) -> Result<Vec<Self>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let _span = tracing::debug_span!("LocalBuffer::from_literals", count = items.len()).entered();

        let trees = items
            .iter()
            .map(|(literal, _)| to_buffer_tree(literal))
            .collect::<Result<Vec<_>>>()?;
        let streams = items
            .iter()
            .map(|(_, ordinal)| client.borrow_stream(*ordinal))
            .collect::<Result<Vec<_>>>()?;

        let transfer_manager = client.backend().transfer_manager();
        let mut results: Vec<Option<Result<ScopedShapedBuffer>>> =
            items.iter().map(|_| None).collect();
        client.transfer_pool().in_place_scope(|scope| {
            let (first, rest) = results.split_at_mut(1);
            for (offset, slot) in rest.iter_mut().enumerate() {
                let i = offset + 1;
                let (tree, stream, ordinal) = (&trees[i], &streams[i], items[i].1);
                scope.spawn(move |_| {
                    *slot = Some(transfer_tree_async(transfer_manager, tree, ordinal, stream));
                });
            }
            first[0] = Some(transfer_tree_async(
                transfer_manager,
                &trees[0],
                items[0].1,
                &streams[0],
            ));
        });

        let mut sync_error = None;
        for stream in &streams {
            if let Err(err) = stream.block_host_until_done() {
                sync_error.get_or_insert(err);
            }
        }
        let buffers = results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    Err(LocalError::Transfer("transfer task did not run".to_string()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(err) = sync_error {
            return Err(err);
        }
        Ok(buffers
            .into_iter()
            .map(|buffer| Self::new(buffer, client.clone()))
            .collect())
    }

    fn scoped(&self) -> Result<&ScopedShapedBuffer> {
        self.shaped_buffer.as_ref().ok_or_else(|| {
            LocalError::InvalidArgument("buffer has been released or destructured".to_string())
        })
    }

    pub fn shaped_buffer(&self) -> Result<&ShapedBuffer> {
        self.scoped().map(|buffer| &**buffer)
    }

    pub fn shape(&self) -> Result<&Shape> {
        Ok(self.scoped()?.on_host_shape())
    }

    pub fn on_device_shape(&self) -> Result<&Shape> {
        Ok(self.scoped()?.on_device_shape())
    }

    pub fn device_ordinal(&self) -> Result<usize> {
        Ok(self.scoped()?.device_ordinal())
    }

    pub fn client(&self) -> &LocalClient {
        &self.client
    }

    pub fn is_empty(&self) -> bool {
        self.shaped_buffer.is_none()
    }

    /// Synchronous copy of the whole value back to the host.
    pub fn to_literal(&self) -> Result<Literal> {
        let buffer = self.scoped()?;
        let _span = tracing::debug_span!(
            "LocalBuffer::to_literal",
            device_ordinal = buffer.device_ordinal()
        )
        .entered();
        self.client
            .backend()
            .transfer_manager()
            .shaped_buffer_to_literal(buffer)
    }

    /// Moves the device allocation out, leaving this handle empty.
    pub fn release(&mut self) -> Result<ScopedShapedBuffer> {
        self.scoped()?;
        self.shaped_buffer.take().ok_or_else(|| {
            LocalError::InvalidArgument("buffer has already been released".to_string())
        })
    }

    /// Splits a tuple into one handle per element, moving the elements'
    /// device memory into the children. The tuple's own index table is freed
    /// and this handle becomes empty. A non-tuple is left untouched.
    pub fn destructure_tuple(&mut self) -> Result<Vec<LocalBuffer>> {
        let shape = self.scoped()?.on_device_shape();
        if !shape.is_tuple() {
            return Err(LocalError::Shape(format!(
                "destructure_tuple requires a tuple, got {shape}"
            )));
        }
        let mut parent = self.release()?;
        let ordinal = parent.device_ordinal();
        let host_elements = parent.on_host_shape().tuple_elements().to_vec();
        let device_elements = parent.on_device_shape().tuple_elements().to_vec();
        let _span = tracing::debug_span!(
            "LocalBuffer::destructure_tuple",
            device_ordinal = ordinal,
            arity = device_elements.len()
        )
        .entered();

        let mut children = Vec::with_capacity(device_elements.len());
        for (i, (host, device)) in host_elements.into_iter().zip(device_elements).enumerate() {
            let mut child = ShapedBuffer::new(host, device, ordinal);
            let moved: Vec<_> = parent
                .buffers()
                .iter()
                .filter(|(index, _)| index.first() == Some(&i))
                .map(|(index, mem)| (index.clone(), *mem))
                .collect();
            for (index, mem) in moved {
                child.set_buffer(mem, &index[1..])?;
                parent.buffers_mut().take(&index);
                tracing::trace!(?index, opaque = mem.opaque(), "moved sub-buffer");
            }
            let child = ScopedShapedBuffer::new(child, Arc::clone(parent.allocator()));
            children.push(LocalBuffer::new(child, self.client.clone()));
        }
        Ok(children)
    }
}
