//! Chunk lifecycle (§4.E): create a chunk from the host allocator and
//! link it into a free set; release one back to the host once it has no
//! live mappings.

use gmm_chunk::{Chunk, Pool};
use gmm_host::{HostAllocError, HostChunkMemory, HostPageAllocator, VmCollaborator};
use gmm_types::ChunkId;

use crate::error::{GmmError, GmmResult};
use crate::inner::GmmInner;

/// Allocates one chunk's worth of host memory, wraps it in a [`Chunk`],
/// and links it into `preferred_set`. Unwinds and returns the host
/// memory if any later step fails.
pub fn create_chunk(inner: &mut GmmInner, host: &dyn HostPageAllocator, preferred_set: Pool) -> GmmResult<ChunkId> {
    let mem: HostChunkMemory = host.allocate_chunk().map_err(|e| match e {
        HostAllocError::NoMemory => GmmError::NoMemory,
    })?;

    let id = match inner.chunk_ids.allocate() {
        Some(id) => id,
        None => {
            host.free_chunk(mem);
            return Err(GmmError::NoMemory);
        }
    };

    let chunk = Chunk::new(id, mem.base, mem.token);
    inner.store.insert(chunk);

    let (set, store) = inner.free_set_and_store(preferred_set);
    set.link(store, id);
    inner.chunk_count += 1;

    Ok(id)
}

/// Releases a chunk back to the host, per §4.E.
///
/// If the chunk still has live user-space mappings, this instead posts
/// an asynchronous unmap request to every mapping VM and returns without
/// freeing anything — the caller must retry once those land.
pub fn release_chunk(
    inner: &mut GmmInner,
    host: &dyn HostPageAllocator,
    vm_collaborator: &dyn VmCollaborator,
    id: ChunkId,
) -> GmmResult<()> {
    let chunk = inner.store.lookup(id).ok_or(GmmError::PageNotFound)?;
    if chunk.mapping_count() > 0 {
        for mapping in chunk.mappings() {
            vm_collaborator.request_unmap(mapping.vm, id, mapping.user_address);
        }
        return Ok(());
    }

    let pool = chunk.pool();
    let host_mem = HostChunkMemory { base: chunk.host_base(), token: chunk.host_token() };

    if let Some(pool) = pool {
        let (set, store) = inner.free_set_and_store(pool);
        set.unlink(store, id);
    }
    let removed = inner.store.remove(id).ok_or(GmmError::InternalError)?;
    drop(removed);
    inner.chunk_count -= 1;
    inner.chunk_ids.free(id);
    host.free_chunk(host_mem);

    Ok(())
}
