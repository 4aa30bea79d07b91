//! Texel memory allocator: per-resource regions inside one shared bit-mask
//! buffer, one bit per texel, 32-aligned bases.

use crate::texel_address::layout;
use aegis_export::commands::CommandBuilder;
use aegis_export::scheduler::{Queue, Scheduler, TileMapping};
use aegis_export::shader_data::{ShaderDataBufferInfo, ShaderDataHost, ShaderDataId};
use std::sync::Mutex;

/// Default mask capacity: 1M words, 32M texel bits.
const DEFAULT_CAPACITY_WORDS: u32 = 1 << 20;

/// The smallest buddy tile, in words.
const MIN_TILE_WORDS: u32 = 32;

/// One reserved region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TexelMemoryAllocation {
    /// First word of the region; always 32-aligned.
    pub texel_base_block: u32,
    /// Reserved length in words.
    pub word_count: u32,
}

/// Geometry of a resource, as the allocator sees it.
#[derive(Copy, Clone, Debug)]
pub struct ResourceTexelInfo {
    pub width: u32,
    pub height: u32,
    pub depth_or_slices: u32,
    pub mip_count: u32,
    pub volumetric: bool,
    /// Buffers size by element count instead of the aligned mip layout.
    pub is_buffer: bool,
}

impl ResourceTexelInfo {
    pub fn texel_count(&self) -> u32 {
        if self.is_buffer {
            self.width.max(1)
        } else {
            layout::texel_count(
                self.width,
                self.height,
                self.depth_or_slices,
                self.mip_count,
                self.volumetric,
            )
        }
    }
}

struct AllocatorInner {
    /// Free lists per buddy order; entries are word offsets.
    free_lists: Vec<Vec<u32>>,
    capacity_words: u32,
    /// Pending sparse mappings committed by the next residency update.
    pending_tiles: Vec<TileMapping>,
}

/// Buddy free-list over fixed-size tiles of the mask buffer.
pub struct TexelMemoryAllocator {
    inner: Mutex<AllocatorInner>,
    texel_blocks_buffer: ShaderDataId,
}

fn order_of(word_count: u32) -> usize {
    let tiles = (word_count.max(1) + MIN_TILE_WORDS - 1) / MIN_TILE_WORDS;
    (32 - tiles.next_power_of_two().leading_zeros() - 1) as usize
}

fn order_words(order: usize) -> u32 {
    MIN_TILE_WORDS << order
}

impl TexelMemoryAllocator {
    /// Create the shared mask buffer and seed the free lists.
    pub fn install(shader_data: &dyn ShaderDataHost) -> TexelMemoryAllocator {
        Self::with_capacity(shader_data, DEFAULT_CAPACITY_WORDS)
    }

    pub fn with_capacity(
        shader_data: &dyn ShaderDataHost,
        capacity_words: u32,
    ) -> TexelMemoryAllocator {
        let capacity_words = capacity_words.next_power_of_two();
        let buffer = shader_data.create_buffer(ShaderDataBufferInfo {
            element_count: capacity_words,
        });

        let top_order = order_of(capacity_words);
        let mut free_lists = vec![Vec::new(); top_order + 1];
        free_lists[top_order].push(0);

        info!(
            "texel allocator installed: {} words of mask memory",
            capacity_words
        );

        TexelMemoryAllocator {
            inner: Mutex::new(AllocatorInner {
                free_lists,
                capacity_words,
                pending_tiles: Vec::new(),
            }),
            texel_blocks_buffer: buffer,
        }
    }

    /// The shared mask buffer exposed to instrumented shaders.
    pub fn texel_blocks_buffer(&self) -> ShaderDataId {
        self.texel_blocks_buffer
    }

    /// Reserve `ceil(texel_count / 32)` words at a 32-aligned base.
    pub fn allocate(&self, info: ResourceTexelInfo) -> TexelMemoryAllocation {
        let texel_count = info.texel_count();
        let word_count = (texel_count + 31) / 32;
        let order = order_of(word_count);

        let mut inner = self.inner.lock().unwrap();

        // Find the first order with a free tile, splitting down.
        let mut found = None;
        for candidate in order..inner.free_lists.len() {
            if let Some(base) = inner.free_lists[candidate].pop() {
                found = Some((candidate, base));
                break;
            }
        }

        let (mut current, base) = match found {
            Some(found) => found,
            None => {
                // Exhausted; hand out a zero-length region rather than
                // failing the application.
                warn!("texel mask memory exhausted ({} words requested)", word_count);
                return TexelMemoryAllocation { texel_base_block: 0, word_count: 0 };
            }
        };

        while current > order {
            current -= 1;
            let buddy = base + order_words(current);
            inner.free_lists[current].push(buddy);
        }

        debug_assert_eq!(base % 32, 0);
        TexelMemoryAllocation { texel_base_block: base, word_count: order_words(order) }
    }

    /// Zero-fill the region; recorded on the exclusive transfer queue by the
    /// caller.
    pub fn initialize(&self, builder: &mut CommandBuilder, allocation: &TexelMemoryAllocation) {
        if allocation.word_count == 0 {
            return;
        }
        builder.clear_buffer(
            self.texel_blocks_buffer,
            allocation.texel_base_block,
            allocation.word_count,
            0,
        );
    }

    /// Queue a sparse tile for the next residency commit.
    pub fn map_tile(&self, mapping: TileMapping) {
        self.inner.lock().unwrap().pending_tiles.push(mapping);
    }

    /// Commit pending tile mappings in one sparse bind.
    pub fn update_residency(&self, scheduler: &dyn Scheduler, queue: Queue) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.pending_tiles, Vec::new())
        };
        if !pending.is_empty() {
            scheduler.map_tiles(queue, self.texel_blocks_buffer, &pending);
        }
    }

    /// Return a region to the free list, merging buddies.
    pub fn free(&self, allocation: TexelMemoryAllocation) {
        if allocation.word_count == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut order = order_of(allocation.word_count);
        let mut base = allocation.texel_base_block;

        loop {
            let size = order_words(order);
            let buddy = base ^ size;
            if order + 1 >= inner.free_lists.len() || buddy >= inner.capacity_words {
                break;
            }
            if let Some(position) = inner.free_lists[order].iter().position(|&b| b == buddy) {
                inner.free_lists[order].swap_remove(position);
                base = base.min(buddy);
                order += 1;
            } else {
                break;
            }
        }

        inner.free_lists[order].push(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct TestShaderData {
        buffers: StdMutex<Vec<Vec<u32>>>,
    }

    impl TestShaderData {
        fn new() -> TestShaderData {
            TestShaderData { buffers: StdMutex::new(Vec::new()) }
        }
    }

    impl ShaderDataHost for TestShaderData {
        fn create_buffer(&self, info: ShaderDataBufferInfo) -> ShaderDataId {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.push(vec![0; info.element_count as usize]);
            (buffers.len() - 1) as ShaderDataId
        }

        fn destroy_buffer(&self, _id: ShaderDataId) {}

        fn read_buffer(&self, id: ShaderDataId) -> Vec<u32> {
            self.buffers.lock().unwrap()[id as usize].clone()
        }
    }

    #[test]
    fn allocations_are_32_aligned_and_disjoint() {
        let host = TestShaderData::new();
        let allocator = TexelMemoryAllocator::with_capacity(&host, 1 << 12);

        let info = |texels: u32| ResourceTexelInfo {
            width: texels,
            height: 1,
            depth_or_slices: 1,
            mip_count: 1,
            volumetric: false,
            is_buffer: true,
        };

        let a = allocator.allocate(info(1024));
        let b = allocator.allocate(info(4096));
        let c = allocator.allocate(info(33));

        for allocation in [&a, &b, &c].iter() {
            assert_eq!(allocation.texel_base_block % 32, 0);
        }

        let ranges = [
            (a.texel_base_block, a.word_count),
            (b.texel_base_block, b.word_count),
            (c.texel_base_block, c.word_count),
        ];
        for (i, &(base_a, len_a)) in ranges.iter().enumerate() {
            for &(base_b, len_b) in ranges.iter().skip(i + 1) {
                assert!(base_a + len_a <= base_b || base_b + len_b <= base_a);
            }
        }
    }

    #[test]
    fn free_merges_buddies() {
        let host = TestShaderData::new();
        let allocator = TexelMemoryAllocator::with_capacity(&host, 1 << 10);

        let info = ResourceTexelInfo {
            width: 32 * 32,
            height: 1,
            depth_or_slices: 1,
            mip_count: 1,
            volumetric: false,
            is_buffer: true,
        };

        let a = allocator.allocate(info);
        allocator.free(a);

        // The whole capacity merges back; the next large allocation fits.
        let large = ResourceTexelInfo { width: (1 << 10) * 32, ..info };
        let b = allocator.allocate(large);
        assert_eq!(b.word_count, 1 << 10);
    }
}
