// 内存块管理
//
// 职责：持有原始字节存储，堆上可追加块与只读内存映射块，
//       所有块由引擎统一持有并在析构时整体释放

use memmap2::Mmap;

use crate::MIN_BLOCK_SIZE;

/// 块编号（块存储内的下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockId(u32);

/// 内存块
///
/// 堆块的 [0, len) 一旦被 piece 引用即视为冻结，
/// 只有备用容量构成的尾部可以继续写入；映射块整体只读。
#[derive(Debug)]
pub(crate) enum Block {
    /// 可追加的堆缓冲区
    Heap(Vec<u8>),
    /// 只读内存映射的文件区域
    Mapped(Mmap),
}

impl Block {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Block::Heap(buf) => buf,
            Block::Mapped(map) => map,
        }
    }

    /// 已填充长度
    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    /// 尾部剩余空间能否容纳 n 字节（映射块恒为否）
    pub(crate) fn can_fit(&self, n: usize) -> bool {
        match self {
            Block::Heap(buf) => buf.capacity() - buf.len() >= n,
            Block::Mapped(_) => false,
        }
    }
}

/// 块存储：只增不减，随引擎一起释放
#[derive(Debug, Default)]
pub(crate) struct BlockStore {
    blocks: Vec<Block>,
}

impl BlockStore {
    /// 分配一个容量至少为 MIN_BLOCK_SIZE 的堆块
    pub(crate) fn alloc_heap(&mut self, min_size: usize) -> BlockId {
        let capacity = min_size.max(MIN_BLOCK_SIZE);
        self.blocks.push(Block::Heap(Vec::with_capacity(capacity)));
        BlockId((self.blocks.len() - 1) as u32)
    }

    /// 纳入一个映射块
    pub(crate) fn adopt_mapped(&mut self, map: Mmap) -> BlockId {
        self.blocks.push(Block::Mapped(map));
        BlockId((self.blocks.len() - 1) as u32)
    }

    pub(crate) fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// 最近分配的块
    pub(crate) fn last_id(&self) -> Option<BlockId> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(BlockId((self.blocks.len() - 1) as u32))
        }
    }

    /// 向堆块尾部追加数据，返回数据在块内的起始偏移。
    /// 调用方必须先用 can_fit 确认容量。
    pub(crate) fn append(&mut self, id: BlockId, data: &[u8]) -> usize {
        match &mut self.blocks[id.0 as usize] {
            Block::Heap(buf) => {
                debug_assert!(buf.capacity() - buf.len() >= data.len());
                let off = buf.len();
                buf.extend_from_slice(data);
                off
            }
            Block::Mapped(_) => unreachable!("append to mapped block"),
        }
    }

    /// 在堆块内部 at 处插入数据，at 之后的字节整体后移。
    /// 仅用于缓存路径：被移动的字节都属于缓存 piece。
    pub(crate) fn insert_at(&mut self, id: BlockId, at: usize, data: &[u8]) {
        match &mut self.blocks[id.0 as usize] {
            Block::Heap(buf) => {
                debug_assert!(buf.capacity() - buf.len() >= data.len());
                buf.splice(at..at, data.iter().copied());
            }
            Block::Mapped(_) => unreachable!("write to mapped block"),
        }
    }

    /// 从堆块内部 at 处移除 n 字节，其后的字节整体前移
    pub(crate) fn remove_at(&mut self, id: BlockId, at: usize, n: usize) {
        match &mut self.blocks[id.0 as usize] {
            Block::Heap(buf) => {
                buf.drain(at..at + n);
            }
            Block::Mapped(_) => unreachable!("write to mapped block"),
        }
    }
}
