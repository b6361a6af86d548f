// Piece Chain 核心实现
//
// 职责：维护 piece 活动链与线性版本历史，
//       支持高效插入、删除、替换与撤销重做

use std::fs::File;
use std::mem;
use std::path::Path;

use memmap2::MmapOptions;
use tracing::{debug, trace};

use crate::block::BlockStore;
use crate::error::{PieceChainError, Result};
use crate::history::{Change, Revision, Span};
use crate::piece::{PieceId, PiecePool};

/// Piece Chain：以 piece 链表示的可编辑字节缓冲区
///
/// 内容由活动链上各 piece 引用的字节串接而成。每次结构性编辑
/// 记录为一笔区间交换，提交后成为一个可整体撤销的版本。
/// 单线程使用；迭代期间由借用规则保证内容不被修改。
#[derive(Debug)]
pub struct PieceChain {
    // --- 内容与状态 ---
    pub(crate) size: usize,
    pub(crate) dirty: bool,

    // --- 存储 ---
    pub(crate) blocks: BlockStore,
    pub(crate) pieces: PiecePool,

    // --- 活动链 ---
    pub(crate) head: Option<PieceId>,
    pub(crate) tail: Option<PieceId>,
    cache: Option<PieceId>,

    // --- 版本历史 ---
    pending: Vec<Change>,
    revisions: Vec<Revision>,
    current: usize,

    last_error: Option<PieceChainError>,
}

// ========== 构造方法 ==========

impl PieceChain {
    /// 创建空的 Piece Chain
    pub fn new() -> Self {
        Self {
            size: 0,
            dirty: false,
            blocks: BlockStore::default(),
            pieces: PiecePool::default(),
            head: None,
            tail: None,
            cache: None,
            pending: Vec::new(),
            // 初始空版本是撤销历史的左边界
            revisions: vec![Revision::default()],
            current: 0,
            last_error: None,
        }
    }

    /// 以文件内容创建 Piece Chain
    ///
    /// 文件被只读私有映射，整块内容作为链上的第一个 piece，
    /// 并作为第一笔已提交版本记录（因此不可撤销）。
    /// 映射建立后文件描述符即关闭。
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| PieceChainError::io("Cannot open file", &e))?;
        let meta = file
            .metadata()
            .map_err(|e| PieceChainError::io("Cannot stat file", &e))?;

        // 普通文件取 stat 大小，块设备走 ioctl，其余类型拒绝
        let file_type = meta.file_type();
        let size = if file_type.is_file() {
            meta.len() as usize
        } else if is_block_device(&file_type) {
            block_device_size(&file)? as usize
        } else {
            return Err(PieceChainError::UnsupportedFileType);
        };

        let mut chain = Self {
            size: 0,
            dirty: false,
            blocks: BlockStore::default(),
            pieces: PiecePool::default(),
            head: None,
            tail: None,
            cache: None,
            pending: Vec::new(),
            revisions: Vec::new(),
            current: 0,
            last_error: None,
        };

        // 映射文件内容，作为链上唯一的 piece
        let mut replacement = Span::EMPTY;
        if size > 0 {
            let map = unsafe { MmapOptions::new().len(size).map_copy_read_only(&file) }
                .map_err(|e| PieceChainError::io("Cannot mmap", &e))?;
            let block = chain.blocks.adopt_mapped(map);
            let piece = chain.pieces.alloc(block, 0, size);
            replacement = Span {
                start: Some(piece),
                end: Some(piece),
                len: size,
            };
        }

        // 初始插入作为第一笔已提交的版本
        let change = Change {
            pos: 0,
            original: Span::EMPTY,
            replacement,
        };
        chain.span_swap(change.original, change.replacement);
        chain.pending.push(change);
        chain.commit();

        debug!(path = %path.display(), size, "opened");
        Ok(chain)
    }
}

impl Default for PieceChain {
    fn default() -> Self {
        Self::new()
    }
}

// ========== 基本查询 ==========

impl PieceChain {
    /// 当前内容的总字节数
    pub fn size(&self) -> usize {
        self.size
    }

    /// 是否没有任何内容（size == 0）
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// 自上次保存以来是否被修改过
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 活动链上的 piece 数量
    pub fn piece_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while let Some(id) = cur {
            count += 1;
            cur = self.pieces[id].next;
        }
        count
    }

    /// 最近一次失败操作的错误
    pub fn last_error(&self) -> Option<&PieceChainError> {
        self.last_error.as_ref()
    }

    /// 读取单个字节
    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        match self.locate(offset) {
            Some((piece, piece_offset)) => Ok(self.piece_bytes(piece)[piece_offset]),
            None => Err(PieceChainError::out_of_range(offset, self.size)),
        }
    }

    /// piece 引用的字节切片
    pub(crate) fn piece_bytes(&self, id: PieceId) -> &[u8] {
        let p = &self.pieces[id];
        &self.blocks.get(p.block).bytes()[p.off..p.off + p.len]
    }

    /// 记录错误并返回
    pub(crate) fn fail<T>(&mut self, err: PieceChainError) -> Result<T> {
        self.last_error = Some(err.clone());
        Err(err)
    }

    /// 定位绝对偏移所在的 piece 及片内偏移
    ///
    /// 恰好等于总大小的偏移不落在任何 piece 内，返回 None，
    /// 由调用方决定如何处理末尾插入。
    fn locate(&self, abs: usize) -> Option<(PieceId, usize)> {
        if abs > self.size {
            return None;
        }
        let mut pos = 0;
        let mut cur = self.head;
        while let Some(id) = cur {
            let piece = &self.pieces[id];
            if abs < pos + piece.len {
                return Some((id, abs - pos));
            }
            pos += piece.len;
            cur = piece.next;
        }
        None
    }
}

// ========== 区间操作 ==========

impl PieceChain {
    /// 以链上 [start, end] 区间构造 Span，长度为区间内 piece 之和
    fn make_span(&self, start: Option<PieceId>, end: Option<PieceId>) -> Span {
        let (first, last) = match (start, end) {
            (Some(first), Some(last)) => (first, last),
            _ => return Span::EMPTY,
        };
        let mut len = 0;
        let mut cur = Some(first);
        while let Some(id) = cur {
            len += self.pieces[id].len;
            if id == last {
                break;
            }
            cur = self.pieces[id].next;
        }
        Span { start, end, len }
    }

    /// 将 prev 的后继指向 id（prev 为 None 时更新链头）
    fn link_next(&mut self, prev: Option<PieceId>, id: Option<PieceId>) {
        match prev {
            Some(p) => self.pieces[p].next = id,
            None => self.head = id,
        }
    }

    /// 将 next 的前驱指向 id（next 为 None 时更新链尾）
    fn link_prev(&mut self, next: Option<PieceId>, id: Option<PieceId>) {
        match next {
            Some(n) => self.pieces[n].prev = id,
            None => self.tail = id,
        }
    }

    /// 用 replacement 区间替换链上的 original 区间，并同步总大小
    ///
    /// 新 piece 自身的 prev/next 必须由调用方事先接好，
    /// 这里只改写相邻 piece（或链头链尾）的指向。
    fn span_swap(&mut self, original: Span, replacement: Span) {
        if original.is_empty() && replacement.is_empty() {
            return;
        } else if original.is_empty() {
            // 纯插入
            if let Some((r_start, r_end)) = replacement.ends() {
                let prev = self.pieces[r_start].prev;
                let next = self.pieces[r_end].next;
                self.link_next(prev, Some(r_start));
                self.link_prev(next, Some(r_end));
            }
        } else if replacement.is_empty() {
            // 纯删除
            if let Some((o_start, o_end)) = original.ends() {
                let prev = self.pieces[o_start].prev;
                let next = self.pieces[o_end].next;
                self.link_next(prev, next);
                self.link_prev(next, prev);
            }
        } else if let (Some((o_start, o_end)), Some((r_start, r_end))) =
            (original.ends(), replacement.ends())
        {
            let prev = self.pieces[o_start].prev;
            let next = self.pieces[o_end].next;
            self.link_next(prev, Some(r_start));
            self.link_prev(next, Some(r_end));
        }
        self.size = self.size - original.len + replacement.len;
    }
}

// ========== 缓存 ==========

impl PieceChain {
    /// 设置缓存 piece
    fn cache_put(&mut self, piece: Option<PieceId>) {
        if let Some(id) = piece {
            // 缓存 piece 必须以最后一个块的尾部结尾
            let p = &self.pieces[id];
            debug_assert_eq!(Some(p.block), self.blocks.last_id());
            debug_assert_eq!(p.off + p.len, self.blocks.get(p.block).len());
        }
        self.cache = piece;
    }

    /// 尝试把插入合并进缓存 piece
    ///
    /// 成功时直接改写堆块尾部：片内偏移之后的字节整体后移，
    /// piece、块、链的长度同步增长，并把增量记入最近一笔
    /// 未提交变更的 replacement，撤销时一起回退。
    fn cache_insert(&mut self, piece: PieceId, piece_offset: usize, data: &[u8]) -> bool {
        if self.cache != Some(piece) {
            return false;
        }

        let (block, piece_len) = {
            let p = &self.pieces[piece];
            (p.block, p.len)
        };
        let block_len = self.blocks.get(block).len();
        debug_assert_eq!(self.pieces[piece].off + piece_len, block_len);

        if !self.blocks.get(block).can_fit(data.len()) {
            return false;
        }

        let at = block_len - (piece_len - piece_offset);
        self.blocks.insert_at(block, at, data);

        let n = data.len();
        self.pieces[piece].len += n;
        self.size += n;
        if let Some(change) = self.pending.last_mut() {
            change.replacement.len += n;
        }

        true
    }

    /// 尝试把删除合并进缓存 piece
    ///
    /// 仅当整个删除范围落在缓存 piece 内时成立。
    fn cache_delete(&mut self, piece: PieceId, piece_offset: usize, n: usize) -> bool {
        if self.cache != Some(piece) {
            return false;
        }

        let (block, piece_len) = {
            let p = &self.pieces[piece];
            (p.block, p.len)
        };
        if piece_len - piece_offset < n {
            return false;
        }
        let block_len = self.blocks.get(block).len();
        debug_assert_eq!(self.pieces[piece].off + piece_len, block_len);

        let at = block_len - (piece_len - piece_offset);
        self.blocks.remove_at(block, at, n);

        self.pieces[piece].len -= n;
        self.size -= n;
        if let Some(change) = self.pending.last_mut() {
            change.replacement.len -= n;
        }

        true
    }
}

// ========== 编辑操作 ==========

impl PieceChain {
    /// 在 offset 处插入字节
    pub fn insert(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset > self.size {
            return self.fail(PieceChainError::out_of_range(offset, self.size));
        }

        // 定位插入点；偏移等于总大小时落到最后一个 piece 的末尾
        let located = match self.locate(offset) {
            Some(found) => Some(found),
            None => match self.tail {
                None => None,
                Some(last) if offset == self.size => Some((last, self.pieces[last].len)),
                Some(_) => return self.fail(PieceChainError::out_of_range(offset, self.size)),
            },
        };

        // 任何改动都会使重做历史失效
        self.purge_redo();

        // 先尝试缓存 piece；插在 piece 开头时也尝试它的前驱
        if let Some((piece, piece_offset)) = located {
            if self.cache_insert(piece, piece_offset, data) {
                self.dirty = true;
                return Ok(());
            }
            if piece_offset == 0 {
                if let Some(prev) = self.pieces[piece].prev {
                    let prev_len = self.pieces[prev].len;
                    if self.cache_insert(prev, prev_len, data) {
                        self.dirty = true;
                        return Ok(());
                    }
                }
            }
        }

        // 选择目标块：能容纳就复用最后一个块，否则新分配
        let block = match self.blocks.last_id() {
            Some(id) if self.blocks.get(id).can_fit(data.len()) => id,
            _ => self.blocks.alloc_heap(data.len()),
        };
        let data_off = self.blocks.append(block, data);

        // 按插入点位置构造变更：空链、piece 边界、piece 内部三种情况
        let (original, replacement, fresh) = match located {
            None => {
                // 空链的首次插入
                let piece = self.pieces.alloc(block, data_off, data.len());
                (
                    Span::EMPTY,
                    self.make_span(Some(piece), Some(piece)),
                    piece,
                )
            }
            Some((piece, piece_offset))
                if piece_offset == 0 || piece_offset == self.pieces[piece].len =>
            {
                // 在已有 piece 的边界插入一个新 piece
                let fresh = self.pieces.alloc(block, data_off, data.len());
                if piece_offset == 0 {
                    self.pieces[fresh].prev = self.pieces[piece].prev;
                    self.pieces[fresh].next = Some(piece);
                } else {
                    self.pieces[fresh].prev = Some(piece);
                    self.pieces[fresh].next = self.pieces[piece].next;
                }
                (
                    Span::EMPTY,
                    self.make_span(Some(fresh), Some(fresh)),
                    fresh,
                )
            }
            Some((piece, piece_offset)) => {
                // 在 piece 内部插入：原 piece 一分为三
                let (p_block, p_off, p_len, p_prev, p_next) = {
                    let p = &self.pieces[piece];
                    (p.block, p.off, p.len, p.prev, p.next)
                };
                let before = self.pieces.alloc(p_block, p_off, piece_offset);
                let middle = self.pieces.alloc(block, data_off, data.len());
                let after = self
                    .pieces
                    .alloc(p_block, p_off + piece_offset, p_len - piece_offset);

                self.pieces[before].prev = p_prev;
                self.pieces[before].next = Some(middle);
                self.pieces[middle].prev = Some(before);
                self.pieces[middle].next = Some(after);
                self.pieces[after].prev = Some(middle);
                self.pieces[after].next = p_next;

                (
                    self.make_span(Some(piece), Some(piece)),
                    self.make_span(Some(before), Some(after)),
                    middle,
                )
            }
        };

        self.cache_put(Some(fresh));
        let change = Change {
            pos: offset,
            original,
            replacement,
        };
        self.span_swap(change.original, change.replacement);
        self.pending.push(change);

        self.dirty = true;
        Ok(())
    }

    /// 删除 [offset, offset+len) 范围的字节，越过末尾的部分截断
    pub fn remove(&mut self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if offset > self.size {
            return self.fail(PieceChainError::out_of_range(offset, self.size));
        }

        let (start_piece, start_offset) = match self.locate(offset) {
            Some(found) => found,
            None => return self.fail(PieceChainError::out_of_range(offset, self.size)),
        };
        let (end_piece, end_offset) = match self.locate(offset.saturating_add(len)) {
            Some(found) => found,
            None => match self.tail {
                Some(last) => (last, self.pieces[last].len),
                None => return self.fail(PieceChainError::out_of_range(offset, self.size)),
            },
        };

        // 任何改动都会使重做历史失效
        self.purge_redo();

        // 整个删除范围落在缓存 piece 内时走快路径
        if self.cache_delete(start_piece, start_offset, len) {
            self.dirty = true;
            return Ok(());
        }

        // 范围两端落在 piece 内部时需要切出保留部分
        let split_start = start_offset != 0;
        let split_end = end_offset != self.pieces[end_piece].len;

        let before = self.pieces[start_piece].prev;
        let after = self.pieces[end_piece].next;

        let mut new_start = None;
        let mut new_end = None;

        if split_start {
            let (p_block, p_off) = {
                let p = &self.pieces[start_piece];
                (p.block, p.off)
            };
            let id = self.pieces.alloc(p_block, p_off, start_offset);
            self.pieces[id].prev = before;
            self.pieces[id].next = after;
            new_start = Some(id);
        }
        if split_end {
            let (p_block, p_off, p_len) = {
                let p = &self.pieces[end_piece];
                (p.block, p.off, p.len)
            };
            let id = self
                .pieces
                .alloc(p_block, p_off + end_offset, p_len - end_offset);
            self.pieces[id].prev = before;
            self.pieces[id].next = after;
            if let Some(start_id) = new_start {
                self.pieces[id].prev = Some(start_id);
                self.pieces[start_id].next = Some(id);
            }
            new_end = Some(id);
        }

        // 只切了一边时区间两端指向同一个 piece
        let new_start = new_start.or(new_end);
        let new_end = new_end.or(new_start);

        let change = Change {
            pos: offset,
            original: self.make_span(Some(start_piece), Some(end_piece)),
            replacement: self.make_span(new_start, new_end),
        };
        self.span_swap(change.original, change.replacement);
        self.pending.push(change);

        self.dirty = true;
        Ok(())
    }

    /// 用给定字节替换 [offset, offset+data.len()) 范围
    ///
    /// 等价于 remove 后 insert，两笔变更同属一个版本。
    pub fn replace(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        // 先整体校验范围，保证删除成功后插入不会再失败，
        // 不会留下只有半笔的未提交变更
        if offset > self.size {
            return self.fail(PieceChainError::out_of_range(offset, self.size));
        }
        self.remove(offset, data.len())?;
        self.insert(offset, data)
    }

    /// 丢弃全部内容（不清除撤销历史）
    pub fn clear(&mut self) -> Result<()> {
        if self.size == 0 {
            return Ok(());
        }
        self.remove(0, self.size)
    }
}

// ========== 提交与撤销重做 ==========

impl PieceChain {
    /// 把未提交的变更打包为一个新版本
    ///
    /// 没有未提交变更时只使缓存失效，不产生空版本。
    pub fn commit(&mut self) {
        if !self.pending.is_empty() {
            self.revisions.push(Revision {
                changes: mem::take(&mut self.pending),
            });
            self.current = self.revisions.len() - 1;
        }
        self.cache_put(None);
    }

    /// 撤销最近一个版本，返回该版本中最早变更的位置
    pub fn undo(&mut self) -> Option<usize> {
        self.commit();

        if self.current == 0 {
            return None;
        }

        let mut first_pos = self.size;
        // 逆序回退当前版本中的每笔变更
        for i in (0..self.revisions[self.current].changes.len()).rev() {
            let change = &self.revisions[self.current].changes[i];
            let (original, replacement, pos) = (change.original, change.replacement, change.pos);
            self.span_swap(replacement, original);
            first_pos = first_pos.min(pos);
        }
        self.current -= 1;

        Some(first_pos)
    }

    /// 重做下一个已撤销的版本，返回该版本中最早变更的位置
    pub fn redo(&mut self) -> Option<usize> {
        self.commit();

        if self.current + 1 >= self.revisions.len() {
            return None;
        }
        self.current += 1;

        let mut first_pos = self.size;
        // 正序重放版本中的每笔变更
        for i in 0..self.revisions[self.current].changes.len() {
            let change = &self.revisions[self.current].changes[i];
            let (original, replacement, pos) = (change.original, change.replacement, change.pos);
            self.span_swap(original, replacement);
            first_pos = first_pos.min(pos);
        }

        Some(first_pos)
    }

    /// 丢弃当前版本之后的重做历史
    ///
    /// 被清除变更的 replacement 区间 piece 已不可达，归还池中；
    /// original 区间的 piece 仍被更早的变更或活动链引用，不动。
    fn purge_redo(&mut self) {
        if self.revisions.is_empty() || self.current + 1 >= self.revisions.len() {
            return;
        }

        let purged = self.revisions.split_off(self.current + 1);
        let mut freed = 0usize;
        for rev in &purged {
            for change in &rev.changes {
                let end = change.replacement.end;
                let mut cur = change.replacement.start;
                while let Some(id) = cur {
                    cur = if Some(id) == end {
                        None
                    } else {
                        self.pieces[id].next
                    };
                    self.pieces.free(id);
                    freed += 1;
                }
            }
        }
        trace!(revisions = purged.len(), pieces = freed, "purged redo history");
    }
}

// ========== Linux 块设备支持 ==========

fn is_block_device(file_type: &std::fs::FileType) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        file_type.is_block_device()
    }
    #[cfg(not(unix))]
    {
        let _ = file_type;
        false
    }
}

/// 块设备的 stat 大小恒为 0，需要 ioctl 询问
#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64: _IOR(0x12, 114, u64)
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let res = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        return Err(PieceChainError::io("Cannot get block device size", &err));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> Result<u64> {
    Err(PieceChainError::UnsupportedFileType)
}

// ========== 测试 ==========
