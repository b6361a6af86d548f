// 惰性迭代与访问
//
// 职责：按 piece 惰性遍历指定字节窗口，产出零拷贝的字节切片

use crate::chain::PieceChain;
use crate::piece::PieceId;

impl PieceChain {
    /// 返回 [start, start+len) 窗口的块迭代器
    ///
    /// 迭代器持有链的只读借用，迭代期间无法修改内容。
    pub fn iter(&self, start: usize, len: usize) -> Chunks<'_> {
        Chunks {
            chain: self,
            current_off: start,
            max_off: start.saturating_add(len).min(self.size()),
            current_piece: None,
        }
    }

    /// 访问 [start, start+len) 窗口，按 piece 回调（绝对偏移，字节）
    ///
    /// 回调返回 false 时中止遍历并返回 false。
    pub fn visit<F>(&self, start: usize, len: usize, mut visitor: F) -> bool
    where
        F: FnMut(usize, &[u8]) -> bool,
    {
        if start >= self.size() || len == 0 {
            return true;
        }
        let end = start.saturating_add(len).min(self.size());

        let mut off = 0;
        let mut cur = self.head;
        while let Some(id) = cur {
            if off >= end {
                break;
            }
            let piece_len = self.pieces[id].len;
            if off + piece_len > start {
                // 把 piece 裁剪到窗口内
                let begin = if off < start { start - off } else { 0 };
                let stop = piece_len.min(end - off);
                if begin < stop && !visitor(off + begin, &self.piece_bytes(id)[begin..stop]) {
                    return false;
                }
            }
            off += piece_len;
            cur = self.pieces[id].next;
        }
        true
    }
}

/// 字节窗口上的块迭代器，逐 piece 产出切片
///
/// 克隆只复制偏移和当前 piece 的引用，代价很低。
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    chain: &'a PieceChain,
    current_off: usize,
    max_off: usize,
    current_piece: Option<PieceId>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.current_off >= self.max_off {
            return None;
        }

        match self.current_piece {
            None => {
                // 首次调用：找到包含起始偏移的 piece
                let start = self.current_off;
                let mut off = 0;
                let mut cur = self.chain.head;
                while let Some(id) = cur {
                    let piece_len = self.chain.pieces[id].len;
                    if off + piece_len > start {
                        let begin = start - off;
                        let take = (piece_len - begin).min(self.max_off - start);
                        self.current_piece = Some(id);
                        self.current_off += take;
                        return Some(&self.chain.piece_bytes(id)[begin..begin + take]);
                    }
                    off += piece_len;
                    cur = self.chain.pieces[id].next;
                }
                None
            }
            Some(prev) => {
                // 推进到下一个 piece
                let id = self.chain.pieces[prev].next?;
                let piece_len = self.chain.pieces[id].len;
                let take = piece_len.min(self.max_off - self.current_off);
                self.current_piece = Some(id);
                self.current_off += take;
                Some(&self.chain.piece_bytes(id)[..take])
            }
        }
    }
}
