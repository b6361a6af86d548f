// pchain - A piece chain byte buffer
//
// Copyright (c) 2026 pchain team
//
// Licensed under MIT License
//
// 职责：使用 Piece Chain 数据结构管理字节内容，
//       支持任意偏移的插入、删除、替换，无限撤销重做，
//       内存映射加载与原子保存

mod block;
mod chain;
mod error;
mod history;
mod iter;
mod piece;
mod save;

// 重新导出
pub use self::chain::PieceChain;
pub use self::error::{PieceChainError, Result};
pub use self::iter::Chunks;
pub use self::save::SaveMode;

/// 块大小配置
pub const MIN_BLOCK_SIZE: usize = 1024 * 1024; // 1MiB，堆块最小容量

/// 性能相关常量
pub const SAVE_CHUNK_SIZE: usize = 64 * 1024; // 64KB，保存时的写块大小
