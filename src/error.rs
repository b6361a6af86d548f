// 错误类型
//
// 职责：统一描述编辑与持久化过程中的失败原因，
//       并保留最近一次错误供上层查询

/// Piece Chain 操作结果
pub type Result<T> = std::result::Result<T, PieceChainError>;

/// Piece Chain 操作的错误类型
///
/// I/O 变体携带静态描述与系统 errno，可克隆，
/// 因此同一个值既作为返回值也作为 last_error 槽位保存。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceChainError {
    /// 偏移或长度超出当前内容范围
    #[error("offset {offset} out of range (size {size})")]
    OutOfRange { offset: usize, size: usize },

    /// 底层 I/O 失败
    #[error("{message} (errno {errno})")]
    Io { message: &'static str, errno: i32 },

    /// 不支持的文件类型：既不是普通文件也不是块设备，
    /// 或原子保存的目标是符号链接/硬链接
    #[error("unsupported file type")]
    UnsupportedFileType,
}

impl PieceChainError {
    /// 由 io::Error 构造，保留静态描述与 errno
    pub(crate) fn io(message: &'static str, err: &std::io::Error) -> Self {
        PieceChainError::Io {
            message,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    pub(crate) fn out_of_range(offset: usize, size: usize) -> Self {
        PieceChainError::OutOfRange { offset, size }
    }
}
