// 持久化
//
// 职责：把链上内容写入文件，支持原子重命名与就地覆写两种策略

use std::ffi::OsString;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::chain::PieceChain;
use crate::error::{PieceChainError, Result};
use crate::SAVE_CHUNK_SIZE;

/// 保存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// 先尝试 Atomic，失败则退回 InPlace
    #[default]
    Auto,
    /// 写临时文件后用 rename(2) 覆盖目标，失败不破坏原文件。
    /// 目标是符号链接或硬链接时拒绝。
    Atomic,
    /// 直接覆写目标文件，中途出错可能造成数据丢失
    InPlace,
}

impl PieceChain {
    /// 把内容保存到 path，成功后清除 dirty 标记
    pub fn save(&mut self, path: impl AsRef<Path>, mode: SaveMode) -> Result<()> {
        let path = path.as_ref();

        let result = match mode {
            SaveMode::Atomic => self.save_atomic(path),
            SaveMode::InPlace => self.save_inplace(path),
            SaveMode::Auto => self
                .save_atomic(path)
                .or_else(|_| self.save_inplace(path)),
        };

        match result {
            Ok(()) => {
                self.dirty = false;
                debug!(path = %path.display(), size = self.size(), "saved");
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    /// 就地覆写：打开目标直接写入并 fsync
    fn save_inplace(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| PieceChainError::io("Cannot open file", &e))?;

        self.write_to(&mut file)?;

        file.sync_all()
            .map_err(|e| PieceChainError::io("Cannot fsync file", &e))?;
        Ok(())
    }

    /// 原子保存：写 `<path>~~save` 临时文件，fsync 后 rename 覆盖目标，
    /// 再 fsync 目标所在目录。任何一步失败都删除临时文件，不碰目标。
    fn save_atomic(&self, path: &Path) -> Result<()> {
        // 检查既有目标：rename 方案不适用于符号链接和硬链接
        let old_meta = match fs::symlink_metadata(path) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(PieceChainError::io("Cannot stat file", &err)),
        };
        if let Some(meta) = &old_meta {
            if !meta.file_type().is_file() || meta.nlink() > 1 {
                return Err(PieceChainError::UnsupportedFileType);
            }
        }

        // 临时文件与目标同目录，保证 rename 不跨文件系统
        let mut tmp_name = OsString::from(path.as_os_str());
        tmp_name.push("~~save");
        let tmp_path = PathBuf::from(tmp_name);

        let result = self.write_temp_and_rename(path, &tmp_path, old_meta.as_ref());
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_temp_and_rename(
        &self,
        path: &Path,
        tmp_path: &Path,
        old_meta: Option<&Metadata>,
    ) -> Result<()> {
        // 沿用原文件的权限位，新文件用 0666 交给 umask 裁剪
        let mode = old_meta.map(|m| m.mode() & 0o7777).unwrap_or(0o666);
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(tmp_path)
            .map_err(|e| PieceChainError::io("Cannot open temp file", &e))?;

        // 尽力保留原文件属主，失败不致命
        if let Some(meta) = old_meta {
            unsafe {
                if meta.uid() != libc::getuid() || meta.gid() != libc::getgid() {
                    let _ = libc::fchown(tmp.as_raw_fd(), meta.uid(), meta.gid());
                }
            }
        }

        self.write_to(&mut tmp)?;
        tmp.sync_all()
            .map_err(|e| PieceChainError::io("Cannot fsync temp file", &e))?;
        drop(tmp);

        fs::rename(tmp_path, path)
            .map_err(|e| PieceChainError::io("Cannot rename temp file to destination", &e))?;

        // fsync 目标所在目录，确认 rename 已落盘
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dir = File::open(dir)
            .map_err(|e| PieceChainError::io("Cannot open destination directory", &e))?;
        dir.sync_all()
            .map_err(|e| PieceChainError::io("Cannot fsync destination directory", &e))?;

        Ok(())
    }

    /// 通过访问器把全部内容按块写出
    fn write_to(&self, file: &mut File) -> Result<()> {
        let mut result = Ok(());
        self.visit(0, self.size(), |_, data| {
            for part in data.chunks(SAVE_CHUNK_SIZE) {
                if let Err(err) = file.write_all(part) {
                    result = Err(PieceChainError::io("Cannot write", &err));
                    return false;
                }
            }
            true
        });
        result
    }
}
