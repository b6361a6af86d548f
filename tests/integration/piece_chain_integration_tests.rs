// Piece Chain 集成测试
//
// 覆盖文件加载、三种保存策略与 dirty 标记的完整生命周期

use std::fs;
use std::os::unix::fs::PermissionsExt;

use pchain::{PieceChain, PieceChainError, SaveMode};

fn contents(chain: &PieceChain) -> Vec<u8> {
    chain
        .iter(0, chain.size())
        .fold(Vec::new(), |mut acc, chunk| {
            acc.extend_from_slice(chunk);
            acc
        })
}

#[test]
fn test_open_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist");

    let result = PieceChain::open(&path);
    assert!(matches!(
        result,
        Err(PieceChainError::Io {
            message: "Cannot open file",
            ..
        })
    ));
}

#[test]
fn test_open_rejects_directory() {
    let dir = tempfile::tempdir().unwrap();

    let result = PieceChain::open(dir.path());
    assert!(matches!(result, Err(PieceChainError::UnsupportedFileType)));
}

#[test]
fn test_open_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    fs::write(&path, b"").unwrap();

    let mut chain = PieceChain::open(&path).unwrap();
    assert!(chain.is_empty());
    assert!(!chain.is_dirty());
    assert_eq!(chain.piece_count(), 0);
    assert_eq!(chain.undo(), None);
}

#[test]
fn test_open_maps_file_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed");
    fs::write(&path, b"hello world").unwrap();

    let chain = PieceChain::open(&path).unwrap();
    assert_eq!(chain.size(), 11);
    assert!(!chain.is_dirty());
    // 整个文件映射为单个 piece
    assert_eq!(chain.piece_count(), 1);
    assert_eq!(contents(&chain), b"hello world");
    assert_eq!(chain.read_byte(6).unwrap(), b'w');
}

#[test]
fn test_initial_revision_is_not_undoable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed");
    fs::write(&path, b"hello").unwrap();

    let mut chain = PieceChain::open(&path).unwrap();
    assert_eq!(chain.undo(), None);
    assert_eq!(contents(&chain), b"hello");
}

#[test]
fn test_edit_mapped_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed");
    fs::write(&path, b"hello world").unwrap();

    let mut chain = PieceChain::open(&path).unwrap();

    // 在映射 piece 中间插入，再删一段横跨映射与堆的范围
    chain.insert(5, b",").unwrap();
    assert_eq!(contents(&chain), b"hello, world");
    assert!(chain.is_dirty());
    chain.commit();

    chain.remove(3, 5).unwrap();
    assert_eq!(contents(&chain), b"helorld");

    assert_eq!(chain.undo(), Some(3));
    assert_eq!(contents(&chain), b"hello, world");
    assert_eq!(chain.undo(), Some(5));
    assert_eq!(contents(&chain), b"hello world");
    assert_eq!(chain.undo(), None);

    assert_eq!(chain.redo(), Some(5));
    assert_eq!(contents(&chain), b"hello, world");
}

#[test]
fn test_save_roundtrip_all_modes() {
    let dir = tempfile::tempdir().unwrap();

    for (name, mode) in [
        ("auto", SaveMode::Auto),
        ("atomic", SaveMode::Atomic),
        ("inplace", SaveMode::InPlace),
    ] {
        let path = dir.path().join(name);

        let mut chain = PieceChain::new();
        chain.insert(0, b"hello").unwrap();
        chain.commit();
        chain.insert(5, b" world").unwrap();
        chain.save(&path, mode).unwrap();
        assert!(!chain.is_dirty());

        // 保存再打开得到完全相同的内容
        let reopened = PieceChain::open(&path).unwrap();
        assert_eq!(contents(&reopened), contents(&chain));
    }
}

#[test]
fn test_save_empty_chain_creates_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty-out");

    let mut chain = PieceChain::new();
    chain.save(&path, SaveMode::Auto).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"");
}

#[test]
fn test_save_atomic_overwrites_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target");
    fs::write(&path, b"previous contents, quite a bit longer").unwrap();

    let mut chain = PieceChain::new();
    chain.insert(0, b"new").unwrap();
    chain.save(&path, SaveMode::Atomic).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"new");
}

#[test]
fn test_save_atomic_preserves_mode_bits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target");
    fs::write(&path, b"old").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

    let mut chain = PieceChain::new();
    chain.insert(0, b"new").unwrap();
    chain.save(&path, SaveMode::Atomic).unwrap();

    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_save_atomic_rejects_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    let link = dir.path().join("link");
    fs::write(&target, b"original").unwrap();
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let mut chain = PieceChain::new();
    chain.insert(0, b"new").unwrap();

    let result = chain.save(&link, SaveMode::Atomic);
    assert!(matches!(result, Err(PieceChainError::UnsupportedFileType)));
    // 失败的原子保存不碰目标
    assert_eq!(fs::read(&target).unwrap(), b"original");
    assert!(chain.is_dirty());
}

#[test]
fn test_save_auto_falls_back_on_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    let link = dir.path().join("link");
    fs::write(&target, b"original").unwrap();
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let mut chain = PieceChain::new();
    chain.insert(0, b"new").unwrap();

    // Auto 退回就地保存，穿过符号链接写到目标
    chain.save(&link, SaveMode::Auto).unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"new");
    assert!(!chain.is_dirty());
}

#[test]
fn test_save_atomic_rejects_hard_link() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    let link = dir.path().join("hardlink");
    fs::write(&target, b"original").unwrap();
    fs::hard_link(&target, &link).unwrap();

    let mut chain = PieceChain::new();
    chain.insert(0, b"new").unwrap();

    let result = chain.save(&target, SaveMode::Atomic);
    assert!(matches!(result, Err(PieceChainError::UnsupportedFileType)));
    assert_eq!(fs::read(&target).unwrap(), b"original");
}

#[test]
fn test_dirty_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed");
    fs::write(&path, b"hello").unwrap();

    let mut chain = PieceChain::open(&path).unwrap();
    assert!(!chain.is_dirty());

    chain.insert(5, b"!").unwrap();
    assert!(chain.is_dirty());

    let out = dir.path().join("out");
    chain.save(&out, SaveMode::Auto).unwrap();
    assert!(!chain.is_dirty());
    assert_eq!(fs::read(&out).unwrap(), b"hello!");
}

#[test]
fn test_edit_save_reopen_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc");
    fs::write(&path, b"fn main() {}\n").unwrap();

    let mut chain = PieceChain::open(&path).unwrap();
    chain.replace(11, b" println!(\"hi\"); }\n").unwrap();
    chain.commit();
    assert_eq!(contents(&chain), b"fn main() { println!(\"hi\"); }\n");

    chain.save(&path, SaveMode::Atomic).unwrap();

    let reopened = PieceChain::open(&path).unwrap();
    assert_eq!(contents(&reopened), b"fn main() { println!(\"hi\"); }\n");
}
