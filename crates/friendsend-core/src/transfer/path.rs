//! 发送路径校验与目录遍历

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::transfer::error::TransferError;

/// 待发送的单个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
}

/// 将待发送路径解析为根目录下的规范路径
///
/// 相对路径基于 `root`（必须已规范化）。拒绝不存在的路径、符号链接，
/// 以及规范化后不在根目录下的路径。
pub fn resolve(root: &Path, path: &Path) -> Result<PathBuf, TransferError> {
    let joined = if path.is_relative() {
        root.join(path)
    } else {
        path.to_path_buf()
    };

    let meta = match fs::symlink_metadata(&joined) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(joined));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Err(TransferError::SymlinkRefused(joined));
    }

    let canonical = fs::canonicalize(&joined)?;
    if !canonical.starts_with(root) {
        return Err(TransferError::OutsideRoot {
            path: canonical,
            root: root.to_path_buf(),
        });
    }
    Ok(canonical)
}

/// 列出要发送的文件；目录按文件名顺序递归展开
///
/// 遇到符号链接或特殊文件时整个请求失败。
pub fn collect_files(path: &Path) -> Result<Vec<SourceFile>, TransferError> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_file() {
        return Ok(vec![SourceFile {
            path: path.to_path_buf(),
            size: meta.len(),
        }]);
    }
    if !meta.is_dir() {
        return Err(TransferError::UnsupportedFileType(path.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            return Err(TransferError::SymlinkRefused(entry.into_path()));
        }
        if !file_type.is_file() {
            return Err(TransferError::UnsupportedFileType(entry.into_path()));
        }
        let size = entry.metadata()?.len();
        files.push(SourceFile {
            path: entry.into_path(),
            size,
        });
    }
    Ok(files)
}

/// 发给对方的文件名（只含最后一级）
pub fn offer_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 取对方提供的文件名的最后一级，拒绝空名、`.`、`..`
pub fn sanitize_name(name: &str) -> Option<&str> {
    let last = name.rsplit(['/', '\\']).next()?;
    match last {
        "" | "." | ".." => None,
        n if n.contains('\0') => None,
        n => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a.bin"), Some("a.bin"));
        assert_eq!(sanitize_name("../../etc/passwd"), Some("passwd"));
        assert_eq!(sanitize_name("dir\\evil.exe"), Some("evil.exe"));
        assert_eq!(sanitize_name(""), None);
        assert_eq!(sanitize_name("."), None);
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name("foo/"), None);
        assert_eq!(sanitize_name("a\0b"), None);
    }

    #[test]
    fn test_collect_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.bin"), [0u8; 3]).unwrap();
        fs::write(dir.path().join("a.bin"), [0u8; 7]).unwrap();
        fs::write(dir.path().join("sub").join("c.bin"), b"").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| offer_name(&f.path)).collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "c.bin"]);
        assert_eq!(files[0].size, 7);
        assert_eq!(files[2].size, 0);
    }

    #[test]
    fn test_resolve_relative() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::write(root.join("a.bin"), b"x").unwrap();

        assert_eq!(resolve(&root, Path::new("a.bin")).unwrap(), root.join("a.bin"));
        assert_eq!(resolve(&root, Path::new(".")).unwrap(), root);
        assert!(matches!(
            resolve(&root, Path::new("missing")),
            Err(TransferError::NotFound(_))
        ));
    }
}
