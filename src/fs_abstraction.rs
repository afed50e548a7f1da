//! Filesystem abstraction layer for testability
//!
//! The hostset controller talks to kernel pseudo-files under `/proc/net`
//! through [`FileSystem`], so tests can stand in a mock (or a temp dir)
//! for the kernel interface.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::io::AsyncWriteExt;

#[cfg(test)]
use mockall::automock;

/// Trait abstracting filesystem operations for dependency injection.
///
/// # Example (testing)
/// ```ignore
/// use blockctl::fs_abstraction::MockFileSystem;
///
/// let mut mock_fs = MockFileSystem::new();
/// mock_fs.expect_list_dir()
///     .returning(|_| Ok(vec!["c_games_tls_hostset".to_string()]));
/// ```
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// List the entry names of a directory.
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Append bytes to an existing file with a single write call.
    ///
    /// The file is not created if missing: kernel pseudo-files only exist
    /// while the owning module has them registered.
    async fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

/// Real filesystem implementation using tokio::fs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFileSystem;

#[async_trait]
impl FileSystem for RealFileSystem {
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?;
        file.write_all(contents).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_real_fs_list_dir() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("set_a"), b"").unwrap();
        std::fs::write(temp_dir.path().join("set_b"), b"").unwrap();

        let mut names = RealFileSystem.list_dir(temp_dir.path()).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["set_a", "set_b"]);
    }

    #[tokio::test]
    async fn test_real_fs_list_missing_dir() {
        let result = RealFileSystem
            .list_dir(Path::new("/nonexistent/blockctl/hostset"))
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_real_fs_append_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("hostset");
        std::fs::write(&file_path, b"").unwrap();

        let fs = RealFileSystem;
        fs.append(&file_path, b"+a.com").await.unwrap();
        fs.append(&file_path, b"-b.com").await.unwrap();
        fs.append(&file_path, b"/").await.unwrap();

        let content = std::fs::read_to_string(&file_path).unwrap();
        assert_eq!(content, "+a.com-b.com/");
    }

    #[tokio::test]
    async fn test_real_fs_append_does_not_create() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("missing");

        let result = RealFileSystem.append(&file_path, b"+a.com").await;
        assert!(result.is_err());
        assert!(!file_path.exists());
    }

    #[test]
    fn test_real_fs_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RealFileSystem>();
    }

    #[tokio::test]
    async fn test_mock_fs_error_simulation() {
        let mut mock = MockFileSystem::new();
        mock.expect_append().returning(|_, _| {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "access denied",
            ))
        });

        let result = mock.append(Path::new("/proc/net/xt_tls/hostset/x"), b"+a").await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }
}
