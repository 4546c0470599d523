//! Local folder file store
//!
//! File ids are absolute paths. Folders are resolved against the store root,
//! so relative `[source] folder` values are relative to the config directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{FileStore, RemoteFile, SourceError};

/// File store over a local directory tree
#[derive(Debug, Clone)]
pub struct LocalFolderStore {
    root: PathBuf,
}

impl LocalFolderStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, folder: &str) -> PathBuf {
        self.root.join(folder)
    }
}

#[async_trait(?Send)]
impl FileStore for LocalFolderStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>, SourceError> {
        let dir = self.resolve(folder);
        if !dir.is_dir() {
            return Err(SourceError::NotFound(format!(
                "folder {} does not exist",
                dir.display()
            )));
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push(RemoteFile {
                    id: path.to_string_lossy().into_owned(),
                    name: name.to_string(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download(&self, id: &str, local_path: &Path) -> Result<(), SourceError> {
        let source = Path::new(id);
        if !source.is_file() {
            return Err(SourceError::NotFound(id.to_string()));
        }
        if source == local_path {
            return Ok(());
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, local_path).await?;
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        _mime_type: &str,
        parent_folder: &str,
        existing_id: Option<&str>,
    ) -> Result<String, SourceError> {
        let target = match existing_id {
            Some(id) => PathBuf::from(id),
            None => self.resolve(parent_folder).join(name),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_download_upload() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("exports")).unwrap();
        std::fs::create_dir(root.path().join("exports").join("nested")).unwrap();
        std::fs::write(root.path().join("exports").join("b.xlsx"), b"b").unwrap();
        std::fs::write(root.path().join("exports").join("a.xlsx"), b"a").unwrap();

        let store = LocalFolderStore::new(root.path());
        let files = store.list_files("exports").await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.xlsx", "b.xlsx"]);

        let dest = root.path().join("work").join("a.xlsx");
        store.download(&files[0].id, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"a");

        let id = store
            .upload(&dest, "copy.xlsx", "application/octet-stream", "out", None)
            .await
            .unwrap();
        assert!(Path::new(&id).ends_with("out/copy.xlsx"));

        std::fs::write(&dest, b"changed").unwrap();
        let same = store
            .upload(&dest, "copy.xlsx", "application/octet-stream", "out", Some(&id))
            .await
            .unwrap();
        assert_eq!(same, id);
        assert_eq!(std::fs::read(&id).unwrap(), b"changed");
    }

    #[tokio::test]
    async fn test_missing_folder_and_file() {
        let root = TempDir::new().unwrap();
        let store = LocalFolderStore::new(root.path());
        assert!(matches!(
            store.list_files("nope").await,
            Err(SourceError::NotFound(_))
        ));
        assert!(
            store
                .download("/definitely/not/here.xlsx", &root.path().join("x"))
                .await
                .is_err()
        );
    }
}
