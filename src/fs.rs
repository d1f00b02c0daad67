//! Filesystem probes and mutations used by the lifecycle phases.
//!
//! Every operation runs on the blocking pool so the event loop never waits on
//! disk I/O.

use std::io::ErrorKind;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;

/// Modification time of `path`, `None` if it does not exist.
pub async fn mtime(path: &Utf8Path) -> Result<Option<SystemTime>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn exists(path: &Utf8Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Whether `path` names a regular file.
pub async fn is_file(path: &Utf8Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Creates `path` if missing and sets its modification time to now.
pub async fn touch(path: &Utf8Path) -> Result<()> {
    let path = path.to_owned();
    blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    })
    .await
}

/// Removes a file or a whole directory tree. Missing paths are not an error.
/// Returns whether anything was removed.
pub async fn remove(path: &Utf8Path) -> Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}

/// Copies `src` to `dest`, creating parent directories. The destination keeps
/// the source modification time so later up-to-date checks compare equal.
pub async fn copy(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let (src, dest) = (src.to_owned(), dest.to_owned());
    blocking(move || {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dest)?;
        let modified = std::fs::metadata(&src)?.modified()?;
        std::fs::File::options()
            .write(true)
            .open(&dest)?
            .set_modified(modified)?;
        Ok(())
    })
    .await
}

pub async fn create_dir_all(path: &Utf8Path) -> Result<()> {
    Ok(tokio::fs::create_dir_all(path).await?)
}

pub async fn read_to_string(path: &Utf8Path) -> Result<String> {
    Ok(tokio::fs::read_to_string(path).await?)
}

pub async fn write(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::write(path, contents).await?)
}

/// Expands glob `patterns` relative to `base` into sorted, absolute,
/// regular-file paths.
pub async fn glob(base: &Utf8Path, patterns: &[String]) -> Result<Vec<Utf8PathBuf>> {
    let base = base.to_owned();
    let patterns = patterns.to_vec();

    blocking(move || {
        let mut found = Vec::new();
        for pattern in &patterns {
            let full = if Utf8Path::new(pattern).is_absolute() {
                pattern.clone()
            } else {
                base.join(pattern).into_string()
            };

            for entry in glob::glob(&full)? {
                let path = Utf8PathBuf::try_from(entry?)?;
                if path.is_file() {
                    found.push(path);
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    })
    .await
}

/// Every regular file below `dir`, sorted.
pub async fn walk(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let dir = dir.to_owned();
    blocking(move || {
        let mut found = Vec::new();
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = Utf8PathBuf::try_from(entry?.path())?;
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_mtime_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(mtime(&root(&dir).join("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_touch_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = root(&dir).join("a/b/stamp");

        touch(&path).await.unwrap();
        assert!(exists(&path).await);
        assert!(mtime(&path).await.unwrap().is_some());

        assert!(remove(&root(&dir).join("a")).await.unwrap());
        assert!(!exists(&path).await);
        assert!(!remove(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_keeps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = root(&dir).join("src.txt");
        std::fs::write(&src, "hello").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let dest = root(&dir).join("out/dest.txt");
        copy(&src, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
        assert_eq!(mtime(&dest).await.unwrap(), Some(past));
    }

    #[tokio::test]
    async fn test_glob_and_walk() {
        let dir = tempfile::tempdir().unwrap();
        let base = root(&dir);
        for file in ["src/a.c", "src/b.c", "src/nested/c.c", "include/x.h"] {
            let path = base.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "").unwrap();
        }

        let found = glob(&base, &["src/*.c".into(), "src/a.c".into()]).await.unwrap();
        assert_eq!(found, vec![base.join("src/a.c"), base.join("src/b.c")]);

        let all = walk(&base.join("src")).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
