//! Durable JSON documents on disk.
//!
//! One logical document per key, stored as pretty-printed JSON at
//! `<root>/<key>.json`. Writes go to a sibling temp file which is synced and
//! renamed over the target, so a reader sees either the old or the new
//! document, never a partial one. Concurrent writers from other processes are
//! not coordinated.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;

use crate::error::{CorruptKind, StoreError};
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};

const EXCERPT_BYTES: usize = 256;

#[derive(Debug, Clone)]
pub struct DurableJsonStore {
    root: PathBuf,
    logger: Logger,
}

impl DurableJsonStore {
    pub fn open(root: impl Into<PathBuf>, logger: Logger) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root, logger })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let path = self.path_for(key);
        let result = Self::read_path(&path);
        if let Err(err @ StoreError::Corrupt { .. }) = &result {
            self.logger.log(
                Level::Error,
                Domain::Store,
                "document_corrupt",
                obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]),
            );
        }
        result
    }

    /// Load and parse the document at an explicit path.
    pub fn read_path<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        parse_document(path, &bytes)
    }

    pub fn write<T: Serialize>(&self, key: &str, document: &T) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let written = Self::write_path(&path, document)?;
        self.logger.log(
            Level::Trace,
            Domain::Store,
            "document_written",
            obj(&[("key", v_str(key)), ("bytes", v_num(written as f64))]),
        );
        Ok(())
    }

    /// Atomically replace the document at `path`. Returns the payload size.
    pub fn write_path<T: Serialize>(path: &Path, document: &T) -> Result<usize, StoreError> {
        let payload = serde_json::to_vec_pretty(document).map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;
        let tmp = temp_path(path);
        let staged = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        // No temp file outlives a failed write.
        if let Err(source) = staged {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        // Persist the rename itself; not all platforms allow opening a directory.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(payload.len() + 1)
    }

    /// Write `default` if no document exists under `key`, otherwise return the
    /// stored document. A corrupt document is reported, never overwritten.
    pub fn ensure_initialized<T>(&self, key: &str, default: T) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.read::<T>(key) {
            Ok(existing) => Ok(existing),
            Err(StoreError::Missing { .. }) => {
                self.write(key, &default)?;
                self.logger.log(
                    Level::Info,
                    Domain::Store,
                    "document_initialized",
                    obj(&[("key", v_str(key))]),
                );
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

fn excerpt(bytes: &[u8]) -> String {
    let end = bytes.len().min(EXCERPT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_document<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        kind: CorruptKind::Encoding,
        excerpt: excerpt(bytes),
        detail: e.to_string(),
    })?;
    serde_json::from_str(text).map_err(|e| {
        let kind = match e.classify() {
            Category::Data => CorruptKind::Shape,
            Category::Syntax | Category::Eof | Category::Io => CorruptKind::Syntax,
        };
        StoreError::Corrupt {
            path: path.to_path_buf(),
            kind,
            excerpt: excerpt(bytes),
            detail: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, DurableJsonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableJsonStore::open(dir.path().join("vali"), Logger::discard()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 0.25);
        store.write("scores", &doc).unwrap();
        let back: BTreeMap<String, f64> = store.read("scores").unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = store();
        let err = store.read::<BTreeMap<String, f64>>("nope").unwrap_err();
        assert!(err.is_missing());
        assert!(err.path().ends_with("nope.json"));
    }

    #[test]
    fn test_syntax_vs_shape_vs_encoding() {
        let (_dir, store) = store();
        fs::write(store.path_for("trunc"), "{\"a\": 0.").unwrap();
        fs::write(store.path_for("shape"), "[1, 2, 3]").unwrap();
        fs::write(store.path_for("bytes"), [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        let kind = |key: &str| match store.read::<BTreeMap<String, f64>>(key) {
            Err(StoreError::Corrupt { kind, .. }) => kind,
            other => panic!("expected corrupt, got {:?}", other),
        };
        assert_eq!(kind("trunc"), CorruptKind::Syntax);
        assert_eq!(kind("shape"), CorruptKind::Shape);
        assert_eq!(kind("bytes"), CorruptKind::Encoding);
    }

    #[test]
    fn test_corrupt_carries_excerpt() {
        let (_dir, store) = store();
        fs::write(store.path_for("bad"), "garbage here").unwrap();
        match store.read::<BTreeMap<String, f64>>("bad") {
            Err(StoreError::Corrupt { path, excerpt, .. }) => {
                assert_eq!(path, store.path_for("bad"));
                assert_eq!(excerpt, "garbage here");
            }
            other => panic!("expected corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_ensure_initialized_is_idempotent() {
        let (_dir, store) = store();
        let first: Vec<u32> = store.ensure_initialized("list", vec![1, 2]).unwrap();
        assert_eq!(first, vec![1, 2]);
        let second: Vec<u32> = store.ensure_initialized("list", vec![9]).unwrap();
        assert_eq!(second, vec![1, 2]);
    }

    #[test]
    fn test_ensure_initialized_does_not_clobber_corrupt() {
        let (_dir, store) = store();
        fs::write(store.path_for("bad"), "{{{").unwrap();
        assert!(store.ensure_initialized::<Vec<u32>>("bad", vec![]).is_err());
        assert_eq!(fs::read_to_string(store.path_for("bad")).unwrap(), "{{{");
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let (_dir, store) = store();
        store.write("doc", &vec![1u8, 2, 3]).unwrap();
        store.write("doc", &vec![4u8]).unwrap();
        let names: Vec<String> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
        let back: Vec<u8> = store.read("doc").unwrap();
        assert_eq!(back, vec![4]);
    }

    #[test]
    fn test_failed_write_cleans_up_temp_file() {
        let (_dir, store) = store();
        // a non-empty directory where the document should go makes the rename fail
        let target = store.path_for("blocked");
        fs::create_dir_all(target.join("inner")).unwrap();

        let err = store.write("blocked", &vec![1u8]).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        let leftovers: Vec<String> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
    }
}
