//! Persistence for what the agent saves: output records, dataset rows and blobs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Key the `save_object_to_output` action writes to.
pub const OUTPUT_RECORD_KEY: &str = "OUTPUT";

const KEY_VALUE_DIR: &str = "key_value_store";
const DATASET_DIR: &str = "dataset";

/// Where saved data goes.
pub trait Store: Send + Sync {
    /// Write a JSON record under `key`, replacing any previous one.
    fn set_value(&self, key: &str, value: &Value) -> Result<()>;

    /// Append rows to the dataset. Returns how many rows it now holds.
    fn push_data(&self, items: &[Value]) -> Result<u64>;

    /// Write raw bytes under `key` with a file extension. Returns where they went.
    fn set_blob(&self, key: &str, extension: &str, data: &[u8]) -> Result<String>;
}

/// Filesystem store:
/// - records: `<dir>/key_value_store/<KEY>.json`
/// - dataset rows: `<dir>/dataset/000000001.json`, numbered in push order
/// - blobs: `<dir>/key_value_store/<key>.<ext>`
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    rows: Mutex<u64>,
}

impl FsStore {
    /// Open (and create) a store directory. Existing dataset rows are kept and
    /// new rows continue their numbering.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(KEY_VALUE_DIR))?;
        fs::create_dir_all(root.join(DATASET_DIR))?;
        let rows = fs::read_dir(root.join(DATASET_DIR))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(".json")?.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0);
        debug!(root = %root.display(), rows, "opened store");
        Ok(Self {
            root,
            rows: Mutex::new(rows),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str, extension: &str) -> Result<PathBuf> {
        check_key(key)?;
        check_key(extension)?;
        Ok(self
            .root
            .join(KEY_VALUE_DIR)
            .join(format!("{}.{}", key, extension)))
    }
}

impl Store for FsStore {
    fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.record_path(key, "json")?;
        fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        debug!(path = %path.display(), "record saved");
        Ok(())
    }

    fn push_data(&self, items: &[Value]) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for item in items {
            let path = self
                .root
                .join(DATASET_DIR)
                .join(format!("{:09}.json", *rows + 1));
            fs::write(&path, serde_json::to_vec_pretty(item)?)?;
            *rows += 1;
        }
        debug!(pushed = items.len(), total = *rows, "dataset rows saved");
        Ok(*rows)
    }

    fn set_blob(&self, key: &str, extension: &str, data: &[u8]) -> Result<String> {
        let path = self.record_path(key, extension)?;
        fs::write(&path, data)?;
        Ok(path.display().to_string())
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
        return Err(Error::Config(format!("invalid store key '{}'", key)));
    }
    Ok(())
}
