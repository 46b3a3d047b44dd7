use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE: &str = "config.json";
pub const VERSION_FILE: &str = "version.json";
pub const HEALTH_MARKER_FILE: &str = ".health_ok";
pub const DEVICE_UID_FILE: &str = ".device_uid";
pub const BACKUP_DIR: &str = "backup";
pub const BOOTSTRAP_LOG: &str = "bootstrap.log";
pub const DEVICE_LOG: &str = "device.log";

/// Files and directories of one device installation.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
    main_program: String,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>, main_program: impl Into<String>) -> Self {
        InstallLayout {
            root: root.into(),
            main_program: main_program.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_program(&self) -> PathBuf {
        self.root.join(&self.main_program)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn version(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    pub fn health_marker(&self) -> PathBuf {
        self.root.join(HEALTH_MARKER_FILE)
    }

    pub fn device_uid(&self) -> PathBuf {
        self.root.join(DEVICE_UID_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The three files a backup snapshot covers, by file name.
    pub fn managed_files(&self) -> [&str; 3] {
        [self.main_program.as_str(), CONFIG_FILE, VERSION_FILE]
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating install dir {}", self.root.display()))
    }
}

/// Path used while `path` is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents` via a temp file and rename, so readers never see a torn file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &contents)
}

/// Reads a JSON file; `Ok(None)` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keeps one previous generation of a log file once it grows past `max_bytes`.
pub fn roll_log(path: &Path, max_bytes: u64) -> Result<()> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() <= max_bytes {
        return Ok(());
    }
    let mut rolled = path.as_os_str().to_os_string();
    rolled.push(".1");
    fs::rename(path, PathBuf::from(rolled))?;
    info!(path = %path.display(), size = meta.len(), "Rolled log file");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::TestDir;
    use super::*;
    use crate::types::LocalVersionRecord;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = TestDir::new();
        let target = dir.path().join("version.json");
        write_atomic(&target, b"{}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}");
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn temp_path_keeps_directory_and_extension() {
        let tmp = temp_path(Path::new("/opt/co2/config.json"));
        assert_eq!(tmp, PathBuf::from("/opt/co2/config.json.tmp"));
    }

    #[test]
    fn read_json_missing_file_is_none() {
        let dir = TestDir::new();
        let value: Option<LocalVersionRecord> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn roll_log_moves_large_file_aside() {
        let dir = TestDir::new();
        let log = dir.path().join("device.log");
        fs::write(&log, vec![b'x'; 64]).unwrap();
        roll_log(&log, 16).unwrap();
        assert!(!log.exists());
        assert!(dir.path().join("device.log.1").exists());
    }
}
