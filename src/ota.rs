//! Bootstrap loader: update check, backup, verified download, health check,
//! commit or rollback, and supervision of the main program.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::LoaderSettings;
use crate::error::UpdateError;
use crate::net::UpdateServer;
use crate::process::{self, Launch, ProcessLauncher, RunOutcome};
use crate::storage::{self, InstallLayout};
use crate::types::{FirmwareManifest, LocalVersionRecord};

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Loader state-machine phases, as they appear in the on-device log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CheckLocalVersion,
    QueryServer,
    Backup,
    Download,
    VerifyHash,
    InstallDependencies,
    HealthCheck,
    Commit,
    Rollback,
    RunMainProcess,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::CheckLocalVersion => "CHECK_LOCAL_VERSION",
            Phase::QueryServer => "QUERY_SERVER",
            Phase::Backup => "BACKUP",
            Phase::Download => "DOWNLOAD",
            Phase::VerifyHash => "VERIFY_HASH",
            Phase::InstallDependencies => "INSTALL_DEPENDENCIES",
            Phase::HealthCheck => "HEALTH_CHECK",
            Phase::Commit => "COMMIT",
            Phase::Rollback => "ROLLBACK",
            Phase::RunMainProcess => "RUN_MAIN_PROCESS",
        };
        f.write_str(name)
    }
}

/// Result of one update check; every variant leaves a runnable installation behind.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    ServerUnreachable,
    UpToDate,
    Updated { version: String },
    /// Backup, download or verification failed; the previous version was never touched.
    Abandoned { reason: String },
    /// The new version failed its health check and the snapshot was restored.
    RolledBack { version: String, reason: String },
}

/// Contents of `backup/snapshot.json`: which managed files existed when the backup was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub created_at: DateTime<Utc>,
    pub files: Vec<String>,
}

/// Hash equality wins when both sides have one; otherwise a newer server date triggers an update.
pub fn needs_update(local: &LocalVersionRecord, server: &FirmwareManifest) -> bool {
    if !local.hash.is_empty() && !server.hash.is_empty() {
        return local.hash != server.hash;
    }
    server.date > local.date
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub struct Loader {
    server: Arc<dyn UpdateServer>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: LoaderSettings,
    layout: InstallLayout,
}

impl Loader {
    pub fn new(
        server: Arc<dyn UpdateServer>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: LoaderSettings,
    ) -> Self {
        let layout = settings.layout();
        Loader {
            server,
            launcher,
            settings,
            layout,
        }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Repeats update check and supervised run until the main program stops normally.
    pub async fn run(&self) -> Result<()> {
        self.layout.ensure_root()?;
        loop {
            match self.update_cycle().await {
                Ok(outcome) => info!(?outcome, "Update check finished"),
                Err(e) => {
                    error!(error = %e, "FATAL: installation left in unknown state, manual intervention required");
                    return Err(e.into());
                }
            }

            match self.supervise().await? {
                RunOutcome::ForceUpdate => {
                    info!("Force update requested, restarting bootstrap cycle");
                    self.discard_version_record()?;
                }
                outcome => {
                    info!(?outcome, "Main program exited normally, bootstrap stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Persisted version record, or the never-updated default when missing or unreadable.
    pub fn local_version(&self) -> LocalVersionRecord {
        match storage::read_json::<LocalVersionRecord>(&self.layout.version()) {
            Ok(Some(record)) => record,
            Ok(None) => LocalVersionRecord::default(),
            Err(e) => {
                warn!(error = %e, "Error reading local version");
                LocalVersionRecord::default()
            }
        }
    }

    /// One pass from CHECK_LOCAL_VERSION to COMMIT or ROLLBACK.
    ///
    /// Only an unrecoverable rollback failure is returned as an error.
    pub async fn update_cycle(&self) -> Result<CycleOutcome, UpdateError> {
        let local = self.local_version();
        info!(phase = %Phase::CheckLocalVersion, version = %local.version, date = %local.date, "Local version");

        info!(phase = %Phase::QueryServer, "Checking server for updates");
        let manifest = match self.server.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(phase = %Phase::QueryServer, error = %e, "Cannot reach server, using local version");
                return Ok(CycleOutcome::ServerUnreachable);
            }
        };

        if !needs_update(&local, &manifest) {
            info!(version = %manifest.version, "Already up to date");
            return Ok(CycleOutcome::UpToDate);
        }
        info!(
            version = %manifest.version,
            date = %manifest.date,
            changelog = %manifest.changelog,
            "Update available"
        );

        match self.apply_update(&manifest).await {
            Ok(()) => Ok(CycleOutcome::Updated {
                version: manifest.version,
            }),
            Err(UpdateError::HealthCheck(reason)) => {
                error!(phase = %Phase::Rollback, reason = %reason, "Health check failed, rolling back");
                self.rollback()?;
                info!(phase = %Phase::Rollback, "Rollback successful, using previous version");
                Ok(CycleOutcome::RolledBack {
                    version: manifest.version,
                    reason,
                })
            }
            Err(e) if e.is_unrecoverable() => Err(e),
            Err(e) => {
                error!(error = %e, "Update abandoned, using local version");
                Ok(CycleOutcome::Abandoned {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn apply_update(&self, manifest: &FirmwareManifest) -> Result<(), UpdateError> {
        info!(phase = %Phase::Backup, "Creating backup");
        self.create_backup().map_err(UpdateError::Backup)?;

        self.download_verified(manifest).await?;

        info!(phase = %Phase::InstallDependencies, "Installing dependencies");
        self.install_dependencies().await;

        info!(phase = %Phase::HealthCheck, "Starting health check");
        self.health_check().await?;

        info!(phase = %Phase::Commit, version = %manifest.version, "Update successful");
        let record = LocalVersionRecord::committed(manifest, Utc::now());
        storage::write_json_atomic(&self.layout.version(), &record)
            .map_err(|e| UpdateError::HealthCheck(format!("cannot commit version record: {e}")))?;
        Ok(())
    }

    /// Copies the managed files into a fresh snapshot, replacing the previous one only when complete.
    pub fn create_backup(&self) -> Result<Snapshot> {
        let root = self.layout.root();
        let staging = root.join("backup.tmp");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut files = Vec::new();
        for name in self.layout.managed_files() {
            let src = root.join(name);
            if src.exists() {
                fs::copy(&src, staging.join(name))
                    .with_context(|| format!("backing up {name}"))?;
                files.push(name.to_string());
            }
        }
        let snapshot = Snapshot {
            created_at: Utc::now(),
            files,
        };
        storage::write_json_atomic(&staging.join(SNAPSHOT_FILE), &snapshot)?;

        let backup = self.layout.backup_dir();
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        fs::rename(&staging, &backup)?;
        info!(phase = %Phase::Backup, files = ?snapshot.files, "Backup created successfully");
        Ok(snapshot)
    }

    fn load_snapshot(&self) -> Result<Snapshot> {
        let backup = self.layout.backup_dir();
        let Some(snapshot) = storage::read_json::<Snapshot>(&backup.join(SNAPSHOT_FILE))? else {
            bail!("no backup available at {}", backup.display());
        };
        for name in &snapshot.files {
            if !backup.join(name).is_file() {
                bail!("backup is missing {name}");
            }
        }
        Ok(snapshot)
    }

    /// Restores the managed files exactly as the snapshot recorded them, including absent ones.
    pub fn rollback(&self) -> Result<(), UpdateError> {
        let fail = |e: anyhow::Error| {
            error!(phase = %Phase::Rollback, error = %e, "Rollback failed! Manual intervention required");
            UpdateError::RollbackFailed(e.to_string())
        };
        let snapshot = self.load_snapshot().map_err(fail)?;
        self.restore(&snapshot).map_err(fail)?;
        storage::remove_if_exists(&self.layout.health_marker()).map_err(fail)?;
        Ok(())
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let root = self.layout.root();
        let backup = self.layout.backup_dir();
        for name in self.layout.managed_files() {
            let dst = root.join(name);
            if snapshot.files.iter().any(|f| f == name) {
                let tmp = storage::temp_path(&dst);
                fs::copy(backup.join(name), &tmp).with_context(|| format!("restoring {name}"))?;
                fs::rename(&tmp, &dst)?;
            } else {
                storage::remove_if_exists(&dst)?;
            }
        }
        Ok(())
    }

    /// Downloads into a temp file, verifies it, and only then renames it over the main program.
    async fn download_verified(&self, manifest: &FirmwareManifest) -> Result<(), UpdateError> {
        let target = self.layout.main_program();
        let tmp = storage::temp_path(&target);
        let attempts = self.settings.download_retries.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            info!(phase = %Phase::Download, attempt, attempts, "Downloading firmware");
            let result = match self.server.download_program().await {
                Ok(bytes) => write_temp(&tmp, &bytes).map(|_| bytes.len()),
                Err(e) => Err(e),
            };
            match result {
                Ok(size) => {
                    info!(phase = %Phase::Download, size, "Downloaded firmware");
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(phase = %Phase::Download, attempt, error = %e, "Download failed");
                    storage::remove_if_exists(&tmp).ok();
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }
        if let Some(source) = last_error {
            return Err(UpdateError::DownloadExhausted { attempts, source });
        }

        if manifest.hash.is_empty() {
            warn!(phase = %Phase::VerifyHash, "Manifest carries no hash, skipping verification");
        } else {
            let actual = md5_hex(&fs::read(&tmp)?);
            if actual != manifest.hash {
                error!(
                    phase = %Phase::VerifyHash,
                    expected = %manifest.hash,
                    actual = %actual,
                    "Hash mismatch"
                );
                storage::remove_if_exists(&tmp).ok();
                return Err(UpdateError::HashMismatch {
                    expected: manifest.hash.clone(),
                    actual,
                });
            }
            info!(phase = %Phase::VerifyHash, hash = %actual, "Hash verified");
        }

        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Marks the program executable and runs the optional install hook. Failures only warn.
    pub async fn install_dependencies(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let program = self.layout.main_program();
            if let Err(e) = fs::set_permissions(&program, fs::Permissions::from_mode(0o755)) {
                warn!(error = %e, "Could not mark main program executable");
            }
        }

        let Some(command) = &self.settings.install_command else {
            return;
        };
        match process::run_shell(command, self.layout.root(), self.settings.install_timeout).await {
            Ok(()) => info!(phase = %Phase::InstallDependencies, "Dependencies installed"),
            Err(e) => warn!(phase = %Phase::InstallDependencies, error = %e, "Failed to install dependencies"),
        }
    }

    fn launch(&self, health_check: bool) -> Launch {
        let mut args = Vec::new();
        if health_check {
            args.push("--health-check".to_string());
        }
        args.push("--install-dir".to_string());
        args.push(self.layout.root().display().to_string());
        Launch {
            program: self.layout.main_program(),
            args,
            cwd: self.layout.root().to_path_buf(),
            capture_stderr: health_check,
        }
    }

    /// Spawns the program in self-check mode and waits for the marker file.
    pub async fn health_check(&self) -> Result<(), UpdateError> {
        let marker = self.layout.health_marker();
        storage::remove_if_exists(&marker).map_err(|e| UpdateError::HealthCheck(e.to_string()))?;

        let mut child = self
            .launcher
            .spawn(&self.launch(true))
            .await
            .map_err(|e| UpdateError::HealthCheck(format!("cannot start program: {e}")))?;

        let deadline = tokio::time::Instant::now() + self.settings.health_check_timeout;
        loop {
            if marker.exists() {
                break;
            }
            let exited = child
                .try_exit_code()
                .map_err(|e| UpdateError::HealthCheck(e.to_string()))?;
            if let Some(code) = exited {
                // The marker may land right before a clean exit.
                if marker.exists() {
                    break;
                }
                let stderr = child.stderr_tail().await.unwrap_or_default();
                error!(phase = %Phase::HealthCheck, code, stderr = %stderr, "Process exited before reporting healthy");
                return Err(UpdateError::HealthCheck(format!("process exited with code {code}")));
            }
            if tokio::time::Instant::now() >= deadline {
                error!(phase = %Phase::HealthCheck, timeout = ?self.settings.health_check_timeout, "Health check TIMEOUT");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill health check process");
                }
                return Err(UpdateError::HealthCheck("timed out".to_string()));
            }
            tokio::time::sleep(self.settings.health_poll_interval).await;
        }

        info!(phase = %Phase::HealthCheck, "Health check PASSED");
        if matches!(child.try_exit_code(), Ok(None)) {
            child.kill().await.ok();
        }
        storage::remove_if_exists(&marker).ok();
        Ok(())
    }

    /// Runs the main program, respawning the same version after crashes.
    ///
    /// Returns once it exits normally or asks for a forced update.
    pub async fn supervise(&self) -> Result<RunOutcome> {
        let launch = self.launch(false);
        loop {
            if !launch.program.exists() {
                error!(program = %launch.program.display(), "Main program not found, cannot run");
                bail!("main program {} not found", launch.program.display());
            }
            info!(phase = %Phase::RunMainProcess, program = %launch.program.display(), "Starting main program");
            let mut child = self.launcher.spawn(&launch).await?;
            let code = child.wait().await?;
            match RunOutcome::from_code(code) {
                RunOutcome::Crash(code) => {
                    warn!(
                        phase = %Phase::RunMainProcess,
                        code,
                        cooldown = ?self.settings.crash_cooldown,
                        "Main program crashed, restarting"
                    );
                    tokio::time::sleep(self.settings.crash_cooldown).await;
                }
                outcome => return Ok(outcome),
            }
        }
    }

    /// Forgets the committed version so the next cycle re-downloads and re-validates.
    pub fn discard_version_record(&self) -> Result<()> {
        storage::remove_if_exists(&self.layout.version())
    }
}

fn write_temp(tmp: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ChildProcess;
    use crate::storage::test_support::TestDir;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const NEW_BUILD: &[u8] = b"#!/bin/sh\necho new build\n";
    const OLD_BUILD: &[u8] = b"#!/bin/sh\necho old build\n";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn manifest(hash: &str, day: NaiveDate) -> FirmwareManifest {
        FirmwareManifest {
            version: "2.0.0".into(),
            date: day,
            hash: hash.into(),
            changelog: "new firmware".into(),
        }
    }

    fn record(hash: &str, day: NaiveDate) -> LocalVersionRecord {
        LocalVersionRecord {
            version: "1.0.0".into(),
            date: day,
            hash: hash.into(),
            changelog: String::new(),
            updated_at: None,
        }
    }

    struct FakeServer {
        manifest: Option<FirmwareManifest>,
        payload: Vec<u8>,
        failures_left: AtomicU32,
        downloads: AtomicU32,
    }

    impl FakeServer {
        fn serving(payload: &[u8], day: NaiveDate) -> Self {
            FakeServer {
                manifest: Some(manifest(&md5_hex(payload), day)),
                payload: payload.to_vec(),
                failures_left: AtomicU32::new(0),
                downloads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl UpdateServer for FakeServer {
        async fn fetch_manifest(&self) -> Result<FirmwareManifest> {
            self.manifest.clone().ok_or_else(|| anyhow!("connection refused"))
        }

        async fn download_program(&self) -> Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("connection reset"));
            }
            Ok(self.payload.clone())
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Healthy,
        Exit(i32),
        Hang,
    }

    struct FakeChild {
        behaviour: Behaviour,
        killed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn try_exit_code(&mut self) -> Result<Option<i32>> {
            Ok(match self.behaviour {
                Behaviour::Healthy => Some(0),
                Behaviour::Exit(code) => Some(code),
                Behaviour::Hang => None,
            })
        }

        async fn wait(&mut self) -> Result<i32> {
            match self.behaviour {
                Behaviour::Healthy => Ok(0),
                Behaviour::Exit(code) => Ok(code),
                Behaviour::Hang => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Plays one scripted behaviour per spawn; `Healthy` writes the marker like the real self-check.
    struct FakeLauncher {
        script: Mutex<VecDeque<Behaviour>>,
        marker: PathBuf,
        spawns: Mutex<Vec<Vec<String>>>,
        killed: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        fn new(layout: &InstallLayout, script: &[Behaviour]) -> Self {
            FakeLauncher {
                script: Mutex::new(script.iter().copied().collect()),
                marker: layout.health_marker(),
                spawns: Mutex::new(Vec::new()),
                killed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn spawn(&self, launch: &Launch) -> Result<Box<dyn ChildProcess>> {
            self.spawns.lock().unwrap().push(launch.args.clone());
            let behaviour = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("unexpected spawn"))?;
            if let Behaviour::Healthy = behaviour {
                fs::write(&self.marker, "ok")?;
            }
            Ok(Box::new(FakeChild {
                behaviour,
                killed: self.killed.clone(),
            }))
        }
    }

    fn settings(dir: &TestDir) -> LoaderSettings {
        LoaderSettings {
            server_url: "http://updates.invalid".into(),
            install_dir: dir.path().to_path_buf(),
            main_program: "co2-device".into(),
            health_check_timeout: Duration::from_millis(50),
            health_poll_interval: Duration::from_millis(5),
            download_retries: 3,
            retry_delay: Duration::from_millis(1),
            crash_cooldown: Duration::from_millis(1),
            install_command: None,
            install_timeout: Duration::from_secs(5),
        }
    }

    /// An installed old build with config and version record `A`.
    fn install_old_build(layout: &InstallLayout) {
        fs::write(layout.main_program(), OLD_BUILD).unwrap();
        fs::write(layout.config(), br#"{"send_interval": 60}"#).unwrap();
        storage::write_json_atomic(&layout.version(), &record("A", date(2025, 1, 1))).unwrap();
    }

    fn loader(
        dir: &TestDir,
        server: Arc<FakeServer>,
        script: &[Behaviour],
    ) -> (Loader, Arc<FakeLauncher>) {
        let settings = settings(dir);
        let launcher = Arc::new(FakeLauncher::new(&settings.layout(), script));
        (Loader::new(server, launcher.clone(), settings), launcher)
    }

    #[test]
    fn identical_hashes_need_no_update() {
        let local = record("A", date(2025, 1, 1));
        assert!(!needs_update(&local, &manifest("A", date(2025, 1, 1))));
    }

    #[test]
    fn hash_takes_precedence_over_date() {
        let local = record("A", date(2025, 1, 1));
        assert!(needs_update(&local, &manifest("B", date(2025, 1, 1))));
        assert!(!needs_update(&local, &manifest("A", date(2025, 3, 1))));
    }

    #[test]
    fn date_decides_when_a_hash_is_missing() {
        let local = record("", date(2025, 1, 1));
        assert!(needs_update(&local, &manifest("B", date(2025, 1, 2))));
        assert!(!needs_update(&local, &manifest("B", date(2025, 1, 1))));
        let local = record("A", date(2025, 1, 1));
        assert!(!needs_update(&local, &manifest("", date(2024, 12, 31))));
    }

    #[test]
    fn missing_record_always_needs_update() {
        let local = LocalVersionRecord::default();
        assert!(needs_update(&local, &manifest("", date(2024, 6, 1))));
    }

    #[test]
    fn md5_matches_known_digest() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn up_to_date_cycle_downloads_nothing_twice() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(&dir, server.clone(), &[]);
        let current = record(&md5_hex(NEW_BUILD), date(2025, 1, 2));
        storage::write_json_atomic(&loader.layout().version(), &current).unwrap();

        assert_eq!(loader.update_cycle().await.unwrap(), CycleOutcome::UpToDate);
        assert_eq!(loader.update_cycle().await.unwrap(), CycleOutcome::UpToDate);
        assert_eq!(server.downloads.load(Ordering::SeqCst), 0);
        assert!(launcher.spawns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn normal_update_commits_new_version() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(&dir, server.clone(), &[Behaviour::Healthy]);
        let layout = loader.layout().clone();
        install_old_build(&layout);

        let outcome = loader.update_cycle().await.unwrap();

        assert_eq!(outcome, CycleOutcome::Updated { version: "2.0.0".into() });
        assert_eq!(fs::read(layout.main_program()).unwrap(), NEW_BUILD);
        let committed = loader.local_version();
        assert_eq!(committed.hash, md5_hex(NEW_BUILD));
        assert_eq!(committed.date, date(2025, 1, 2));
        assert!(committed.updated_at.is_some());
        assert_eq!(fs::read(layout.backup_dir().join("co2-device")).unwrap(), OLD_BUILD);
        assert!(!layout.health_marker().exists());
        assert_eq!(launcher.spawns.lock().unwrap()[0][0], "--health-check");
    }

    #[tokio::test]
    async fn failed_health_check_restores_backup_byte_for_byte() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(&dir, server.clone(), &[Behaviour::Hang]);
        let layout = loader.layout().clone();
        install_old_build(&layout);
        let before: Vec<Vec<u8>> = layout
            .managed_files()
            .iter()
            .map(|f| fs::read(layout.root().join(f)).unwrap())
            .collect();

        let outcome = loader.update_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::RolledBack { .. }));
        assert_eq!(launcher.killed.load(Ordering::SeqCst), 1);
        let after: Vec<Vec<u8>> = layout
            .managed_files()
            .iter()
            .map(|f| fs::read(layout.root().join(f)).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(loader.local_version().hash, "A");
    }

    #[tokio::test]
    async fn crashing_self_check_is_rolled_back() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(&dir, server, &[Behaviour::Exit(1)]);
        install_old_build(loader.layout());

        let outcome = loader.update_cycle().await.unwrap();

        match outcome {
            CycleOutcome::RolledBack { reason, .. } => assert!(reason.contains("code 1")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(launcher.killed.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(loader.layout().main_program()).unwrap(), OLD_BUILD);
    }

    #[tokio::test]
    async fn first_install_rollback_removes_new_files() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, _launcher) = loader(&dir, server, &[Behaviour::Exit(2)]);

        let outcome = loader.update_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::RolledBack { .. }));
        assert!(!loader.layout().main_program().exists());
        assert!(!loader.layout().version().exists());
    }

    #[tokio::test]
    async fn rollback_without_snapshot_is_unrecoverable() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, _launcher) = loader(&dir, server, &[]);
        install_old_build(loader.layout());

        let err = loader.rollback().unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_unrecoverable() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, _launcher) = loader(&dir, server, &[]);
        install_old_build(loader.layout());
        loader.create_backup().unwrap();
        fs::remove_file(loader.layout().backup_dir().join("config.json")).unwrap();

        assert!(matches!(loader.rollback(), Err(UpdateError::RollbackFailed(_))));
    }

    #[tokio::test]
    async fn transient_download_failures_are_retried() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        server.failures_left.store(2, Ordering::SeqCst);
        let (loader, _launcher) = loader(&dir, server.clone(), &[Behaviour::Healthy]);
        install_old_build(loader.layout());

        let outcome = loader.update_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Updated { .. }));
        assert_eq!(server.downloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_download_keeps_previous_version() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        server.failures_left.store(10, Ordering::SeqCst);
        let (loader, launcher) = loader(&dir, server.clone(), &[]);
        let layout = loader.layout().clone();
        install_old_build(&layout);

        let outcome = loader.update_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Abandoned { .. }));
        assert_eq!(server.downloads.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(layout.main_program()).unwrap(), OLD_BUILD);
        assert!(!storage::temp_path(&layout.main_program()).exists());
        assert!(launcher.spawns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_discards_artifact() {
        let dir = TestDir::new();
        let mut server = FakeServer::serving(NEW_BUILD, date(2025, 1, 2));
        server.payload = b"tampered".to_vec();
        let server = Arc::new(server);
        let (loader, _launcher) = loader(&dir, server, &[]);
        let layout = loader.layout().clone();
        install_old_build(&layout);

        let outcome = loader.update_cycle().await.unwrap();

        match outcome {
            CycleOutcome::Abandoned { reason } => assert!(reason.contains("hash mismatch")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fs::read(layout.main_program()).unwrap(), OLD_BUILD);
        assert!(!storage::temp_path(&layout.main_program()).exists());
        assert_eq!(loader.local_version().hash, "A");
    }

    #[tokio::test]
    async fn unreachable_server_keeps_local_version() {
        let dir = TestDir::new();
        let mut server = FakeServer::serving(NEW_BUILD, date(2025, 1, 2));
        server.manifest = None;
        let (loader, _launcher) = loader(&dir, Arc::new(server), &[]);
        install_old_build(loader.layout());

        assert_eq!(loader.update_cycle().await.unwrap(), CycleOutcome::ServerUnreachable);
    }

    #[tokio::test]
    async fn crash_respawns_same_version_without_update_check() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(
            &dir,
            server.clone(),
            &[Behaviour::Exit(3), Behaviour::Exit(-1), Behaviour::Exit(0)],
        );
        install_old_build(loader.layout());

        assert_eq!(loader.supervise().await.unwrap(), RunOutcome::Normal);
        assert_eq!(launcher.spawns.lock().unwrap().len(), 3);
        assert_eq!(server.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_update_exit_triggers_full_recheck() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, launcher) = loader(
            &dir,
            server.clone(),
            &[
                Behaviour::Healthy,
                Behaviour::Exit(100),
                Behaviour::Healthy,
                Behaviour::Exit(0),
            ],
        );
        install_old_build(loader.layout());

        loader.run().await.unwrap();

        assert_eq!(server.downloads.load(Ordering::SeqCst), 2);
        let spawns = launcher.spawns.lock().unwrap();
        assert_eq!(spawns.len(), 4);
        assert_eq!(spawns[2][0], "--health-check");
        assert_eq!(loader.local_version().hash, md5_hex(NEW_BUILD));
    }

    #[tokio::test]
    async fn missing_main_program_stops_supervision() {
        let dir = TestDir::new();
        let server = Arc::new(FakeServer::serving(NEW_BUILD, date(2025, 1, 2)));
        let (loader, _launcher) = loader(&dir, server, &[]);
        assert!(loader.supervise().await.is_err());
    }
}
