use std::path::PathBuf;
use std::time::Duration;

/// Monitor tunables. `Default` reproduces the stock system layout;
/// `detect()` additionally probes for the 64-bit spawner variant to decide
/// how many spawners discovery must find.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Command-line prefix that identifies a spawner process.
    pub spawner_name: String,
    /// Pre-warmed helper command lines. Never hiding targets.
    pub prewarm_names: Vec<String>,
    /// Directory holding the package database.
    pub package_dir: PathBuf,
    /// File within `package_dir` whose close-write means "packages changed".
    pub package_db: String,
    /// Spawner executable, watched for accesses. When absent, the `32`/`64`
    /// suffixed variants are probed instead.
    pub spawner_exe: PathBuf,
    /// Discovery is complete once this many spawners are under trace:
    /// two on 64-bit systems, one otherwise.
    pub expected_spawners: usize,
    /// Rescan period while discovery is incomplete.
    pub rescan_interval: Duration,
    /// Iteration cap for the inspector's metadata polls.
    pub inspect_poll_cap: u32,
    /// First poll sleep. Later sleeps only ever grow.
    pub inspect_poll_base: Duration,
    /// Upper bound the poll sleep grows toward.
    pub inspect_poll_ceiling: Duration,
    /// Capacity of the fork handoff queue feeding the inspectors.
    pub fork_queue_depth: usize,
    /// Inspector worker threads.
    pub inspectors: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            spawner_name: "zygote".into(),
            prewarm_names: vec!["usap32".into(), "usap64".into()],
            package_dir: "/data/system".into(),
            package_db: "packages.xml".into(),
            spawner_exe: "/system/bin/app_process".into(),
            expected_spawners: 1,
            rescan_interval: Duration::from_millis(250),
            inspect_poll_cap: 300_000,
            inspect_poll_base: Duration::from_micros(10),
            inspect_poll_ceiling: Duration::from_micros(10),
            fork_queue_depth: 64,
            inspectors: 2,
        }
    }
}

impl MonitorConfig {
    /// Defaults, with the expected spawner count raised to two when the
    /// 64-bit executable variant exists.
    pub fn detect() -> Self {
        let mut config = Self::default();
        if config.exe_variant("64").exists() {
            config.expected_spawners = 2;
        }
        config
    }

    pub(crate) fn discovery_done(&self, traced: usize) -> bool {
        traced >= self.expected_spawners
    }

    fn exe_variant(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .spawner_exe
            .file_name()
            .unwrap_or_default()
            .to_os_string();
        name.push(suffix);
        self.spawner_exe.with_file_name(name)
    }

    /// Executable paths worth watching: the common form when present,
    /// otherwise whichever bitness variants exist.
    pub(crate) fn spawner_exe_watch_paths(&self) -> Vec<PathBuf> {
        if self.spawner_exe.exists() {
            return vec![self.spawner_exe.clone()];
        }
        ["32", "64"]
            .iter()
            .map(|suffix| self.exe_variant(suffix))
            .filter(|path| path.exists())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exe_variants_keep_the_directory() {
        let config = MonitorConfig::default();
        assert_eq!(
            config.exe_variant("64"),
            PathBuf::from("/system/bin/app_process64")
        );
        assert_eq!(
            config.exe_variant("32"),
            PathBuf::from("/system/bin/app_process32")
        );
    }

    #[test]
    fn done_predicate_is_a_simple_threshold() {
        let mut config = MonitorConfig::default();
        config.expected_spawners = 2;
        assert!(!config.discovery_done(0));
        assert!(!config.discovery_done(1));
        assert!(config.discovery_done(2));
        assert!(config.discovery_done(3));
    }
}
