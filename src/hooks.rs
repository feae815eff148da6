use nix::unistd::Pid;

/// External collaborators supplied by the host daemon. The monitor only
/// coordinates; package knowledge and mount scrubbing live behind this
/// trait. Implementations are called from the monitor thread and from the
/// inspector workers.
pub trait Hooks: Send + Sync {
    /// Enumerate live pids, calling `f` for each until it returns false.
    fn crawl_procfs(&self, f: &mut dyn FnMut(Pid) -> bool);

    /// The package database changed; rebuild the uid to package map.
    fn update_uid_map(&self);

    /// Should processes of this uid and command line be hidden from?
    fn is_hide_target(&self, uid: u32, cmdline: &str, confidence: u32) -> bool;

    /// Take ownership of a stopped target: scrub its mount view, then
    /// resume or kill it. The monitor will not touch the pid afterwards.
    fn hide_daemon(&self, pid: Pid);
}
