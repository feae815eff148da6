use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, TrySendError};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::RwLock;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::hooks::Hooks;
use crate::registry::SpawnerRegistry;
use crate::sys::Sys;

/// Match confidence forwarded to the target predicate, untouched.
const TARGET_CONFIDENCE: u32 = 95;

/// Command line a child publishes before it has specialized.
const PRE_INITIALIZED: &str = "<pre-initialized>";

/// Sleep schedule for the metadata polls: a bounded number of iterations
/// whose interval never shrinks.
struct Backoff {
    left: u32,
    delay: Duration,
    ceiling: Duration,
}

impl Backoff {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            left: config.inspect_poll_cap,
            delay: config.inspect_poll_base,
            ceiling: config.inspect_poll_ceiling,
        }
    }

    /// One sleep step; false once the iteration cap is spent.
    fn step(&mut self) -> bool {
        if self.left == 0 {
            return false;
        }
        self.left -= 1;
        thread::sleep(self.delay);
        if self.delay < self.ceiling {
            self.delay = (self.delay * 2).min(self.ceiling);
        }
        true
    }
}

struct InspectCtx {
    config: Arc<MonitorConfig>,
    sys: Arc<dyn Sys>,
    hooks: Arc<dyn Hooks>,
    registry: Arc<RwLock<SpawnerRegistry>>,
}

/// Worker pool consuming freshly detached fork children from a bounded
/// queue. Workers never touch the registry beyond fingerprint reads, and
/// bound their own runtime through the poll cap, so teardown does not wait
/// for them.
pub(crate) struct InspectorPool {
    tx: Option<Sender<Pid>>,
}

impl InspectorPool {
    pub fn start(
        config: Arc<MonitorConfig>,
        sys: Arc<dyn Sys>,
        hooks: Arc<dyn Hooks>,
        registry: Arc<RwLock<SpawnerRegistry>>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded(config.fork_queue_depth);
        for n in 0..config.inspectors.max(1) {
            let rx = rx.clone();
            let ctx = InspectCtx {
                config: config.clone(),
                sys: sys.clone(),
                hooks: hooks.clone(),
                registry: registry.clone(),
            };
            thread::Builder::new()
                .name(format!("procmon-inspect{n}"))
                .spawn(move || {
                    while let Ok(pid) = rx.recv() {
                        inspect(&ctx, pid);
                    }
                })?;
        }
        Ok(Self { tx: Some(tx) })
    }

    /// Queue a child for inspection. On overflow the child is dropped with
    /// a warning rather than stalling the event router.
    pub fn submit(&self, pid: Pid) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(pid) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(target: "proc_monitor", %pid, "fork queue full, child not inspected");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Drop the queue; workers finish what they hold and exit.
    pub fn stop(&mut self) {
        self.tx.take();
    }
}

/// Classify one forked child and settle it: every path out of here either
/// resumes the child once or hands it, stopped, to the hiding daemon once.
fn inspect(ctx: &InspectCtx, pid: Pid) {
    let resume = scopeguard::guard((), |_| {
        let _ = ctx.sys.kill(pid, Signal::SIGCONT);
    });

    let mut backoff = Backoff::new(&ctx.config);

    // The child starts inside its spawner's mount namespace and separates
    // on its own schedule; there is no event for it, so poll.
    loop {
        match ctx.sys.mnt_ns(pid) {
            // died mid-inspection: nothing to do
            Err(_) => return,
            Ok(ns) if !ctx.registry.read().any_shares_ns(ns) => break,
            Ok(_) => {}
        }
        if !backoff.step() {
            info!(target: "proc_monitor", %pid, "skip: mount namespace never separated");
            return;
        }
    }

    let uid = match ctx.sys.proc_uid(pid) {
        Ok(uid) => uid,
        Err(_) => return,
    };

    let cmdline = loop {
        match ctx.sys.cmdline(pid) {
            Err(_) => return,
            Ok(cmdline) if cmdline == PRE_INITIALIZED => {
                if !backoff.step() {
                    debug!(target: "proc_monitor", %pid, "skip: still pre-initialized");
                    return;
                }
            }
            Ok(cmdline) => break cmdline,
        }
    };

    if uid == 0 {
        return;
    }
    if cmdline.starts_with(ctx.config.spawner_name.as_str())
        || ctx.config.prewarm_names.iter().any(|name| *name == cmdline)
    {
        debug!(target: "proc_monitor", %pid, %cmdline, "skip: spawner or pre-warmed helper");
        return;
    }

    // Freeze before classifying: a target must not run any user code until
    // its mount view has been scrubbed.
    if ctx.sys.kill(pid, Signal::SIGSTOP).is_err() {
        return;
    }

    if !ctx.hooks.is_hide_target(uid, &cmdline, TARGET_CONFIDENCE) {
        debug!(target: "proc_monitor", %pid, uid, %cmdline, "not a target");
        return;
    }

    // The spawner set may have changed while we polled; scrubbing a child
    // that still shares a spawner namespace would damage the spawner.
    match ctx.sys.mnt_ns(pid) {
        Err(_) => return,
        Ok(ns) if ctx.registry.read().any_shares_ns(ns) => {
            info!(target: "proc_monitor", %pid, uid, %cmdline, "skip: still sharing a spawner namespace");
            return;
        }
        Ok(_) => {}
    }

    info!(target: "proc_monitor", %pid, uid, %cmdline, "target frozen, handing to hiding daemon");
    // the daemon resumes (or kills) the child from here on
    ScopeGuard::into_inner(resume);
    ctx.hooks.hide_daemon(pid);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_respects_cap() {
        let mut config = MonitorConfig::default();
        config.inspect_poll_cap = 3;
        config.inspect_poll_base = Duration::from_micros(1);
        config.inspect_poll_ceiling = Duration::from_micros(1);
        let mut backoff = Backoff::new(&config);
        assert!(backoff.step());
        assert!(backoff.step());
        assert!(backoff.step());
        assert!(!backoff.step());
        assert!(!backoff.step());
    }

    #[test]
    fn backoff_interval_is_monotone() {
        let mut config = MonitorConfig::default();
        config.inspect_poll_cap = 16;
        config.inspect_poll_base = Duration::from_micros(1);
        config.inspect_poll_ceiling = Duration::from_micros(8);
        let mut backoff = Backoff::new(&config);
        let mut last = Duration::ZERO;
        while backoff.step() {
            assert!(backoff.delay >= last);
            last = backoff.delay;
        }
        assert_eq!(last, Duration::from_micros(8));
    }
}
