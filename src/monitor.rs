use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attach::AttachBitmap;
use crate::config::MonitorConfig;
use crate::events::{control_channel, drain_wake_pipe, Control, ControlSender, RescanTimer};
use crate::hooks::Hooks;
use crate::inspect::InspectorPool;
use crate::registry::SpawnerRegistry;
use crate::sys::Sys;
use crate::watches::PackageWatches;

/// Failures surfaced to the host. Everything per-pid is logged and
/// absorbed inside the monitor; only setup can fail outward.
#[derive(Debug, Error)]
pub enum Error {
    #[error("monitor setup failed: {0}")]
    Sys(#[from] Errno),
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

const EPOLL_CHILD: u64 = 1;
const EPOLL_CONTROL: u64 = 2;

const SPAWNER_OPTIONS: Options = Options::PTRACE_O_TRACEFORK
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACEEXIT);

const APP_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Start the monitor on its own thread. The returned handle is the one
/// external cancellation path: `shutdown` queues a terminate event and
/// joins the thread after its teardown.
pub fn spawn(
    config: MonitorConfig,
    sys: Arc<dyn Sys>,
    hooks: Arc<dyn Hooks>,
) -> Result<MonitorHandle, Error> {
    let (ctl, ctl_rx, wake_rx) = control_channel()?;
    let thread_ctl = ctl.clone();
    let thread = thread::Builder::new().name("procmon".into()).spawn(move || {
        match Monitor::new(config, sys, hooks, thread_ctl, ctl_rx) {
            Ok(mut monitor) => monitor.run(wake_rx),
            Err(err) => warn!(target: "proc_monitor", %err, "monitor setup failed"),
        }
    })?;
    Ok(MonitorHandle { ctl, thread })
}

pub struct MonitorHandle {
    ctl: ControlSender,
    thread: thread::JoinHandle<()>,
}

impl MonitorHandle {
    /// A clone of the control plane, e.g. to wire a host signal handler to
    /// `Control::Terminate`.
    pub fn controls(&self) -> ControlSender {
        self.ctl.clone()
    }

    pub fn shutdown(self) {
        self.ctl.send(Control::Terminate);
        let _ = self.thread.join();
    }
}

struct Monitor {
    config: Arc<MonitorConfig>,
    sys: Arc<dyn Sys>,
    hooks: Arc<dyn Hooks>,
    registry: Arc<RwLock<SpawnerRegistry>>,
    attached: AttachBitmap,
    timer: RescanTimer,
    watches: Option<PackageWatches>,
    pool: InspectorPool,
    ctl_rx: Receiver<Control>,
    child_events: Option<OwnedFd>,
    torn_down: bool,
}

impl Monitor {
    fn new(
        config: MonitorConfig,
        sys: Arc<dyn Sys>,
        hooks: Arc<dyn Hooks>,
        ctl: ControlSender,
        ctl_rx: Receiver<Control>,
    ) -> Result<Self, Error> {
        let config = Arc::new(config);
        // mask SIGCHLD before the first attach so no notification is lost
        let child_events = sys.init_child_events()?;
        let registry = Arc::new(RwLock::new(SpawnerRegistry::default()));
        let watches = PackageWatches::start(&config, ctl.clone());
        let timer = RescanTimer::spawn(config.rescan_interval, ctl)?;
        let pool = InspectorPool::start(
            config.clone(),
            sys.clone(),
            hooks.clone(),
            registry.clone(),
        )?;
        Ok(Self {
            config,
            sys,
            hooks,
            registry,
            attached: AttachBitmap::new(),
            timer,
            watches,
            pool,
            ctl_rx,
            child_events: Some(child_events),
            torn_down: false,
        })
    }

    fn run(&mut self, wake_rx: Arc<OwnedFd>) {
        if let Err(err) = self.event_loop(&wake_rx) {
            warn!(target: "proc_monitor", %err, "event loop failed");
        }
        self.teardown();
    }

    fn event_loop(&mut self, wake_rx: &OwnedFd) -> nix::Result<()> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        if let Some(fd) = &self.child_events {
            epoll.add(fd, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_CHILD))?;
        }
        epoll.add(wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_CONTROL))?;

        self.scan_once();

        let mut events = [EpollEvent::empty(), EpollEvent::empty()];
        loop {
            // control first, so a terminate beats a busy tracee
            if self.drain_control() {
                return Ok(());
            }
            self.drain_children();

            let n = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    // stay alive: the host must never be taken down by us
                    warn!(target: "proc_monitor", %err, "epoll wait failed");
                    thread::sleep(self.config.rescan_interval);
                    continue;
                }
            };
            for event in &events[..n] {
                match event.data() {
                    EPOLL_CHILD => {
                        if let Some(fd) = &self.child_events {
                            self.sys.drain_child_events(fd.as_fd());
                        }
                    }
                    EPOLL_CONTROL => drain_wake_pipe(wake_rx),
                    _ => {}
                }
            }
        }
    }

    /// Returns true when a terminate event was consumed.
    fn drain_control(&mut self) -> bool {
        while let Ok(event) = self.ctl_rx.try_recv() {
            match event {
                Control::Tick => self.scan_once(),
                Control::PackagesChanged => {
                    debug!(target: "proc_monitor", "package database rewritten");
                    self.hooks.update_uid_map();
                    self.scan_once();
                }
                Control::SpawnerAccessed => {
                    debug!(target: "proc_monitor", "spawner executable accessed");
                    self.scan_once();
                }
                Control::Terminate => return true,
            }
        }
        false
    }

    fn drain_children(&mut self) {
        loop {
            match self.sys.wait_any() {
                Ok(WaitStatus::StillAlive) => return,
                Ok(status) => self.route(status),
                // nothing traced yet; epoll sleeps until a control event
                Err(Errno::ECHILD) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(target: "proc_monitor", %err, "waitpid failed");
                    return;
                }
            }
        }
    }

    fn route(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.on_trace_event(pid, event),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.on_sigstop(pid),
            WaitStatus::Stopped(pid, sig) => {
                // not ours; hand the signal back to the tracee
                debug!(target: "proc_monitor", %pid, ?sig, "forwarding signal");
                if self.sys.cont(pid, Some(sig)).is_err() {
                    self.detach(pid);
                }
            }
            WaitStatus::PtraceSyscall(pid) => self.detach(pid),
            WaitStatus::Exited(pid, _)
            | WaitStatus::Signaled(pid, _, _)
            | WaitStatus::Continued(pid) => self.on_gone(pid),
            WaitStatus::StillAlive => {}
        }
    }

    fn on_trace_event(&mut self, pid: Pid, event: i32) {
        let from_spawner = self.registry.read().contains(pid);
        if !from_spawner {
            // an app process hit one of its traced events; we only keep the
            // attachment to learn about its end, so let go here
            self.detach(pid);
            return;
        }
        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                match self.sys.event_msg(pid) {
                    Ok(msg) => {
                        let child = Pid::from_raw(msg as i32);
                        debug!(target: "proc_monitor", spawner = %pid, %child, "spawner forked");
                        self.detach(child);
                        self.pool.submit(child);
                    }
                    Err(err) => {
                        warn!(target: "proc_monitor", %pid, %err, "cannot read fork event message");
                    }
                }
                if self.sys.cont(pid, None).is_err() {
                    self.spawner_lost(pid);
                }
            }
            other => {
                if other == libc::PTRACE_EVENT_EXIT {
                    info!(target: "proc_monitor", %pid, "spawner exiting");
                } else {
                    debug!(target: "proc_monitor", %pid, event = other, "unexpected spawner event");
                }
                self.spawner_lost(pid);
            }
        }
    }

    fn on_sigstop(&mut self, pid: Pid) {
        let keep = self.attached.test(pid)
            // group leader means process; unreadable status means dead
            || self.sys.is_process(pid).unwrap_or(false);
        if !keep {
            debug!(target: "proc_monitor", %pid, "sigstop from a bare thread");
            self.detach(pid);
            return;
        }
        if self.sys.set_options(pid, APP_OPTIONS).is_err()
            || self.sys.cont(pid, None).is_err()
        {
            self.detach(pid);
            return;
        }
        self.attached.set(pid);
        debug!(target: "proc_monitor", %pid, "app process under watch");
    }

    /// Detach clears the bitmap bit no matter what the kernel says.
    fn detach(&mut self, pid: Pid) {
        if let Err(err) = self.sys.detach(pid) {
            debug!(target: "proc_monitor", %pid, %err, "detach failed, pid already gone");
        }
        self.attached.clear(pid);
    }

    fn on_gone(&mut self, pid: Pid) {
        let was_spawner = self.registry.write().forget(pid);
        if was_spawner {
            info!(target: "proc_monitor", %pid, "spawner died");
            self.sync_timer();
        }
        self.detach(pid);
    }

    fn spawner_lost(&mut self, pid: Pid) {
        let was_spawner = self.registry.write().forget(pid);
        if was_spawner {
            self.sync_timer();
        }
        self.detach(pid);
    }

    /// Rescan timer runs exactly while the registry is short of the
    /// expected spawner count.
    fn sync_timer(&mut self) {
        let traced = self.registry.read().count();
        if self.config.discovery_done(traced) {
            self.timer.disarm();
        } else {
            self.timer.arm();
        }
    }

    /// Walk the live processes and adopt every spawner found: command line
    /// starting with the spawner name, parented by init.
    fn scan_once(&mut self) {
        let mut found = Vec::new();
        {
            let sys = &self.sys;
            let name = self.config.spawner_name.as_str();
            self.hooks.crawl_procfs(&mut |pid| {
                let is_spawner = sys
                    .cmdline(pid)
                    .map_or(false, |cmdline| cmdline.starts_with(name))
                    && sys.ppid(pid).map_or(false, |ppid| ppid == Pid::from_raw(1));
                if is_spawner {
                    found.push(pid);
                }
                true
            });
        }
        for pid in found {
            self.adopt(pid);
        }
        self.sync_timer();
    }

    fn adopt(&mut self, pid: Pid) {
        // candidate vanished before we could fingerprint it
        let Ok(ns) = self.sys.mnt_ns(pid) else { return };
        {
            let mut registry = self.registry.write();
            if registry.contains(pid) {
                // refresh the fingerprint only, the trace is already in place
                registry.upsert(pid, ns);
                return;
            }
            registry.upsert(pid, ns);
        }
        info!(target: "proc_monitor", %pid, "tracing spawner");
        if let Err(err) = self.trace_spawner(pid) {
            warn!(target: "proc_monitor", %pid, %err, "spawner attach failed");
            self.registry.write().forget(pid);
            self.detach(pid);
        }
    }

    fn trace_spawner(&self, pid: Pid) -> nix::Result<()> {
        self.sys.attach(pid)?;
        self.sys.wait_first_stop(pid)?;
        self.sys.set_options(pid, SPAWNER_OPTIONS)?;
        self.sys.cont(pid, None)
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!(target: "proc_monitor", "shutting down");

        // stop the producers first so nothing refills the queues
        self.timer.stop();
        if let Some(mut watches) = self.watches.take() {
            watches.stop();
        }
        self.pool.stop();

        for pid in self.attached.drain() {
            let _ = self.sys.detach(pid);
        }
        let spawners = {
            let mut registry = self.registry.write();
            let pids = registry.pids();
            registry.clear();
            pids
        };
        for pid in spawners {
            let _ = self.sys.detach(pid);
        }

        drop(self.child_events.take());
        self.sys.shutdown_child_events();
    }
}
