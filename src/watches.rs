use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::thread;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::unistd::pipe2;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::events::{Control, ControlSender};

/// Filesystem triggers for rescans: close-writes under the package database
/// directory and accesses to the spawner executable. A blocking reader
/// thread owns the inotify descriptor and forwards events onto the control
/// queue; when inotify is unavailable the monitor simply runs without
/// watches, paced by the timer alone.
pub(crate) struct PackageWatches {
    stop: OwnedFd,
    thread: Option<thread::JoinHandle<()>>,
}

impl PackageWatches {
    pub fn start(config: &MonitorConfig, ctl: ControlSender) -> Option<Self> {
        let inotify = match Inotify::init(InitFlags::IN_CLOEXEC) {
            Ok(inotify) => inotify,
            Err(err) => {
                warn!(
                    target: "proc_monitor",
                    %err,
                    "inotify unavailable, relying on timer rescans only"
                );
                return None;
            }
        };

        match inotify.add_watch(&config.package_dir, AddWatchFlags::IN_CLOSE_WRITE) {
            Ok(_) => debug!(
                target: "proc_monitor",
                path = %config.package_dir.display(),
                "watching package database directory"
            ),
            Err(err) => warn!(
                target: "proc_monitor",
                %err,
                path = %config.package_dir.display(),
                "cannot watch package database directory"
            ),
        }

        for exe in config.spawner_exe_watch_paths() {
            match inotify.add_watch(&exe, AddWatchFlags::IN_ACCESS) {
                Ok(_) => debug!(
                    target: "proc_monitor",
                    path = %exe.display(),
                    "watching spawner executable"
                ),
                Err(err) => warn!(
                    target: "proc_monitor",
                    %err,
                    path = %exe.display(),
                    "cannot watch spawner executable"
                ),
            }
        }

        let (stop_rx, stop_tx) = match pipe2(OFlag::O_CLOEXEC) {
            Ok(pipe) => pipe,
            Err(err) => {
                warn!(target: "proc_monitor", %err, "cannot set up watch shutdown pipe");
                return None;
            }
        };
        let package_db = config.package_db.clone();
        let thread = match thread::Builder::new()
            .name("procmon-watch".into())
            .spawn(move || read_loop(inotify, stop_rx, package_db, ctl))
        {
            Ok(thread) => thread,
            Err(err) => {
                warn!(target: "proc_monitor", %err, "cannot start watch reader");
                return None;
            }
        };

        Some(Self {
            stop: stop_tx,
            thread: Some(thread),
        })
    }

    /// Wake the reader and wait for it; dropping the reader's `Inotify`
    /// closes the descriptor.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            unsafe {
                libc::write(self.stop.as_raw_fd(), [1u8].as_ptr().cast(), 1);
            }
            let _ = thread.join();
        }
    }
}

impl Drop for PackageWatches {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(inotify: Inotify, stop: OwnedFd, package_db: String, ctl: ControlSender) {
    loop {
        let mut fds = [
            PollFd::new(inotify.as_fd(), PollFlags::POLLIN),
            PollFd::new(stop.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!(target: "proc_monitor", %err, "watch poll failed");
                return;
            }
        }
        if fds[1].revents().is_some_and(|flags| !flags.is_empty()) {
            return;
        }

        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(err) => {
                warn!(target: "proc_monitor", %err, "inotify read failed");
                return;
            }
        };
        for event in events {
            let packages_rewritten = event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE)
                && event.name.as_deref() == Some(OsStr::new(package_db.as_str()));
            ctl.send(if packages_rewritten {
                Control::PackagesChanged
            } else {
                Control::SpawnerAccessed
            });
        }
    }
}
