use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// Control events merged into the monitor's queue. The monitor thread is
/// the only consumer; the timer thread, the inotify reader, and the host's
/// terminate handle produce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Periodic rescan while discovery is incomplete.
    Tick,
    /// The package database was rewritten.
    PackagesChanged,
    /// The spawner executable was touched.
    SpawnerAccessed,
    /// Tear everything down and exit the monitor thread.
    Terminate,
}

/// Producer half of the control plane. `send` queues the event, then pokes
/// the wake pipe so a monitor blocked in epoll notices immediately. Every
/// clone keeps the read end alive too, so the poke can never hit a widowed
/// pipe and raise SIGPIPE.
#[derive(Clone)]
pub struct ControlSender {
    tx: Sender<Control>,
    wake: Arc<OwnedFd>,
    _wake_rx: Arc<OwnedFd>,
}

impl ControlSender {
    pub fn send(&self, event: Control) {
        if self.tx.send(event).is_err() {
            // monitor already gone
            return;
        }
        // EAGAIN on a full pipe is fine, the monitor is poked either way
        unsafe {
            libc::write(self.wake.as_raw_fd(), [1u8].as_ptr().cast(), 1);
        }
    }
}

/// Queue plus wake pipe. Returns the sender, the consumer's receiver, and
/// the pipe end the monitor adds to its epoll set.
pub(crate) fn control_channel() -> nix::Result<(ControlSender, Receiver<Control>, Arc<OwnedFd>)> {
    let (tx, rx) = unbounded();
    let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    let wake_rx = Arc::new(wake_rx);
    Ok((
        ControlSender {
            tx,
            wake: Arc::new(wake_tx),
            _wake_rx: wake_rx.clone(),
        },
        rx,
        wake_rx,
    ))
}

/// Empty a wake pipe after epoll reported it readable.
pub(crate) fn drain_wake_pipe(fd: impl AsFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(fd.as_fd().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        };
        if n <= 0 {
            return;
        }
    }
}

enum TimerCmd {
    Arm,
    Disarm,
    Quit,
}

/// The periodic rescan timer, as a thread paced by `recv_timeout`. Armed it
/// emits `Control::Tick` every interval; disarmed it sleeps on the command
/// channel. The monitor keeps it armed exactly while the spawner registry
/// is below the expected count.
pub(crate) struct RescanTimer {
    cmd: Sender<TimerCmd>,
    thread: Option<thread::JoinHandle<()>>,
    armed: bool,
}

impl RescanTimer {
    pub fn spawn(interval: Duration, ctl: ControlSender) -> std::io::Result<Self> {
        let (cmd, cmd_rx) = unbounded();
        let thread = thread::Builder::new()
            .name("procmon-timer".into())
            .spawn(move || run_timer(interval, cmd_rx, ctl))?;
        Ok(Self {
            cmd,
            thread: Some(thread),
            armed: false,
        })
    }

    pub fn arm(&mut self) {
        if !self.armed {
            self.armed = true;
            let _ = self.cmd.send(TimerCmd::Arm);
        }
    }

    pub fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            let _ = self.cmd.send(TimerCmd::Disarm);
        }
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.cmd.send(TimerCmd::Quit);
            let _ = thread.join();
        }
    }
}

impl Drop for RescanTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(interval: Duration, cmd: Receiver<TimerCmd>, ctl: ControlSender) {
    let mut armed = false;
    loop {
        let next = if armed {
            match cmd.recv_timeout(interval) {
                Ok(next) => next,
                Err(RecvTimeoutError::Timeout) => {
                    ctl.send(Control::Tick);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        } else {
            match cmd.recv() {
                Ok(next) => next,
                Err(_) => return,
            }
        };
        match next {
            TimerCmd::Arm => armed = true,
            TimerCmd::Disarm => armed = false,
            TimerCmd::Quit => return,
        }
    }
}
