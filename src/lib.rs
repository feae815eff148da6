//! Process monitor for the root-hiding subsystem.
//!
//! Traces the application spawner(s), watches every child they fork, and
//! freezes each child that turns out to be a hiding target until the host's
//! hiding daemon has scrubbed its mount view. One consumer thread owns all
//! trace state; a timer thread, an inotify reader, and the host's terminate
//! handle feed it control events; short-lived inspector workers classify
//! the children off the hot loop.

mod attach;
mod config;
mod events;
mod hooks;
mod inspect;
mod monitor;
mod registry;
mod sys;
mod watches;

pub use config::MonitorConfig;
pub use events::{Control, ControlSender};
pub use hooks::Hooks;
pub use monitor::{spawn, Error, MonitorHandle};
pub use sys::{NativeSys, NsId, Sys};
