//! `pilot-kernel` – Service lifecycle
//!
//! Launches every configured Service in an isolated worker, routes control
//! messages to it and stops the fleet on a termination signal.
//!
//! # Modules
//!
//! - [`worker`] – the loop that drives one Service ([`run_actor`]) and the
//!   [`Control`] messages it accepts; [`ThreadWorker`] hosts it on a named
//!   OS thread.
//! - [`process`] – [`ProcessWorker`] hosts it in a child process and
//!   [`run_child`] is the child's entry point; both sides speak JSON lines.
//! - [`supervisor`] – [`ServiceSupervisor`]: fail-open construction, the
//!   Command Dispatch Table, the refresh broadcast and bounded shutdown.
//! - [`shutdown`] – waits for SIGINT, SIGTERM or SIGQUIT.

pub mod process;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use process::{ProcessWorker, WorkerFrame, WorkerLauncher, run_child};
pub use shutdown::wait_for_termination;
pub use supervisor::{Isolation, ServiceSpec, ServiceSupervisor};
pub use worker::{Control, ThreadWorker, run_actor};
