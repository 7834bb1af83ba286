//! Support for structured logging.
//!
//! # Overview
//!
//! Lockstep emits [`tracing`] events for the kernel lifecycle and the
//! establishment of peer links at the `INFO` level, for stops, teardown and
//! late deliveries at the `DEBUG` level, and for every invoked event and
//! exchanged message at the `TRACE` level. Protocol violations by a peer are
//! reported at the `ERROR` level before the kernel returns an error.
//!
//! By default, the [`tracing_subscriber::fmt`][mod@tracing_subscriber::fmt]
//! subscriber timestamps events with the wall clock time. When the `tracing`
//! feature is activated, this module provides a [`SimulationTime`] timer
//! which stamps events emitted from within a kernel event with the virtual
//! time and the context of that event instead.
//!
//! # Configuration
//!
//! ```
//! use lockstep::tracing::SimulationTime;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
//!     .with_timer(SimulationTime::with_system_timer())
//!     .init();
//! ```
//!
//! This timer reverts to system time stamping for events emitted outside of
//! kernel events, e.g.:
//!
//! ```text
//! [t=1500 ctx=3]  INFO my_simulation: packet received
//! 2025-03-10T14:39:24.670921Z  INFO lockstep::kernel: kernel returned time=2000 events=421 stopped=true
//! ```
//!
//! Alternatively, `SimulationTime::with_system_timer_always()` prepends the
//! system time to all events:
//!
//! ```text
//! 2025-03-10T14:39:22.124945Z [t=1500 ctx=3]  INFO my_simulation: packet received
//! 2025-03-10T14:39:24.670921Z  INFO lockstep::kernel: kernel returned time=2000 events=421 stopped=true
//! ```
//!
//! # Event filtering examples
//!
//! Filtering based on the `RUST_LOG` environment variable requires the
//! `env-filter` feature of [`tracing-subscriber`][tracing_subscriber]. The
//! following directive shows the protocol messages exchanged with peers
//! while keeping the kernel quiet:
//!
//! ```text
//! $ RUST_LOG="warn,lockstep::peer=trace" cargo run --release my_simulation
//! ```

use std::fmt;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

use crate::kernel::EVENT_CONTEXT;

/// A timer that can be used in conjunction with the
/// [`tracing-subscriber`][tracing_subscriber] crate to log events using the
/// virtual time instead of (or on top of) the wall clock time.
///
/// See the [module-level documentation][crate::tracing] for more details.
#[derive(Default, Debug)]
pub struct SimulationTime<const VERBOSE: bool, T> {
    sys_timer: T,
}

impl SimulationTime<false, SystemTime> {
    /// Constructs a new simulation timer which falls back to the [`SystemTime`]
    /// timer for events emitted outside of kernel events.
    pub fn with_system_timer() -> Self {
        Self::default()
    }
}

impl SimulationTime<true, SystemTime> {
    /// Constructs a new simulation timer which prepends a [`SystemTime`]
    /// timestamp to all tracing events, followed by the virtual timestamp for
    /// events emitted from within kernel events.
    pub fn with_system_timer_always() -> Self {
        Self::default()
    }
}

impl<T: FormatTime> SimulationTime<false, T> {
    /// Constructs a new simulation timer which falls back to the provided
    /// timer for events emitted outside of kernel events.
    pub fn with_custom_timer(sys_timer: T) -> Self {
        Self { sys_timer }
    }
}

impl<T: FormatTime> SimulationTime<true, T> {
    /// Constructs a new simulation timer which prepends a timestamp generated
    /// with the provided timer to all tracing events, followed by the virtual
    /// timestamp for events emitted from within kernel events.
    pub fn with_custom_timer_always(sys_timer: T) -> Self {
        Self { sys_timer }
    }
}

impl<const VERBOSE: bool, T: FormatTime> FormatTime for SimulationTime<VERBOSE, T> {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        EVENT_CONTEXT
            .map(|ctx| {
                if VERBOSE {
                    self.sys_timer.format_time(w)?;
                    w.write_char(' ')?;
                }
                write!(w, "[t={} ctx={}]", ctx.time, ctx.context)
            })
            .unwrap_or_else(|| self.sys_timer.format_time(w))
    }
}
