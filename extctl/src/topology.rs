//! Core pinning for the receive worker and the control loop.
//!
//! Both harness threads spend their time blocked: the worker in `poll`, the
//! engine on the handoff channel. Giving each its own core keeps wake-up
//! latency out of the loop period. Pinning is best effort; a refusal is
//! logged and the thread keeps running wherever the OS put it.

use core_affinity::CoreId;

use crate::trace::{debug, warn};

/// Cores visible to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLayout {
    pub logical: usize,
    pub physical: usize,
    /// Ids accepted by [`pin_current_thread`], in enumeration order.
    pub ids: Vec<usize>,
}

impl CoreLayout {
    #[must_use]
    pub fn detect() -> Self {
        let logical = num_cpus::get();
        let ids = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|c| c.id).collect())
            .unwrap_or_else(|| (0..logical).collect());
        Self {
            logical,
            physical: num_cpus::get_physical(),
            ids,
        }
    }

    #[must_use]
    pub const fn smt(&self) -> bool {
        self.logical > self.physical
    }

    /// First two ids when there are two of anything to spread over.
    ///
    /// Linux and Windows enumerate one id per physical core before the SMT
    /// siblings, so ids 0 and 1 land on separate cores whenever two exist,
    /// and on the two siblings of a lone SMT core otherwise.
    #[must_use]
    pub fn placement(&self) -> ThreadPlacement {
        if self.physical < 2 && !self.smt() {
            return ThreadPlacement::UNPINNED;
        }
        match self.ids.as_slice() {
            [rx, engine, ..] => ThreadPlacement {
                rx_core: Some(*rx),
                engine_core: Some(*engine),
            },
            _ => ThreadPlacement::UNPINNED,
        }
    }
}

/// Core per harness thread; `None` leaves that thread to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadPlacement {
    pub rx_core: Option<usize>,
    pub engine_core: Option<usize>,
}

impl ThreadPlacement {
    pub const UNPINNED: Self = Self {
        rx_core: None,
        engine_core: None,
    };

    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.rx_core.is_some() || self.engine_core.is_some()
    }
}

/// Pinning policy, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuConfig {
    /// Detect the core layout and spread the two threads over it.
    Auto,
    Manual {
        rx_core: Option<usize>,
        engine_core: Option<usize>,
    },
    #[default]
    Disabled,
}

impl CpuConfig {
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match *self {
            Self::Auto => {
                let layout = CoreLayout::detect();
                let placement = layout.placement();
                debug!(?layout, ?placement, "resolved automatic thread placement");
                placement
            }
            Self::Manual {
                rx_core,
                engine_core,
            } => ThreadPlacement {
                rx_core,
                engine_core,
            },
            Self::Disabled => ThreadPlacement::UNPINNED,
        }
    }
}

/// Pins the calling thread to `core`. Returns `false` (and logs) if the id is
/// unknown or the OS refuses.
pub fn pin_current_thread(core: usize) -> bool {
    let pinned = core_affinity::set_for_current(CoreId { id: core });
    if pinned {
        debug!(core, "thread pinned");
    } else {
        warn!(core, "could not pin thread, leaving it to the scheduler");
    }
    pinned
}
