//! Runtime configuration
//!
//! Host-dependent defaults live here instead of being spread over the
//! engine: which descriptor kinds the event queue can watch natively, how
//! large the initial descriptor table is, and how the wall-clock-step
//! detector samples.

use core::time::Duration;
use lazy_static::lazy_static;

use crate::epoll::node::NodeType;

/// Native filter support for one descriptor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCaps {
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

impl FilterCaps {
    pub const ALL: FilterCaps = FilterCaps {
        read: true,
        write: true,
        except: true,
    };
    pub const NONE: FilterCaps = FilterCaps {
        read: false,
        write: false,
        except: false,
    };
    pub const READ_WRITE: FilterCaps = FilterCaps {
        read: true,
        write: true,
        except: false,
    };
    pub const READ_ONLY: FilterCaps = FilterCaps {
        read: true,
        write: false,
        except: false,
    };
}

/// Capability table, one row per node kind
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub fifo: FilterCaps,
    pub socket: FilterCaps,
    pub kqueue: FilterCaps,
    pub other: FilterCaps,
    /// Character devices are watched with `poll` instead of the queue
    pub char_device_fallback: bool,
}

impl Capabilities {
    pub fn for_node(&self, node_type: NodeType) -> FilterCaps {
        match node_type {
            NodeType::Fifo => self.fifo,
            NodeType::Socket => self.socket,
            NodeType::Kqueue => self.kqueue,
            NodeType::Other => self.other,
            NodeType::Poll => FilterCaps::NONE,
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn host_default() -> Self {
        Capabilities {
            fifo: FilterCaps::READ_WRITE,
            socket: FilterCaps::ALL,
            kqueue: FilterCaps::READ_ONLY,
            other: FilterCaps::READ_WRITE,
            char_device_fallback: true,
        }
    }

    #[cfg(target_os = "freebsd")]
    fn host_default() -> Self {
        Capabilities {
            fifo: FilterCaps::READ_WRITE,
            socket: FilterCaps::ALL,
            kqueue: FilterCaps::READ_ONLY,
            other: FilterCaps::READ_WRITE,
            char_device_fallback: false,
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    fn host_default() -> Self {
        Capabilities {
            fifo: FilterCaps::READ_WRITE,
            socket: FilterCaps::ALL,
            kqueue: FilterCaps::READ_ONLY,
            other: FilterCaps::ALL,
            char_device_fallback: false,
        }
    }
}

/// Process-wide shim settings
#[derive(Debug, Clone)]
pub struct ShimConfig {
    pub capabilities: Capabilities,
    /// Slots reserved in the descriptor table at first use
    pub initial_table_capacity: usize,
    /// How often the wall-clock-step detector samples
    pub realtime_check_interval: Duration,
    /// Offset change treated as a step rather than slewing
    pub realtime_step_threshold: Duration,
    /// Scratch buffers larger than this are released after a wait
    pub scratch_retain: usize,
    /// Queue events fetched per drain
    pub drain_batch: usize,
    /// Re-poll period for writers blocked on a full counter
    pub blocked_write_retry: Duration,
    /// Longest single sleep of a blocked reader before it re-checks
    pub blocked_read_retry: Duration,
    /// Nesting depth after which bridged readiness reports nothing
    pub max_nesting_depth: usize,
}

impl ShimConfig {
    fn host_default() -> Self {
        ShimConfig {
            capabilities: Capabilities::host_default(),
            initial_table_capacity: 64,
            realtime_check_interval: Duration::from_millis(500),
            realtime_step_threshold: Duration::from_millis(1),
            scratch_retain: 1024,
            drain_batch: 64,
            blocked_write_retry: Duration::from_millis(10),
            blocked_read_retry: Duration::from_millis(100),
            max_nesting_depth: 5,
        }
    }
}

lazy_static! {
    static ref CONFIG: ShimConfig = ShimConfig::host_default();
}

/// Global shim configuration
pub fn config() -> &'static ShimConfig {
    &CONFIG
}
