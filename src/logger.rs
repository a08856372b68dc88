use crate::{NodeInfo, NodeStatus};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::debug;

/// Subscriber of the tree's status change notifications.
///
/// `callback` runs synchronously on the ticking thread, once per actual
/// transition, before the tick that caused it returns. It must not block.
/// A panicking callback is caught and logged; the tree keeps running.
pub trait StatusChangeLogger: Send + Sync {
    /// `timestamp` is the time since the UNIX epoch.
    fn callback(&self, timestamp: Duration, node: &NodeInfo, prev: NodeStatus, status: NodeStatus);

    /// Persist whatever is buffered. May be called any number of times.
    fn flush(&self) {}

    /// A disabled logger is skipped by the tree.
    fn is_enabled(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Writes every transition to `tracing` at debug level.
pub struct TracingLogger {
    enabled: AtomicBool,
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl StatusChangeLogger for TracingLogger {
    fn callback(&self, timestamp: Duration, node: &NodeInfo, prev: NodeStatus, status: NodeStatus) {
        debug!(
            timestamp_us = timestamp.as_micros() as u64,
            uid = node.uid,
            name = node.name,
            "{prev} -> {status}"
        );
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        "tracing"
    }
}
