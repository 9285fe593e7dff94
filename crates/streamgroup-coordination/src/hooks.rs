//! Observer hooks for leadership and assignment transitions.
//!
//! Hooks are invoked synchronously, in registration order, from the coordination task that
//! observed the transition. A hook that returns an error or panics is logged and skipped; it never
//! stops the remaining hooks or the protocol.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;

use parking_lot::RwLock;
use streamgroup_core::PartitionId;
use tracing::warn;

/// Notified when this consumer gains or loses leadership of a group.
pub trait LeaderHook: Send + Sync {
    fn on_acquired(&self, subscriber_id: &str) -> anyhow::Result<()>;

    fn on_lost(&self, subscriber_id: &str) -> anyhow::Result<()>;
}

/// Notified when a subscription starts or stops owning partitions.
pub trait SubscriptionLifecycleHook: Send + Sync {
    fn on_assigned(&self, subscription_id: &str, partitions: &[PartitionId]) -> anyhow::Result<()>;

    fn on_revoked(&self, subscription_id: &str, partitions: &[PartitionId]) -> anyhow::Result<()>;
}

/// Ordered list of registered hooks of one kind.
pub struct HookRegistry<H: ?Sized> {
    hooks: RwLock<Vec<Arc<H>>>,
}

impl<H: ?Sized> Default for HookRegistry<H> {
    fn default() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }
}

impl<H: ?Sized> HookRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. Hooks are never replaced.
    pub fn register(&self, hook: Arc<H>) {
        self.hooks.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Call `f` on every hook. `event` names the callback in logs.
    ///
    /// Works on a snapshot, so a hook may register further hooks without deadlocking; those are
    /// first called on the next event.
    pub fn invoke<F>(&self, event: &'static str, f: F)
    where F: Fn(&H) -> anyhow::Result<()> {
        let snapshot: Vec<Arc<H>> = self.hooks.read().clone();
        for (position, hook) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event, position, error = %e, "hook failed"),
                Err(_) => warn!(event, position, "hook panicked"),
            }
        }
    }
}

impl HookRegistry<dyn LeaderHook> {
    pub fn acquired(&self, subscriber_id: &str) {
        self.invoke("leader_acquired", |h| h.on_acquired(subscriber_id));
    }

    pub fn lost(&self, subscriber_id: &str) {
        self.invoke("leader_lost", |h| h.on_lost(subscriber_id));
    }
}

impl HookRegistry<dyn SubscriptionLifecycleHook> {
    pub fn assigned(&self, subscription_id: &str, partitions: &[PartitionId]) {
        if partitions.is_empty() {
            return;
        }
        self.invoke("partitions_assigned", |h| h.on_assigned(subscription_id, partitions));
    }

    pub fn revoked(&self, subscription_id: &str, partitions: &[PartitionId]) {
        if partitions.is_empty() {
            return;
        }
        self.invoke("partitions_revoked", |h| h.on_revoked(subscription_id, partitions));
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LeaderHook for Recorder {
        fn on_acquired(&self, subscriber_id: &str) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:acquired:{subscriber_id}", self.name));
            Ok(())
        }

        fn on_lost(&self, subscriber_id: &str) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:lost:{subscriber_id}", self.name));
            Ok(())
        }
    }

    struct Failing;

    impl LeaderHook for Failing {
        fn on_acquired(&self, _subscriber_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }

        fn on_lost(&self, _subscriber_id: &str) -> anyhow::Result<()> {
            panic!("boom")
        }
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry: HookRegistry<dyn LeaderHook> = HookRegistry::new();
        registry.register(Arc::new(Recorder { name: "a", log: log.clone() }));
        registry.register(Arc::new(Recorder { name: "b", log: log.clone() }));

        registry.acquired("billing");
        registry.lost("billing");

        assert_eq!(*log.lock(), vec!["a:acquired:billing", "b:acquired:billing", "a:lost:billing", "b:lost:billing"]);
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry: HookRegistry<dyn LeaderHook> = HookRegistry::new();
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Recorder { name: "a", log: log.clone() }));

        registry.acquired("billing");
        registry.lost("billing");

        assert_eq!(*log.lock(), vec!["a:acquired:billing", "a:lost:billing"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_partition_lists_are_not_reported() {
        struct Counting(Arc<Mutex<usize>>);
        impl SubscriptionLifecycleHook for Counting {
            fn on_assigned(&self, _: &str, _: &[PartitionId]) -> anyhow::Result<()> {
                *self.0.lock() += 1;
                Ok(())
            }

            fn on_revoked(&self, _: &str, _: &[PartitionId]) -> anyhow::Result<()> {
                *self.0.lock() += 1;
                Ok(())
            }
        }

        let count = Arc::new(Mutex::new(0));
        let registry: HookRegistry<dyn SubscriptionLifecycleHook> = HookRegistry::new();
        registry.register(Arc::new(Counting(count.clone())));

        registry.assigned("sub-1", &[]);
        registry.revoked("sub-1", &[]);
        assert_eq!(*count.lock(), 0);

        registry.assigned("sub-1", &[PartitionId::new("orders", 0)]);
        assert_eq!(*count.lock(), 1);
    }
}
