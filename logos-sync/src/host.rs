//! Host lifecycle hooks: "the process/page is going away".

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

/// Callback run when the host exits.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Source of host exit notifications.
pub trait HostLifecycle: Send + Sync {
    fn subscribe(&self, hook: ExitHook) -> HookId;

    /// Returns whether the hook was registered.
    fn unsubscribe(&self, id: HookId) -> bool;
}

#[derive(Default)]
struct HookTable {
    next_id: u64,
    hooks: BTreeMap<HookId, ExitHook>,
}

/// Manually fired exit signal. Clones share the same hook table.
#[derive(Clone, Default)]
pub struct HostSignal {
    table: Arc<Mutex<HookTable>>,
}

impl HostSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HookTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run every registered hook. Returns how many ran.
    pub fn fire(&self) -> usize {
        let hooks: Vec<ExitHook> = self.table().hooks.values().cloned().collect();
        for hook in &hooks {
            hook();
        }
        hooks.len()
    }

    pub fn hook_count(&self) -> usize {
        self.table().hooks.len()
    }

    /// Fire once on ctrl-c.
    pub fn watch_ctrl_c(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("ctrl-c received, running {} exit hooks", signal.hook_count());
                    signal.fire();
                }
                Err(e) => log::warn!("cannot listen for ctrl-c: {e}"),
            }
        })
    }
}

impl HostLifecycle for HostSignal {
    fn subscribe(&self, hook: ExitHook) -> HookId {
        let mut table = self.table();
        let id = HookId(table.next_id);
        table.next_id += 1;
        table.hooks.insert(id, hook);
        id
    }

    fn unsubscribe(&self, id: HookId) -> bool {
        self.table().hooks.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_runs_hooks() {
        let signal = HostSignal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = signal.subscribe(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(signal.fire(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));
        assert_eq!(signal.fire(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_may_unsubscribe_itself() {
        let signal = HostSignal::new();
        let slot: Arc<Mutex<Option<HookId>>> = Arc::new(Mutex::new(None));
        let (s, sl) = (signal.clone(), slot.clone());
        let id = signal.subscribe(Arc::new(move || {
            if let Some(id) = sl.lock().unwrap().take() {
                s.unsubscribe(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        signal.fire();
        assert_eq!(signal.hook_count(), 0);
    }
}
