//! Process-wide shutdown coordination.
//!
//! A [`ShutdownRegistry`] is created once by the entry point and shared via
//! `Arc`. Components register named cancel callbacks and get back a
//! [`ShutdownGuard`] that deregisters them when dropped. On a termination
//! signal the registry runs every callback once, in registration order.
//! Callbacks are expected to only raise a flag; the threads owning the work
//! do the actual teardown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::exit_codes;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    id: u64,
    name: String,
    callback: Callback,
}

#[derive(Default)]
struct Registrations {
    entries: Vec<Entry>,
    triggered: bool,
}

/// What happened during [`ShutdownRegistry::trigger_shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Callbacks that ran to completion or panicked, in order.
    pub invoked: Vec<String>,
    /// Subset of `invoked` that panicked.
    pub panicked: Vec<String>,
    /// The deadline elapsed before every callback returned.
    pub timed_out: bool,
}

/// What the signal handler does once the registry has handled a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Registered components are winding down; let them return normally.
    Continue,
    /// Nothing would notice the shutdown, or this is a repeated signal.
    Exit,
}

pub struct ShutdownRegistry {
    registrations: Mutex<Registrations>,
    next_id: AtomicU64,
    signals: AtomicUsize,
    deadline: Duration,
}

/// Keeps a registration alive. Dropping it removes the entry, unless a newer
/// registration under the same name has replaced it.
#[must_use = "dropping the guard deregisters the callback"]
pub struct ShutdownGuard {
    registry: Weak<ShutdownRegistry>,
    name: String,
    id: u64,
}

impl ShutdownGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.name, self.id);
        }
    }
}

impl ShutdownRegistry {
    /// `deadline` bounds the total time `trigger_shutdown` waits for callbacks.
    pub fn new(deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            registrations: Mutex::new(Registrations::default()),
            next_id: AtomicU64::new(1),
            signals: AtomicUsize::new(0),
            deadline,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registrations> {
        match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `callback` under `name`.
    ///
    /// A duplicate name replaces the earlier callback (it keeps its place in
    /// the order). If shutdown has already been triggered the callback runs
    /// immediately on the calling thread.
    pub fn register_on_shutdown<F>(self: &Arc<Self>, name: &str, callback: F) -> ShutdownGuard
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = ShutdownGuard {
            registry: Arc::downgrade(self),
            name: name.to_string(),
            id,
        };
        let callback: Callback = Arc::new(callback);

        let mut registrations = self.lock();
        if registrations.triggered {
            drop(registrations);
            info!(name, "shutdown already triggered, running callback now");
            if invoke_isolated(name, &callback).is_err() {
                error!(name, "late shutdown callback panicked");
            }
            return guard;
        }
        match registrations
            .entries
            .iter_mut()
            .find(|entry| entry.name == name)
        {
            Some(entry) => {
                warn!(name, "shutdown callback already registered, replacing");
                entry.id = id;
                entry.callback = callback;
            }
            None => {
                debug!(name, "shutdown callback registered");
                registrations.entries.push(Entry {
                    id,
                    name: name.to_string(),
                    callback,
                });
            }
        }
        guard
    }

    fn deregister(&self, name: &str, id: u64) {
        let mut registrations = self.lock();
        let before = registrations.entries.len();
        registrations
            .entries
            .retain(|entry| !(entry.name == name && entry.id == id));
        if registrations.entries.len() != before {
            debug!(name, "shutdown callback deregistered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().triggered
    }

    /// Names currently registered, in invocation order.
    pub fn registered(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Run every registered callback once, in registration order.
    ///
    /// Each callback is isolated: a panic is recorded and the next one still
    /// runs. Callbacks run on a helper thread; this returns when they are all
    /// done or the deadline passes, whichever is first. Only the first call
    /// does anything.
    pub fn trigger_shutdown(&self) -> ShutdownReport {
        let snapshot: Vec<(String, Callback)> = {
            let mut registrations = self.lock();
            if registrations.triggered {
                debug!("shutdown already triggered");
                return ShutdownReport::default();
            }
            registrations.triggered = true;
            registrations
                .entries
                .iter()
                .map(|entry| (entry.name.clone(), Arc::clone(&entry.callback)))
                .collect()
        };
        info!(callbacks = snapshot.len(), "triggering shutdown");

        let expected = snapshot.len();
        let (tx, rx) = mpsc::channel::<(String, bool)>();
        thread::spawn(move || {
            for (name, callback) in snapshot {
                let panicked = invoke_isolated(&name, &callback).is_err();
                if tx.send((name, panicked)).is_err() {
                    return;
                }
            }
        });

        let mut report = ShutdownReport::default();
        let deadline = Instant::now() + self.deadline;
        while report.invoked.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((name, panicked)) => {
                    if panicked {
                        report.panicked.push(name.clone());
                    }
                    report.invoked.push(name);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        deadline_secs = self.deadline.as_secs(),
                        pending = expected - report.invoked.len(),
                        "shutdown deadline elapsed"
                    );
                    report.timed_out = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(
            invoked = report.invoked.len(),
            panicked = report.panicked.len(),
            timed_out = report.timed_out,
            "shutdown callbacks finished"
        );
        report
    }

    /// Handle one termination signal.
    ///
    /// The first signal triggers shutdown. If no callback was registered the
    /// process has nothing to unwind and should exit; a second signal always
    /// exits.
    pub fn on_signal(&self) -> SignalAction {
        if self.signals.fetch_add(1, Ordering::SeqCst) > 0 {
            warn!("repeated termination signal");
            return SignalAction::Exit;
        }
        warn!("termination signal received");
        let report = self.trigger_shutdown();
        if !report.panicked.is_empty() {
            error!(panicked = ?report.panicked, "shutdown callbacks panicked");
        }
        if report.invoked.is_empty() && !report.timed_out {
            info!("nothing registered for shutdown");
            return SignalAction::Exit;
        }
        SignalAction::Continue
    }

    /// Route SIGINT/SIGTERM (Ctrl-C on other platforms) to
    /// [`on_signal`](Self::on_signal), exiting with
    /// [`exit_codes::CANCELED`] when it says so. Can be installed once per
    /// process.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let registry = Arc::clone(self);
        ctrlc::set_handler(move || {
            if registry.on_signal() == SignalAction::Exit {
                std::process::exit(exit_codes::CANCELED);
            }
        })
        .context("install signal handler")
    }
}

fn invoke_isolated(name: &str, callback: &Callback) -> std::thread::Result<()> {
    debug!(name, "invoking shutdown callback");
    let result = catch_unwind(AssertUnwindSafe(|| callback()));
    if result.is_err() {
        warn!(name, "shutdown callback panicked");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn invokes_every_callback_once_in_order_despite_panic() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut guards = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            guards.push(registry.register_on_shutdown(&format!("runner-{i}"), move || {
                order.lock().expect("lock").push(i);
                if i == 2 {
                    panic!("callback {i} failed");
                }
            }));
        }

        let report = registry.trigger_shutdown();
        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2, 3, 4]);
        assert_eq!(report.invoked.len(), 5);
        assert_eq!(report.panicked, vec!["runner-2".to_string()]);
        assert!(!report.timed_out);

        let again = registry.trigger_shutdown();
        assert!(again.invoked.is_empty());
        assert_eq!(order.lock().expect("lock").len(), 5);
    }

    #[test]
    fn duplicate_name_replaces_and_old_guard_does_not_remove_new() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        let first = counter();
        let second = counter();
        let f = Arc::clone(&first);
        let old_guard = registry.register_on_shutdown("base-infrastructure", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        let _new_guard = registry.register_on_shutdown("base-infrastructure", move || {
            s.fetch_add(1, Ordering::SeqCst);
        });
        drop(old_guard);
        assert_eq!(registry.registered(), vec!["base-infrastructure".to_string()]);

        registry.trigger_shutdown();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_guard_deregisters() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        let hits = counter();
        let h = Arc::clone(&hits);
        let guard = registry.register_on_shutdown("runner", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        assert!(registry.registered().is_empty());
        registry.trigger_shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        registry.trigger_shutdown();
        let hits = counter();
        let h = Arc::clone(&hits);
        let _guard = registry.register_on_shutdown("late", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.registered().is_empty());
    }

    #[test]
    fn deadline_bounds_slow_callbacks() {
        let registry = ShutdownRegistry::new(Duration::from_millis(200));
        let _slow = registry.register_on_shutdown("slow", || {
            thread::sleep(Duration::from_secs(3));
        });
        let _never = registry.register_on_shutdown("after-slow", || {});
        let started = Instant::now();
        let report = registry.trigger_shutdown();
        assert!(report.timed_out);
        assert!(report.invoked.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn signal_with_nothing_registered_exits() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        assert_eq!(registry.on_signal(), SignalAction::Exit);
        assert!(registry.is_triggered());
    }

    #[test]
    fn second_signal_exits_even_with_registrations() {
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        let hits = counter();
        let h = Arc::clone(&hits);
        let _guard = registry.register_on_shutdown("runner", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.on_signal(), SignalAction::Continue);
        assert_eq!(registry.on_signal(), SignalAction::Exit);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_registration_during_trigger_runs_each_callback_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;
        let registry = ShutdownRegistry::new(Duration::from_secs(5));
        let hits: Arc<Vec<AtomicUsize>> =
            Arc::new((0..THREADS * PER_THREAD).map(|_| AtomicUsize::new(0)).collect());

        let guards = thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let registry = &registry;
                    let hits = Arc::clone(&hits);
                    scope.spawn(move || {
                        (0..PER_THREAD)
                            .map(|i| {
                                let slot = t * PER_THREAD + i;
                                let hits = Arc::clone(&hits);
                                registry.register_on_shutdown(&format!("runner-{slot}"), move || {
                                    hits[slot].fetch_add(1, Ordering::SeqCst);
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            thread::sleep(Duration::from_millis(1));
            let report = registry.trigger_shutdown();
            assert!(report.panicked.is_empty());
            workers
                .into_iter()
                .flat_map(|worker| worker.join().expect("worker"))
                .collect::<Vec<_>>()
        });

        assert_eq!(guards.len(), THREADS * PER_THREAD);
        for (slot, count) in hits.iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 1, "runner-{slot}");
        }
    }
}
