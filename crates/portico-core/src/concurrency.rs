use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::warn;

/// Process-wide stop request, flipped by Ctrl-C or by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route Ctrl-C into a [`ShutdownSignal`]. A second Ctrl-C exits at once.
pub fn install_signal_handler() -> ShutdownSignal {
    let signal = ShutdownSignal::new();
    let flag = signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.is_requested() {
            std::process::exit(1);
        }
        flag.request();
        eprintln!("\nshutdown requested, stopping containers...");
    }) {
        warn!("failed to install signal handler: {e}");
    }
    signal
}

/// Apply `f` to every item on at most `threads` scoped workers and return the
/// results in item order.
pub fn run_bounded<T, R, F>(items: &[T], threads: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = threads.max(1).min(items.len());
    if workers <= 1 {
        return items.iter().map(f).collect();
    }

    let cursor = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new(items.iter().map(|_| None).collect());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else {
                    break;
                };
                let result = f(item);
                slots.lock().expect("worker results lock poisoned")[index] = Some(result);
            });
        }
    });

    slots
        .into_inner()
        .expect("worker results lock poisoned")
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn results_keep_item_order() {
        let items: Vec<u64> = (0..20).collect();
        let doubled = run_bounded(&items, 4, |n| {
            thread::sleep(Duration::from_millis(20 - n));
            n * 2
        });
        assert_eq!(doubled, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn concurrency_is_bounded() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 12];
        run_bounded(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn empty_input() {
        let out: Vec<u8> = run_bounded(&[] as &[u8], 8, |b| *b);
        assert!(out.is_empty());
    }

    #[test]
    fn shutdown_signal_is_shared() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        assert!(!other.is_requested());
        signal.request();
        assert!(other.is_requested());
    }
}
