use std::{path::Path, thread, time::Duration};

const SETTLE_ATTEMPTS: u32 = 1000;
const SETTLE_INTERVAL: Duration = Duration::from_millis(1);

/// Waits for the udev event queue to drain, so that `boot_vga` and driver bindings are
/// trustworthy. Gives up after about a second; returns whether the queue settled.
pub fn settle(queue: &Path) -> bool {
    for _ in 0..SETTLE_ATTEMPTS {
        if !queue.exists() {
            return true;
        }

        thread::sleep(SETTLE_INTERVAL);
    }

    warn!("udev did not settle; continuing anyway");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        assert!(settle(&dir.path().join("queue")));
    }

    #[test]
    fn busy_queue_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        std::fs::write(&queue, "").unwrap();
        assert!(!settle(&queue));
    }
}
