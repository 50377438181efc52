//! Thread identifier service.
//!
//! Each chunk carries one pending-operation word per thread, so every
//! participating thread needs a stable small integer id below the queue's
//! `max_threads`. Ids are handed out on first use and recycled when the
//! thread exits, keeping the live range as dense as the number of
//! concurrently running threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
static FREE_IDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

struct Registration(usize);

impl Drop for Registration {
    fn drop(&mut self) {
        FREE_IDS.lock().unwrap().push(self.0);
    }
}

thread_local! {
    static REGISTRATION: Registration = Registration(
        FREE_IDS
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| NEXT_ID.fetch_add(1, Ordering::Relaxed)),
    );
}

/// Returns this thread's id. Stable for the lifetime of the thread.
pub(crate) fn thread_id() -> usize {
    REGISTRATION.with(|r| r.0)
}

#[cfg(test)]
mod tests {
    use super::thread_id;

    #[test]
    fn stable_within_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn recycled_after_exit() {
        let id = std::thread::spawn(thread_id).join().unwrap();
        // The spawned thread has exited, so its id is available again.
        assert!(super::FREE_IDS.lock().unwrap().contains(&id));
    }
}
