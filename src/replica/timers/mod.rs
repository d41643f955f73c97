//! Timer tasks that drive the replica: a randomized election timer while Follower/Candidate, and
//! one heartbeat timer per (leader term, peer). Each timer is a background task owned through a
//! handle; dropping the handle is the cancellation token for the leadership epoch or follower
//! incarnation it belongs to.

mod clock;
mod election_timer;
mod heartbeat_timer;

#[cfg(test)]
mod test_support;

pub(crate) use election_timer::ElectionTimerHandle;
pub(crate) use heartbeat_timer::HeartbeatTimerHandle;

mod shared_slot {
    use std::sync::{Arc, Mutex};

    /// A single-value mailbox shared between a timer handle and its task.
    #[derive(Clone)]
    pub(super) struct SharedSlot<T> {
        value: Arc<Mutex<Option<T>>>,
    }

    impl<T> SharedSlot<T> {
        pub(super) fn new() -> Self {
            SharedSlot {
                value: Arc::new(Mutex::new(None)),
            }
        }

        pub(super) fn replace(&self, new_value: T) {
            self.value
                .lock()
                .expect("SharedSlot.replace() mutex guard poison")
                .replace(new_value);
        }

        pub(super) fn take(&self) -> Option<T> {
            self.value
                .lock()
                .expect("SharedSlot.take() mutex guard poison")
                .take()
        }
    }
}

mod stop_signal {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(super) struct Stopper {
        stop_requested: Arc<AtomicBool>,
    }

    pub(super) struct StopCheck {
        stop_requested: Arc<AtomicBool>,
    }

    impl Drop for Stopper {
        fn drop(&mut self) {
            self.stop_requested.store(true, Ordering::Release);
        }
    }

    impl StopCheck {
        pub(super) fn should_stop(&self) -> bool {
            self.stop_requested.load(Ordering::Acquire)
        }
    }

    pub(super) fn new() -> (Stopper, StopCheck) {
        let stop_requested = Arc::new(AtomicBool::new(false));

        let stopper = Stopper {
            stop_requested: stop_requested.clone(),
        };
        let stop_check = StopCheck { stop_requested };

        (stopper, stop_check)
    }
}
