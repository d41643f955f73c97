use crate::actor;
use crate::replica::timers::clock::{Clock, RealClock};
use crate::replica::timers::shared_slot::SharedSlot;
use crate::replica::timers::stop_signal;
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// Owns the randomized election timeout while this replica is a follower or candidate. Each call
/// to `reset_timeout()` pushes the deadline out by a fresh random duration; if the deadline passes
/// without a reset, the task tells the actor to start an election.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    next_wake_time: SharedSlot<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _to_drop: stop_signal::Stopper,
}

struct ElectionTimerTask<C: Clock> {
    next_wake_time: SharedSlot<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: stop_signal::StopCheck,
    // Static wait between repeated timeouts, so a partitioned replica doesn't spin.
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let shared_slot = SharedSlot::new();
        let (stopper, stop_check) = stop_signal::new();

        let task = ElectionTimerTask {
            next_wake_time: shared_slot.clone(),
            actor_client,
            clock: clock.clone(),
            stop_check,
            timeout_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            next_wake_time: shared_slot,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _to_drop: stopper,
        };

        // The task must start with a deadline present, or it would trigger a timeout immediately
        // after we become a follower.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // Heard from a current leader recently; sleep until the next deadline.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // We slept until `wake_time` and no reset arrived. Keep the task running even
                    // after notifying, in case the actor concurrently received AppendEntries and
                    // remains a follower.
                    if self.stop_check.should_stop() {
                        return;
                    }
                    let _ = self.actor_client.election_timeout().await;
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // Handle dropped means this follower/candidate incarnation is over.
            if self.stop_check.should_stop() {
                return;
            }
        }
    }
}
