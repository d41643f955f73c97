use crate::actor;
use crate::replica::replica_api::HeartbeatTick;
use crate::replica::timers::clock::{Clock, RealClock};
use crate::replica::timers::shared_slot::SharedSlot;
use crate::replica::{ReplicaId, Term};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Drives AppendEntries traffic towards a single peer for a single leader term. The leader holds
/// one handle per peer; dropping the handles (on losing leadership) stops the tasks.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedSlot<Instant>,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: SharedSlot<Instant>,
    actor_client: actor::WeakActorClient,
    event: HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Pushes out the next periodic heartbeat, after the leader has just sent this peer an
    /// AppendEntries for some other reason.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        let new_timeout = self.clock.now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let shared_slot = SharedSlot::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: shared_slot.clone(),
            clock: clock.clone(),
        });
        let event = HeartbeatTick { peer_id, term };

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time: shared_slot,
            actor_client,
            event,
            clock,
        };
        let handle = HeartbeatTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The SharedSlot starts empty, so the first iteration publishes a tick immediately. A newly
        // elected leader wants its first heartbeat out to each peer ASAP.
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => {
                    // A recent proactive send means no periodic heartbeat is due yet.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    if let Some(shared) = self.weak_shared.upgrade() {
                        let _ = self.actor_client.heartbeat_tick(self.event.clone()).await;
                        shared.reset_heartbeat_timer();
                    } else {
                        // Handle dropped: no longer leader for this term.
                        return;
                    }
                }
            }
        }
    }
}
