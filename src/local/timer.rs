use crate::event::{Event, EventSender};
use rand::Rng;
use tokio::time::{sleep_until, Duration, Instant};

/// ElectionTimerHandle owns a background task that fires one
/// `ElectionTimeout` event if the timer is not reset or dropped first. Each
/// reset re-arms the deadline with fresh jitter. Dropping the handle
/// disconnects the queue and the task exits without firing.
pub(crate) struct ElectionTimerHandle {
    // flume gives the timer task a non-blocking try_recv to distinguish
    // "reset arrived" from "queue still open but idle".
    wake_time_queue: flume::Sender<Instant>,
    base_timeout: Duration,
    max_jitter: f64,
}

impl ElectionTimerHandle {
    pub fn spawn(
        base_timeout: Duration,
        max_jitter: f64,
        events: EventSender<Event>,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let handle = ElectionTimerHandle {
            wake_time_queue: tx,
            base_timeout,
            max_jitter,
        };
        handle.reset();

        tokio::spawn(Self::timer_task(rx, events));

        handle
    }

    pub fn reset(&self) {
        let _ = self.wake_time_queue.try_send(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let jitter = rand::thread_rng().gen_range(0.0..self.max_jitter);
        Instant::now() + self.base_timeout.mul_f64(1.0 + jitter)
    }

    async fn timer_task(queue: flume::Receiver<Instant>, events: EventSender<Event>) {
        loop {
            match queue.try_recv() {
                Ok(wake_time) => {
                    // Leader contact arrived; sleep towards the new deadline.
                    sleep_until(wake_time).await;
                }
                Err(flume::TryRecvError::Empty) => {
                    // Slept to the deadline with no reset in between.
                    events.send(Event::ElectionTimeout);
                    return;
                }
                Err(flume::TryRecvError::Disconnected) => {
                    // Role changed and the handle was dropped.
                    return;
                }
            }
        }
    }
}
