//! Callback delivery worker pool.
//!
//! A fixed number of workers, started with the connection, drive every push
//! subscription. Each endpoint belongs to exactly one worker, chosen by hashing its
//! id, which gives strict FIFO per subscription while unrelated subscriptions
//! progress in parallel. A handler that stalls holds up only the endpoints that
//! hash to the same worker.
//!
//! Endpoints are scheduled, not polled: enqueueing a message into an idle push
//! endpoint claims it and sends it to its worker, which drains the queue and then
//! releases the claim.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::subscription::{Delivery, Popped};

pub(crate) struct DeliveryDispatcher {
    workers: Vec<mpsc::UnboundedSender<Arc<Delivery>>>,
}

impl DeliveryDispatcher {
    /// Starts `size` workers that stop when `cancel` fires.
    ///
    /// `on_exhausted` runs after a handler consumed the last message allowed by
    /// auto-unsubscribe, with the endpoint id.
    pub(crate) fn start<F>(
        size: usize,
        cancel: CancellationToken,
        on_exhausted: F,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let on_exhausted = Arc::new(on_exhausted);
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                rx,
                cancel.clone(),
                on_exhausted.clone(),
            )));
        }

        (DeliveryDispatcher { workers }, handles)
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Worker owning endpoint `id`.
    pub(crate) fn worker_for(&self, id: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }

    /// Hands a push endpoint with pending messages to its worker.
    pub(crate) fn schedule(&self, delivery: &Arc<Delivery>) {
        if !delivery.try_schedule() {
            return;
        }
        let worker = self.worker_for(delivery.id());
        if self.workers[worker].send(delivery.clone()).is_err() {
            // Worker gone: the connection is shutting down.
            delivery.unschedule();
        }
    }
}

async fn run_worker<F>(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Arc<Delivery>>,
    cancel: CancellationToken,
    on_exhausted: Arc<F>,
) where
    F: Fn(u64) + Send + Sync + 'static,
{
    debug!("Delivery worker {index} started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => drain(&delivery, &cancel, on_exhausted.as_ref()).await,
                None => break,
            },
        }
    }
    debug!("Delivery worker {index} stopped");
}

async fn drain<F>(delivery: &Arc<Delivery>, cancel: &CancellationToken, on_exhausted: &F)
where
    F: Fn(u64),
{
    loop {
        if cancel.is_cancelled() {
            delivery.unschedule();
            return;
        }

        // Handler detached (ordered consumer stopped consuming): leave messages queued.
        let Some(handler) = delivery.handler() else {
            delivery.unschedule();
            return;
        };

        match delivery.pop() {
            Popped::Message { msg, exhausted } => {
                trace!("Delivering message on {} to handler", msg.subject);
                handler.handle(msg).await;
                if exhausted {
                    on_exhausted(delivery.id());
                }
            }
            Popped::Empty | Popped::Invalid(_) => {
                delivery.unschedule();
                // A message may have landed between the pop and the release.
                if delivery.has_pending() && delivery.try_schedule() {
                    continue;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::{message::Message, subscription::MessageHandler};

    fn recording_delivery(id: u64, seen: Arc<Mutex<Vec<String>>>) -> Arc<Delivery> {
        let handler = move |msg: Message| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&msg.payload).into_owned());
            }
        };
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        Arc::new(Delivery::new(id, 100, 1 << 20, Some(handler)))
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_assignment_is_stable_and_in_range() {
        let cancel = CancellationToken::new();
        let (dispatcher, _) = DeliveryDispatcher::start(4, cancel.clone(), |_| {});
        for id in 0..100 {
            let worker = dispatcher.worker_for(id);
            assert!(worker < 4);
            assert_eq!(worker, dispatcher.worker_for(id));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_push_delivery_is_fifo() {
        let cancel = CancellationToken::new();
        let (dispatcher, _) = DeliveryDispatcher::start(2, cancel.clone(), |_| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let delivery = recording_delivery(7, seen.clone());

        for i in 0..50 {
            delivery.push(Message::new("a", format!("{i}")));
            dispatcher.schedule(&delivery);
        }

        wait_for(&seen, 50).await;
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_handler_does_not_block_other_workers() {
        let cancel = CancellationToken::new();
        let (dispatcher, _) = DeliveryDispatcher::start(2, cancel.clone(), |_| {});

        // Find two ids living on different workers.
        let slow_id = 1;
        let fast_id = (2..100)
            .find(|id| dispatcher.worker_for(*id) != dispatcher.worker_for(slow_id))
            .unwrap();

        let gate = Arc::new(tokio::sync::Notify::new());
        let slow_gate = gate.clone();
        let slow_handler = move |_msg: Message| {
            let gate = slow_gate.clone();
            async move { gate.notified().await }
        };
        let slow_handler: Arc<dyn MessageHandler> = Arc::new(slow_handler);
        let slow = Arc::new(Delivery::new(slow_id, 10, 1024, Some(slow_handler)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let fast = recording_delivery(fast_id, seen.clone());

        slow.push(Message::new("slow", "x"));
        dispatcher.schedule(&slow);
        fast.push(Message::new("fast", "y"));
        dispatcher.schedule(&fast);

        wait_for(&seen, 1).await;
        assert_eq!(*seen.lock().unwrap(), vec!["y".to_string()]);

        gate.notify_one();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_exhausted_callback_fires() {
        let cancel = CancellationToken::new();
        let exhausted = Arc::new(Mutex::new(Vec::new()));
        let sink = exhausted.clone();
        let (dispatcher, _) =
            DeliveryDispatcher::start(1, cancel.clone(), move |id| sink.lock().unwrap().push(id));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let delivery = recording_delivery(3, seen.clone());
        delivery.set_max_delivered(2);
        for i in 0..3 {
            delivery.push(Message::new("a", format!("{i}")));
        }
        dispatcher.schedule(&delivery);

        wait_for(&seen, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(*exhausted.lock().unwrap(), vec![3]);
        cancel.cancel();
    }
}
