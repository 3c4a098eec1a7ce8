use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::store::SharedQueue;

/// Provides a bounded [SharedQueue] which lives in the memory of the current process.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use datastore::store::{LocalQueue, SharedQueue};
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let queue = LocalQueue::new(1);
/// assert_eq!(queue.offer(1).await?, true);
///
/// // The queue is full...
/// assert_eq!(queue.offer(2).await?, false);
///
/// assert_eq!(queue.poll(Duration::from_millis(10)).await?, Some(1));
/// assert_eq!(queue.poll(Duration::from_millis(10)).await?, None);
/// # Ok(())
/// # }
/// ```
pub struct LocalQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> LocalQueue<T> {
    /// Creates a new queue which accepts up to **capacity** items.
    pub fn new(capacity: usize) -> Self {
        LocalQueue {
            capacity,
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl<T> SharedQueue<T> for LocalQueue<T>
where
    T: Send + 'static,
{
    async fn poll(&self, timeout: Duration) -> anyhow::Result<Option<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for a wakeup before checking the queue, so that an item which is offered
            // in between isn't missed...
            let notified = self.available.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if let Some(item) = self.pop() {
                return Ok(Some(item));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop());
            }
        }
    }

    async fn offer(&self, item: T) -> anyhow::Result<bool> {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                return Ok(false);
            }
            items.push_back(item);
        }

        self.available.notify_one();
        Ok(true)
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.items.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::store::{LocalQueue, SharedQueue};
    use crate::testing::test_async;

    #[test]
    fn items_are_polled_in_fifo_order() {
        test_async(async {
            let queue = LocalQueue::new(10);
            for item in 1..=3 {
                assert_eq!(queue.offer(item).await.unwrap(), true);
            }
            assert_eq!(queue.len().await.unwrap(), 3);

            assert_eq!(queue.poll(Duration::from_millis(1)).await.unwrap(), Some(1));
            assert_eq!(queue.poll(Duration::from_millis(1)).await.unwrap(), Some(2));
            assert_eq!(queue.poll(Duration::from_millis(1)).await.unwrap(), Some(3));
            assert_eq!(queue.poll(Duration::from_millis(1)).await.unwrap(), None);
        });
    }

    #[test]
    fn a_waiting_poll_is_woken_by_an_offer() {
        test_async(async {
            let queue = Arc::new(LocalQueue::new(10));
            let producer = queue.clone();
            let _ = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = producer.offer("late").await;
            });

            assert_eq!(
                queue.poll(Duration::from_secs(10)).await.unwrap(),
                Some("late")
            );
        });
    }
}
