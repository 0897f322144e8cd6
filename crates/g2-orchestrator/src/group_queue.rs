//! Per-JID FIFO execution queue with bounded global concurrency (§4.4/§4.4.1).
//!
//! Each JID gets its own worker task draining a dedicated `mpsc` channel strictly
//! FIFO; cross-JID concurrency is bounded by a shared semaphore so idle JIDs hold
//! no permit. The queue also owns bookkeeping for the live container (if any)
//! backing a JID, so the message pipeline can pipe follow-up input into it.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use g2_container::ContainerHandle;
use g2_core::domain::Jid;
use tokio::sync::{mpsc, Mutex, Semaphore};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One unit of work for a JID's worker. Takes the owning queue (so it can
/// register/unregister its live process handle) and the JID it's running for.
pub type WorkFn = Box<dyn FnOnce(Arc<GroupQueue>, Jid) -> BoxFuture<()> + Send>;

struct JidWorker {
    tx: mpsc::UnboundedSender<WorkFn>,
    process: Mutex<Option<Arc<ContainerHandle>>>,
    task: tokio::task::JoinHandle<()>,
}

pub struct GroupQueue {
    workers: Mutex<HashMap<Jid, Arc<JidWorker>>>,
    semaphore: Arc<Semaphore>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    /// Enqueue a work item for `jid`, creating its worker task if this is the
    /// first item ever seen for it.
    pub async fn enqueue(self: &Arc<Self>, jid: Jid, work: WorkFn) {
        let worker = self.worker_for(jid).await;
        let _ = worker.tx.send(work);
    }

    async fn worker_for(self: &Arc<Self>, jid: Jid) -> Arc<JidWorker> {
        let mut workers = self.workers.lock().await;
        if let Some(w) = workers.get(&jid) {
            return w.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkFn>();
        let queue = self.clone();
        let jid_for_task = jid.clone();
        let task = tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                let permit = queue.semaphore.clone().acquire_owned().await;
                work(queue.clone(), jid_for_task.clone()).await;
                drop(permit);
            }
        });

        let worker = Arc::new(JidWorker {
            tx,
            process: Mutex::new(None),
            task,
        });
        workers.insert(jid, worker.clone());
        worker
    }

    /// Record the live container backing `jid`, enabling the pipe path.
    pub async fn register_process(&self, jid: &Jid, handle: Arc<ContainerHandle>) {
        let workers = self.workers.lock().await;
        if let Some(worker) = workers.get(jid) {
            *worker.process.lock().await = Some(handle);
        }
    }

    pub async fn unregister_process(&self, jid: &Jid) {
        let workers = self.workers.lock().await;
        if let Some(worker) = workers.get(jid) {
            worker.process.lock().await.take();
        }
    }

    /// Write `text` to the already-running container for `jid`, if any. Returns
    /// `true` if there was a live process to pipe into.
    pub async fn send_message(&self, jid: &Jid, text: &str) -> bool {
        let handle = {
            let workers = self.workers.lock().await;
            let Some(worker) = workers.get(jid) else {
                return false;
            };
            worker.process.lock().await.clone()
        };
        match handle {
            Some(h) => {
                let _ = h.write_line(text).await;
                true
            }
            None => false,
        }
    }

    /// Close stdin on the live container for `jid`, if any (idle-timeout path).
    pub async fn close_stdin(&self, jid: &Jid) {
        let handle = {
            let workers = self.workers.lock().await;
            let Some(worker) = workers.get(jid) else {
                return;
            };
            worker.process.lock().await.clone()
        };
        if let Some(h) = handle {
            h.close_stdin().await;
        }
    }

    pub async fn is_running(&self, jid: &Jid) -> bool {
        let workers = self.workers.lock().await;
        let Some(worker) = workers.get(jid) else {
            return false;
        };
        worker.process.lock().await.is_some()
    }

    /// Close every live stdin, then wait up to `timeout` for running work to
    /// finish before aborting remaining worker tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };

        for worker in workers.values() {
            if let Some(handle) = worker.process.lock().await.as_ref() {
                handle.close_stdin().await;
            }
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        for worker in workers.values() {
            tokio::select! {
                _ = &mut deadline => break,
                _ = async { while !worker.task.is_finished() { tokio::time::sleep(Duration::from_millis(50)).await; } } => {}
            }
        }
        for worker in workers.values() {
            worker.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn work_items_for_one_jid_run_strictly_in_order() {
        let queue = GroupQueue::new(4);
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let jid = Jid("a@x".to_string());

        for i in 0..5u32 {
            let order = order.clone();
            queue
                .enqueue(
                    jid.clone(),
                    Box::new(move |_queue, _jid| {
                        Box::pin(async move {
                            order.lock().await.push(i);
                        })
                    }),
                )
                .await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cross_jid_work_runs_concurrently_up_to_the_limit() {
        let queue = GroupQueue::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            queue
                .enqueue(
                    Jid(format!("{i}@x")),
                    Box::new(move |_queue, _jid| {
                        Box::pin(async move {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                        })
                    }),
                )
                .await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn send_message_returns_false_without_a_registered_process() {
        let queue = GroupQueue::new(1);
        let jid = Jid("a@x".to_string());
        queue
            .enqueue(jid.clone(), Box::new(|_q, _j| Box::pin(async {})))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queue.send_message(&jid, "hi").await);
    }
}
