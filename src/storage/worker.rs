//! Background worker: cache purging and page flushing off the hot path.
//!
//! One thread drains an MPSC queue in FIFO order. Blocking messages carry
//! a rendezvous channel on which the producer waits for completion.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::PageRef;
use crate::storage::pager::PageManager;
use crate::types::Lsn;

/// Work items handled by the background thread.
pub enum Message {
    /// Evict cold pages if the cache is over its limit
    PurgeCache,
    /// Write the given dirty pages, stamping them with `lsn`
    FlushPages { pages: Vec<PageRef>, lsn: Lsn },
    /// Drop any state the worker still holds for a closing database
    ReleasePointers { pages: Vec<PageRef> },
    /// Stop the worker thread
    Stop,
}

struct Envelope {
    message: Message,
    /// Present on blocking sends; the worker reports completion here.
    done: Option<Sender<Result<()>>>,
}

/// Handle to the background worker thread.
pub struct Worker {
    tx: Sender<Envelope>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker against a shared page manager.
    pub fn spawn(page_manager: Arc<PageManager>) -> Self {
        let (tx, rx) = unbounded::<Envelope>();
        let handle = std::thread::Builder::new()
            .name("burrow-flusher".into())
            .spawn(move || run(rx, page_manager))
            .expect("failed to spawn worker thread");
        Worker {
            tx,
            handle: Some(handle),
        }
    }

    /// Enqueue without waiting.
    pub fn post(&self, message: Message) {
        let _ = self.tx.send(Envelope {
            message,
            done: None,
        });
    }

    /// Enqueue and wait until the worker has processed the message.
    pub fn post_blocking(&self, message: Message) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.tx
            .send(Envelope {
                message,
                done: Some(done_tx),
            })
            .map_err(|_| Error::with_message(ErrorCode::InternalError, "worker is gone"))?;
        done_rx
            .recv()
            .map_err(|_| Error::with_message(ErrorCode::InternalError, "worker died"))?
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.post_blocking(Message::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: Receiver<Envelope>, page_manager: Arc<PageManager>) {
    while let Ok(envelope) = rx.recv() {
        let stop = matches!(envelope.message, Message::Stop);
        let result = handle(envelope.message, &page_manager);
        if let Err(err) = &result {
            log::warn!("background worker: {}", err);
        }
        if let Some(done) = envelope.done {
            let _ = done.send(result);
        }
        if stop {
            break;
        }
    }
}

fn handle(message: Message, page_manager: &PageManager) -> Result<()> {
    match message {
        Message::PurgeCache => {
            page_manager.purge()?;
            Ok(())
        }
        Message::FlushPages { pages, lsn } => {
            for page in &pages {
                page_manager.flush_page(page, lsn)?;
            }
            Ok(())
        }
        Message::ReleasePointers { pages } => {
            drop(pages);
            Ok(())
        }
        Message::Stop => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{Device, InMemoryDevice};
    use crate::storage::changeset::Context;
    use crate::storage::page::PageType;
    use crate::storage::pager::{AllocFlags, PagerConfig};
    use parking_lot::Mutex;

    fn manager() -> Arc<PageManager> {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(dev)));
        Arc::new(PageManager::new(
            PagerConfig {
                page_size: 1024,
                cache_capacity: 4,
                cache_unlimited: false,
                crc_enabled: false,
            },
            device,
        ))
    }

    #[test]
    fn test_blocking_flush() {
        let pm = manager();
        let worker = Worker::spawn(pm.clone());

        let mut ctx = Context::new(None);
        let page = pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
        page.lock().payload_mut()[0] = 0xAB;

        worker
            .post_blocking(Message::FlushPages {
                pages: vec![page.clone()],
                lsn: 7,
            })
            .unwrap();

        assert!(!page.lock().is_dirty());
        assert_eq!(page.lock().lsn(), 7);
    }

    #[test]
    fn test_purge_message() {
        let pm = manager();
        let worker = Worker::spawn(pm.clone());
        let mut ctx = Context::new(None);
        for _ in 0..40 {
            pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
        }
        ctx.changeset.clear();
        worker.post_blocking(Message::PurgeCache).unwrap();
        let (resident, _, _) = pm.cache_stats();
        assert!(resident < 40);
    }
}
