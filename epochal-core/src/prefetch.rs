//! Background batch prefetching over a single-producer/single-consumer channel.
//!
//! A [`Prefetcher`] owns a data supply between epochs. `start_epoch` moves the
//! supply onto a worker thread that fills a bounded channel while the
//! scheduler consumes from the other end; when the epoch is drained the
//! worker hands the supply back through its join handle.

use crate::collaborators::{Batch, DataSupply};
use crate::error::DataError;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

type Item<I, T> = Result<Batch<I, T>, DataError>;

pub struct Prefetcher<S, I, T> {
    idle: Option<S>,
    worker: Option<JoinHandle<S>>,
    rx: Option<Receiver<Item<I, T>>>,
    depth: usize,
    batches_per_epoch: usize,
}

impl<S, I, T> Prefetcher<S, I, T>
where
    S: DataSupply<I, T> + Send + 'static,
    I: Send + 'static,
    T: Send + 'static,
{
    /// Wrap `supply`, buffering up to `depth` batches ahead of the consumer.
    pub fn new(supply: S, depth: usize) -> Self {
        let batches_per_epoch = supply.batches_per_epoch();
        Self {
            idle: Some(supply),
            worker: None,
            rx: None,
            depth: depth.max(1),
            batches_per_epoch,
        }
    }

    /// Wait for an in-flight epoch to finish and take the supply back.
    fn reclaim(&mut self) -> Result<(), DataError> {
        // Dropping the receiver unblocks a producer stuck on a full channel.
        self.rx = None;
        if let Some(handle) = self.worker.take() {
            let supply = handle
                .join()
                .map_err(|_| DataError::failed("prefetch worker panicked"))?;
            self.idle = Some(supply);
        }
        Ok(())
    }

    /// Stop any in-flight epoch and return the wrapped supply.
    pub fn into_inner(mut self) -> Result<S, DataError> {
        self.reclaim()?;
        self.idle
            .take()
            .ok_or_else(|| DataError::failed("data supply lost by prefetch worker"))
    }
}

fn produce<S, I, T>(mut supply: S, epoch: usize, tx: SyncSender<Item<I, T>>) -> S
where
    S: DataSupply<I, T>,
{
    if let Err(e) = supply.start_epoch(epoch) {
        let _ = tx.send(Err(e));
        return supply;
    }
    while let Some(item) = supply.next_batch() {
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            break;
        }
    }
    supply
}

impl<S, I, T> DataSupply<I, T> for Prefetcher<S, I, T>
where
    S: DataSupply<I, T> + Send + 'static,
    I: Send + 'static,
    T: Send + 'static,
{
    fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<(), DataError> {
        self.reclaim()?;
        let supply = self
            .idle
            .take()
            .ok_or_else(|| DataError::failed("data supply lost by prefetch worker"))?;
        let (tx, rx) = sync_channel(self.depth);
        let handle = std::thread::Builder::new()
            .name(format!("prefetch-epoch-{epoch}"))
            .spawn(move || produce(supply, epoch, tx))
            .map_err(|e| DataError::failed(format!("failed to spawn prefetch worker: {e}")))?;
        self.worker = Some(handle);
        self.rx = Some(rx);
        tracing::debug!(epoch, depth = self.depth, "Prefetch worker started");
        Ok(())
    }

    fn next_batch(&mut self) -> Option<Result<Batch<I, T>, DataError>> {
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                // Producer finished the epoch; take the supply back.
                if let Err(e) = self.reclaim() {
                    return Some(Err(e));
                }
                None
            }
        }
    }
}

impl<S, I, T> Drop for Prefetcher<S, I, T> {
    fn drop(&mut self) {
        self.rx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::InMemorySupply;

    fn supply(n: usize) -> InMemorySupply<usize, usize> {
        InMemorySupply::new((0..n).map(|i| Batch::new(i, i * 10)).collect())
    }

    fn drain<D: DataSupply<usize, usize>>(d: &mut D) -> Vec<usize> {
        let mut seen = Vec::new();
        while let Some(batch) = d.next_batch() {
            seen.push(batch.unwrap().inputs);
        }
        seen
    }

    #[test]
    fn test_prefetch_preserves_order_across_epochs() {
        let mut pf: Prefetcher<_, usize, usize> = Prefetcher::new(supply(5), 2);
        assert_eq!(pf.batches_per_epoch(), 5);
        for epoch in 0..3 {
            pf.start_epoch(epoch).unwrap();
            assert_eq!(drain(&mut pf), vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_restart_mid_epoch() {
        let mut pf: Prefetcher<_, usize, usize> = Prefetcher::new(supply(6), 1);
        pf.start_epoch(0).unwrap();
        assert_eq!(pf.next_batch().unwrap().unwrap().inputs, 0);
        pf.start_epoch(1).unwrap();
        assert_eq!(drain(&mut pf).len(), 6);
        assert_eq!(pf.into_inner().unwrap().batches_per_epoch(), 6);
    }

    #[test]
    fn test_next_before_start_is_none() {
        let mut pf: Prefetcher<_, usize, usize> = Prefetcher::new(supply(2), 1);
        assert!(pf.next_batch().is_none());
    }
}
