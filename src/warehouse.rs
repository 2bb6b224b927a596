//! Producer-centric output buffer with just-in-time cloning.
//!
//! A block's outputs are committed once and then handed to each of its
//! consumers exactly once. Every consumer except the last receives deep
//! clones; the last one receives the committed items themselves and the
//! warehouse drops its reference so the memory can be reclaimed.
//!
//! Readers take the snapshot lock in shared mode and decrement the consumer
//! counter while holding it. A reader whose decrement leaves consumers behind
//! clones under that shared lock. The reader that reaches zero upgrades to the
//! exclusive lock to move the snapshot out, which waits for every in-flight
//! clone to finish first.

use crate::{
    block::WorkItem,
    sync::{AtomicUsize, Ordering, RwLock},
    types::Outputs,
};
use core::fmt;
use thiserror::Error;

/// Contract violations on a [`Warehouse`]. Any of them is a runtime bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WarehouseError {
    /// `commit` was called on an already sealed warehouse.
    #[error("warehouse is already sealed; cannot commit twice")]
    DoubleCommit,
    /// Inputs were requested before the producer committed.
    #[error("warehouse has not been committed yet")]
    NotCommitted,
    /// More retrievals than the warehouse has consumers.
    #[error("consumer count underflow; more consumers than expected")]
    ConsumerUnderflow,
}

enum Stock<I> {
    Empty,
    Sealed(Outputs<I>),
    Released,
}

/// Committed output of one block for one shipment, shared by its consumers.
pub struct Warehouse<I> {
    stock: RwLock<Stock<I>>,
    consumers: AtomicUsize,
}

impl<I> fmt::Debug for Warehouse<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stock = match &*self.stock.read() {
            Stock::Empty => "empty",
            Stock::Sealed(_) => "sealed",
            Stock::Released => "released",
        };
        f.debug_struct("Warehouse")
            .field("stock", &stock)
            .field("consumers", &self.consumers.load(Ordering::Relaxed))
            .finish()
    }
}

impl<I: WorkItem> Warehouse<I> {
    /// Create an empty warehouse serving `consumer_count` consumers (the
    /// producer's out-degree).
    #[must_use]
    pub fn new(consumer_count: usize) -> Self {
        Self {
            stock: RwLock::new(Stock::Empty),
            consumers: AtomicUsize::new(consumer_count),
        }
    }

    /// Seal the producer's outputs into the warehouse.
    ///
    /// # Errors
    /// [`WarehouseError::DoubleCommit`] if the warehouse was already sealed.
    pub fn commit(&self, outputs: Outputs<I>) -> Result<(), WarehouseError> {
        let mut stock = self.stock.write();
        if !matches!(*stock, Stock::Empty) {
            return Err(WarehouseError::DoubleCommit);
        }
        *stock = Stock::Sealed(outputs);
        Ok(())
    }

    /// Retrieve the committed outputs on behalf of one consumer.
    ///
    /// The last consumer receives the committed items; every earlier
    /// consumer receives deep clones.
    ///
    /// # Errors
    /// - [`WarehouseError::NotCommitted`] before `commit`.
    /// - [`WarehouseError::ConsumerUnderflow`] once every consumer has been
    ///   served.
    pub fn get_inputs(&self) -> Result<Outputs<I>, WarehouseError> {
        {
            let stock = self.stock.read();
            let outputs = match &*stock {
                Stock::Empty => return Err(WarehouseError::NotCommitted),
                Stock::Released => return Err(WarehouseError::ConsumerUnderflow),
                Stock::Sealed(outputs) => outputs,
            };
            if self.take_consumer()? > 0 {
                return Ok(outputs
                    .iter()
                    .map(|(socket, items)| (socket.clone(), items.clone()))
                    .collect());
            }
        }
        // Last consumer: no other reader can get past `take_consumer` now.
        match core::mem::replace(&mut *self.stock.write(), Stock::Released) {
            Stock::Sealed(outputs) => Ok(outputs),
            Stock::Empty | Stock::Released => {
                unreachable!("Warehouse::get_inputs: sealed stock vanished")
            }
        }
    }

    /// Account for a consumer that will never read (it was poisoned or
    /// cancelled). Releases the snapshot when it was the last one.
    ///
    /// # Errors
    /// [`WarehouseError::ConsumerUnderflow`] if no consumer is left.
    pub fn release_consumer(&self) -> Result<(), WarehouseError> {
        let guard = self.stock.read();
        let remaining = self.take_consumer()?;
        drop(guard);
        if remaining == 0 {
            let mut stock = self.stock.write();
            if matches!(*stock, Stock::Sealed(_)) {
                *stock = Stock::Released;
            }
        }
        Ok(())
    }

    /// Consumers that have not been served yet.
    #[must_use]
    pub fn remaining_consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    /// Whether outputs have been committed and not yet handed off to the
    /// last consumer.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(*self.stock.read(), Stock::Sealed(_))
    }

    /// Sum of [`WorkItem::size_mp`] over all stored items; `0.0` once the
    /// snapshot has been released.
    #[must_use]
    pub fn total_size_mp(&self) -> f32 {
        match &*self.stock.read() {
            Stock::Sealed(outputs) => outputs.values().flatten().map(WorkItem::size_mp).sum(),
            Stock::Empty | Stock::Released => 0.0,
        }
    }

    /// Decrement the consumer counter, returning the value after the
    /// decrement.
    fn take_consumer(&self) -> Result<usize, WarehouseError> {
        self.consumers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(1)
            })
            .map(|prev| prev - 1)
            .map_err(|_| WarehouseError::ConsumerUnderflow)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::{Warehouse, WarehouseError};
    use crate::{
        block::WorkItem,
        types::{Outputs, SocketId},
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Tile {
        pixels: Box<[u8]>,
        mp: f32,
    }

    impl WorkItem for Tile {
        fn size_mp(&self) -> f32 {
            self.mp
        }
    }

    fn tiles() -> Outputs<Tile> {
        let mut outputs = Outputs::default();
        outputs.insert(
            SocketId::from("out"),
            vec![
                Tile {
                    pixels: vec![1, 2, 3].into(),
                    mp: 1.5,
                },
                Tile {
                    pixels: vec![4, 5].into(),
                    mp: 0.5,
                },
            ],
        );
        outputs
    }

    fn pixel_ptrs(outputs: &Outputs<Tile>) -> Vec<*const u8> {
        outputs.values().flatten().map(|tile| tile.pixels.as_ptr()).collect()
    }

    #[test]
    fn earlier_consumers_get_clones_and_last_gets_originals() {
        let warehouse = Warehouse::new(3);
        let committed = tiles();
        let originals = pixel_ptrs(&committed);
        warehouse.commit(committed).unwrap();
        assert!((warehouse.total_size_mp() - 2.0).abs() < f32::EPSILON);

        for remaining in [2, 1] {
            let copy = warehouse.get_inputs().unwrap();
            assert_eq!(copy, tiles());
            assert!(pixel_ptrs(&copy)
                .iter()
                .zip(&originals)
                .all(|(copy, original)| copy != original));
            assert_eq!(warehouse.remaining_consumers(), remaining);
        }

        let last = warehouse.get_inputs().unwrap();
        assert_eq!(pixel_ptrs(&last), originals);
        assert_eq!(warehouse.remaining_consumers(), 0);
        assert!(!warehouse.is_sealed());
        assert!(warehouse.total_size_mp().abs() < f32::EPSILON);
        assert_eq!(
            warehouse.get_inputs().unwrap_err(),
            WarehouseError::ConsumerUnderflow
        );
    }

    #[test]
    fn double_commit_is_rejected() {
        let warehouse = Warehouse::new(1);
        warehouse.commit(tiles()).unwrap();
        assert_eq!(warehouse.commit(tiles()), Err(WarehouseError::DoubleCommit));
    }

    #[test]
    fn read_before_commit_is_rejected() {
        let warehouse = Warehouse::<Tile>::new(1);
        assert_eq!(
            warehouse.get_inputs().unwrap_err(),
            WarehouseError::NotCommitted
        );
        assert_eq!(warehouse.remaining_consumers(), 1);
    }

    #[test]
    fn released_consumers_free_the_snapshot() {
        let warehouse = Warehouse::new(2);
        warehouse.commit(tiles()).unwrap();
        warehouse.release_consumer().unwrap();
        assert!(warehouse.is_sealed());
        let last = warehouse.get_inputs().unwrap();
        assert_eq!(last, tiles());

        let warehouse = Warehouse::new(1);
        warehouse.commit(tiles()).unwrap();
        warehouse.release_consumer().unwrap();
        assert!(!warehouse.is_sealed());
        assert_eq!(
            warehouse.release_consumer(),
            Err(WarehouseError::ConsumerUnderflow)
        );
    }

    #[test]
    fn zero_consumers_underflow_immediately() {
        let warehouse = Warehouse::new(0);
        warehouse.commit(tiles()).unwrap();
        assert_eq!(
            warehouse.get_inputs().unwrap_err(),
            WarehouseError::ConsumerUnderflow
        );
        assert!(warehouse.is_sealed());
    }
}
