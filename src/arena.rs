//! Bounded pool of reusable chart memory.
//!
//! A [`ChartArena`] owns a fixed number of float slots and index slots. A chart leases one
//! slot for its whole lifetime and hands it back when dropped. Leasing never blocks and never
//! shares memory: when every slot is taken, or when the chart is larger than the arena was
//! configured for, the lease fails immediately.
//!
//! The arena is an explicit value, not a process-wide singleton. It is `Sync`, so charts for
//! different sentences can be leased and filled from different threads.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use crate::eisner::EisnerChart;
use crate::error::{Error, Result};
use crate::hard::HardChart;

/// Capacity settings for a [`ChartArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Largest chart size (sentence length, root included) a slot may serve.
    pub max_size: usize,
    /// Number of float slots (one per forward or backward chart).
    pub float_slots: usize,
    /// Number of index slots (one per backpointer/subgradient table).
    pub index_slots: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        // 100 tokens plus the root.
        Self {
            max_size: 101,
            float_slots: 16,
            index_slots: 16,
        }
    }
}

/// Free list of equally-sized buffers; `None` marks a leased slot.
#[derive(Debug)]
struct Pool<T> {
    name: &'static str,
    slots: Mutex<Vec<Option<Vec<T>>>>,
}

impl<T: Copy + Default> Pool<T> {
    fn new(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            slots: Mutex::new((0..slots).map(|_| Some(Vec::new())).collect()),
        }
    }

    fn acquire(&self, cells: usize, capacity: usize) -> Result<Lease<'_, T>> {
        if cells > capacity {
            log::warn!(
                "{} lease of {} cells exceeds the slot capacity {}",
                self.name,
                cells,
                capacity
            );
            return Err(Error::LeaseTooLarge { cells, capacity });
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let total = slots.len();
        let Some((index, mut buffer)) = slots
            .iter_mut()
            .enumerate()
            .find_map(|(index, slot)| slot.take().map(|buffer| (index, buffer)))
        else {
            log::warn!("{} pool exhausted ({} slots)", self.name, total);
            return Err(Error::ArenaExhausted {
                pool: self.name,
                slots: total,
            });
        };
        // Slots grow lazily and keep their allocation across leases.
        buffer.clear();
        buffer.resize(cells, T::default());
        log::debug!("leased {} slot {} ({} cells)", self.name, index, cells);
        Ok(Lease {
            pool: self,
            index,
            buffer,
        })
    }

    fn release(&self, index: usize, buffer: Vec<T>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("released {} slot {}", self.name, index);
        slots[index] = Some(buffer);
    }

    fn available(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Exclusive, zero-filled buffer leased from a [`ChartArena`].
///
/// Dereferences to a slice; the slot is returned to the arena on drop.
#[derive(Debug)]
pub struct Lease<'a, T: Copy + Default> {
    pool: &'a Pool<T>,
    index: usize,
    buffer: Vec<T>,
}

impl<T: Copy + Default> Lease<'_, T> {
    /// Slot number inside its pool.
    pub fn slot(&self) -> usize {
        self.index
    }
}

impl<T: Copy + Default> Deref for Lease<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.buffer
    }
}

impl<T: Copy + Default> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.buffer
    }
}

impl<T: Copy + Default> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        self.pool.release(self.index, std::mem::take(&mut self.buffer));
    }
}

/// Bounded pool of float and index buffers shared by many charts.
#[derive(Debug)]
pub struct ChartArena {
    config: ArenaConfig,
    floats: Pool<f64>,
    indices: Pool<usize>,
}

impl Default for ChartArena {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}

impl ChartArena {
    /// Build an arena; slot memory is allocated on first use.
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            floats: Pool::new("float", config.float_slots),
            indices: Pool::new("index", config.index_slots),
        }
    }

    /// The capacity settings this arena was built with.
    pub fn config(&self) -> ArenaConfig {
        self.config
    }

    /// Lease a float buffer of `cells` cells for a chart of size `size`.
    ///
    /// `cells` may not exceed [`ChartArena::float_capacity`] of `size`.
    pub fn lease_floats(&self, size: usize, cells: usize) -> Result<Lease<'_, f64>> {
        self.check_size(size)?;
        self.floats.acquire(cells, Self::float_capacity(size))
    }

    /// Lease an index buffer of `cells` cells for a chart of size `size`.
    ///
    /// `cells` may not exceed [`ChartArena::index_capacity`] of `size`.
    pub fn lease_indices(&self, size: usize, cells: usize) -> Result<Lease<'_, usize>> {
        self.check_size(size)?;
        self.indices.acquire(cells, Self::index_capacity(size))
    }

    /// Most float cells a chart of size `size` can ask for (an Eisner chart).
    pub fn float_capacity(size: usize) -> usize {
        EisnerChart::required_cells(size)
    }

    /// Most index cells a chart of size `size` can ask for (four Eisner signs).
    pub fn index_capacity(size: usize) -> usize {
        HardChart::required_cells(size, 4)
    }

    /// Number of float slots not currently leased.
    pub fn free_float_slots(&self) -> usize {
        self.floats.available()
    }

    /// Number of index slots not currently leased.
    pub fn free_index_slots(&self) -> usize {
        self.indices.available()
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::EmptyChart);
        }
        if size > self.config.max_size {
            log::warn!(
                "chart of size {} requested from an arena capped at {}",
                size,
                self.config.max_size
            );
            return Err(Error::ChartTooLarge {
                size,
                max_size: self.config.max_size,
            });
        }
        Ok(())
    }
}
