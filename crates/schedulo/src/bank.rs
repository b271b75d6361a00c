use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::event::EventRecord;
use crate::shard::Shard;
use crate::Error;

/// Fallback hard bound for a shard when the config leaves it unset.
pub const DEFAULT_MAX_SHARD_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankConfig {
    pub shards: usize,
    pub default_shard_capacity: usize,
    pub max_shard_capacity: usize,
}

/// ShardBank owns the time-ordered shards and spreads insertions across them
/// round-robin: the target shard is `insertions mod N`, independent of event
/// timing, so occupancy stays within one element of uniform.
#[derive(Debug)]
pub struct ShardBank {
    shards: RwLock<Vec<Arc<Mutex<Shard>>>>,
    insertions: AtomicU64,
    config: Mutex<BankConfig>,
}

impl ShardBank {
    pub fn new(mut config: BankConfig) -> Self {
        if config.max_shard_capacity == 0 {
            config.max_shard_capacity = DEFAULT_MAX_SHARD_CAPACITY;
        }

        let shards = (0..config.shards)
            .map(|_| {
                Arc::new(Mutex::new(Shard::new(
                    config.default_shard_capacity,
                    config.max_shard_capacity,
                )))
            })
            .collect();

        Self {
            shards: RwLock::new(shards),
            insertions: AtomicU64::new(0),
            config: Mutex::new(config),
        }
    }

    pub fn push(&self, record: EventRecord) -> Result<(), Error> {
        let shards = self.shards.read().unwrap();
        let i = self.insertions.load(Ordering::Relaxed) as usize % shards.len();

        shards[i]
            .lock()
            .unwrap()
            .push(record)
            .map_err(|_| Error::ShardCapacityExceeded)?;

        self.insertions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn shard(&self, i: usize) -> Option<Arc<Mutex<Shard>>> {
        self.shards.read().unwrap().get(i).cloned()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().unwrap().len()
    }

    /// Total records pending across all shards.
    pub fn len(&self) -> usize {
        let shards = self.shards.read().unwrap();
        shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a new configuration: grow or shrink the shard population, and
    /// raise per-shard capacity bounds when the new maximum is larger.
    pub fn set_config(&self, mut new: BankConfig) -> Result<(), Error> {
        if new.max_shard_capacity == 0 {
            new.max_shard_capacity = DEFAULT_MAX_SHARD_CAPACITY;
        }

        self.resize(new)?;

        let mut config = self.config.lock().unwrap();
        if new.max_shard_capacity > config.max_shard_capacity {
            for shard in self.shards.read().unwrap().iter() {
                shard.lock().unwrap().set_max_capacity(new.max_shard_capacity);
            }
        }
        *config = new;
        Ok(())
    }

    fn resize(&self, new: BankConfig) -> Result<(), Error> {
        let old_count = self.shard_count();

        if new.shards == old_count {
            return Ok(());
        }

        if new.shards > old_count {
            let mut shards = self.shards.write().unwrap();
            for _ in 0..new.shards - old_count {
                shards.push(Arc::new(Mutex::new(Shard::new(
                    new.default_shard_capacity,
                    new.max_shard_capacity,
                ))));
            }
            return Ok(());
        }

        // Shrinking: the survivors must be able to absorb every pending
        // record before the first `old - new` shards are spliced away.
        if new.max_shard_capacity * new.shards < self.len() {
            return Err(Error::ShardCapacityExceeded);
        }

        let removed: Vec<Arc<Mutex<Shard>>> = {
            let mut shards = self.shards.write().unwrap();
            shards.drain(..old_count - new.shards).collect()
        };

        for shard in removed {
            for record in shard.lock().unwrap().drain() {
                self.push(record)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Mode;
    use chrono::{Duration, Utc};

    fn record(i: usize) -> EventRecord {
        EventRecord {
            id: format!("ev-{i}"),
            cron_expression: String::new(),
            should_execute_at: Utc::now() + Duration::seconds(i as i64 + 1),
            mode: Mode::Timestamp,
        }
    }

    fn config(shards: usize, default_cap: usize, max_cap: usize) -> BankConfig {
        BankConfig {
            shards,
            default_shard_capacity: default_cap,
            max_shard_capacity: max_cap,
        }
    }

    #[test]
    fn round_robin_spread_is_within_one() {
        let bank = ShardBank::new(config(5, 10, 20));
        for i in 0..23 {
            bank.push(record(i)).unwrap();
        }

        let occupancies: Vec<usize> = (0..5)
            .map(|i| bank.shard(i).unwrap().lock().unwrap().len())
            .collect();
        let max = occupancies.iter().max().unwrap();
        let min = occupancies.iter().min().unwrap();
        assert!(max - min <= 1, "occupancies: {occupancies:?}");
        assert_eq!(bank.len(), 23);
    }

    #[test]
    fn zero_max_capacity_defaults() {
        let bank = ShardBank::new(config(1, 10, 0));
        let shard = bank.shard(0).unwrap();
        assert_eq!(shard.lock().unwrap().max_capacity(), DEFAULT_MAX_SHARD_CAPACITY);
    }

    #[test]
    fn growing_appends_empty_shards() {
        let bank = ShardBank::new(config(2, 10, 20));
        for i in 0..8 {
            bank.push(record(i)).unwrap();
        }

        bank.set_config(config(4, 10, 20)).unwrap();
        assert_eq!(bank.shard_count(), 4);
        assert_eq!(bank.len(), 8);
        assert_eq!(bank.shard(3).unwrap().lock().unwrap().len(), 0);
    }

    #[test]
    fn shrinking_repushes_into_survivors() {
        let bank = ShardBank::new(config(4, 10, 20));
        for i in 0..12 {
            bank.push(record(i)).unwrap();
        }

        bank.set_config(config(2, 10, 20)).unwrap();
        assert_eq!(bank.shard_count(), 2);
        assert_eq!(bank.len(), 12);
    }

    #[test]
    fn shrinking_below_occupancy_fails() {
        let bank = ShardBank::new(config(4, 2, 4));
        for i in 0..13 {
            bank.push(record(i)).unwrap();
        }

        // 13 pending records cannot fit in 3 shards of max capacity 4.
        assert!(matches!(
            bank.set_config(config(3, 2, 4)),
            Err(Error::ShardCapacityExceeded)
        ));
    }

    #[test]
    fn bank_full_surfaces_capacity_error() {
        let bank = ShardBank::new(config(2, 2, 3));
        for i in 0..6 {
            bank.push(record(i)).unwrap();
        }
        assert!(matches!(
            bank.push(record(6)),
            Err(Error::ShardCapacityExceeded)
        ));
    }
}
