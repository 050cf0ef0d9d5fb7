/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use log::trace;

use super::protocol::{Dialect, ScanTarget};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub address: IpAddr,
    pub port: u16,
    pub dialect: Dialect,
}

impl CacheKey {
    pub fn new(address: IpAddr, target: &ScanTarget) -> Self {
        Self { address, port: target.port, dialect: target.dialect }
    }
}

/// Targets recently verified as not being a relay. Bounded; the oldest
/// entry makes room for a new one.
#[derive(Debug)]
pub struct CleanCache {
    entries: HashMap<CacheKey, Instant>,
    capacity: usize,
    expiry: Duration,
}

impl CleanCache {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        Self { entries: HashMap::new(), capacity, expiry }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_fresh(&self, inserted: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted) < self.expiry
    }

    /// `true` if `key` was verified clean less than `expiry` ago.
    pub fn contains(&self, key: &CacheKey, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|t| self.is_fresh(*t, now))
    }

    pub fn insert(&mut self, key: CacheKey, now: Instant) {
        if self.capacity == 0 {
            return
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.expire(now);
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.iter().min_by_key(|(_, t)| **t).map(|(k, _)| *k) {
                trace!(target: "probe::cache", "evicting {:?}", oldest);
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(key, now);
    }

    /// Drop every expired entry.
    pub fn expire(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.entries.retain(|_, t| now.saturating_duration_since(*t) < expiry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
