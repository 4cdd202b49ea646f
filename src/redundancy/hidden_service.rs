//! Onion address clusters per logical service

use rand::seq::SliceRandom;
use serde::Serialize;

/// Where a logical inbound service can currently be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HiddenServiceCluster {
    pub service: String,
    pub primary: Option<String>,
    pub backups: Vec<String>,
    pub current_active: Option<String>,
    pub failover_count: u64,
    pub last_failover: Option<u64>,
    pub load_balancing: bool,
}

impl HiddenServiceCluster {
    pub fn new(service: impl Into<String>, load_balancing: bool) -> Self {
        Self {
            service: service.into(),
            primary: None,
            backups: Vec::new(),
            current_active: None,
            failover_count: 0,
            last_failover: None,
            load_balancing,
        }
    }

    /// Rebuild from addresses of healthy instances, best instance first
    ///
    /// Returns `(old, new)` when an existing primary was replaced.
    pub fn refresh(
        &mut self,
        addresses: Vec<String>,
        now: u64,
    ) -> Option<(Option<String>, Option<String>)> {
        let mut unique: Vec<String> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !unique.contains(&address) {
                unique.push(address);
            }
        }

        let old = self.primary.take();
        let mut iter = unique.into_iter();
        self.primary = iter.next();
        self.backups = iter.collect();
        self.current_active = self.primary.clone();

        if old.is_some() && old != self.primary {
            self.failover_count += 1;
            self.last_failover = Some(now);
            return Some((old, self.primary.clone()));
        }
        None
    }

    /// Primary followed by backups
    pub fn addresses(&self) -> Vec<String> {
        self.primary
            .iter()
            .chain(self.backups.iter())
            .cloned()
            .collect()
    }

    /// Address to hand out: random across all when load-balancing
    pub fn best_address(&self) -> Option<String> {
        if !self.load_balancing {
            return self.current_active.clone();
        }
        self.addresses().choose(&mut rand::thread_rng()).cloned()
    }
}
