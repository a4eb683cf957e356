use std::collections::{HashMap, HashSet};

/// Busy flag plus the bookings currently holding it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargerBusyEntry {
    pub contributing: HashSet<String>,
    pub busy: bool,
}

/// Per-charger busy state. Pure in-memory; never performs I/O.
#[derive(Debug, Default)]
pub struct BusyStore {
    entries: HashMap<String, ChargerBusyEntry>,
    revision: u64,
}

impl BusyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the charger flipped to busy.
    pub fn mark_contributing(&mut self, charger_id: &str, booking_id: &str) -> bool {
        let entry = self.entries.entry(charger_id.to_string()).or_default();
        if !entry.contributing.insert(booking_id.to_string()) {
            return false;
        }
        if entry.busy {
            return false;
        }
        entry.busy = true;
        self.revision += 1;
        true
    }

    /// Returns true if the charger flipped to free.
    pub fn unmark_contributing(&mut self, charger_id: &str, booking_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(charger_id) else {
            return false;
        };
        if !entry.contributing.remove(booking_id) || !entry.contributing.is_empty() {
            return false;
        }
        self.entries.remove(charger_id);
        self.revision += 1;
        true
    }

    /// Unknown chargers are free.
    pub fn is_busy(&self, charger_id: &str) -> bool {
        self.entries.get(charger_id).is_some_and(|e| e.busy)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entry(&self, charger_id: &str) -> Option<&ChargerBusyEntry> {
        self.entries.get(charger_id)
    }

    pub fn contributors(&self, charger_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .get(charger_id)
            .map(|e| e.contributing.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn busy_chargers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.busy)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop everything. Returns the chargers that were busy; bumps revision once if any.
    pub fn clear(&mut self) -> Vec<String> {
        let was_busy = self.busy_chargers();
        self.entries.clear();
        if !was_busy.is_empty() {
            self.revision += 1;
        }
        was_busy
    }
}
