use serde::{Deserialize, Serialize};

/// One ranked key in a top-N list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEntry {
    /// Feature id or model name
    pub key: String,
    /// Requests attributed to the key
    pub requests: u64,
    /// Cumulative cost attributed to the key
    pub cost: f64,
}

#[derive(Debug, Clone)]
struct Ranked {
    entry: TopEntry,
    first_seen: u64,
}

/// Bounded list of the busiest keys
///
/// After every upsert the list is re-sorted by request count descending,
/// ties going to the key seen first, then truncated to capacity. A key
/// that falls off the list loses its counts.
#[derive(Debug, Clone)]
pub struct TopN {
    capacity: usize,
    entries: Vec<Ranked>,
    seq: u64,
}

impl TopN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
            seq: 0,
        }
    }

    /// Count one request and its cost against `key`
    pub fn record(&mut self, key: &str, cost: f64) {
        match self.entries.iter_mut().find(|r| r.entry.key == key) {
            Some(ranked) => {
                ranked.entry.requests += 1;
                ranked.entry.cost += cost;
            }
            None => {
                self.entries.push(Ranked {
                    entry: TopEntry {
                        key: key.to_string(),
                        requests: 1,
                        cost,
                    },
                    first_seen: self.seq,
                });
                self.seq += 1;
            }
        }

        self.entries.sort_by(|a, b| {
            b.entry
                .requests
                .cmp(&a.entry.requests)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in rank order
    pub fn entries(&self) -> Vec<TopEntry> {
        self.entries.iter().map(|r| r.entry.clone()).collect()
    }

    /// Combine per-window lists, oldest window first, into one ranking
    ///
    /// Counts are summed per key; keys that fell off a window's list are
    /// not recoverable, so the result is a lower bound for each key.
    pub fn merge<'a>(lists: impl IntoIterator<Item = &'a [TopEntry]>, capacity: usize) -> Vec<TopEntry> {
        let mut merged = TopN::new(capacity);
        for list in lists {
            for entry in list {
                match merged.entries.iter_mut().find(|r| r.entry.key == entry.key) {
                    Some(ranked) => {
                        ranked.entry.requests += entry.requests;
                        ranked.entry.cost += entry.cost;
                    }
                    None => {
                        merged.entries.push(Ranked {
                            entry: entry.clone(),
                            first_seen: merged.seq,
                        });
                        merged.seq += 1;
                    }
                }
            }
        }
        merged.entries.sort_by(|a, b| {
            b.entry
                .requests
                .cmp(&a.entry.requests)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        merged.entries.truncate(capacity);
        merged.entries()
    }
}
