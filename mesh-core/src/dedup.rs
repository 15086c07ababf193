//! Duplicate suppression ring.

/// Seconds a seen hash suppresses redelivery.
pub const DEDUP_WINDOW_SECS: u32 = 300;

pub const DEFAULT_DEDUP_SLOTS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    hash: u32,
    received_at: u32,
}

/// Fixed ring of recently delivered message hashes.
///
/// Insertion always overwrites the slot at the write cursor, oldest by position, even when that
/// slot still guards a message inside its window.
#[derive(Debug, Clone)]
pub struct RecentMessageCache<const N: usize = DEFAULT_DEDUP_SLOTS> {
    slots: [Option<SeenEntry>; N],
    next: usize,
}

impl<const N: usize> Default for RecentMessageCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RecentMessageCache<N> {
    pub fn new() -> Self {
        Self {
            slots: [None; N],
            next: 0,
        }
    }

    /// Whether `hash` was recorded less than the dedup window before `now`.
    pub fn contains(&self, hash: u32, now: u32) -> bool {
        self.slots.iter().flatten().any(|e| {
            e.hash == hash && now.wrapping_sub(e.received_at) < DEDUP_WINDOW_SECS
        })
    }

    /// Returns true for a duplicate. Otherwise records the hash in the next ring slot.
    pub fn check_and_insert(&mut self, hash: u32, now: u32) -> bool {
        if self.contains(hash, now) {
            return true;
        }
        if N == 0 {
            return false;
        }
        self.slots[self.next] = Some(SeenEntry {
            hash,
            received_at: now,
        });
        self.next = (self.next + 1) % N;
        false
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
        self.next = 0;
    }
}
