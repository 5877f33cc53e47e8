use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch for generated ids: 2020-01-01T00:00:00Z.
const EPOCH_MS: u64 = 1_577_836_800_000;

const SEQUENCE_BITS: u64 = 12;
const NODE_BITS: u64 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

/// Lock-free snowflake-style unique id generator: 41 bits of milliseconds
/// since [`EPOCH_MS`], 10 node bits, 12 sequence bits. A single atomic packs
/// `(ms << 12) | sequence`; sequence exhaustion within one millisecond
/// borrows from the next millisecond.
pub struct UidGenerator {
    node: u64,
    state: AtomicU64,
}

impl UidGenerator {
    pub fn new(node: u64) -> Self {
        Self {
            node: node & NODE_MASK,
            state: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        loop {
            let now = current_millis();
            let observed = self.state.load(Ordering::Acquire);
            let last_ms = observed >> SEQUENCE_BITS;
            let last_seq = observed & SEQUENCE_MASK;

            let (ms, seq) = if now > last_ms {
                (now, 0)
            } else if last_seq < SEQUENCE_MASK {
                (last_ms, last_seq + 1)
            } else {
                (last_ms + 1, 0)
            };

            let packed = (ms << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(observed, packed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (ms << (SEQUENCE_BITS + NODE_BITS)) | (self.node << SEQUENCE_BITS) | seq;
            }
        }
    }
}

fn current_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    since_epoch.saturating_sub(EPOCH_MS)
}

fn node_id() -> u64 {
    if let Ok(raw) = std::env::var("NODE_ID") {
        if let Ok(id) = raw.parse::<u64>() {
            return id & NODE_MASK;
        }
    }
    u64::from(std::process::id()) & NODE_MASK
}

static GENERATOR: OnceLock<UidGenerator> = OnceLock::new();

/// Process-wide unique id, formatted for use as a message key.
pub fn generate() -> String {
    GENERATOR
        .get_or_init(|| UidGenerator::new(node_id()))
        .next_id()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let generator = UidGenerator::new(7);
        let mut previous = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > previous, "ids must be strictly increasing");
            previous = id;
        }
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let generator = Arc::new(UidGenerator::new(3));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let generator = Arc::clone(&generator);
            handles.push(std::thread::spawn(move || {
                (0..5_000).map(|_| generator.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id generated: {id}");
            }
        }
    }

    #[test]
    fn node_bits_are_masked() {
        let generator = UidGenerator::new(u64::MAX);
        let id = generator.next_id();
        let node = (id >> SEQUENCE_BITS) & NODE_MASK;
        assert_eq!(node, NODE_MASK);
    }
}
