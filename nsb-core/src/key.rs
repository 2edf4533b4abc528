//! Payload keys for the external store: `{millis}-{client_id}-{counter}`, unique without a central sequencer.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MILLIS_MASK: u64 = 0x1FF_FFFF_FFFF;
const COUNTER_MASK: u32 = 0xFFFFF;

/// Per-client key source. The counter is the only state shared by concurrent sends.
#[derive(Debug)]
pub struct MessageKeyGenerator {
    client_id: String,
    counter: Mutex<u32>,
}

impl MessageKeyGenerator {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            counter: Mutex::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next unique key. Counter wraps at 2^20; the millisecond timestamp disambiguates wraps.
    pub fn next_key(&self) -> String {
        let count = {
            let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            *counter = (*counter + 1) & COUNTER_MASK;
            *counter
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
            & MILLIS_MASK;
        format!("{}-{}-{}", millis, self.client_id, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn key_embeds_client_id() {
        let gen = MessageKeyGenerator::new("alice");
        let key = gen.next_key();
        let parts: Vec<&str> = key.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<u64>().is_ok());
        assert_eq!(parts[1], "alice");
        assert_eq!(parts[2], "1");
    }

    #[test]
    fn concurrent_keys_unique() {
        let gen = Arc::new(MessageKeyGenerator::new("bob"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..500).map(|_| gen.next_key()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for key in h.join().unwrap() {
                assert!(seen.insert(key), "duplicate key");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn counter_wraps() {
        let gen = MessageKeyGenerator::new("c");
        *gen.counter.lock().unwrap() = COUNTER_MASK;
        assert!(gen.next_key().ends_with("-c-0"));
    }
}
