//! Size estimation for entries, batches and whole buffers
//!
//! All sizes are exact byte lengths of the compact JSON encoding, which is
//! what the local store and the sink actually receive.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{StreamType, TelemetryEntry};

/// Borrowed mirror of `TelemetryEntry` used to size an entry without
/// cloning its payload. Field order and names must match the owned type.
#[derive(Serialize)]
struct EntryView<'a> {
    id: &'a str,
    stream: StreamType,
    payload: &'a serde_json::Value,
    created_at: &'a DateTime<Utc>,
    size_bytes: usize,
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Serialized size of `entry`, including its own `size_bytes` field.
///
/// The encoded length depends on the number of digits in the size itself,
/// so this solves `size = base + digits(size)` by iteration.
pub fn entry_size(entry: &TelemetryEntry) -> Result<usize, serde_json::Error> {
    let view = EntryView {
        id: &entry.id,
        stream: entry.stream,
        payload: &entry.payload,
        created_at: &entry.created_at,
        size_bytes: 0,
    };
    let base = serde_json::to_vec(&view)?.len() - 1;

    let mut size = base + 1;
    loop {
        let next = base + decimal_digits(size);
        if next == size {
            return Ok(size);
        }
        size = next;
    }
}

/// Size of a JSON array holding entries of the given sizes
pub fn array_size<I>(sizes: I) -> usize
where
    I: IntoIterator<Item = usize>,
{
    let mut total = 2;
    let mut count: usize = 0;
    for s in sizes {
        total += s;
        count += 1;
    }
    total + count.saturating_sub(1)
}

/// Size of the blob a buffer serializes to
pub fn buffer_size<'a, I>(entries: I) -> usize
where
    I: IntoIterator<Item = &'a TelemetryEntry>,
{
    array_size(entries.into_iter().map(|e| e.size_bytes))
}

/// Sum of entry sizes (the quantity bounded by `max_total_bytes`)
pub fn total_entry_bytes<'a, I>(entries: I) -> usize
where
    I: IntoIterator<Item = &'a TelemetryEntry>,
{
    entries.into_iter().map(|e| e.size_bytes).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: serde_json::Value) -> TelemetryEntry {
        TelemetryEntry::new(StreamType::Report, payload).unwrap()
    }

    #[test]
    fn test_decimal_digits() {
        assert_eq!(decimal_digits(0), 1);
        assert_eq!(decimal_digits(9), 1);
        assert_eq!(decimal_digits(10), 2);
        assert_eq!(decimal_digits(999), 3);
        assert_eq!(decimal_digits(1000), 4);
    }

    #[test]
    fn test_entry_size_across_digit_boundary() {
        // Payloads chosen so sizes straddle 100 and 1000 bytes
        for len in [10, 40, 60, 900, 960] {
            let e = entry(serde_json::json!({ "s": "x".repeat(len) }));
            assert_eq!(e.size_bytes, serde_json::to_vec(&e).unwrap().len(), "len={len}");
        }
    }

    #[test]
    fn test_buffer_size_matches_array_encoding() {
        let entries: Vec<_> = (0..5)
            .map(|i| entry(serde_json::json!({ "i": i })))
            .collect();
        let encoded = serde_json::to_vec(&entries).unwrap();
        assert_eq!(buffer_size(&entries), encoded.len());
    }

    #[test]
    fn test_empty_buffer_size() {
        let entries: Vec<TelemetryEntry> = Vec::new();
        assert_eq!(buffer_size(&entries), 2);
        assert_eq!(total_entry_bytes(&entries), 0);
    }

    #[test]
    fn test_array_size_counts_separators() {
        assert_eq!(array_size(std::iter::empty()), 2);
        assert_eq!(array_size([10]), 12);
        assert_eq!(array_size([10, 20, 30]), 64);
    }
}
