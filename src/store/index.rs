//! Forensic watermark index: payload -> (token, campaign, recipient).
//!
//! Rows are inserted exactly once per successful embed and never mutated.
//! The exact lookup keys on the token-hash region of the payload (bytes
//! 2..10, hex chars 4..20); the fuzzy lookup scans every row and picks the
//! strict Hamming minimum within tolerance.

use rusqlite::{params, OptionalExtension};

use crate::error::{Error, Result};
use crate::now_s;

/// Default hex-character tolerance for the fuzzy scan.
pub const DEFAULT_MAX_HEX_DIFF: usize = 8;

/// Hex offsets of the token-hash region inside payload_hex.
const TOKEN_REGION: std::ops::Range<usize> = 4..20;

/// One attribution row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub payload_hex: String,
    pub token_id: String,
    pub campaign_id: String,
    pub recipient_id: String,
    pub algorithm: String,
}

impl crate::store::Store {
    /// Idempotent insert; retries with an identical payload are no-ops.
    pub fn insert_index(&self, entry: &IndexEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO watermark_index
                (payload_hex, token_id, campaign_id, recipient_id, algorithm, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.payload_hex,
                entry.token_id,
                entry.campaign_id,
                entry.recipient_id,
                entry.algorithm,
                now_s(),
            ],
        )?;
        Ok(())
    }

    /// Row whose token-hash region equals `token_hash_hex` (16 chars);
    /// deterministic first match in insertion order.
    pub fn lookup_exact(&self, token_hash_hex: &str) -> Result<Option<IndexEntry>> {
        if token_hash_hex.len() != TOKEN_REGION.len() {
            return Err(Error::InvalidPayload(format!(
                "token hash slice must be {} hex chars, got {}",
                TOKEN_REGION.len(),
                token_hash_hex.len()
            )));
        }
        self.conn
            .query_row(
                "SELECT payload_hex, token_id, campaign_id, recipient_id, algorithm
                 FROM watermark_index
                 WHERE substr(payload_hex, 5, 16) = ?1
                 ORDER BY rowid ASC LIMIT 1",
                params![token_hash_hex.to_ascii_lowercase()],
                entry_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Scan every row and return the entry whose token-hash region has the
    /// strictly smallest Hamming distance (in hex characters) to the query,
    /// provided it is within `max_hex_diff`. Ties keep the earlier row.
    pub fn lookup_fuzzy(
        &self,
        token_hash_hex: &str,
        max_hex_diff: usize,
    ) -> Result<Option<(IndexEntry, usize)>> {
        if token_hash_hex.len() != TOKEN_REGION.len() {
            return Err(Error::InvalidPayload(format!(
                "token hash slice must be {} hex chars, got {}",
                TOKEN_REGION.len(),
                token_hash_hex.len()
            )));
        }
        let query = token_hash_hex.to_ascii_lowercase();

        let mut stmt = self.conn.prepare(
            "SELECT payload_hex, token_id, campaign_id, recipient_id, algorithm
             FROM watermark_index ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;

        let mut best: Option<(IndexEntry, usize)> = None;
        for row in rows {
            let entry = row?;
            if entry.payload_hex.len() < TOKEN_REGION.end {
                continue;
            }
            let region = &entry.payload_hex[TOKEN_REGION];
            let diff = hex_hamming(region, &query);
            if diff > max_hex_diff {
                continue;
            }
            match &best {
                Some((_, best_diff)) if *best_diff <= diff => {}
                _ => best = Some((entry, diff)),
            }
        }
        Ok(best)
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        payload_hex: row.get(0)?,
        token_id: row.get(1)?,
        campaign_id: row.get(2)?,
        recipient_id: row.get(3)?,
        algorithm: row.get(4)?,
    })
}

/// Positions at which two equal-length hex strings differ.
fn hex_hamming(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).filter(|(x, y)| x != y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn entry(payload_hex: &str, token: &str) -> IndexEntry {
        IndexEntry {
            payload_hex: payload_hex.to_string(),
            token_id: token.to_string(),
            campaign_id: "c1".to_string(),
            recipient_id: "r1".to_string(),
            algorithm: "dwtDctSvd-native".to_string(),
        }
    }

    fn payload_hex(token_region: &str) -> String {
        // version(4) + token(16) + campaign(8) + crc(4) hex chars
        format!("0001{token_region}aabbccdd0000")
    }

    #[test]
    fn insert_is_idempotent() {
        let store = Store::open(":memory:").expect("open");
        let e = entry(&payload_hex("00112233445566ff"), "t1");
        store.insert_index(&e).unwrap();
        store.insert_index(&e).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM watermark_index", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn exact_lookup_keys_on_token_region() {
        let store = Store::open(":memory:").expect("open");
        store
            .insert_index(&entry(&payload_hex("00112233445566ff"), "t1"))
            .unwrap();
        store
            .insert_index(&entry(&payload_hex("ffeeddccbbaa9988"), "t2"))
            .unwrap();

        let hit = store.lookup_exact("ffeeddccbbaa9988").unwrap().expect("hit");
        assert_eq!(hit.token_id, "t2");
        assert!(store.lookup_exact("0000000000000000").unwrap().is_none());
    }

    #[test]
    fn exact_lookup_validates_query_length() {
        let store = Store::open(":memory:").expect("open");
        assert!(store.lookup_exact("abcd").is_err());
    }

    #[test]
    fn fuzzy_lookup_returns_strict_minimum() {
        let store = Store::open(":memory:").expect("open");
        store
            .insert_index(&entry(&payload_hex("0000000000000000"), "near"))
            .unwrap();
        store
            .insert_index(&entry(&payload_hex("00000000000fffff"), "far"))
            .unwrap();

        // Query differs from "near" in 4 chars, from "far" in at least 5.
        let (hit, diff) = store
            .lookup_fuzzy("000000000000beef", DEFAULT_MAX_HEX_DIFF)
            .unwrap()
            .expect("hit");
        assert_eq!(hit.token_id, "near");
        assert_eq!(diff, 4);
    }

    #[test]
    fn fuzzy_lookup_respects_tolerance() {
        let store = Store::open(":memory:").expect("open");
        store
            .insert_index(&entry(&payload_hex("0000000000000000"), "t1"))
            .unwrap();
        assert!(store
            .lookup_fuzzy("ffffffffffffffff", DEFAULT_MAX_HEX_DIFF)
            .unwrap()
            .is_none());
        assert!(store.lookup_fuzzy("ffffffffffffffff", 16).unwrap().is_some());
    }

    #[test]
    fn fuzzy_tie_keeps_scan_order() {
        let store = Store::open(":memory:").expect("open");
        store
            .insert_index(&entry(&payload_hex("aa00000000000000"), "first"))
            .unwrap();
        store
            .insert_index(&entry(&payload_hex("bb00000000000000"), "second"))
            .unwrap();

        // Both rows are 2 chars away from the query.
        let (hit, diff) = store
            .lookup_fuzzy("cc00000000000000", DEFAULT_MAX_HEX_DIFF)
            .unwrap()
            .expect("hit");
        assert_eq!(diff, 2);
        assert_eq!(hit.token_id, "first");
    }
}
