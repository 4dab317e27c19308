//! Revision strings and write timestamps.
//!
//! A revision has the form `<height>-<hash>`. The height grows by exactly one
//! per accepted write; the hash is a digest of the writing database's token and
//! the previous revision, so it is deterministic for a given lineage.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document;
use crate::error::{Error, Result};

const HASH_LEN: usize = 16;

/// Split a revision into its height and hash parts.
pub fn parse_revision(rev: &str) -> Result<(u64, &str)> {
    let (height, hash) = rev
        .split_once('-')
        .ok_or_else(|| Error::InvalidRevision(rev.to_string()))?;
    let height: u64 = height
        .parse()
        .map_err(|_| Error::InvalidRevision(rev.to_string()))?;
    if height == 0 || hash.is_empty() {
        return Err(Error::InvalidRevision(rev.to_string()));
    }
    Ok((height, hash))
}

/// Height of the document's `_rev`. Fails if the field is missing or malformed.
pub fn revision_height(data: &Value) -> Result<u64> {
    let rev = document::revision(data)
        .ok_or_else(|| Error::InvalidRevision("<missing>".to_string()))?;
    Ok(parse_revision(rev)?.0)
}

/// Compute the revision a write on top of `previous` must carry.
pub fn create_revision(token: &str, previous: Option<&Value>) -> Result<String> {
    let previous_rev = previous.and_then(document::revision);
    let height = match previous_rev {
        Some(rev) => parse_revision(rev)?.0 + 1,
        None => 1,
    };
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(previous_rev.unwrap_or("").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(format!("{height}-{}", &digest[..HASH_LEN]))
}

static LAST_LWT: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in milliseconds, strictly increasing within
/// the process. Two decimals of precision.
pub fn now_lwt() -> f64 {
    // hundredths of a millisecond
    let wall = (chrono::Utc::now().timestamp_micros().max(0) as u64) / 10;
    let mut prev = LAST_LWT.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_LWT.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next as f64 / 100.0,
            Err(actual) => prev = actual,
        }
    }
}

/// Wall-clock milliseconds, used for event bulk timings.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
