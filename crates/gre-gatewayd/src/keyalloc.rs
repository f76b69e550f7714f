//! Tunnel key allocation.
//!
//! Each VRF hands out ingress tunnel keys from a configured inclusive range.
//! A cursor remembers where the next search starts. When the key under the
//! cursor is taken, the VRF's key index is walked in order from the cursor
//! to find the first gap, wrapping around to the start of the range once.
//! Releasing a key pulls the cursor back to it, so freed keys are reused
//! before fresh ones.

use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::store::{TunnelKey, Vrf};

/// Finds the first free key in `[from, to]`, walking the VRF index.
fn first_gap(vrf: &Vrf, from: TunnelKey, to: TunnelKey) -> Option<TunnelKey> {
    let mut expected = u64::from(from);
    for (&key, _) in vrf.sessions.iter_from(&from) {
        let key = u64::from(key);
        if key > u64::from(to) {
            break;
        }
        if key > expected {
            break;
        }
        expected = key + 1;
    }
    if expected <= u64::from(to) {
        TunnelKey::try_from(expected).ok()
    } else {
        None
    }
}

/// Picks the next free key of `vrf` and advances its cursor.
///
/// Fails with [`GatewayError::SessionLimit`] once the active sessions keyed
/// in this VRF reach its maximum. Sessions still waiting for their processor
/// and sessions merely egressing into the VRF do not count.
///
/// The key is not reserved; the caller inserts it into the VRF's key index
/// under the same lock.
pub fn generate_key(vrf: &mut Vrf) -> Result<TunnelKey> {
    if vrf.keyed.active >= vrf.max_sessions {
        debug!(vrf = %vrf.id, max = vrf.max_sessions, "VRF at session limit");
        return Err(GatewayError::SessionLimit(vrf.id));
    }

    let range = vrf.keys;
    if !range.contains(vrf.cursor) {
        vrf.cursor = range.start;
    }
    let cursor = vrf.cursor;

    let key = if !vrf.sessions.contains_key(&cursor) {
        Some(cursor)
    } else {
        first_gap(vrf, cursor, range.end).or_else(|| {
            if cursor > range.start {
                first_gap(vrf, range.start, cursor - 1)
            } else {
                None
            }
        })
    };

    let Some(key) = key else {
        warn!(vrf = %vrf.id, start = range.start, end = range.end, "Tunnel key range exhausted");
        return Err(GatewayError::KeysExhausted(vrf.id));
    };

    vrf.cursor = if key >= range.end { range.start } else { key + 1 };
    Ok(key)
}

/// Returns `key` to the VRF's namespace.
pub fn release(vrf: &mut Vrf, key: TunnelKey) {
    if vrf.keys.contains(key) && key < vrf.cursor {
        vrf.cursor = key;
    }
}
