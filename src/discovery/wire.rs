//! Binary encodings exchanged with the directory service.
//!
//! The attested channel itself is out of scope, but connection
//! implementations share these payload layouts:
//!
//! | Payload | Layout |
//! |---------|--------|
//! | E164 list | `u64` big-endian per number, digits only |
//! | Access keys | `aci (16) ‖ access_key (16)` per entry |
//! | Results | `e164 (u64 BE) ‖ pni (16) ‖ aci (16)` per entry |
//!
//! An all-zero PNI in a result record means "no match" and the record is
//! skipped. An all-zero ACI means the ACI was not revealed.

use super::connection::ResultEntry;
use super::error::{DiscoveryError, Result};
use super::types::{AccessKey, Aci, Pni, E164};

/// Size of one encoded e164.
pub const E164_LEN: usize = 8;

/// Size of one encoded service identifier.
pub const SERVICE_ID_LEN: usize = 16;

/// Size of one result record.
pub const TRIPLE_LEN: usize = E164_LEN + 2 * SERVICE_ID_LEN;

/// Encodes phone numbers as concatenated big-endian integers.
#[must_use]
pub fn encode_e164s<'a>(e164s: impl IntoIterator<Item = &'a E164>) -> Vec<u8> {
    e164s
        .into_iter()
        .flat_map(|e164| e164.to_u64().to_be_bytes())
        .collect()
}

/// Decodes a list produced by [`encode_e164s`].
///
/// # Errors
///
/// Returns [`DiscoveryError::Fatal`] if the length is not a multiple of
/// eight or a value is not a valid E.164 number.
pub fn decode_e164s(data: &[u8]) -> Result<Vec<E164>> {
    if data.len() % E164_LEN != 0 {
        return Err(DiscoveryError::Fatal(format!(
            "e164 list length {} is not a multiple of {E164_LEN}",
            data.len()
        )));
    }

    data.chunks_exact(E164_LEN)
        .map(|chunk| {
            let value = u64::from_be_bytes(read_array(chunk));
            E164::from_u64(value).map_err(|e| DiscoveryError::Fatal(format!("malformed e164: {e}")))
        })
        .collect()
}

/// Encodes ACI/access-key pairs.
#[must_use]
pub fn encode_access_keys(pairs: &[(Aci, AccessKey)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 2 * SERVICE_ID_LEN);
    for (aci, key) in pairs {
        out.extend_from_slice(aci.as_bytes());
        out.extend_from_slice(key.as_bytes());
    }
    out
}

/// Decodes the e164/PNI/ACI result records returned by the service.
///
/// # Errors
///
/// Returns [`DiscoveryError::Fatal`] on a truncated record or a zero e164
/// in a matched record.
pub fn decode_triples(data: &[u8]) -> Result<Vec<ResultEntry>> {
    if data.len() % TRIPLE_LEN != 0 {
        return Err(DiscoveryError::Fatal(
            "malformed e164/aci/pni triples".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(data.len() / TRIPLE_LEN);
    for record in data.chunks_exact(TRIPLE_LEN) {
        let (raw_e164, ids) = record.split_at(E164_LEN);
        let (raw_pni, raw_aci) = ids.split_at(SERVICE_ID_LEN);

        let Some(pni) = Pni::from_bytes(read_array(raw_pni)) else {
            continue;
        };

        let e164 = E164::from_u64(u64::from_be_bytes(read_array(raw_e164)))
            .map_err(|_| DiscoveryError::Fatal("malformed e164".to_string()))?;

        entries.push(ResultEntry {
            e164,
            pni: Some(pni),
            aci: Aci::from_bytes(read_array(raw_aci)),
        });
    }

    Ok(entries)
}

/// Copies a slice of known length into an array.
fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}
