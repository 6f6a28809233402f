//! Core value types for contact discovery.
//!
//! Phone numbers ([`E164`]), service identifiers ([`Aci`], [`Pni`]), access
//! keys, tokens, and the request/result shapes exchanged with the
//! directory service.
//!
//! # Privacy
//!
//! Phone numbers, access keys, and tokens are redacted in `Debug` output so
//! they cannot leak into logs by accident.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::E164Error;

/// Maximum number of digits in an E.164 number.
const MAX_E164_DIGITS: usize = 15;

/// A phone number in canonical E.164 format (`+` followed by digits).
///
/// The numeric value is cached because the wire format encodes numbers as
/// big-endian integers.
///
/// # Example
///
/// ```
/// use cds_core::discovery::E164;
///
/// let number: E164 = "+15550001".parse().unwrap();
/// assert_eq!(number.as_str(), "+15550001");
/// assert_eq!(number.to_u64(), 15_550_001);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct E164 {
    value: u64,
    text: String,
}

impl E164 {
    /// Parses a string in E.164 format.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `+` followed by 1 to 15 digits
    /// with a non-zero first digit.
    pub fn parse(s: &str) -> Result<Self, E164Error> {
        let digits = s.strip_prefix('+').ok_or(E164Error::MissingPlus)?;

        if digits.is_empty() || digits.len() > MAX_E164_DIGITS {
            return Err(E164Error::InvalidLength(digits.len()));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(E164Error::InvalidDigits);
        }
        if digits.starts_with('0') {
            return Err(E164Error::LeadingZero);
        }

        let value = digits.parse::<u64>().map_err(|_| E164Error::InvalidDigits)?;

        Ok(Self {
            value,
            text: s.to_string(),
        })
    }

    /// Builds an E164 from its numeric wire value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is zero or longer than 15 digits.
    pub fn from_u64(value: u64) -> Result<Self, E164Error> {
        Self::parse(&format!("+{value}"))
    }

    /// Returns the canonical string form, including the leading `+`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the digits as an integer.
    #[must_use]
    pub const fn to_u64(&self) -> u64 {
        self.value
    }
}

impl FromStr for E164 {
    type Err = E164Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep only the last two digits so logs stay useful without the number.
        let tail_start = self.text.len().saturating_sub(2).max(1);
        write!(f, "E164(+…{})", &self.text[tail_start..])
    }
}

impl Serialize for E164 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for E164 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Account identifier assigned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Aci(Uuid);

/// Phone-number identifier assigned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pni(Uuid);

macro_rules! service_id_impl {
    ($name:ident) => {
        impl $name {
            /// Wraps a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Builds an identifier from its 16 raw bytes.
            ///
            /// Returns `None` for the all-zero UUID, which the service uses
            /// to mean "absent".
            #[must_use]
            pub fn from_bytes(bytes: [u8; 16]) -> Option<Self> {
                let uuid = Uuid::from_bytes(bytes);
                (!uuid.is_nil()).then_some(Self(uuid))
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }

            /// Returns the 16 raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", stringify!($name).to_uppercase(), self.0)
            }
        }
    };
}

service_id_impl!(Aci);
service_id_impl!(Pni);

/// Length of an access key in bytes.
pub const ACCESS_KEY_LEN: usize = 16;

/// Per-account secret that lets a known ACI be reconfirmed without
/// spending phone-number quota.
///
/// Zeroized on drop, redacted in `Debug`, compared in constant time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessKey([u8; ACCESS_KEY_LEN]);

impl AccessKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; ACCESS_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, returning `None` on a length mismatch.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; ACCESS_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ACCESS_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for AccessKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for AccessKey {}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(<redacted>)")
    }
}

/// Opaque token issued by the directory service.
///
/// A token only has meaning together with the exact set of e164s it was
/// issued for. It is never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct DiscoveryToken(Vec<u8>);

impl DiscoveryToken {
    /// Wraps token bytes, returning `None` for an empty token.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        (!bytes.is_empty()).then_some(Self(bytes))
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns a short, non-reversible fingerprint suitable for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for DiscoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DiscoveryToken")
            .field(&self.fingerprint())
            .finish()
    }
}

/// How a discovery run treats the persisted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Automated lookups that reuse and advance the persisted token so
    /// quota is only spent on new numbers.
    #[default]
    Incremental,
    /// User-initiated lookups that never read or write the persisted token.
    OneOff,
}

impl DiscoveryMode {
    /// Returns whether runs in this mode use the persisted token state.
    #[must_use]
    pub const fn uses_persisted_state(&self) -> bool {
        matches!(self, Self::Incremental)
    }
}

/// Outbound lookup request.
///
/// `new_e164s` and `prev_e164s` are always disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    /// Numbers the service has not acknowledged under `token`; these cost quota.
    pub new_e164s: BTreeSet<E164>,
    /// Numbers already acknowledged under `token`.
    pub prev_e164s: BTreeSet<E164>,
    /// Known ACIs with their access keys.
    pub access_keys: Vec<(Aci, AccessKey)>,
    /// Token from a prior run, if any.
    pub token: Option<DiscoveryToken>,
}

impl LookupRequest {
    /// Returns whether the request continues from a prior token.
    #[must_use]
    pub const fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Returns every number covered by the token the service will return.
    #[must_use]
    pub fn all_e164s(&self) -> BTreeSet<E164> {
        self.prev_e164s.union(&self.new_e164s).cloned().collect()
    }
}

/// A phone number the service matched to a registered account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupResult {
    /// The matched phone number.
    pub e164: E164,
    /// Phone-number identifier of the account.
    pub pni: Pni,
    /// Account identifier, present when an access key confirmed it.
    pub aci: Option<Aci>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_e164() {
        let number = E164::parse("+15550001").unwrap();
        assert_eq!(number.as_str(), "+15550001");
        assert_eq!(number.to_u64(), 15_550_001);
        assert_eq!(number.to_string(), "+15550001");
    }

    #[test]
    fn parse_rejects_malformed_numbers() {
        assert_eq!(E164::parse("15550001"), Err(E164Error::MissingPlus));
        assert_eq!(E164::parse("+"), Err(E164Error::InvalidLength(0)));
        assert_eq!(E164::parse("+1555-0001"), Err(E164Error::InvalidDigits));
        assert_eq!(E164::parse("+05550001"), Err(E164Error::LeadingZero));
        assert_eq!(
            E164::parse("+1234567890123456"),
            Err(E164Error::InvalidLength(16))
        );
    }

    #[test]
    fn from_u64_matches_parse() {
        assert_eq!(
            E164::from_u64(15_550_002).unwrap(),
            E164::parse("+15550002").unwrap()
        );
        assert!(E164::from_u64(0).is_err());
    }

    #[test]
    fn e164_debug_is_redacted() {
        let number = E164::parse("+15551234567").unwrap();
        let debug = format!("{number:?}");
        assert!(!debug.contains("5551234"));
        assert!(debug.ends_with("67)"));
    }

    #[test]
    fn e164_serde_uses_string_form() {
        let number = E164::parse("+447700900123").unwrap();
        let json = serde_json::to_string(&number).unwrap();
        assert_eq!(json, "\"+447700900123\"");
        let back: E164 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, number);
        assert!(serde_json::from_str::<E164>("\"447700900123\"").is_err());
    }

    #[test]
    fn nil_service_ids_are_absent() {
        assert!(Pni::from_bytes([0; 16]).is_none());
        assert!(Aci::from_bytes([0; 16]).is_none());
        let pni = Pni::from_bytes([7; 16]).unwrap();
        assert_eq!(pni.as_bytes(), &[7; 16]);
        assert!(pni.to_string().starts_with("PNI:"));
    }

    #[test]
    fn access_key_equality_and_redaction() {
        let a = AccessKey::new([1; ACCESS_KEY_LEN]);
        let b = AccessKey::from_slice(&[1; ACCESS_KEY_LEN]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, AccessKey::new([2; ACCESS_KEY_LEN]));
        assert!(AccessKey::from_slice(&[1; 15]).is_none());
        assert_eq!(format!("{a:?}"), "AccessKey(<redacted>)");
    }

    #[test]
    fn access_key_implements_zeroize_on_drop() {
        fn assert_zeroize_on_drop<T: ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<AccessKey>();
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(DiscoveryToken::new(Vec::new()).is_none());
        let token = DiscoveryToken::new(vec![1, 2, 3]).unwrap();
        assert_eq!(token.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn token_debug_shows_fingerprint_only() {
        let token = DiscoveryToken::new(b"secret-token-bytes".to_vec()).unwrap();
        let debug = format!("{token:?}");
        assert!(debug.contains(&token.fingerprint()));
        assert!(!debug.contains("secret"));
        assert_eq!(token.fingerprint().len(), 16);
    }

    #[test]
    fn request_all_e164s_is_union() {
        let a = E164::parse("+15550001").unwrap();
        let b = E164::parse("+15550002").unwrap();
        let request = LookupRequest {
            new_e164s: BTreeSet::from([a.clone()]),
            prev_e164s: BTreeSet::from([b.clone()]),
            access_keys: Vec::new(),
            token: None,
        };
        assert_eq!(request.all_e164s(), BTreeSet::from([a, b]));
        assert!(!request.has_token());
    }

    #[test]
    fn mode_uses_persisted_state() {
        assert!(DiscoveryMode::Incremental.uses_persisted_state());
        assert!(!DiscoveryMode::OneOff.uses_persisted_state());
        assert_eq!(DiscoveryMode::default(), DiscoveryMode::Incremental);
    }
}
