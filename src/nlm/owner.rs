//! Translation between the NLM wire identity (caller host name, System
//! V process id, opaque owner handle) and this crate's protocol-agnostic
//! [`crate::owner::LockOwner`] (spec §3, §9).
//!
//! Other protocols never see `svid`/`oh`; they only compare `owner_id`
//! for equality, so the encoding only has to be unambiguous, not
//! compact.

use crate::error::{Error, Result};

/// Builds the opaque `owner_id` string for an NLM lock request:
/// `nlm:<caller_name>:<svid>:<oh_hex>`.
pub fn format_owner_id(caller_name: &str, svid: i32, oh: &[u8]) -> String {
    format!("nlm:{caller_name}:{svid}:{}", hex_encode(oh))
}

/// Parses an `owner_id` previously built by [`format_owner_id`]. Returns
/// `None` for owner ids belonging to a different protocol (no `nlm:`
/// prefix) rather than erroring, since callers often scan a mixed list.
pub fn parse_owner_id(owner_id: &str) -> Option<(String, i32, Vec<u8>)> {
    let rest = owner_id.strip_prefix("nlm:")?;
    let mut parts = rest.rsplitn(3, ':');
    let oh_hex = parts.next()?;
    let svid_str = parts.next()?;
    let caller_name = parts.next()?;

    let svid = svid_str.parse::<i32>().ok()?;
    let oh = hex_decode(oh_hex).ok()?;
    Some((caller_name.to_string(), svid, oh))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::InvalidArgument("odd-length hex string"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::InvalidArgument("invalid hex digit")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() {
        let owner_id = format_owner_id("client.example.com", 4242, &[0xde, 0xad, 0xbe, 0xef]);
        let (caller_name, svid, oh) = parse_owner_id(&owner_id).unwrap();
        assert_eq!(caller_name, "client.example.com");
        assert_eq!(svid, 4242);
        assert_eq!(oh, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_non_nlm_owner_ids() {
        assert!(parse_owner_id("smb:session-1").is_none());
    }

    #[test]
    fn caller_name_may_itself_contain_colons() {
        let owner_id = format_owner_id("fe80::1", -7, &[0x01]);
        let (caller_name, svid, oh) = parse_owner_id(&owner_id).unwrap();
        assert_eq!(caller_name, "fe80::1");
        assert_eq!(svid, -7);
        assert_eq!(oh, vec![0x01]);
    }
}
