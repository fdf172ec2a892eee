use rand::RngCore;

use crate::hash_id::Id20;

/// Two-letter client code in our own peer ids.
pub const CLIENT_ID: [u8; 2] = *b"PS";

// Azureus-style version digits: one character per digit, 64 possible values.
const DIGITS: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz.-";

#[derive(Debug, PartialEq, Eq)]
pub struct AzureusStyle {
    pub client: [u8; 2],
    pub version: [u8; 4],
}

/// Decode a `-XX1234-` prefix. Used to name remote clients in logs.
pub fn try_decode_azureus_style(id: &Id20) -> Option<AzureusStyle> {
    let prefix = &id.0[..8];
    if prefix[0] != b'-' || prefix[7] != b'-' {
        return None;
    }
    let mut version = [0u8; 4];
    for (out, c) in version.iter_mut().zip(&prefix[3..7]) {
        *out = DIGITS.iter().position(|d| d == c)? as u8;
    }
    Some(AzureusStyle {
        client: [prefix[1], prefix[2]],
        version,
    })
}

/// A peer id starting with `-XXabcd-`, where `abcd` encodes `version`.
/// Components above 63 wrap around.
pub fn generate_azureus_style(client: [u8; 2], version: (u8, u8, u8, u8)) -> Id20 {
    let (a, b, c, d) = version;
    let digit = |v: u8| DIGITS[(v & 63) as usize];
    let mut prefix = *b"--------";
    prefix[1..3].copy_from_slice(&client);
    prefix[3..7].copy_from_slice(&[digit(a), digit(b), digit(c), digit(d)]);
    generate_peer_id(&prefix)
}

/// `prefix` followed by 12 random bytes.
pub fn generate_peer_id(prefix: &[u8; 8]) -> Id20 {
    let mut id = Id20::default();
    id.0[..8].copy_from_slice(prefix);
    rand::rng().fill_bytes(&mut id.0[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_prefixes() {
        let cases = [
            (*b"xx", (1, 2, 3, 4), *b"-xx1234-"),
            (*b"PS", (0, 10, 35, 36), *b"-PS0AZa-"),
            (*b"ab", (62, 63, 64, 0), *b"-ab.-00-"),
        ];
        for (client, version, expected) in cases {
            let a = generate_azureus_style(client, version);
            let b = generate_azureus_style(client, version);
            assert_eq!(a.0[..8], expected);
            assert_eq!(a.0[..8], b.0[..8]);
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_decode() {
        let id = generate_azureus_style(CLIENT_ID, (0, 1, 0, 0));
        assert_eq!(
            try_decode_azureus_style(&id),
            Some(AzureusStyle {
                client: CLIENT_ID,
                version: [0, 1, 0, 0]
            })
        );
        assert_eq!(try_decode_azureus_style(&Id20::default()), None);
        let mut bad = id;
        bad.0[4] = b'!';
        assert_eq!(try_decode_azureus_style(&bad), None);
    }
}
