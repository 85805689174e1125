use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

const FID_LENGTH: usize = 22;
const FID_BYTE_COUNT: usize = 17;
const FID_HEADER: u8 = 0b0111_0000;

/// Generates a new installation id, or an empty string if the generated
/// value is not a valid FID.
pub fn generate_fid() -> String {
    let mut bytes = [0u8; FID_BYTE_COUNT];
    rand::thread_rng().fill_bytes(&mut bytes);
    encode_fid(bytes)
}

fn encode_fid(mut bytes: [u8; FID_BYTE_COUNT]) -> String {
    bytes[0] = FID_HEADER | (bytes[0] & 0b0000_1111);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    let fid: String = encoded.chars().take(FID_LENGTH).collect();
    if is_valid_fid(&fid) {
        fid
    } else {
        String::new()
    }
}

/// Matches `^[cdef][\w-]{21}$`.
pub fn is_valid_fid(fid: &str) -> bool {
    let mut chars = fid.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    fid.len() == FID_LENGTH
        && matches!(first, 'c'..='f')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_fids_are_valid() {
        for _ in 0..100 {
            let fid = generate_fid();
            assert!(is_valid_fid(&fid), "invalid fid {fid}");
        }
    }

    #[test]
    fn header_bits_pick_the_first_character() {
        assert!(encode_fid([0xFF; FID_BYTE_COUNT]).starts_with('f'));
        assert!(encode_fid([0x00; FID_BYTE_COUNT]).starts_with('c'));
    }

    #[test]
    fn rejects_malformed_fids() {
        assert!(!is_valid_fid(""));
        assert!(!is_valid_fid("aAAAAAAAAAAAAAAAAAAAAA"));
        assert!(!is_valid_fid("cAAAAAAAAAAAAAAAAAAAA"));
        assert!(!is_valid_fid("cAAAAAAAAAAAAAAAAAAA+A"));
        assert!(is_valid_fid("cAAAAAAAAAAAAAAAAAAA_A"));
    }
}
