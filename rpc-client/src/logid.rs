// Log ids are 32 lowercase hex characters (16 random bytes), never all zero.

use rand::Rng;

fn hex32(b: [u8; 16]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(32);
    for byte in b {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn random_bytes(b: &mut [u8; 16]) {
    if getrandom::fill(b).is_err() {
        rand::rng().fill(&mut b[..]);
    }
}

pub fn new_log_id() -> String {
    let mut id = [0u8; 16];
    random_bytes(&mut id);
    while id.iter().all(|&b| b == 0) {
        random_bytes(&mut id);
    }
    hex32(id)
}

pub fn is_log_id(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex32() {
        let b = [
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88,
            0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00,
        ];
        assert_eq!(hex32(b), "112233445566778899aabbccddeeff00");
    }

    #[test]
    fn test_new_log_id() {
        let a = new_log_id();
        let b = new_log_id();
        assert!(is_log_id(&a));
        assert!(is_log_id(&b));
        assert_ne!(a, b);
        assert!(!is_log_id("XYZ"));
    }
}
