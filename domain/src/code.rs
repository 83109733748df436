//! Short code generation: base62 over a monotonically increasing id.

use crate::CodeGenerator;
use crate::ShortCode;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encode into base62 using 0-9, A-Z, a-z. Zero encodes to "0".
pub fn encode_base62(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(11);
    while n > 0 {
        digits.push(ALPHABET[(n % 62) as usize] as char);
        n /= 62;
    }
    digits.iter().rev().collect()
}

/// Deterministic w.r.t. `next_id`; left-pads with '0' up to `min_width`.
#[derive(Clone, Copy, Debug)]
pub struct Base62CodeGenerator {
    min_width: usize,
}

impl Base62CodeGenerator {
    pub fn new(min_width: usize) -> Self {
        Self { min_width }
    }
}

impl CodeGenerator for Base62CodeGenerator {
    fn next_code(&self, next_id: u64) -> ShortCode {
        let encoded = encode_base62(next_id);
        let padded = format!("{:0>width$}", encoded, width = self.min_width);
        // base62 digits and '0' padding always form a valid code
        ShortCode::new(padded).unwrap_or_else(|_| unreachable!("base62 output is alphanumeric"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_vectors() {
        assert_eq!(encode_base62(0), "0");
        assert_eq!(encode_base62(61), "z");
        assert_eq!(encode_base62(62), "10");
        assert_eq!(encode_base62(3843), "zz");
        assert_eq!(encode_base62(u64::MAX).len(), 11);
    }

    #[test]
    fn pads_to_min_width() {
        let g = Base62CodeGenerator::new(4);
        assert_eq!(g.next_code(0).as_str(), "0000");
        assert_eq!(g.next_code(62).as_str(), "0010");
        assert_eq!(Base62CodeGenerator::new(2).next_code(3843).as_str(), "zz");
    }
}
