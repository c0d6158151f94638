//! 256-bit big-endian target arithmetic.
//!
//! Targets and difficulties are carried as 32-byte big-endian integers.
//! Conversion from difficulty uses byte-wise long division so the whole
//! computation stays in 256 bits.

use std::cmp::Ordering;
use std::fmt;

/// Big-endian 256-bit unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct U256(pub [u8; 32]);

impl U256 {
    pub const ZERO: U256 = U256([0u8; 32]);
    pub const MAX: U256 = U256([0xff; 32]);

    /// Parse a hex string (with or without `0x`), left-padded to 32 bytes.
    /// Returns `None` for invalid hex or values wider than 256 bits.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches("0x");
        if s.is_empty() || s.len() > 64 {
            return None;
        }
        let padded = if s.len() % 2 == 1 {
            format!("0{}", s)
        } else {
            s.to_string()
        };
        let bytes = hex::decode(&padded).ok()?;
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Some(U256(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        U256(bytes)
    }

    /// Interpret the leading bytes of an arbitrary-length big-endian slice.
    /// Slices shorter than 32 bytes are left-padded, longer ones truncated
    /// to their low 32 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        if bytes.len() >= 32 {
            out.copy_from_slice(&bytes[bytes.len() - 32..]);
        } else {
            out[32 - bytes.len()..].copy_from_slice(bytes);
        }
        U256(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Share target for a worker difficulty: `⌊(2^256 − 1) / d⌋`.
    ///
    /// Fractional difficulties are handled by scaling both sides by 2^16
    /// before the division. Difficulties below the scale resolution clamp
    /// to the maximum target.
    pub fn from_difficulty(diff: f64) -> Self {
        if !diff.is_finite() || diff <= 0.0 {
            return U256::MAX;
        }
        // Clamp keeps `rem << 8` within u128 in the loop; difficulty
        // resolution saturates at 2^80.
        let scaled = ((diff * 65536.0).round() as u128).min(1 << 96);
        if scaled <= 65536 {
            return U256::MAX;
        }
        // Numerator is (2^256 - 1) << 16: 32 0xff bytes followed by two
        // zero bytes. Divide base-256 with a u128 remainder; the quotient
        // fits in the low 32 bytes of the 34-byte result whenever d >= 1.
        let mut quotient = [0u8; 34];
        let mut rem: u128 = 0;
        for (i, q) in quotient.iter_mut().enumerate() {
            let digit = if i < 32 { 0xffu128 } else { 0 };
            let acc = (rem << 8) | digit;
            *q = (acc / scaled) as u8;
            rem = acc % scaled;
        }
        if quotient[0] != 0 || quotient[1] != 0 {
            return U256::MAX;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&quotient[2..]);
        U256(out)
    }

    /// Difficulty this value represents as a target: `(2^256 − 1) / self`.
    pub fn to_difficulty(&self) -> f64 {
        if self.is_zero() {
            return f64::MAX;
        }
        U256::MAX.to_f64() / self.to_f64()
    }

    /// Lossy conversion for ratio arithmetic and display.
    pub fn to_f64(&self) -> f64 {
        let mut val = 0.0f64;
        for &b in self.0.iter() {
            val = val * 256.0 + b as f64;
        }
        val
    }
}

impl Default for U256 {
    /// The easiest possible target.
    fn default() -> Self {
        U256::MAX
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U256({})", self.to_hex())
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
