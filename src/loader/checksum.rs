//! Image checksum primitive.

/// Integrity check the loader applies to the transferred image.
///
/// The loader computes the expected value from the image it sends and compares it with the
/// value the board reports after the transfer.
pub trait Checksum: Send + Sync {
    /// Checksum of a whole image.
    fn compute_checksum(&self, image: &[u8]) -> i32;

    /// Whether the board's reported value matches the expected one.
    fn verify_checksum(&self, expected: i32, actual: i32) -> bool {
        expected == actual
    }
}

/// Propeller boot checksum: byte sum of the image plus the initial stack marker, mod 256.
///
/// A well-formed Propeller image sums to zero once the marker is added.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropellerChecksum;

/// Byte sum of the two longs the boot ROM places after the image (0xFFF9FFFF twice).
const STACK_MARKER_SUM: u32 = 0xEC;

impl Checksum for PropellerChecksum {
    fn compute_checksum(&self, image: &[u8]) -> i32 {
        let sum = image.iter().fold(STACK_MARKER_SUM, |acc, &b| acc.wrapping_add(u32::from(b)));
        (sum & 0xFF) as i32
    }
}
