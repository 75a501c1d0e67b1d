//! Identifier generation for ledger rows
//!
//! References are internally generated and distinct from any gateway-issued
//! id: a human-decodable prefix, the creation timestamp, and a random suffix.
//! Uniqueness is ultimately enforced by the database unique constraints; the
//! random suffix keeps collisions out of the happy path.

use rand::distributions::Uniform;
use rand::Rng;
use time::OffsetDateTime;

const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let dist = Uniform::from(0..SUFFIX_ALPHABET.len());
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.sample(dist)] as char)
        .collect()
}

/// Generate a transaction reference, e.g. `TXN-1754630000-K4P7QA`
pub fn transaction_reference(now: OffsetDateTime) -> String {
    format!("TXN-{}-{}", now.unix_timestamp(), random_suffix(6))
}

/// Generate an invoice number, e.g. `INV-202608-X2M9T4WQ`
pub fn invoice_number(now: OffsetDateTime) -> String {
    format!(
        "INV-{:04}{:02}-{}",
        now.year(),
        now.month() as u8,
        random_suffix(8)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_transaction_reference_shape() {
        let reference = transaction_reference(datetime!(2026-08-08 12:00 UTC));
        let parts: Vec<&str> = reference.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TXN");
        assert_eq!(parts[1], "1786190400");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .bytes()
            .all(|b| SUFFIX_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_invoice_number_shape() {
        let number = invoice_number(datetime!(2026-08-08 12:00 UTC));
        assert!(number.starts_with("INV-202608-"));
        assert_eq!(number.len(), "INV-202608-".len() + 8);
    }

    #[test]
    fn test_references_differ() {
        let now = datetime!(2026-08-08 12:00 UTC);
        // Same timestamp, different random suffixes
        assert_ne!(transaction_reference(now), transaction_reference(now));
    }
}
