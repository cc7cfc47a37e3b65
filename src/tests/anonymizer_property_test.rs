//! Property tests for the anonymizer and fingerprint

use crate::services::pipeline::anonymizer::{anonymize, fingerprint};
use proptest::prelude::*;

proptest! {
    /// anonymize(anonymize(q)) == anonymize(q) for arbitrary WHERE literals
    #[test]
    fn anonymize_is_idempotent(
        id in 0i64..1_000_000,
        name in "[a-z]{1,12}",
        price in 0.0f64..10_000.0,
    ) {
        let sql = format!(
            "SELECT * FROM items WHERE id = {} AND name = '{}' AND price < {:.2}",
            id, name, price
        );
        let once = anonymize(&sql);
        prop_assert_eq!(anonymize(&once), once);
    }

    /// Queries differing only in literals share a fingerprint
    #[test]
    fn fingerprint_ignores_literal_values(
        a in 0i64..1_000_000,
        b in 0i64..1_000_000,
        sa in "[a-zA-Z ]{0,16}",
        sb in "[a-zA-Z ]{0,16}",
    ) {
        let qa = format!("SELECT * FROM t WHERE id = {} AND note = '{}'", a, sa);
        let qb = format!("SELECT * FROM t WHERE id = {} AND note = '{}'", b, sb);
        prop_assert_eq!(fingerprint(&qa), fingerprint(&qb));
    }

    /// Fingerprints ignore whitespace and comments
    #[test]
    fn fingerprint_ignores_whitespace_and_comments(pad in " {0,5}", n in 1i64..100) {
        let qa = format!("SELECT *{}FROM t WHERE id = {} -- note", if pad.is_empty() { " " } else { pad.as_str() }, n);
        let qb = "SELECT * FROM t WHERE id = 1";
        prop_assert_eq!(fingerprint(&qa), fingerprint(qb));
    }

    /// No raw numeric literal survives anonymization
    #[test]
    fn no_literal_survives(id in 10i64..1_000_000) {
        let sql = format!("SELECT * FROM t WHERE id = {}", id);
        let anonymized = anonymize(&sql);
        prop_assert!(!anonymized.contains(&id.to_string()));
    }
}
