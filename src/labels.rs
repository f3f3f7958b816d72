//! Tags and structured type labels.

use std::sync::OnceLock;

use regex::Regex;

use crate::db::LedgerDb;
use crate::error::LedgerError;

/// Structured label enumeration, `(key, label)`.
pub const TYPE_LABELS: &[(&str, &str)] = &[
    ("marketplace", "shopee"),
    ("marketplace", "tokopedia"),
    ("marketplace", "lazada"),
    ("marketplace", "tiktok"),
    ("marketplace", "offline"),
    ("order_type", "regular"),
    ("order_type", "cod"),
    ("order_type", "preorder"),
    ("order_type", "dropship"),
    ("revenue_source", "sales"),
    ("revenue_source", "shipping"),
    ("revenue_source", "adjustment"),
    ("warehouse_transaction_type", "restock"),
    ("warehouse_transaction_type", "transfer"),
    ("warehouse_transaction_type", "return"),
    ("warehouse_transaction_type", "adjustment"),
    ("warehouse_transaction_type", "broken"),
];

fn whitespace_regex() -> &'static Regex {
    static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex should compile"))
}

/// Canonical tag name: trimmed, lowercased, whitespace runs collapsed to `_`.
pub fn normalize_tag_name(name: &str) -> String {
    whitespace_regex()
        .replace_all(name.trim(), "_")
        .to_lowercase()
}

/// Insert the type-label enumeration. Existing labels are left alone.
/// Returns the number of labels now registered from the enumeration.
pub fn seed_type_labels(db: &LedgerDb) -> Result<usize, LedgerError> {
    db.with_transaction(|db| {
        for (key, label) in TYPE_LABELS {
            db.ensure_type_label(key, label)?;
        }
        Ok::<_, LedgerError>(TYPE_LABELS.len())
    })
}
