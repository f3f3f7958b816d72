//! Reference ids: `"<reftype>#<id>"` keys that make postings replay-safe.
//!
//! The `transactions.ref_id` unique index turns a reference id into an
//! at-most-once guarantee, so a retried request that rebuilds the same ref id
//! either finds the existing posting or fails with `DuplicateRefId`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Kind of business event a posting records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefType {
    Withdrawal,
    RevenueAdjustment,
    Order,
    OrderReturn,
    OrderProblem,
    OrderFund,
    StockAccept,
    StockTransfer,
    StockTransferAccept,
    StockReturn,
    StockAdjustment,
    Expense,
    Restock,
    Payment,
    AdminAdjustment,
    AdsPayment,
    CommonAdjustment,
    /// A type not in the reserved set. Kept verbatim.
    Other(String),
}

impl RefType {
    pub fn as_str(&self) -> &str {
        match self {
            RefType::Withdrawal => "wd",
            RefType::RevenueAdjustment => "revenue_adjustment",
            RefType::Order => "order",
            RefType::OrderReturn => "order_return",
            RefType::OrderProblem => "order_problem",
            RefType::OrderFund => "order_fund",
            RefType::StockAccept => "stock_accept",
            RefType::StockTransfer => "stock_transfer",
            RefType::StockTransferAccept => "stock_transfer_accept",
            RefType::StockReturn => "stock_return",
            RefType::StockAdjustment => "stock_adjustment",
            RefType::Expense => "expense",
            RefType::Restock => "restock",
            RefType::Payment => "payment",
            RefType::AdminAdjustment => "admin_adjustment",
            RefType::AdsPayment => "ads_payment",
            RefType::CommonAdjustment => "common_adjustment",
            RefType::Other(s) => s,
        }
    }

    /// Map a type string onto the reserved set, falling back to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "wd" => RefType::Withdrawal,
            "revenue_adjustment" => RefType::RevenueAdjustment,
            "order" => RefType::Order,
            "order_return" => RefType::OrderReturn,
            "order_problem" => RefType::OrderProblem,
            "order_fund" => RefType::OrderFund,
            "stock_accept" => RefType::StockAccept,
            "stock_transfer" => RefType::StockTransfer,
            "stock_transfer_accept" => RefType::StockTransferAccept,
            "stock_return" => RefType::StockReturn,
            "stock_adjustment" => RefType::StockAdjustment,
            "expense" => RefType::Expense,
            "restock" => RefType::Restock,
            "payment" => RefType::Payment,
            "admin_adjustment" => RefType::AdminAdjustment,
            "ads_payment" => RefType::AdsPayment,
            "common_adjustment" => RefType::CommonAdjustment,
            other => RefType::Other(other.to_string()),
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, RefType::Other(_))
    }
}

/// The external half of a reference id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKey {
    Number(u64),
    Text(String),
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKey::Number(n) => write!(f, "{n}"),
            RefKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RefKey {
    fn from(n: u64) -> Self {
        RefKey::Number(n)
    }
}

impl From<&str> for RefKey {
    fn from(s: &str) -> Self {
        RefKey::Text(s.to_string())
    }
}

impl From<String> for RefKey {
    fn from(s: String) -> Self {
        RefKey::Text(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RefId {
    pub ref_type: RefType,
    pub key: RefKey,
}

impl RefId {
    pub fn new(ref_type: RefType, key: impl Into<RefKey>) -> Self {
        Self {
            ref_type,
            key: key.into(),
        }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ref_type.as_str(), self.key)
    }
}

impl FromStr for RefId {
    type Err = LedgerError;

    /// Split on the first `#`. The type may be outside the reserved set; the
    /// key is numeric when it parses as `u64`, text otherwise.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ref_type, key) = s
            .split_once('#')
            .ok_or_else(|| LedgerError::InvalidRefId(s.to_string()))?;
        if ref_type.is_empty() || key.is_empty() {
            return Err(LedgerError::InvalidRefId(s.to_string()));
        }
        let key = match key.parse::<u64>() {
            Ok(n) if n.to_string() == key => RefKey::Number(n),
            _ => RefKey::Text(key.to_string()),
        };
        Ok(Self {
            ref_type: RefType::parse(ref_type),
            key,
        })
    }
}

impl From<RefId> for String {
    fn from(id: RefId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RefId {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_numeric_and_text_keys() {
        assert_eq!(RefId::new(RefType::Order, 1).to_string(), "order#1");
        assert_eq!(
            RefId::new(RefType::AdsPayment, "shop42_extref").to_string(),
            "ads_payment#shop42_extref"
        );
        assert_eq!(RefId::new(RefType::Withdrawal, 9).to_string(), "wd#9");
    }

    #[test]
    fn test_parse_is_tolerant() {
        let id: RefId = "stock_transfer#T-77".parse().expect("parse");
        assert_eq!(id.ref_type, RefType::StockTransfer);
        assert_eq!(id.key, RefKey::Text("T-77".into()));

        let id: RefId = "legacy_sync#12".parse().expect("parse");
        assert_eq!(id.ref_type, RefType::Other("legacy_sync".into()));
        assert!(!id.ref_type.is_reserved());
        assert_eq!(id.key, RefKey::Number(12));

        // Everything after the first '#' belongs to the key.
        let id: RefId = "order#a#b".parse().expect("parse");
        assert_eq!(id.key, RefKey::Text("a#b".into()));
        assert_eq!(id.to_string(), "order#a#b");
    }

    #[test]
    fn test_leading_zero_key_stays_text() {
        let id: RefId = "order#007".parse().expect("parse");
        assert_eq!(id.key, RefKey::Text("007".into()));
        assert_eq!(id.to_string(), "order#007");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["order", "#1", "order#", ""] {
            assert!(matches!(
                bad.parse::<RefId>(),
                Err(LedgerError::InvalidRefId(_))
            ));
        }
    }

    #[test]
    fn test_serde_as_string() {
        let id = RefId::new(RefType::Expense, 3);
        let json = serde_json::to_string(&id).expect("encode");
        assert_eq!(json, "\"expense#3\"");
        let back: RefId = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, id);
    }
}
