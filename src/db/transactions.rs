use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::error::{is_unique_violation, LedgerError};
use crate::util::{parse_time_column, to_db_time};

/// Label extras attached to one posting header, as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionLabels {
    pub shop_ids: Vec<u64>,
    pub cs_ids: Vec<u64>,
    pub supplier_ids: Vec<u64>,
    pub tag_ids: Vec<u64>,
    pub type_label_ids: Vec<u64>,
}

/// Label tables keyed by `(transaction_id, <label>)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTable {
    Shop,
    CustomerService,
    Supplier,
    Tag,
    TypeLabel,
}

impl LabelTable {
    fn table(&self) -> &'static str {
        match self {
            LabelTable::Shop => "transaction_shops",
            LabelTable::CustomerService => "transaction_customer_services",
            LabelTable::Supplier => "transaction_suppliers",
            LabelTable::Tag => "transaction_tags",
            LabelTable::TypeLabel => "transaction_type_labels",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            LabelTable::Shop => "shop_id",
            LabelTable::CustomerService => "cs_id",
            LabelTable::Supplier => "supplier_id",
            LabelTable::Tag => "tag_id",
            LabelTable::TypeLabel => "type_label_id",
        }
    }
}

impl LedgerDb {
    // =========================================================================
    // Posting headers
    // =========================================================================

    /// Persist a posting header. A reused `ref_id` fails with `DuplicateRefId`.
    pub fn insert_transaction(
        &self,
        ref_id: &str,
        team_id: u64,
        created_by_id: u64,
        desc: &str,
        created: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let result = self.conn.execute(
            "INSERT INTO transactions (ref_id, team_id, created_by_id, description, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ref_id,
                team_id as i64,
                created_by_id as i64,
                desc,
                to_db_time(created)
            ],
        );
        match result {
            Ok(_) => Ok(Transaction {
                id: self.last_id(),
                ref_id: ref_id.to_string(),
                team_id,
                created_by_id,
                desc: desc.to_string(),
                created,
            }),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateRefId(ref_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a posting header by its external reference.
    pub fn find_transaction_by_ref(
        &self,
        ref_id: &str,
    ) -> Result<Option<Transaction>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT id, ref_id, team_id, created_by_id, description, created
                 FROM transactions WHERE ref_id = ?1",
                params![ref_id],
                Self::map_transaction_row,
            )
            .optional()
    }

    /// Get a posting header by id.
    pub fn get_transaction(&self, id: u64) -> Result<Option<Transaction>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT id, ref_id, team_id, created_by_id, description, created
                 FROM transactions WHERE id = ?1",
                params![id as i64],
                Self::map_transaction_row,
            )
            .optional()
    }

    pub fn count_transactions(&self) -> Result<u64, rusqlite::Error> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn map_transaction_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
        let created_text: String = row.get(5)?;
        Ok(Transaction {
            id: row.get::<_, i64>(0)? as u64,
            ref_id: row.get(1)?,
            team_id: row.get::<_, i64>(2)? as u64,
            created_by_id: row.get::<_, i64>(3)? as u64,
            desc: row.get(4)?,
            created: parse_time_column(5, &created_text)?,
        })
    }

    // =========================================================================
    // Label extras
    // =========================================================================

    /// Attach a label to a posting. Attaching the same label twice is a no-op.
    pub fn attach_label(
        &self,
        table: LabelTable,
        transaction_id: u64,
        label_id: u64,
    ) -> Result<bool, rusqlite::Error> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO {} (transaction_id, {}) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                table.table(),
                table.column()
            ),
            params![transaction_id as i64, label_id as i64],
        )?;
        Ok(inserted > 0)
    }

    /// All label extras stored for a posting.
    pub fn get_transaction_labels(
        &self,
        transaction_id: u64,
    ) -> Result<TransactionLabels, rusqlite::Error> {
        Ok(TransactionLabels {
            shop_ids: self.label_ids(LabelTable::Shop, transaction_id)?,
            cs_ids: self.label_ids(LabelTable::CustomerService, transaction_id)?,
            supplier_ids: self.label_ids(LabelTable::Supplier, transaction_id)?,
            tag_ids: self.label_ids(LabelTable::Tag, transaction_id)?,
            type_label_ids: self.label_ids(LabelTable::TypeLabel, transaction_id)?,
        })
    }

    fn label_ids(&self, table: LabelTable, transaction_id: u64) -> Result<Vec<u64>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {col} FROM {tbl} WHERE transaction_id = ?1 ORDER BY {col}",
            col = table.column(),
            tbl = table.table()
        ))?;
        let rows = stmt.query_map(params![transaction_id as i64], |row| {
            row.get::<_, i64>(0).map(|id| id as u64)
        })?;
        rows.collect()
    }

    // =========================================================================
    // Tags and type labels
    // =========================================================================

    /// Get or create a tag by its already-normalised name.
    pub fn ensure_tag(&self, name: &str) -> Result<Tag, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO accounting_tags (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        self.conn.query_row(
            "SELECT id, name FROM accounting_tags WHERE name = ?1",
            params![name],
            |row| {
                Ok(Tag {
                    id: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                })
            },
        )
    }

    /// Get or create a structured type label.
    pub fn ensure_type_label(&self, key: &str, label: &str) -> Result<TypeLabel, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO type_labels (key, label) VALUES (?1, ?2) ON CONFLICT(key, label) DO NOTHING",
            params![key, label],
        )?;
        self.conn.query_row(
            "SELECT id, key, label FROM type_labels WHERE key = ?1 AND label = ?2",
            params![key, label],
            Self::map_type_label_row,
        )
    }

    /// Type labels registered under one key, ordered by label.
    pub fn get_type_labels(&self, key: &str) -> Result<Vec<TypeLabel>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, key, label FROM type_labels WHERE key = ?1 ORDER BY label")?;
        let rows = stmt.query_map(params![key], Self::map_type_label_row)?;
        rows.collect()
    }

    fn map_type_label_row(row: &Row<'_>) -> rusqlite::Result<TypeLabel> {
        Ok(TypeLabel {
            id: row.get::<_, i64>(0)? as u64,
            key: row.get(1)?,
            label: row.get(2)?,
        })
    }
}
