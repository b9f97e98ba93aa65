//! Row and table value model.
//!
//! The value enum is kept protocol-neutral. Encoding for any transport
//! happens at the messenger boundary, so executor and engine logic stay
//! independent from wire format.

use std::fmt;

use kiln_common::ids::{DependencyId, TxnId};

/// One typed column value.
#[derive(Debug, Clone)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer column.
    Integer(i64),
    /// Double-precision float column. Compared bitwise so tables stay `Eq`.
    Double(f64),
    /// Variable-length text column.
    Text(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(left), Self::Integer(right)) => left == right,
            (Self::Double(left), Self::Double(right)) => left.to_bits() == right.to_bits(),
            (Self::Text(left), Self::Text(right)) => left == right,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

/// One table row.
pub type Row = Vec<Value>;

/// In-memory result or storage table: an ordered list of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    /// Rows in insertion order.
    pub rows: Vec<Row>,
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a table from rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Creates a one-row, one-column integer table, the common shape of
    /// aggregate fragment results.
    #[must_use]
    pub fn single_integer(value: i64) -> Self {
        Self {
            rows: vec![vec![Value::Integer(value)]],
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns whether the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result rows of one fragment batch, keyed by output dependency id in the
/// order the producing fragments were declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    /// Transaction the results belong to.
    pub txn_id: TxnId,
    /// `(dependency id, rows)` pairs in producing-fragment order.
    pub entries: Vec<(DependencyId, Table)>,
}

impl DependencySet {
    /// Creates a dependency set for one transaction.
    #[must_use]
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            entries: Vec::new(),
        }
    }

    /// Appends one produced dependency.
    pub fn push(&mut self, dep_id: DependencyId, table: Table) {
        self.entries.push((dep_id, table));
    }

    /// Number of produced dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no dependencies were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dependency ids in production order.
    #[must_use]
    pub fn dep_ids(&self) -> Vec<DependencyId> {
        self.entries.iter().map(|(dep_id, _)| *dep_id).collect()
    }
}
