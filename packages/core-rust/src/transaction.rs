//! Transaction records as exchanged with the remote API.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` to match the JSON
//! produced by the transaction service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Income,
    Outcome,
}

/// A single transaction record.
///
/// `id` is absent until the server has created the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub price: f64,
    pub category: String,
    /// Older service builds send this field as `data`.
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
}

impl Transaction {
    /// Creates an unsaved record (no id, no date).
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        price: f64,
        category: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: None,
            title: title.into(),
            price,
            category: category.into(),
            date: None,
            kind,
        }
    }

    /// Sets the id (builder style).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Returns `true` if this record carries the given id.
    #[must_use]
    pub fn has_id(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }

    /// Returns a copy with every field present in `patch` overwritten.
    #[must_use]
    pub fn merged(&self, patch: &TransactionPatch) -> Self {
        let mut next = self.clone();
        if let Some(title) = &patch.title {
            next.title.clone_from(title);
        }
        if let Some(price) = patch.price {
            next.price = price;
        }
        if let Some(category) = &patch.category {
            next.category.clone_from(category);
        }
        if let Some(date) = patch.date {
            next.date = Some(date);
        }
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        next
    }
}

/// Partial record sent with an update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionKind>,
}

impl TransactionPatch {
    /// Returns `true` if the patch would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Aggregated totals across every transaction on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_income: f64,
    pub total_outcome: f64,
    pub total_transactions: u64,
}

impl Summary {
    /// Income minus outcome.
    #[must_use]
    pub fn balance(&self) -> f64 {
        self.total_income - self.total_outcome
    }
}
