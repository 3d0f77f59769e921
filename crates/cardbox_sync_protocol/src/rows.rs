//! Positional row types for chunked table transfer.
//!
//! Chunked tables cross the wire as JSON arrays in column order, exactly
//! as they sit in the collection database. The server only ever inspects
//! the identity, `mod` and `usn` columns; everything else passes through
//! untouched, so the rows are tuple structs with accessors for the three
//! columns that matter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `cards` row in wire column order:
/// `(id, nid, did, ord, mod, usn, type, queue, due, ivl, factor, reps,
/// lapses, left, odue, odid, flags, data)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRow(
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub String,
);

impl CardRow {
    /// Card id.
    pub fn id(&self) -> i64 {
        self.0
    }

    /// Modification timestamp.
    pub fn modified(&self) -> i64 {
        self.4
    }

    /// Update sequence number.
    pub fn usn(&self) -> i64 {
        self.5
    }
}

/// One `notes` row in wire column order:
/// `(id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data)`.
///
/// The sort field and field checksum are sent as empty strings and
/// recomputed by whichever side stores the row, so those two columns are
/// left loosely typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRow(
    pub i64,
    pub String,
    pub i64,
    pub i64,
    pub i64,
    pub String,
    pub String,
    pub Value,
    pub Value,
    pub i64,
    pub String,
);

impl NoteRow {
    /// Note id.
    pub fn id(&self) -> i64 {
        self.0
    }

    /// Modification timestamp.
    pub fn modified(&self) -> i64 {
        self.3
    }

    /// Update sequence number.
    pub fn usn(&self) -> i64 {
        self.4
    }

    /// The field payload, fields separated by `\x1f`.
    pub fn fields(&self) -> &str {
        &self.6
    }
}

/// One `revlog` row in wire column order:
/// `(id, cid, usn, ease, ivl, lastIvl, factor, time, type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevlogRow(
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
);

impl RevlogRow {
    /// Review id (epoch millis of the review).
    pub fn id(&self) -> i64 {
        self.0
    }

    /// Update sequence number.
    pub fn usn(&self) -> i64 {
        self.2
    }
}
