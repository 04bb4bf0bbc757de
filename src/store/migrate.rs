//! Engine-neutral migration planning.
//!
//! Both backends share one algorithm: inspect the existing column set, then
//! either create the table fresh, leave it alone, or rebuild it through a
//! shadow-table copy. The copy technique is the lowest common capability
//! (the embedded engine cannot drop columns in place), so the plan computed
//! here is executed identically by both, each in its own SQL dialect.

use std::collections::BTreeSet;

use super::CANONICAL_COLUMNS;

#[derive(Debug)]
pub enum SchemaAction {
    /// No `users` table exists; create the canonical shape directly.
    CreateFresh,
    /// Column set already matches canonical; structural no-op.
    UpToDate,
    /// Column set differs; rebuild via shadow-table copy.
    Rebuild { copy: Vec<CopyColumn> },
}

#[derive(Debug)]
pub struct CopyColumn {
    pub name: &'static str,
    pub source: CopySource,
}

#[derive(Debug)]
pub enum CopySource {
    /// Present in the old table; copy forward.
    Existing,
    /// Absent in the old table; default to the empty string.
    EmptyText,
}

/// Decide what `ensure_schema` must do given the observed column names.
/// `None` means the table does not exist at all.
pub fn plan(existing: Option<&[String]>) -> SchemaAction {
    let Some(existing) = existing else {
        return SchemaAction::CreateFresh;
    };
    let have: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    let want: BTreeSet<&str> = CANONICAL_COLUMNS.iter().copied().collect();
    if have == want {
        return SchemaAction::UpToDate;
    }
    let copy = CANONICAL_COLUMNS
        .iter()
        .filter_map(|&column| {
            if have.contains(column) {
                Some(CopyColumn {
                    name: column,
                    source: CopySource::Existing,
                })
            } else if column == "id" {
                // Old table never assigned ids; let the engine number rows.
                None
            } else {
                Some(CopyColumn {
                    name: column,
                    source: CopySource::EmptyText,
                })
            }
        })
        .collect();
    SchemaAction::Rebuild { copy }
}

/// Destination column list and matching SELECT expressions for the shadow
/// copy. COALESCE folds legacy NULLs into the non-null canonical shape; the
/// `id` column, when present, is copied raw.
pub fn copy_lists(copy: &[CopyColumn]) -> (String, String) {
    let columns: Vec<&str> = copy.iter().map(|c| c.name).collect();
    let exprs: Vec<String> = copy
        .iter()
        .map(|c| match c.source {
            CopySource::Existing if c.name == "id" => "id".to_string(),
            CopySource::Existing => format!("COALESCE({}, '')", c.name),
            CopySource::EmptyText => "''".to_string(),
        })
        .collect();
    (columns.join(", "), exprs.join(", "))
}
