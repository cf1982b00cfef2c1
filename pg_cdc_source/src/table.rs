use std::fmt;

use pg_escape::quote_identifier;
use tokio_postgres::types::Type;

/// A fully qualified table identity: database, schema and table name.
///
/// Stable for the lifetime of a job and usable as a map key across the
/// split bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub database: String,
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        name: impl Into<String>,
    ) -> TableRef {
        TableRef {
            database: database.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the table reference as a quoted identifier usable in SQL.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}.{}",
            quote_identifier(&self.database),
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{0}.{1}.{2}",
            self.database, self.schema, self.name
        ))
    }
}

type TypeModifier = i32;

/// The structure of a single column at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub typ: Type,
    pub modifier: TypeModifier,
    pub nullable: bool,
    pub primary: bool,
}

impl ColumnDescriptor {
    pub fn new(
        name: impl Into<String>,
        typ: Type,
        modifier: TypeModifier,
        nullable: bool,
        primary: bool,
    ) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.into(),
            typ,
            modifier,
            nullable,
            primary,
        }
    }
}

/// An immutable capture of a table's structure at a point in time.
///
/// Streaming splits carry these so that log records can be decoded without a
/// live schema fetch. DDL text is carried separately on the split and is not
/// part of this capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchemaSnapshot {
    pub table: TableRef,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchemaSnapshot {
    pub fn new(table: TableRef, columns: Vec<ColumnDescriptor>) -> TableSchemaSnapshot {
        TableSchemaSnapshot { table, columns }
    }

    pub fn has_primary_keys(&self) -> bool {
        self.columns.iter().any(|c| c.primary)
    }
}
