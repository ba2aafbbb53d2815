//! Immutable schema snapshots: tables, columns and secondary indexes.
//!
//! A [`Schema`] is built once and never mutated; DDL produces a new snapshot
//! that reuses the ids of entities carried over from the previous one, so a
//! `TableId` or `IndexId` stays stable across schema generations. Readers pin
//! an `Arc<Schema>` for the lifetime of their transaction.

use meridian_types::{ColumnId, Error, IndexId, Result, SortOrder, TableId, Type};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod catalog;

pub use catalog::VersionedCatalog;

/// A column definition inside a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Stable column id.
    pub id: ColumnId,
    /// Column name, unique within the table.
    pub name: String,
    /// Declared type.
    pub ty: Type,
    /// Whether NULL is storable.
    pub nullable: bool,
    /// Position in the table's column list.
    pub ordinal: usize,
}

/// A key column reference: which column, and in which direction it sorts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyColumn {
    /// The referenced column.
    pub column: ColumnId,
    /// Sort direction of this key part.
    pub order: SortOrder,
}

/// A table definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Stable table id; also the keyspace id of the table's rows in storage.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<Column>,
    /// Primary-key columns, leftmost first.
    pub primary_key: Vec<KeyColumn>,
    /// Indexes defined on this table.
    pub indexes: Vec<IndexId>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_id: HashMap<ColumnId, usize>,
}

impl Table {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.by_name
            .get(name)
            .map(|&i| &self.columns[i])
            .ok_or_else(|| {
                Error::NotFound(format!("column {name} not found in table {}", self.name))
            })
    }

    /// Look up a column by id.
    pub fn column_by_id(&self, id: ColumnId) -> Result<&Column> {
        self.by_id.get(&id).map(|&i| &self.columns[i]).ok_or_else(|| {
            Error::Internal(format!("column {id} missing from table {}", self.name))
        })
    }

    /// Ids of every column, in ordinal order.
    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.id).collect()
    }

    /// Whether `id` is one of the primary-key columns.
    pub fn is_key_column(&self, id: ColumnId) -> bool {
        self.primary_key.iter().any(|kc| kc.column == id)
    }

    /// Position of `id` within the primary key, if any.
    pub fn key_position(&self, id: ColumnId) -> Option<usize> {
        self.primary_key.iter().position(|kc| kc.column == id)
    }

    fn rebuild_lookup(&mut self) {
        self.by_name = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        self.by_id = self.columns.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
    }
}

/// A secondary-index definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Stable index id.
    pub id: IndexId,
    /// Index name, unique within the schema.
    pub name: String,
    /// The indexed base table.
    pub base_table: TableId,
    /// Keyspace id under which the index entries are stored.
    pub data_table: TableId,
    /// Indexed columns with their sort directions.
    pub key_columns: Vec<KeyColumn>,
    /// Covering columns copied into each entry.
    pub stored_columns: Vec<ColumnId>,
    /// Whether rows with a NULL indexed column are omitted.
    pub null_filtered: bool,
    /// Whether indexed-column tuples must be unique across live entries.
    pub unique: bool,
}

impl Index {
    /// Whether `id` is one of the indexed key columns.
    pub fn has_key_column(&self, id: ColumnId) -> bool {
        self.key_columns.iter().any(|kc| kc.column == id)
    }
}

/// An immutable schema snapshot.
#[derive(Debug, Default)]
pub struct Schema {
    generation: u64,
    next_id: u64,
    tables: Vec<Table>,
    indexes: Vec<Index>,
    tables_by_name: HashMap<String, usize>,
    tables_by_id: HashMap<TableId, usize>,
    indexes_by_name: HashMap<String, usize>,
    indexes_by_id: HashMap<IndexId, usize>,
}

impl Schema {
    /// Start building a schema from scratch.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            base: None,
            tables: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Start building the successor of `base`; entities with unchanged names
    /// keep their ids.
    pub fn evolve(base: &Arc<Schema>) -> SchemaBuilder {
        SchemaBuilder {
            base: Some(Arc::clone(base)),
            tables: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Monotonic schema generation number, starting at 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All tables.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// All indexes.
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables_by_name
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| Error::NotFound(format!("table {name} not found")))
    }

    /// Look up a table by id.
    pub fn table_by_id(&self, id: TableId) -> Result<&Table> {
        self.tables_by_id
            .get(&id)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| Error::Internal(format!("{id} missing from schema")))
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Result<&Index> {
        self.indexes_by_name
            .get(name)
            .map(|&i| &self.indexes[i])
            .ok_or_else(|| Error::NotFound(format!("index {name} not found")))
    }

    /// Look up an index by id.
    pub fn index_by_id(&self, id: IndexId) -> Result<&Index> {
        self.indexes_by_id
            .get(&id)
            .map(|&i| &self.indexes[i])
            .ok_or_else(|| Error::Internal(format!("{id} missing from schema")))
    }

    /// Indexes defined on the given table.
    pub fn indexes_of(&self, table: TableId) -> Vec<&Index> {
        self.indexes.iter().filter(|ix| ix.base_table == table).collect()
    }
}

/// Column description handed to [`SchemaBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub ty: Type,
    /// Whether NULL is storable. Defaults to `true`.
    pub nullable: bool,
}

impl ColumnDef {
    /// A nullable column.
    pub fn new(name: &str, ty: Type) -> Self {
        ColumnDef {
            name: name.to_owned(),
            ty,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table description handed to [`SchemaBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Column definitions in ordinal order.
    pub columns: Vec<ColumnDef>,
    /// Primary-key column names with directions, leftmost first.
    pub primary_key: Vec<(String, SortOrder)>,
}

impl TableDef {
    /// A table with no columns yet.
    pub fn new(name: &str) -> Self {
        TableDef {
            name: name.to_owned(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Append a column.
    pub fn column(mut self, def: ColumnDef) -> Self {
        self.columns.push(def);
        self
    }

    /// Append an ascending primary-key column.
    pub fn primary_key(mut self, name: &str) -> Self {
        self.primary_key.push((name.to_owned(), SortOrder::Ascending));
        self
    }

    /// Append a primary-key column with an explicit direction.
    pub fn primary_key_ordered(mut self, name: &str, order: SortOrder) -> Self {
        self.primary_key.push((name.to_owned(), order));
        self
    }
}

/// Index description handed to [`SchemaBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Base table name.
    pub table: String,
    /// Indexed column names with directions.
    pub columns: Vec<(String, SortOrder)>,
    /// Covering column names.
    pub stored: Vec<String>,
    /// Omit rows with NULL in any indexed column.
    pub null_filtered: bool,
    /// Enforce uniqueness of indexed-column tuples.
    pub unique: bool,
}

impl IndexDef {
    /// An index with no key columns yet.
    pub fn new(name: &str, table: &str) -> Self {
        IndexDef {
            name: name.to_owned(),
            table: table.to_owned(),
            columns: Vec::new(),
            stored: Vec::new(),
            null_filtered: false,
            unique: false,
        }
    }

    /// Append an ascending key column.
    pub fn column(mut self, name: &str) -> Self {
        self.columns.push((name.to_owned(), SortOrder::Ascending));
        self
    }

    /// Append a descending key column.
    pub fn column_desc(mut self, name: &str) -> Self {
        self.columns.push((name.to_owned(), SortOrder::Descending));
        self
    }

    /// Copy `name` into each entry.
    pub fn storing(mut self, name: &str) -> Self {
        self.stored.push(name.to_owned());
        self
    }

    /// Omit rows whose indexed projection contains NULL.
    pub fn null_filtered(mut self) -> Self {
        self.null_filtered = true;
        self
    }

    /// Enforce uniqueness.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Builder assembling an immutable [`Schema`], optionally evolving a base
/// snapshot.
#[derive(Debug)]
pub struct SchemaBuilder {
    base: Option<Arc<Schema>>,
    tables: Vec<TableDef>,
    indexes: Vec<IndexDef>,
}

impl SchemaBuilder {
    /// Add a table.
    pub fn table(mut self, def: TableDef) -> Self {
        self.tables.push(def);
        self
    }

    /// Add an index.
    pub fn index(mut self, def: IndexDef) -> Self {
        self.indexes.push(def);
        self
    }

    /// Validate the definitions and produce the snapshot.
    pub fn build(self) -> Result<Schema> {
        let mut next_id = self.base.as_ref().map(|s| s.next_id).unwrap_or(1);
        let mut alloc = |reused: Option<u64>| -> u64 {
            match reused {
                Some(id) => id,
                None => {
                    let id = next_id;
                    next_id += 1;
                    id
                }
            }
        };

        let mut schema = Schema {
            generation: self.base.as_ref().map(|s| s.generation + 1).unwrap_or(0),
            ..Schema::default()
        };

        for def in &self.tables {
            if schema.tables_by_name.contains_key(&def.name) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate table {}",
                    def.name
                )));
            }
            let base_table = self
                .base
                .as_ref()
                .and_then(|s| s.table(&def.name).ok().cloned());
            let table_id = TableId(alloc(base_table.as_ref().map(|t| t.id.0)));

            let mut table = Table {
                id: table_id,
                name: def.name.clone(),
                columns: Vec::with_capacity(def.columns.len()),
                primary_key: Vec::with_capacity(def.primary_key.len()),
                indexes: Vec::new(),
                by_name: HashMap::new(),
                by_id: HashMap::new(),
            };
            for (ordinal, col) in def.columns.iter().enumerate() {
                if table.columns.iter().any(|c| c.name == col.name) {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate column {} in table {}",
                        col.name, def.name
                    )));
                }
                let reused = base_table
                    .as_ref()
                    .and_then(|t| t.column(&col.name).ok().map(|c| c.id.0));
                table.columns.push(Column {
                    id: ColumnId(alloc(reused)),
                    name: col.name.clone(),
                    ty: col.ty,
                    nullable: col.nullable,
                    ordinal,
                });
            }
            table.rebuild_lookup();

            if def.primary_key.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "table {} has no primary key",
                    def.name
                )));
            }
            for (name, order) in &def.primary_key {
                let column = table.column(name).map_err(|_| {
                    Error::InvalidArgument(format!(
                        "primary key column {name} not found in table {}",
                        def.name
                    ))
                })?;
                table.primary_key.push(KeyColumn {
                    column: column.id,
                    order: *order,
                });
            }

            schema.tables_by_name.insert(table.name.clone(), schema.tables.len());
            schema.tables_by_id.insert(table.id, schema.tables.len());
            schema.tables.push(table);
        }

        for def in &self.indexes {
            if schema.indexes_by_name.contains_key(&def.name) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate index {}",
                    def.name
                )));
            }
            let base_index = self
                .base
                .as_ref()
                .and_then(|s| s.index(&def.name).ok().cloned());
            let table_pos = *schema.tables_by_name.get(&def.table).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "index {} references unknown table {}",
                    def.name, def.table
                ))
            })?;

            if def.columns.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "index {} has no key columns",
                    def.name
                )));
            }
            let mut key_columns = Vec::with_capacity(def.columns.len());
            let mut stored_columns = Vec::with_capacity(def.stored.len());
            {
                let table = &schema.tables[table_pos];
                for (name, order) in &def.columns {
                    let column = table.column(name).map_err(|_| {
                        Error::InvalidArgument(format!(
                            "index {} references unknown column {name}",
                            def.name
                        ))
                    })?;
                    key_columns.push(KeyColumn {
                        column: column.id,
                        order: *order,
                    });
                }
                for name in &def.stored {
                    let column = table.column(name).map_err(|_| {
                        Error::InvalidArgument(format!(
                            "index {} stores unknown column {name}",
                            def.name
                        ))
                    })?;
                    if key_columns.iter().any(|kc| kc.column == column.id) {
                        return Err(Error::InvalidArgument(format!(
                            "index {} stores key column {name}",
                            def.name
                        )));
                    }
                    stored_columns.push(column.id);
                }
            }

            let index = Index {
                id: IndexId(alloc(base_index.as_ref().map(|ix| ix.id.0))),
                name: def.name.clone(),
                base_table: schema.tables[table_pos].id,
                data_table: TableId(alloc(base_index.as_ref().map(|ix| ix.data_table.0))),
                key_columns,
                stored_columns,
                null_filtered: def.null_filtered,
                unique: def.unique,
            };
            schema.tables[table_pos].indexes.push(index.id);
            schema.indexes_by_name.insert(index.name.clone(), schema.indexes.len());
            schema.indexes_by_id.insert(index.id, schema.indexes.len());
            schema.indexes.push(index);
        }

        schema.next_id = next_id;
        Ok(schema)
    }
}
