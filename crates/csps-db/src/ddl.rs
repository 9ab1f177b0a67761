//! Typed DDL statements.
//!
//! MySQL is the canonical rendering (`Display`), with backtick-quoted
//! identifiers. SQLite renders table and index statements directly; column
//! and constraint changes have no single-statement form there and are carried
//! out by rebuilding the table from a [`TableDef`] (see [`TableDef::apply`]).

use std::fmt;
use std::str::FromStr;

use csps_common::{Error, Result};

/// SQL flavour a statement is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Type name passed through as written, e.g. `varchar(255)`.
    Raw(String),
    /// MySQL `enum (...)`; plain `TEXT` on SQLite.
    Enum(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    /// Raw SQL expression, e.g. `0` or `'planifiee'`.
    Expr(String),
    /// Current time; `on_update` also refreshes it on every update (MySQL only).
    CurrentTimestamp { on_update: bool },
}

/// A column definition as it appears in `ADD`, `MODIFY` and `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub auto_increment: bool,
    /// Position for `ADD`: place the column right after this one.
    pub after: Option<String>,
}

impl ColumnDef {
    /// A `NOT NULL` column of the given SQL type.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self::with_type(name, ColumnType::Raw(sql_type.into()))
    }

    /// An enum column whose allowed values are `values`.
    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values.into_iter().map(|v| v.as_ref().to_string()).collect();
        Self::with_type(name, ColumnType::Enum(values))
    }

    fn with_type(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            auto_increment: false,
            after: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(DefaultValue::Expr(expr.into()));
        self
    }

    /// Default to a string literal, quoted.
    pub fn default_str(self, value: &str) -> Self {
        self.default(quote_literal(value))
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::CurrentTimestamp { on_update: false });
        self
    }

    pub fn default_now_on_update(mut self) -> Self {
        self.default = Some(DefaultValue::CurrentTimestamp { on_update: true });
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn after(mut self, column: impl Into<String>) -> Self {
        self.after = Some(column.into());
        self
    }

    /// The definition without its `AFTER` placement.
    fn unplaced(&self) -> Self {
        Self {
            after: None,
            ..self.clone()
        }
    }

    /// `(6)` for `datetime(6)`; the precision `CURRENT_TIMESTAMP` must match in MySQL.
    fn fractional_precision(&self) -> &str {
        match &self.column_type {
            ColumnType::Raw(t) if t.starts_with("datetime") || t.starts_with("timestamp") => {
                t.find('(').map_or("", |i| &t[i..])
            }
            _ => "",
        }
    }

    pub fn render(&self, dialect: Dialect) -> String {
        let mut out = format!("{} ", quote_ident(&self.name, dialect));
        match (dialect, &self.column_type) {
            (Dialect::MySql, ColumnType::Raw(t)) => out.push_str(t),
            (Dialect::MySql, ColumnType::Enum(values)) => {
                let values: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                out.push_str(&format!("enum ({})", values.join(", ")));
            }
            // an INTEGER primary key is SQLite's rowid alias, which auto-assigns
            (Dialect::Sqlite, _) if self.auto_increment => out.push_str("INTEGER"),
            (Dialect::Sqlite, ColumnType::Raw(t)) => out.push_str(t),
            (Dialect::Sqlite, ColumnType::Enum(_)) => out.push_str("TEXT"),
        }

        match dialect {
            Dialect::MySql => out.push_str(if self.nullable { " NULL" } else { " NOT NULL" }),
            Dialect::Sqlite if !self.nullable => out.push_str(" NOT NULL"),
            Dialect::Sqlite => {}
        }

        match (&self.default, dialect) {
            (None, _) => {}
            (Some(DefaultValue::Expr(expr)), _) => out.push_str(&format!(" DEFAULT {expr}")),
            (Some(DefaultValue::CurrentTimestamp { on_update }), Dialect::MySql) => {
                let fsp = self.fractional_precision();
                out.push_str(&format!(" DEFAULT CURRENT_TIMESTAMP{fsp}"));
                if *on_update {
                    out.push_str(&format!(" ON UPDATE CURRENT_TIMESTAMP{fsp}"));
                }
            }
            (Some(DefaultValue::CurrentTimestamp { .. }), Dialect::Sqlite) => {
                out.push_str(" DEFAULT CURRENT_TIMESTAMP");
            }
        }

        if self.auto_increment && dialect == Dialect::MySql {
            out.push_str(" AUTO_INCREMENT");
        }
        out
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(Dialect::MySql))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        })
    }
}

impl FromStr for ReferentialAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CASCADE" => Ok(ReferentialAction::Cascade),
            "SET NULL" => Ok(ReferentialAction::SetNull),
            "RESTRICT" => Ok(ReferentialAction::Restrict),
            "NO ACTION" => Ok(ReferentialAction::NoAction),
            other => Err(Error::Database(format!("unsupported referential action: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Constraint name. SQLite does not keep it; keys there are matched by column.
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ForeignKey {
    /// A key on `column` referencing `table`.`id`.
    pub fn new(name: impl Into<String>, column: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            references_table: table.into(),
            references_column: "id".to_string(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    fn same_key(&self, other: &ForeignKey) -> bool {
        self.column == other.column && self.references_table == other.references_table
    }

    fn render(&self, dialect: Dialect) -> String {
        let constraint = match dialect {
            Dialect::MySql => format!("CONSTRAINT {} ", quote_ident(&self.name, dialect)),
            Dialect::Sqlite => String::new(),
        };
        format!(
            "{constraint}FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {} ON UPDATE {}",
            quote_ident(&self.column, dialect),
            quote_ident(&self.references_table, dialect),
            quote_ident(&self.references_column, dialect),
            self.on_delete,
            self.on_update
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key.push(column.into());
        self
    }

    pub fn foreign_key(mut self, key: ForeignKey) -> Self {
        self.foreign_keys.push(key);
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn position(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| Error::NotFound(format!("column `{column}` in table `{}`", self.name)))
    }

    /// Apply a column or foreign key change to this definition. Table and
    /// index statements are rejected; they never need a rebuild.
    pub fn apply(&mut self, change: &SchemaChange) -> Result<()> {
        match change {
            SchemaChange::AddColumn { column, .. } => {
                if self.position(&column.name).is_ok() {
                    return Err(Error::Database(format!(
                        "column `{}` already exists in table `{}`",
                        column.name, self.name
                    )));
                }
                let at = match &column.after {
                    Some(after) => self.position(after)? + 1,
                    None => self.columns.len(),
                };
                self.columns.insert(at, column.unplaced());
            }
            SchemaChange::DropColumn { column, .. } => {
                let at = self.position(column)?;
                self.columns.remove(at);
                self.foreign_keys.retain(|k| &k.column != column);
            }
            SchemaChange::ModifyColumn { column, .. } => {
                let at = self.position(&column.name)?;
                self.columns[at] = column.unplaced();
            }
            SchemaChange::AddForeignKey { key, .. } => self.foreign_keys.push(key.clone()),
            SchemaChange::DropForeignKey { key, .. } => {
                let before = self.foreign_keys.len();
                self.foreign_keys.retain(|k| !k.same_key(key));
                if self.foreign_keys.len() == before {
                    return Err(Error::NotFound(format!(
                        "foreign key on `{}`.`{}`",
                        self.name, key.column
                    )));
                }
            }
            other => {
                return Err(Error::Other(format!(
                    "`{other}` does not alter a table definition"
                )));
            }
        }
        Ok(())
    }

    pub fn create_sql(&self, dialect: Dialect) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.render(dialect)).collect();
        if !self.primary_key.is_empty() {
            parts.push(format!(
                "PRIMARY KEY ({})",
                ident_list(&self.primary_key, dialect)
            ));
        }
        let mut keys: Vec<&ForeignKey> = self.foreign_keys.iter().collect();
        if dialect == Dialect::Sqlite {
            // pragma_foreign_key_list does not preserve declaration order
            keys.sort_by(|a, b| {
                (&a.column, &a.references_table).cmp(&(&b.column, &b.references_table))
            });
        }
        parts.extend(keys.into_iter().map(|k| k.render(dialect)));

        let body = format!(
            "CREATE TABLE {} ({})",
            quote_ident(&self.name, dialect),
            parts.join(", ")
        );
        match dialect {
            Dialect::MySql => format!("{body} ENGINE=InnoDB"),
            Dialect::Sqlite => body,
        }
    }
}

/// One DDL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    /// Change type or nullability in place.
    ModifyColumn { table: String, column: ColumnDef },
    DropIndex { table: String, name: String },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    CreateTable(TableDef),
    DropTable { table: String },
    AddForeignKey { table: String, key: ForeignKey },
    /// MySQL drops by constraint name, SQLite by column.
    DropForeignKey { table: String, key: ForeignKey },
}

impl SchemaChange {
    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaChange::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SchemaChange::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn modify_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaChange::ModifyColumn {
            table: table.into(),
            column,
        }
    }

    /// Replace the allowed value set and default of an enum column.
    pub fn alter_enum<I, S>(
        table: impl Into<String>,
        column: impl Into<String>,
        values: I,
        default: &str,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SchemaChange::modify_column(
            table,
            ColumnDef::enumeration(column, values).default_str(default),
        )
    }

    pub fn drop_index(table: impl Into<String>, name: impl Into<String>) -> Self {
        SchemaChange::DropIndex {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn create_index(
        table: impl Into<String>,
        name: impl Into<String>,
        column: impl Into<String>,
        unique: bool,
    ) -> Self {
        SchemaChange::CreateIndex {
            table: table.into(),
            name: name.into(),
            columns: vec![column.into()],
            unique,
        }
    }

    pub fn drop_table(table: impl Into<String>) -> Self {
        SchemaChange::DropTable {
            table: table.into(),
        }
    }

    pub fn add_foreign_key(table: impl Into<String>, key: ForeignKey) -> Self {
        SchemaChange::AddForeignKey {
            table: table.into(),
            key,
        }
    }

    pub fn drop_foreign_key(table: impl Into<String>, key: ForeignKey) -> Self {
        SchemaChange::DropForeignKey {
            table: table.into(),
            key,
        }
    }

    /// The table this change touches.
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable(def) => &def.name,
            SchemaChange::AddColumn { table, .. }
            | SchemaChange::DropColumn { table, .. }
            | SchemaChange::ModifyColumn { table, .. }
            | SchemaChange::DropIndex { table, .. }
            | SchemaChange::CreateIndex { table, .. }
            | SchemaChange::DropTable { table }
            | SchemaChange::AddForeignKey { table, .. }
            | SchemaChange::DropForeignKey { table, .. } => table,
        }
    }

    /// The single statement for `dialect`, or `None` when the change needs a
    /// table rebuild there.
    pub fn to_sql(&self, dialect: Dialect) -> Option<String> {
        match dialect {
            Dialect::MySql => Some(self.mysql()),
            Dialect::Sqlite => self.sqlite(),
        }
    }

    fn mysql(&self) -> String {
        let d = Dialect::MySql;
        match self {
            SchemaChange::AddColumn { table, column } => {
                let mut sql = format!("ALTER TABLE {} ADD {column}", quote_ident(table, d));
                if let Some(after) = &column.after {
                    sql.push_str(&format!(" AFTER {}", quote_ident(after, d)));
                }
                sql
            }
            SchemaChange::DropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table, d),
                quote_ident(column, d)
            ),
            SchemaChange::ModifyColumn { table, column } => {
                format!("ALTER TABLE {} MODIFY {column}", quote_ident(table, d))
            }
            SchemaChange::DropIndex { table, name } => {
                format!("DROP INDEX {} ON {}", quote_ident(name, d), quote_ident(table, d))
            }
            SchemaChange::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => index_sql(table, name, columns, *unique, d),
            SchemaChange::CreateTable(table) => table.create_sql(d),
            SchemaChange::DropTable { table } => format!("DROP TABLE {}", quote_ident(table, d)),
            SchemaChange::AddForeignKey { table, key } => {
                format!("ALTER TABLE {} ADD {}", quote_ident(table, d), key.render(d))
            }
            SchemaChange::DropForeignKey { table, key } => format!(
                "ALTER TABLE {} DROP FOREIGN KEY {}",
                quote_ident(table, d),
                quote_ident(&key.name, d)
            ),
        }
    }

    fn sqlite(&self) -> Option<String> {
        let d = Dialect::Sqlite;
        match self {
            SchemaChange::CreateTable(table) => Some(table.create_sql(d)),
            SchemaChange::DropTable { table } => Some(format!("DROP TABLE {}", quote_ident(table, d))),
            SchemaChange::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => Some(index_sql(table, name, columns, *unique, d)),
            SchemaChange::DropIndex { name, .. } => Some(format!("DROP INDEX {}", quote_ident(name, d))),
            SchemaChange::AddColumn { .. }
            | SchemaChange::DropColumn { .. }
            | SchemaChange::ModifyColumn { .. }
            | SchemaChange::AddForeignKey { .. }
            | SchemaChange::DropForeignKey { .. } => None,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mysql())
    }
}

/// Quote an identifier for `dialect`, doubling embedded quote characters.
pub fn quote_ident(name: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

fn index_sql(table: &str, name: &str, columns: &[String], unique: bool, d: Dialect) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        quote_ident(name, d),
        quote_ident(table, d),
        ident_list(columns, d)
    )
}

fn ident_list(names: &[String], dialect: Dialect) -> String {
    names
        .iter()
        .map(|n| quote_ident(n, dialect))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
