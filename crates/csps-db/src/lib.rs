pub mod ddl;
pub mod driver;
pub mod history;
pub mod migrations;

pub use ddl::{
    ColumnDef, ColumnType, DefaultValue, Dialect, ForeignKey, ReferentialAction, SchemaChange,
    TableDef,
};
pub use driver::{MigrationDriver, MySqlDriver, SqliteDriver, connect};
pub use migrations::{
    AppliedMigration, Guard, MigrationStatus, MigrationUnit, Migrator, MigratorSettings,
    PlannedMigration, RunReport, Step, Target,
};
