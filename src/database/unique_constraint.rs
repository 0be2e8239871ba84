use sea_orm::{DbErr, SqlErr};

/// Whether `db_err` is a unique constraint violation.
///
/// Inserts guarded by a unique index use this to turn a lost race into a
/// read of the row that won.
pub fn is_unique_violation(db_err: &DbErr) -> bool {
    matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}
