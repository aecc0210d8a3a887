//! Shared plumbing for the sqlx-backed engines.
//!
//! Both SQL engines keep every record in one engine-owned table keyed by
//! `(record_tag, record_key)` with the JSON body stored as text. The table is
//! created when a session first opens.

use serde_json::Value;
use sqlx::error::ErrorKind as SqlxErrorKind;

use crate::error::{FailureKind, StorageFailure};

/// Statement text for one SQL dialect
pub(crate) struct Dialect {
    pub create_table: &'static str,
    pub select_one: &'static str,
    pub select_all: &'static str,
    pub select_window: &'static str,
    pub count: &'static str,
    pub insert: &'static str,
    /// Binds body first, then tag and key
    pub update: &'static str,
    pub delete: &'static str,
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS dal_records (
    record_tag TEXT NOT NULL,
    record_key TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (record_tag, record_key)
)";

#[cfg(feature = "sqlite")]
pub(crate) const SQLITE: Dialect = Dialect {
    create_table: CREATE_TABLE,
    select_one: "SELECT body FROM dal_records WHERE record_tag = ? AND record_key = ?",
    select_all: "SELECT body FROM dal_records WHERE record_tag = ? ORDER BY record_key",
    select_window:
        "SELECT body FROM dal_records WHERE record_tag = ? ORDER BY record_key LIMIT ? OFFSET ?",
    count: "SELECT COUNT(*) FROM dal_records WHERE record_tag = ?",
    insert: "INSERT INTO dal_records (record_tag, record_key, body) VALUES (?, ?, ?)",
    update: "UPDATE dal_records SET body = ? WHERE record_tag = ? AND record_key = ?",
    delete: "DELETE FROM dal_records WHERE record_tag = ? AND record_key = ?",
};

#[cfg(feature = "postgres")]
pub(crate) const POSTGRES: Dialect = Dialect {
    create_table: CREATE_TABLE,
    select_one: "SELECT body FROM dal_records WHERE record_tag = $1 AND record_key = $2",
    select_all: "SELECT body FROM dal_records WHERE record_tag = $1 ORDER BY record_key",
    select_window:
        "SELECT body FROM dal_records WHERE record_tag = $1 ORDER BY record_key LIMIT $2 OFFSET $3",
    count: "SELECT COUNT(*) FROM dal_records WHERE record_tag = $1",
    insert: "INSERT INTO dal_records (record_tag, record_key, body) VALUES ($1, $2, $3)",
    update: "UPDATE dal_records SET body = $1 WHERE record_tag = $2 AND record_key = $3",
    delete: "DELETE FROM dal_records WHERE record_tag = $1 AND record_key = $2",
};

/// Classify a driver error by SQLSTATE or SQLite result code
pub(crate) fn classify(operation: &str, err: sqlx::Error) -> StorageFailure {
    let kind = failure_kind(&err);
    StorageFailure::with_source(kind, format!("{operation} failed: {err}"), err)
}

fn failure_kind(err: &sqlx::Error) -> FailureKind {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            if let Some(kind) = code.as_deref().and_then(transient_code_kind) {
                return kind;
            }
            match db.kind() {
                SqlxErrorKind::UniqueViolation
                | SqlxErrorKind::ForeignKeyViolation
                | SqlxErrorKind::NotNullViolation
                | SqlxErrorKind::CheckViolation => FailureKind::ConstraintViolation,
                _ => match code.as_deref() {
                    Some(code) if code.starts_with("23") => FailureKind::ConstraintViolation,
                    Some(code) if code.starts_with("42") => FailureKind::InvalidQuery,
                    _ => FailureKind::Other,
                },
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => FailureKind::ConnectionReset,
        sqlx::Error::PoolTimedOut => FailureKind::Timeout,
        sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => FailureKind::Configuration,
        sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => FailureKind::InvalidQuery,
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => FailureKind::Encoding,
        _ => FailureKind::Other,
    }
}

/// Transient SQLSTATE or SQLite (extended) result codes
fn transient_code_kind(code: &str) -> Option<FailureKind> {
    let kind = match code {
        // postgres
        "40001" => FailureKind::SerializationConflict,
        "40P01" => FailureKind::Deadlock,
        "57014" | "55P03" => FailureKind::Timeout,
        "57P01" | "53300" => FailureKind::ConnectionReset,
        code if code.starts_with("08") => FailureKind::ConnectionReset,
        // sqlite: BUSY, BUSY_RECOVERY, BUSY_SNAPSHOT, BUSY_TIMEOUT
        "5" | "261" | "517" | "773" => FailureKind::SerializationConflict,
        // sqlite: LOCKED, LOCKED_SHAREDCACHE
        "6" | "262" => FailureKind::Deadlock,
        _ => return None,
    };
    Some(kind)
}

pub(crate) fn encode_body(body: &Value) -> Result<String, StorageFailure> {
    serde_json::to_string(body).map_err(|e| {
        StorageFailure::with_source(FailureKind::Encoding, "record body is not valid JSON", e)
    })
}

pub(crate) fn decode_body(text: &str) -> Result<Value, StorageFailure> {
    serde_json::from_str(text).map_err(|e| {
        StorageFailure::with_source(FailureKind::Encoding, "stored record body is not valid JSON", e)
    })
}

/// Generates a `StorageSession` over one sqlx pool type and dialect
macro_rules! record_session {
    ($session:ident, $db:ty, $dialect:expr, $engine:literal) => {
        pub struct $session {
            pool: ::sqlx::Pool<$db>,
            schema: ::tokio::sync::OnceCell<()>,
            opened: ::std::sync::atomic::AtomicBool,
            max_connections: u32,
        }

        impl $session {
            pub(crate) fn new(pool: ::sqlx::Pool<$db>, max_connections: u32) -> Self {
                Self {
                    pool,
                    schema: ::tokio::sync::OnceCell::new(),
                    opened: ::std::sync::atomic::AtomicBool::new(false),
                    max_connections,
                }
            }

            fn ensure_not_missing(
                mutation: &$crate::engine::Mutation,
                rows_affected: u64,
            ) -> Result<(), $crate::error::StorageFailure> {
                if rows_affected == 0 {
                    return Err($crate::error::StorageFailure::new(
                        $crate::error::FailureKind::MissingRecord,
                        format!(
                            "cannot {} missing record '{}' in '{}'",
                            mutation.verb(),
                            mutation.key,
                            mutation.tag
                        ),
                    ));
                }
                Ok(())
            }
        }

        #[::async_trait::async_trait]
        impl $crate::engine::StorageSession for $session {
            async fn open(&self) -> Result<(), $crate::error::StorageFailure> {
                use $crate::engine::sql::classify;

                self.schema
                    .get_or_try_init(|| async {
                        ::sqlx::query($dialect.create_table)
                            .execute(&self.pool)
                            .await
                            .map(|_| ())
                    })
                    .await
                    .map_err(|e| classify("open", e))?;

                if !self.opened.swap(true, ::std::sync::atomic::Ordering::SeqCst) {
                    ::tracing::info!(engine = $engine, "Storage session opened");
                }
                Ok(())
            }

            fn is_open(&self) -> bool {
                self.opened.load(::std::sync::atomic::Ordering::SeqCst) && !self.pool.is_closed()
            }

            async fn fetch(
                &self,
                tag: &str,
                key: &str,
            ) -> Result<Option<::serde_json::Value>, $crate::error::StorageFailure> {
                use $crate::engine::sql::{classify, decode_body};

                let body: Option<String> = ::sqlx::query_scalar($dialect.select_one)
                    .bind(tag)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| classify("fetch", e))?;

                body.as_deref().map(decode_body).transpose()
            }

            async fn scan(
                &self,
                tag: &str,
                window: Option<&$crate::pagination::Pagination>,
            ) -> Result<Vec<::serde_json::Value>, $crate::error::StorageFailure> {
                use $crate::engine::sql::{classify, decode_body};

                let bodies: Vec<String> = match window {
                    Some(window) => ::sqlx::query_scalar($dialect.select_window)
                        .bind(tag)
                        .bind(i64::from(window.limit))
                        .bind(i64::from(window.offset))
                        .fetch_all(&self.pool)
                        .await,
                    None => ::sqlx::query_scalar($dialect.select_all)
                        .bind(tag)
                        .fetch_all(&self.pool)
                        .await,
                }
                .map_err(|e| classify("scan", e))?;

                bodies.iter().map(|body| decode_body(body)).collect()
            }

            async fn count(&self, tag: &str) -> Result<u64, $crate::error::StorageFailure> {
                use $crate::engine::sql::classify;

                let count: i64 = ::sqlx::query_scalar($dialect.count)
                    .bind(tag)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| classify("count", e))?;

                Ok(count.max(0) as u64)
            }

            async fn apply(
                &self,
                batch: &[$crate::engine::Mutation],
            ) -> Result<u64, $crate::error::StorageFailure> {
                use $crate::engine::sql::{classify, encode_body};
                use $crate::engine::MutationOp;

                let mut tx = self.pool.begin().await.map_err(|e| classify("begin", e))?;
                let mut affected = 0u64;

                for mutation in batch {
                    let result = match &mutation.op {
                        MutationOp::Insert(body) => {
                            ::sqlx::query($dialect.insert)
                                .bind(mutation.tag.as_str())
                                .bind(mutation.key.as_str())
                                .bind(encode_body(body)?)
                                .execute(&mut *tx)
                                .await
                        }
                        MutationOp::Update(body) => {
                            ::sqlx::query($dialect.update)
                                .bind(encode_body(body)?)
                                .bind(mutation.tag.as_str())
                                .bind(mutation.key.as_str())
                                .execute(&mut *tx)
                                .await
                        }
                        MutationOp::Delete => {
                            ::sqlx::query($dialect.delete)
                                .bind(mutation.tag.as_str())
                                .bind(mutation.key.as_str())
                                .execute(&mut *tx)
                                .await
                        }
                    }
                    .map_err(|e| classify(mutation.verb(), e))?;

                    Self::ensure_not_missing(mutation, result.rows_affected())?;
                    affected += result.rows_affected();
                }

                tx.commit().await.map_err(|e| classify("commit", e))?;
                Ok(affected)
            }

            async fn ping(&self) -> Result<(), $crate::error::StorageFailure> {
                use $crate::engine::sql::classify;

                self.open().await?;
                ::sqlx::query("SELECT 1")
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("ping", e))
            }

            async fn close(&self) {
                self.pool.close().await;
                if self.opened.swap(false, ::std::sync::atomic::Ordering::SeqCst) {
                    ::tracing::info!(engine = $engine, "Storage session closed");
                }
            }

            fn connection_stats(&self) -> Option<$crate::engine::ConnectionStats> {
                let idle = self.pool.num_idle() as u32;
                Some($crate::engine::ConnectionStats {
                    active_connections: self.pool.size().saturating_sub(idle),
                    idle_connections: idle,
                    max_connections: self.max_connections,
                })
            }
        }
    };
}

pub(crate) use record_session;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_driver_errors_are_classified() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify("flush", io).kind(), FailureKind::ConnectionReset);
        assert_eq!(
            classify("flush", sqlx::Error::PoolTimedOut).kind(),
            FailureKind::Timeout
        );
        assert!(classify("flush", sqlx::Error::PoolTimedOut).is_transient());
        assert_eq!(
            classify("fetch", sqlx::Error::RowNotFound).kind(),
            FailureKind::InvalidQuery
        );
        assert_eq!(
            classify("fetch", sqlx::Error::PoolClosed).kind(),
            FailureKind::Other
        );
    }

    #[test]
    fn test_lock_and_busy_codes_are_transient() {
        for (code, kind) in [
            ("40001", FailureKind::SerializationConflict),
            ("40P01", FailureKind::Deadlock),
            ("55P03", FailureKind::Timeout),
            ("53300", FailureKind::ConnectionReset),
            ("08006", FailureKind::ConnectionReset),
            ("5", FailureKind::SerializationConflict),
            ("261", FailureKind::SerializationConflict),
            ("773", FailureKind::SerializationConflict),
            ("262", FailureKind::Deadlock),
        ] {
            assert_eq!(transient_code_kind(code), Some(kind), "{code}");
            assert_eq!(kind.category(), ErrorCategory::Transient);
        }

        assert_eq!(transient_code_kind("23505"), None);
        assert_eq!(transient_code_kind("42P01"), None);
        assert_eq!(transient_code_kind("19"), None);
    }

    #[test]
    fn test_body_codec() {
        let body = serde_json::json!({"id": "a", "total": 3});
        let text = encode_body(&body).unwrap();
        assert_eq!(decode_body(&text).unwrap(), body);
        assert_eq!(
            decode_body("{not json").unwrap_err().kind(),
            FailureKind::Encoding
        );
    }
}
