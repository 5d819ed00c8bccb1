//! Relational schema for the SQL artifact index.

/// Schema version this build of the index issues queries against.
pub const SCHEMA_VERSION: i32 = 2;

/// Leading URL characters covered by the prefix search indexes.
pub(crate) const URL_KEY_CHARS: usize = 2048;

/// Table recording the installed schema version.
pub(crate) const VERSION_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS vellum_schema_version (
    version      INTEGER     NOT NULL,
    installed_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

/// Artifact table and its indexes.
///
/// Text columns use the "C" collation so that `ORDER BY` and `LIKE` follow
/// byte order, the same order the in-memory backends use. URLs may be tens of
/// kilobytes, beyond what a btree entry holds, so exact lookups go through
/// `md5(uri)` and prefix searches through `left(uri, 2048)`.
pub(crate) const ARTIFACT_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS artifact (
    uuid            UUID        PRIMARY KEY,
    namespace       TEXT        COLLATE "C" NOT NULL,
    auid            TEXT        COLLATE "C" NOT NULL,
    uri             TEXT        COLLATE "C" NOT NULL,
    version         INTEGER     NOT NULL CHECK (version > 0),
    committed       BOOLEAN     NOT NULL DEFAULT FALSE,
    storage_url     TEXT        NOT NULL,
    content_length  BIGINT      NOT NULL CHECK (content_length >= 0),
    content_digest  TEXT        NOT NULL,
    collection_date TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS artifact_stem_version
    ON artifact (namespace, auid, md5(uri), version);

CREATE INDEX IF NOT EXISTS artifact_namespace_uri_idx
    ON artifact (namespace, md5(uri));

CREATE INDEX IF NOT EXISTS artifact_au_uri_prefix_idx
    ON artifact (namespace, auid, left(uri, 2048));

CREATE INDEX IF NOT EXISTS artifact_namespace_uri_prefix_idx
    ON artifact (namespace, left(uri, 2048));
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_uniqueness_is_declared() {
        assert!(ARTIFACT_TABLE_SQL.contains("UNIQUE INDEX IF NOT EXISTS artifact_stem_version"));
        assert!(ARTIFACT_TABLE_SQL.contains(r#"uri             TEXT        COLLATE "C""#));
    }

    #[test]
    fn test_prefix_indexes_match_key_length() {
        let key = format!("left(uri, {})", URL_KEY_CHARS);
        assert_eq!(ARTIFACT_TABLE_SQL.matches(key.as_str()).count(), 2);
    }
}
