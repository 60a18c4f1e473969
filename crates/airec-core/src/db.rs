use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::StoreError;
use crate::recording::Recording;

/// Durable store for recording metadata.
///
/// Rows hold paths relative to the documents root handed to [`RecordStore::open`];
/// reads resolve them against that root and silently skip rows whose backing
/// audio file no longer exists. The rows themselves are never deleted by reads.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
    root: PathBuf,
}

impl RecordStore {
    /// Open (or create) the store at `<root>/recordings.sqlite`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let db_path = root.join("recordings.sqlite");

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::OpenDir)?;
        }

        let conn = Connection::open(&db_path).map_err(StoreError::Open)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            root: root.to_path_buf(),
        };

        store.run_migrations()?;
        Ok(store)
    }

    /// Documents root used to resolve stored relative paths.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the recordings table and apply additive migrations.
    ///
    /// Safe to run on every startup: table creation is `IF NOT EXISTS` and
    /// the `content` column is only added when a pre-existing table lacks it.
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS recordings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                created_at REAL NOT NULL,
                content TEXT
            );
            "#,
        )
        .map_err(StoreError::Open)?;

        let has_content: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('recordings') WHERE name = 'content'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Open)?;

        if has_content == 0 {
            conn.execute("ALTER TABLE recordings ADD COLUMN content TEXT", [])
                .map_err(StoreError::Open)?;
            debug!("added content column to recordings table");
        }

        Ok(())
    }

    /// Insert a new recording and return its assigned id.
    pub fn insert(
        &self,
        name: &str,
        relative_path: &str,
        created_at: f64,
        content: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO recordings (name, file_path, created_at, content)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![name, relative_path, created_at, content],
        )
        .map_err(StoreError::Write)?;

        Ok(conn.last_insert_rowid())
    }

    /// All recordings, newest first, filtered to rows whose file exists.
    pub fn all(&self) -> Result<Vec<Recording>, StoreError> {
        self.query_filtered(
            r#"
            SELECT id, name, file_path, created_at, content
            FROM recordings
            ORDER BY created_at DESC
            "#,
            params![],
        )
    }

    /// Case-insensitive substring search over name and transcript content.
    pub fn search(&self, query: &str) -> Result<Vec<Recording>, StoreError> {
        let pattern = format!("%{}%", query);
        self.query_filtered(
            r#"
            SELECT id, name, file_path, created_at, content
            FROM recordings
            WHERE name LIKE ?1 OR content LIKE ?1
            ORDER BY created_at DESC
            "#,
            params![pattern],
        )
    }

    fn query_filtered(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Recording>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(StoreError::Write)?;

        let rows = stmt
            .query_map(args, |row| {
                Ok(Recording {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    relative_path: row.get(2)?,
                    created_at: row.get(3)?,
                    content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            })
            .map_err(StoreError::Write)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Write)?;

        // Rows whose backing file is gone are skipped, not deleted.
        let (kept, skipped): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .partition(|rec| rec.file_exists(&self.root));

        for rec in &skipped {
            debug!(id = rec.id, path = %rec.relative_path, "skipping recording with missing file");
        }

        Ok(kept)
    }

    /// Look up a single recording by id, applying the same existence filter.
    pub fn get(&self, id: i64) -> Result<Option<Recording>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            r#"
            SELECT id, name, file_path, created_at, content
            FROM recordings
            WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(Recording {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    relative_path: row.get(2)?,
                    created_at: row.get(3)?,
                    content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            },
        );

        match result {
            Ok(rec) if rec.file_exists(&self.root) => Ok(Some(rec)),
            Ok(_) => Ok(None),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Write(e)),
        }
    }

    /// Delete the row for `relative_path` inside a single transaction.
    ///
    /// The transaction rolls back on failure so a partial delete can never
    /// leave the table inconsistent.
    pub fn delete(&self, relative_path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::Write)?;
        tx.execute(
            "DELETE FROM recordings WHERE file_path = ?1",
            params![relative_path],
        )
        .map_err(StoreError::Write)?;
        tx.commit().map_err(StoreError::Write)?;
        Ok(())
    }

    /// Point update of the stored file path.
    pub fn update_path(&self, id: i64, new_path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recordings SET file_path = ?1 WHERE id = ?2",
            params![new_path, id],
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }

    /// Point update of the display name.
    pub fn update_name(&self, id: i64, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recordings SET name = ?1 WHERE id = ?2",
            params![name, id],
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }

    /// Point update of the transcript content.
    pub fn update_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recordings SET content = ?1 WHERE id = ?2",
            params![content, id],
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }

    /// Update transcript content and display name together.
    pub fn update_content_and_name(
        &self,
        id: i64,
        content: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recordings SET content = ?1, name = ?2 WHERE id = ?3",
            params![content, name, id],
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }

    #[cfg(test)]
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> T) -> T {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }
}
