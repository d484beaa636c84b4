//! Note storage

use ghostrunner_common::auth::now_epoch_secs;
use ghostrunner_common::{Database, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL
    );
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct NoteStore {
    db: Database,
}

impl NoteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn install_schema(&self) -> Result<()> {
        self.db.execute_batch(SCHEMA)
    }

    pub fn create(&self, title: &str, body: &str) -> Result<Note> {
        let created_at = now_epoch_secs();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notes (title, body, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![title, body, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(Note {
            id,
            title: title.to_string(),
            body: body.to_string(),
            created_at,
        })
    }

    /// Newest first
    pub fn list(&self) -> Result<Vec<Note>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, title, body, created_at FROM notes ORDER BY id DESC")?;
            let rows = stmt.query_map([], |r| {
                Ok(Note {
                    id: r.get(0)?,
                    title: r.get(1)?,
                    body: r.get(2)?,
                    created_at: r.get(3)?,
                })
            })?;
            let notes = rows.collect::<rusqlite::Result<Vec<_>>>();
            notes
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_list_newest_first() {
        let store = NoteStore::new(Database::open_memory("default").unwrap());
        store.install_schema().unwrap();

        store.create("first", "a").unwrap();
        let second = store.create("second", "").unwrap();

        let notes = store.list().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0], second);
        assert_eq!(notes[1].title, "first");
    }
}
