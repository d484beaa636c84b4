//! SQLite connections with an explicit cross-thread capability

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info};

/// Alias every application is expected to configure
pub const DEFAULT_ALIAS: &str = "default";

/// Storage engine behind a connection alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    /// Private in-memory SQLite database; its contents die with the connection
    SqliteMemory,
    /// SQLite database file
    SqliteFile(PathBuf),
    /// Client/server database reached over the network
    Network { vendor: String, url: String },
}

impl Engine {
    /// Parse a database URL.
    ///
    /// Accepted forms: `sqlite::memory:`, `sqlite://<path>`, and
    /// `<vendor>://...` for network engines (`postgres`, `postgresql`, `mysql`).
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(Engine::SqliteMemory);
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(Error::InvalidConfig(format!("missing sqlite path in '{}'", url)));
            }
            return Ok(Engine::SqliteFile(PathBuf::from(path)));
        }
        match url.split_once("://") {
            Some((vendor @ ("postgres" | "postgresql" | "mysql"), rest)) if !rest.is_empty() => {
                Ok(Engine::Network {
                    vendor: vendor.to_string(),
                    url: url.to_string(),
                })
            }
            _ => Err(Error::InvalidConfig(format!("unrecognized database url '{}'", url))),
        }
    }

    pub fn vendor(&self) -> &str {
        match self {
            Engine::SqliteMemory | Engine::SqliteFile(_) => "sqlite",
            Engine::Network { vendor, .. } => vendor,
        }
    }

    /// Embedded engines can drive one physical connection from two threads.
    fn is_embedded(&self) -> bool {
        matches!(self, Engine::SqliteMemory | Engine::SqliteFile(_))
    }
}

/// Settings for one connection alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub alias: String,
    pub engine: Engine,
}

impl DatabaseSettings {
    pub fn new(alias: impl Into<String>, engine: Engine) -> Self {
        Self {
            alias: alias.into(),
            engine,
        }
    }

    pub fn from_url(alias: impl Into<String>, url: &str) -> Result<Self> {
        Ok(Self::new(alias, Engine::parse(url)?))
    }
}

/// Cross-thread permission for a connection.
///
/// A connection belongs to the thread that created it. Any other thread may
/// use it only while sharing is allowed.
#[derive(Debug)]
pub struct ThreadSharing {
    owner: ThreadId,
    allowed: AtomicBool,
}

impl ThreadSharing {
    fn new() -> Self {
        Self {
            owner: thread::current().id(),
            allowed: AtomicBool::new(false),
        }
    }

    pub fn allow(&self) {
        self.allowed.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.allowed.store(false, Ordering::SeqCst);
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    fn validate(&self, alias: &str) -> Result<()> {
        let current = thread::current().id();
        if current == self.owner || self.is_allowed() {
            return Ok(());
        }
        Err(Error::ThreadSharing {
            alias: alias.to_string(),
            owner: format!("{:?}", self.owner),
            current: format!("{:?}", current),
        })
    }
}

/// A named database connection, opened lazily and closable.
///
/// Clones share the same physical connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    settings: DatabaseSettings,
    conn: Mutex<Option<Connection>>,
    sharing: Option<ThreadSharing>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("alias", &self.alias())
            .field("engine", &self.inner.settings.engine)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Database {
    /// Create a connection that connects on first use
    pub fn lazy(settings: DatabaseSettings) -> Self {
        let sharing = settings.engine.is_embedded().then(ThreadSharing::new);
        Self {
            inner: Arc::new(DatabaseInner {
                settings,
                conn: Mutex::new(None),
                sharing,
            }),
        }
    }

    /// Create a connection and connect immediately
    pub fn open(settings: DatabaseSettings) -> Result<Self> {
        let db = Self::lazy(settings);
        db.with_conn(|_| Ok(()))?;
        info!("Opened database '{}' ({})", db.alias(), db.vendor());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory(alias: impl Into<String>) -> Result<Self> {
        Self::open(DatabaseSettings::new(alias, Engine::SqliteMemory))
    }

    pub fn alias(&self) -> &str {
        &self.inner.settings.alias
    }

    pub fn vendor(&self) -> &str {
        self.inner.settings.engine.vendor()
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.inner.settings
    }

    /// Cross-thread capability of this connection.
    ///
    /// `None` for engines that cannot safely share one physical connection
    /// between threads.
    pub fn thread_sharing(&self) -> Option<&ThreadSharing> {
        self.inner.sharing.as_ref()
    }

    pub fn allows_thread_sharing(&self) -> bool {
        self.thread_sharing().map(ThreadSharing::is_allowed).unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    /// Run `f` against the physical connection, connecting first if needed
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        self.validate_thread()?;
        let mut guard = self.inner.conn.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        match guard.as_ref() {
            Some(conn) => Ok(f(conn)?),
            None => Err(Error::Internal(format!("connection '{}' failed to open", self.alias()))),
        }
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Open savepoint `name`. Everything written through this connection,
    /// from any thread, is undone by [`Database::rollback_to_savepoint`].
    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.execute_batch(&format!("SAVEPOINT {}", savepoint_ident(name)?))
    }

    /// Undo everything since savepoint `name` and release it
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let name = savepoint_ident(name)?;
        self.execute_batch(&format!("ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0};", name))
    }

    /// Close the physical connection. The next use reconnects.
    pub fn close(&self) -> Result<()> {
        self.validate_thread()?;
        if self.inner.conn.lock().take().is_some() {
            debug!("Closed database connection '{}'", self.alias());
        }
        Ok(())
    }

    fn validate_thread(&self) -> Result<()> {
        match &self.inner.sharing {
            Some(sharing) => sharing.validate(self.alias()),
            None => Ok(()),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let conn = match &self.inner.settings.engine {
            Engine::SqliteMemory => Connection::open_in_memory()?,
            Engine::SqliteFile(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                conn
            }
            Engine::Network { vendor, .. } => {
                return Err(Error::Unsupported {
                    alias: self.alias().to_string(),
                    engine: vendor.clone(),
                })
            }
        };
        debug!("Connected database '{}'", self.alias());
        Ok(conn)
    }
}

fn savepoint_ident(name: &str) -> Result<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(Error::InvalidConfig(format!("invalid savepoint name '{}'", name)))
    }
}

/// Registry of the connections visible to one thread
#[derive(Clone, Default, Debug)]
pub struct Connections {
    by_alias: BTreeMap<String, Database>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazy connections for every alias in `settings`
    pub fn from_settings(settings: &[DatabaseSettings]) -> Self {
        let mut connections = Self::new();
        for s in settings {
            connections.insert(Database::lazy(s.clone()));
        }
        connections
    }

    pub fn insert(&mut self, db: Database) -> Option<Database> {
        self.by_alias.insert(db.alias().to_string(), db)
    }

    pub fn get(&self, alias: &str) -> Result<&Database> {
        self.by_alias
            .get(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))
    }

    pub fn default_db(&self) -> Result<&Database> {
        self.get(DEFAULT_ALIAS)
    }

    pub fn all(&self) -> impl Iterator<Item = &Database> {
        self.by_alias.values()
    }

    pub fn settings(&self) -> Vec<DatabaseSettings> {
        self.all().map(|db| db.settings().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("sqlite::memory:", Engine::SqliteMemory ; "memory")]
    #[test_case("sqlite://state.db", Engine::SqliteFile(PathBuf::from("state.db")) ; "file")]
    #[test_case("postgres://db.internal/app", Engine::Network { vendor: "postgres".into(), url: "postgres://db.internal/app".into() } ; "postgres")]
    fn test_engine_parse(url: &str, expected: Engine) {
        assert_eq!(Engine::parse(url).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("sqlite://" ; "missing path")]
    #[test_case("redis://cache" ; "unknown vendor")]
    fn test_engine_parse_rejects(url: &str) {
        assert!(matches!(Engine::parse(url), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_only_embedded_engines_can_share() {
        let memory = Database::lazy(DatabaseSettings::new("default", Engine::SqliteMemory));
        let remote = Database::lazy(DatabaseSettings::from_url("reports", "mysql://db/reports").unwrap());

        assert!(memory.thread_sharing().is_some());
        assert!(remote.thread_sharing().is_none());
        assert!(matches!(
            remote.with_conn(|_| Ok(())),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn test_foreign_thread_needs_sharing() {
        let db = Database::open_memory("default").unwrap();

        let other = db.clone();
        let denied = std::thread::spawn(move || other.with_conn(|c| c.execute_batch("SELECT 1")))
            .join()
            .unwrap();
        assert!(matches!(denied, Err(Error::ThreadSharing { .. })));

        db.thread_sharing().unwrap().allow();
        let other = db.clone();
        let allowed = std::thread::spawn(move || other.with_conn(|c| c.execute_batch("SELECT 1")))
            .join()
            .unwrap();
        assert!(allowed.is_ok());
    }

    #[test]
    fn test_closing_memory_database_discards_contents() {
        let db = Database::open_memory("default").unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();

        db.close().unwrap();
        assert!(!db.is_open());

        let missing = db.with_conn(|c| c.query_row("SELECT v FROM t", [], |r| r.get::<_, i64>(0)));
        assert!(matches!(missing, Err(Error::Database(_))));
    }

    #[test]
    fn test_file_database_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatabaseSettings::new("default", Engine::SqliteFile(dir.path().join("state.db")));
        let db = Database::open(settings).unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        db.close().unwrap();
        let v: i64 = db
            .with_conn(|c| c.query_row("SELECT v FROM t", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_rollback_to_savepoint_undoes_writes() {
        let db = Database::open_memory("default").unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        let count = |db: &Database| -> i64 {
            db.with_conn(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)))
                .unwrap()
        };

        db.savepoint("per_test").unwrap();
        db.execute_batch("INSERT INTO t VALUES (2); INSERT INTO t VALUES (3);")
            .unwrap();
        assert_eq!(count(&db), 3);

        db.rollback_to_savepoint("per_test").unwrap();
        assert_eq!(count(&db), 1);

        // Released: a second rollback has nothing to return to.
        assert!(db.rollback_to_savepoint("per_test").is_err());
        assert!(matches!(db.savepoint("drop table t"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_connections_registry() {
        let settings = vec![
            DatabaseSettings::new(DEFAULT_ALIAS, Engine::SqliteMemory),
            DatabaseSettings::from_url("warehouse", "postgres://db/warehouse").unwrap(),
        ];
        let connections = Connections::from_settings(&settings);

        assert_eq!(connections.len(), 2);
        assert_eq!(connections.default_db().unwrap().vendor(), "sqlite");
        assert_eq!(connections.settings(), settings);
        assert!(matches!(connections.get("missing"), Err(Error::UnknownAlias(_))));
    }
}
