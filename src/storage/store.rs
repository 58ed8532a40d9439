//! Durable key-value tables on SQLite.
//!
//! Four logical tables back the index: the symbol-name inverted index,
//! the per-location symbol records, the file dependency graph, and the
//! per-source compile-argument records. Keys are raw bytes (padded
//! location keys, big-endian file ids, UTF-8 names, path bytes), values
//! are bincode framed with a leading version word so schema drift is
//! detected per record.
//!
//! Handles are cheap and scoped: the syncer opens one per flush phase,
//! query jobs open read-only ones, and SQLite's locking arbitrates.

use crate::storage::error::{StorageError, StorageResult};
use crate::DATABASE_VERSION;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// The four logical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    SymbolName,
    Symbol,
    Dependency,
    FileInformation,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::SymbolName => "symbol_names",
            Table::Symbol => "symbols",
            Table::Dependency => "dependencies",
            Table::FileInformation => "file_informations",
        }
    }

    const ALL: [Table; 4] = [
        Table::SymbolName,
        Table::Symbol,
        Table::Dependency,
        Table::FileInformation,
    ];
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    /// Delete every key in `[start, end)`.
    DeleteRange(Vec<u8>, Vec<u8>),
}

/// Buffered writes against one table, committed atomically.
pub struct WriteBatch {
    table: Table,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            ops: Vec::new(),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Queue a versioned put.
    pub fn put<T: Serialize>(&mut self, key: &[u8], value: &T) -> StorageResult<()> {
        self.ops.push(BatchOp::Put(key.to_vec(), frame(value)?));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.ops
            .push(BatchOp::DeleteRange(start.to_vec(), end.to_vec()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Prefix a bincode payload with the database version.
fn frame<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    let mut buf = DATABASE_VERSION.to_le_bytes().to_vec();
    bincode::serialize_into(&mut buf, value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn unframe<T: DeserializeOwned>(table: Table, key: &[u8], raw: &[u8]) -> StorageResult<T> {
    let corrupt = || StorageError::CorruptRecord {
        table: table.name(),
        key: String::from_utf8_lossy(key).into_owned(),
    };
    if raw.len() < 4 {
        return Err(corrupt());
    }
    let version = u32::from_le_bytes(raw[..4].try_into().unwrap());
    if version != DATABASE_VERSION {
        return Err(corrupt());
    }
    bincode::deserialize(&raw[4..]).map_err(|_| corrupt())
}

/// Handle over the four tables.
pub struct Store {
    conn: Connection,
    /// Keys already reported as corrupt through this handle, so each is
    /// logged once.
    reported: Mutex<HashSet<(Table, Vec<u8>)>>,
}

impl Store {
    /// Open (and bootstrap if needed) the store for read-write access.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn,
            reported: Mutex::new(HashSet::new()),
        })
    }

    /// Open for reads only. Fails when the store has never been created.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::check_version(&conn)?;
        Ok(Self {
            conn,
            reported: Mutex::new(HashSet::new()),
        })
    }

    fn bootstrap(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS symbol_names (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS symbols (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS dependencies (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS file_informations (key BLOB PRIMARY KEY, value BLOB NOT NULL);",
        )?;
        let stored: Option<u32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match stored {
            Some(found) if found != DATABASE_VERSION => Err(StorageError::VersionMismatch {
                expected: DATABASE_VERSION,
                found,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('version', ?1)",
                    params![DATABASE_VERSION],
                )?;
                Ok(())
            }
        }
    }

    fn check_version(conn: &Connection) -> StorageResult<()> {
        let found: u32 = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(DATABASE_VERSION);
        if found != DATABASE_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: DATABASE_VERSION,
                found,
            });
        }
        Ok(())
    }

    /// Point read. Absent and corrupt records both come back as the
    /// default value; corrupt ones are logged once per key.
    pub fn read<T: DeserializeOwned + Default>(&self, table: Table, key: &[u8]) -> T {
        match self.read_opt(table, key) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(_) => T::default(),
        }
    }

    /// Point read distinguishing absence; corrupt records are reported
    /// and surface as `None`.
    pub fn read_opt<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
    ) -> StorageResult<Option<T>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", table.name());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let raw: Option<Vec<u8>> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match unframe(table, key, &raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                self.report_corrupt(table, key);
                Ok(None)
            }
        }
    }

    /// Largest key `<= key` with its decoded value, for position lookups
    /// in the ordered symbol table.
    pub fn read_floor<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
    ) -> StorageResult<Option<(Vec<u8>, T)>> {
        let sql = format!(
            "SELECT key, value FROM {} WHERE key <= ?1 ORDER BY key DESC LIMIT 1",
            table.name()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let row: Option<(Vec<u8>, Vec<u8>)> = stmt
            .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((found_key, raw)) = row else {
            return Ok(None);
        };
        match unframe(table, &found_key, &raw) {
            Ok(value) => Ok(Some((found_key, value))),
            Err(_) => {
                self.report_corrupt(table, &found_key);
                Ok(None)
            }
        }
    }

    /// Visit every `(key, value)` in the table in key order, skipping
    /// corrupt records.
    pub fn for_each<T, F>(&self, table: Table, mut f: F) -> StorageResult<()>
    where
        T: DeserializeOwned,
        F: FnMut(&[u8], T),
    {
        let sql = format!("SELECT key, value FROM {} ORDER BY key", table.name());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let raw: Vec<u8> = row.get(1)?;
            match unframe(table, &key, &raw) {
                Ok(value) => f(&key, value),
                Err(_) => self.report_corrupt(table, &key),
            }
        }
        Ok(())
    }

    pub fn keys(&self, table: Table) -> StorageResult<Vec<Vec<u8>>> {
        let sql = format!("SELECT key FROM {} ORDER BY key", table.name());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<Vec<u8>>, _>>()?;
        Ok(keys)
    }

    pub fn count(&self, table: Table) -> StorageResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Apply every operation in the batch inside one transaction.
    pub fn write(&mut self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let table = batch.table.name();
        let tx = self.conn.transaction()?;
        {
            let put_sql = format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)");
            let del_sql = format!("DELETE FROM {table} WHERE key = ?1");
            let range_sql = format!("DELETE FROM {table} WHERE key >= ?1 AND key < ?2");
            let mut put = tx.prepare_cached(&put_sql)?;
            let mut del = tx.prepare_cached(&del_sql)?;
            let mut range = tx.prepare_cached(&range_sql)?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put(key, value) => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete(key) => {
                        del.execute(params![key])?;
                    }
                    BatchOp::DeleteRange(start, end) => {
                        range.execute(params![start, end])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop every record in every table (project reset).
    pub fn clear(&mut self) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        for table in Table::ALL {
            tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn report_corrupt(&self, table: Table, key: &[u8]) {
        let mut reported = self.reported.lock().unwrap();
        if reported.insert((table, key.to_vec())) {
            warn!(
                table = table.name(),
                key = %String::from_utf8_lossy(key),
                "corrupt record treated as absent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("index.db")).unwrap()
    }

    #[test]
    fn test_absent_key_reads_default() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let set: BTreeSet<u64> = s.read(Table::SymbolName, b"missing");
        assert!(set.is_empty());
    }

    #[test]
    fn test_batch_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);

        let value: BTreeSet<u64> = [1u64, 2, 3].into_iter().collect();
        let mut batch = WriteBatch::new(Table::SymbolName);
        batch.put(b"foo", &value).unwrap();
        batch.put(b"bar", &value).unwrap();
        s.write(batch).unwrap();

        let read: BTreeSet<u64> = s.read(Table::SymbolName, b"foo");
        assert_eq!(read, value);
        assert_eq!(s.count(Table::SymbolName).unwrap(), 2);
    }

    #[test]
    fn test_delete_range() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);

        let mut batch = WriteBatch::new(Table::Symbol);
        for offset in [0u64, 1, 2, 100] {
            let key = ((7u64 << 32) | offset).to_be_bytes();
            batch.put(&key, &offset).unwrap();
        }
        let other = ((8u64 << 32) | 5).to_be_bytes();
        batch.put(&other, &5u64).unwrap();
        s.write(batch).unwrap();

        let mut purge = WriteBatch::new(Table::Symbol);
        purge.delete_range(&(7u64 << 32).to_be_bytes(), &(8u64 << 32).to_be_bytes());
        s.write(purge).unwrap();

        assert_eq!(s.count(Table::Symbol).unwrap(), 1);
        let survivor: Option<u64> = s.read_opt(Table::Symbol, &other).unwrap();
        assert_eq!(survivor, Some(5));
    }

    #[test]
    fn test_read_floor() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);

        let mut batch = WriteBatch::new(Table::Symbol);
        batch.put(&10u64.to_be_bytes(), &"ten".to_string()).unwrap();
        batch
            .put(&20u64.to_be_bytes(), &"twenty".to_string())
            .unwrap();
        s.write(batch).unwrap();

        let (key, value): (Vec<u8>, String) = s
            .read_floor(Table::Symbol, &15u64.to_be_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(key, 10u64.to_be_bytes());
        assert_eq!(value, "ten");

        let below: Option<(Vec<u8>, String)> =
            s.read_floor(Table::Symbol, &5u64.to_be_bytes()).unwrap();
        assert!(below.is_none());
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut s = Store::open(&path).unwrap();
            let mut batch = WriteBatch::new(Table::SymbolName);
            batch.put(b"ok", &42u64).unwrap();
            s.write(batch).unwrap();
            // Plant garbage behind the store's back.
            s.conn
                .execute(
                    "INSERT OR REPLACE INTO symbol_names (key, value) VALUES (?1, ?2)",
                    params![b"bad".as_slice(), b"xx".as_slice()],
                )
                .unwrap();
        }
        let s = Store::open(&path).unwrap();
        let bad: u64 = s.read(Table::SymbolName, b"bad");
        assert_eq!(bad, 0);
        let ok: u64 = s.read(Table::SymbolName, b"ok");
        assert_eq!(ok, 42);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut s = Store::open(&path).unwrap();
            let mut batch = WriteBatch::new(Table::FileInformation);
            batch.put(b"/src/a.c", &7u64).unwrap();
            s.write(batch).unwrap();
        }
        let s = Store::open_read_only(&path).unwrap();
        let v: u64 = s.read(Table::FileInformation, b"/src/a.c");
        assert_eq!(v, 7);
    }
}
