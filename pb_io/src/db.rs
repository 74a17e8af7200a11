use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use pb_core::Error;

pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub version: String,
    pub store_key: String,
    pub installed_at: i64,
    /// Requested by the user (true) or pulled in as a dependency (false)
    pub explicit: bool,
}

const SELECT_KEG: &str = "SELECT name, version, store_key, installed_at, explicit FROM installed_kegs";

fn keg_from_row(row: &Row<'_>) -> rusqlite::Result<InstalledKeg> {
    Ok(InstalledKeg {
        name: row.get(0)?,
        version: row.get(1)?,
        store_key: row.get(2)?,
        installed_at: row.get(3)?,
        explicit: row.get::<_, i64>(4)? != 0,
    })
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::store(format!("{context}: {e}"))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(db_err("failed to open database"))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, Error> {
        let conn =
            Connection::open_in_memory().map_err(db_err("failed to open in-memory database"))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS installed_kegs (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                store_key TEXT NOT NULL,
                installed_at INTEGER NOT NULL,
                explicit INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS installed_kegs_store_key
                ON installed_kegs (store_key);
            ",
        )
        .map_err(db_err("failed to initialize schema"))
    }

    pub fn transaction(&mut self) -> Result<InstallTransaction<'_>, Error> {
        let tx = self
            .conn
            .transaction()
            .map_err(db_err("failed to start transaction"))?;
        Ok(InstallTransaction { tx })
    }

    pub fn get_installed(&self, name: &str) -> Result<Option<InstalledKeg>, Error> {
        self.conn
            .query_row(
                &format!("{SELECT_KEG} WHERE name = ?1"),
                params![name],
                keg_from_row,
            )
            .optional()
            .map_err(db_err("failed to query installed keg"))
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledKeg>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_KEG} ORDER BY name"))
            .map_err(db_err("failed to prepare statement"))?;

        let kegs = stmt
            .query_map([], keg_from_row)
            .map_err(db_err("failed to query installed kegs"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect results"))?;

        Ok(kegs)
    }

    /// Whether any installed keg still uses this store entry.
    pub fn is_store_key_referenced(&self, store_key: &str) -> Result<bool, Error> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM installed_kegs WHERE store_key = ?1)",
                params![store_key],
                |row| row.get(0),
            )
            .map_err(db_err("failed to query store references"))
    }
}

pub struct InstallTransaction<'a> {
    tx: Transaction<'a>,
}

impl InstallTransaction<'_> {
    /// Record `name` at `version`, replacing any earlier record.
    pub fn record_install(
        &self,
        name: &str,
        version: &str,
        store_key: &str,
        explicit: bool,
    ) -> Result<(), Error> {
        self.tx
            .execute(
                "INSERT INTO installed_kegs (name, version, store_key, installed_at, explicit)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    version = excluded.version,
                    store_key = excluded.store_key,
                    installed_at = excluded.installed_at,
                    explicit = MAX(installed_kegs.explicit, excluded.explicit)",
                params![name, version, store_key, Utc::now().timestamp(), explicit as i64],
            )
            .map(drop)
            .map_err(db_err("failed to record install"))
    }

    /// Returns the store key the removed record pointed at.
    pub fn record_uninstall(&self, name: &str) -> Result<Option<String>, Error> {
        let store_key: Option<String> = self
            .tx
            .query_row(
                "SELECT store_key FROM installed_kegs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to look up install record"))?;

        self.tx
            .execute("DELETE FROM installed_kegs WHERE name = ?1", params![name])
            .map_err(db_err("failed to remove install record"))?;

        Ok(store_key)
    }

    pub fn commit(self) -> Result<(), Error> {
        self.tx.commit().map_err(db_err("failed to commit transaction"))
    }
}
