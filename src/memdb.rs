use anyhow::{bail, Context as _, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::archive::Archive;
use crate::catalog::{user_version, Format};
use crate::hashes::{HashType, Hashes};
use crate::models::{FileType, Location, Status};

/// Environment variable that redirects the memory index to an on-disk
/// database for debugging.
pub const DEBUG_MEMDB_VAR: &str = "CKMAME_DEBUG_MEMDB";

const SQL_INIT_MEM: &str = "\
create table ptr_cache (\n\
    archive_id integer primary key autoincrement,\n\
    name text not null unique\n\
);\n\
create table file (\n\
    game_id integer,\n\
    file_type integer,\n\
    file_idx integer,\n\
    file_sh integer,\n\
    location integer not null,\n\
    size integer,\n\
    crc integer,\n\
    md5 binary,\n\
    sha1 binary\n\
);\n\
create index file_id on file (game_id, file_type, file_idx);\n\
create index file_crc on file (file_type, crc);\n\
create index file_md5 on file (file_type, md5);\n\
";

/// One candidate location returned by a hash lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemDbEntry {
    pub archive_id: i64,
    pub archive_name: String,
    pub index: usize,
    pub location: Location,
}

/// Process-lifetime content-addressed index over every archive seen so
/// far: (filetype, primary hash) to archive slots. Candidates still need
/// secondary-hash verification against the live archive.
pub struct MemDb {
    conn: Connection,
}

impl MemDb {
    pub fn new() -> Result<Self> {
        let conn = match std::env::var(DEBUG_MEMDB_VAR) {
            Ok(path) if !path.is_empty() => {
                let _ = std::fs::remove_file(&path);
                Connection::open(&path)
                    .with_context(|| format!("cannot create debug memdb '{}'", path))?
            }
            _ => Connection::open_in_memory().context("cannot create in-memory db")?,
        };

        conn.execute_batch(&format!("begin;\n{}commit;", SQL_INIT_MEM))
            .context("cannot initialize in-memory db schema")?;
        conn.pragma_update(None, "user_version", user_version(Format::MemDb))?;

        Ok(MemDb { conn })
    }

    /// Stable id for an archive path; allocated on first sight.
    pub fn register_archive(&self, name: &str) -> Result<i64> {
        let mut stmt = self
            .conn
            .prepare_cached("select archive_id from ptr_cache where name = ?1")?;
        if let Some(id) = stmt.query_row([name], |row| row.get(0)).optional()? {
            return Ok(id);
        }
        self.conn
            .execute("insert into ptr_cache (name) values (?1)", [name])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn archive_name(&self, archive_id: i64) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("select name from ptr_cache where archive_id = ?1")?;
        Ok(stmt.query_row([archive_id], |row| row.get(0)).optional()?)
    }

    fn insert_file_views(&self, archive: &Archive, index: usize) -> Result<()> {
        let file = &archive.files[index];
        let mut stmt = self.conn.prepare_cached(
            "insert into file (game_id, file_type, file_idx, file_sh, location, size, crc, md5, sha1) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;

        let raw = (&file.hashes, file.size.as_db());
        let views: Vec<(i64, &Hashes, Option<i64>)> = match &file.detector_view {
            Some(view) => vec![(0, raw.0, raw.1), (1, &view.hashes, Some(view.size as i64))],
            None => vec![(0, raw.0, raw.1)],
        };

        for (file_sh, hashes, size) in views {
            stmt.execute(params![
                archive.id,
                archive.filetype.as_db(),
                index as i64,
                file_sh,
                archive.location.as_db(),
                size,
                hashes.crc.map(i64::from),
                hashes.md5.map(|md5| md5.to_vec()),
                hashes.sha1.map(|sha1| sha1.to_vec()),
            ])?;
        }
        Ok(())
    }

    /// Insert one entry of an already-registered archive.
    pub fn insert_file(&self, archive: &Archive, index: usize) -> Result<()> {
        if archive.id == 0 {
            bail!("archive '{}' is not registered", archive.path);
        }
        if archive.files[index].status != Status::Ok {
            return Ok(());
        }
        self.insert_file_views(archive, index)
    }

    /// Insert every entry of an archive, one row per size/hash view.
    pub fn insert_archive(&self, archive: &Archive) -> Result<()> {
        for index in 0..archive.files.len() {
            self.insert_file(archive, index)?;
        }
        Ok(())
    }

    /// Remove one entry; with `adjust_index` set, later entries of the same
    /// archive slide down one slot.
    pub fn delete_file(
        &self,
        archive_id: i64,
        filetype: FileType,
        index: usize,
        adjust_index: bool,
    ) -> Result<()> {
        self.conn.execute(
            "delete from file where game_id = ?1 and file_type = ?2 and file_idx = ?3",
            params![archive_id, filetype.as_db(), index as i64],
        )?;
        if adjust_index {
            self.conn.execute(
                "update file set file_idx = file_idx - 1 \
                 where game_id = ?1 and file_type = ?2 and file_idx > ?3",
                params![archive_id, filetype.as_db(), index as i64],
            )?;
        }
        Ok(())
    }

    /// Rewrite the rows of one entry after its content changed.
    pub fn update_file(&self, archive: &Archive, index: usize) -> Result<()> {
        self.delete_file(archive.id, archive.filetype, index, false)?;
        if archive.files[index].status == Status::Ok {
            self.insert_file_views(archive, index)?;
        }
        Ok(())
    }

    /// Drop all rows belonging to an archive, keeping its id registered.
    pub fn delete_archive(&self, archive_id: i64, filetype: FileType) -> Result<()> {
        self.conn.execute(
            "delete from file where game_id = ?1 and file_type = ?2",
            params![archive_id, filetype.as_db()],
        )?;
        Ok(())
    }

    /// All slots whose primary hash matches: CRC for ROMs, MD5 for disks.
    pub fn lookup(&self, filetype: FileType, hashes: &Hashes) -> Result<Vec<MemDbEntry>> {
        let (column, value): (&str, rusqlite::types::Value) = match filetype {
            FileType::Disk => {
                let Some(md5) = &hashes.md5 else {
                    return Ok(Vec::new());
                };
                ("md5", rusqlite::types::Value::Blob(md5.to_vec()))
            }
            _ => {
                let Some(crc) = hashes.crc else {
                    return Ok(Vec::new());
                };
                ("crc", rusqlite::types::Value::Integer(i64::from(crc)))
            }
        };

        let query = format!(
            "select distinct file.game_id, ptr_cache.name, file.file_idx, file.location \
             from file join ptr_cache on ptr_cache.archive_id = file.game_id \
             where file.file_type = ?1 and file.{} = ?2 \
             order by file.location, file.game_id, file.file_idx",
            column
        );
        let mut stmt = self.conn.prepare_cached(&query)?;
        let entries = stmt
            .query_map(params![filetype.as_db(), value], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut result = Vec::with_capacity(entries.len());
        for (archive_id, archive_name, index, location) in entries {
            let Some(location) = Location::from_db(location) else {
                continue;
            };
            result.push(MemDbEntry {
                archive_id,
                archive_name,
                index: index as usize,
                location,
            });
        }
        Ok(result)
    }
}
