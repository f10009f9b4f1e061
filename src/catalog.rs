use anyhow::{anyhow, bail, Context as _, Result};
use camino::Utf8Path;
use rusqlite::{params, Connection, OpenFlags as SqlOpenFlags, OptionalExtension};

use crate::detector::{
    Detector, EndOffset, Operation, Rule, SizeCompare, SizeOperand, Test, TestOp,
};
use crate::hashes::{HashType, HashTypes, Hashes};
use crate::models::{DatEntry, FileDesc, FileLocation, FileSize, FileType, Game, Location, Status};

/// Schema revision; the stored user_version also encodes the format.
const SCHEMA_VERSION: i64 = 3;
const VERSION_MAGIC: i64 = 17000;

/// Sentinel for "to end of file" in the rule table.
const RULE_OFFSET_EOF: i64 = 0;
/// Sentinel for "size is a power of two" in the test table.
const TEST_SIZE_POWER_OF_2: i64 = -1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Catalog = 0,
    MemDb = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    New,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListKind {
    Games,
    Disks,
}

const SQL_INIT: &str = "\
create table dat (\n\
    dat_idx integer primary key,\n\
    name text,\n\
    description text,\n\
    version text\n\
);\n\
create table detector (\n\
    name text,\n\
    author text,\n\
    version text\n\
);\n\
create table game (\n\
    game_id integer primary key autoincrement,\n\
    name text not null,\n\
    description text,\n\
    dat_idx integer not null,\n\
    cloneof text\n\
);\n\
create index game_name on game (name);\n\
create table file (\n\
    game_id integer,\n\
    file_type integer,\n\
    file_idx integer,\n\
    name text not null,\n\
    merge text,\n\
    status integer not null,\n\
    location integer not null,\n\
    size integer,\n\
    crc integer,\n\
    md5 binary,\n\
    sha1 binary,\n\
    primary key (game_id, file_type, file_idx)\n\
);\n\
create index file_game_type on file (game_id, file_type);\n\
create index file_name on file (name);\n\
create index file_size on file (size);\n\
create index file_crc on file (crc);\n\
create index file_md5 on file (md5);\n\
create index file_sha1 on file (sha1);\n\
create table rule (\n\
    rule_idx integer primary key,\n\
    start_offset integer,\n\
    end_offset integer,\n\
    operation integer\n\
);\n\
create table test (\n\
    rule_idx integer,\n\
    test_idx integer,\n\
    type integer not null,\n\
    offset integer,\n\
    size integer,\n\
    mask binary,\n\
    value binary,\n\
    result integer not null,\n\
    primary key (rule_idx, test_idx)\n\
);\n\
";

pub fn user_version(format: Format) -> i64 {
    SCHEMA_VERSION + ((format as i64) << 8) + VERSION_MAGIC
}

fn hashes_to_columns(hashes: &Hashes) -> (Option<i64>, Option<Vec<u8>>, Option<Vec<u8>>) {
    (
        hashes.crc.map(i64::from),
        hashes.md5.map(|md5| md5.to_vec()),
        hashes.sha1.map(|sha1| sha1.to_vec()),
    )
}

fn hashes_from_columns(
    crc: Option<i64>,
    md5: Option<Vec<u8>>,
    sha1: Option<Vec<u8>>,
) -> Result<Hashes> {
    let mut hashes = Hashes::default();
    if let Some(crc) = crc {
        hashes.crc = Some(crc as u32);
    }
    if let Some(md5) = md5 {
        hashes.set(HashType::Md5, &md5)?;
    }
    if let Some(sha1) = sha1 {
        hashes.set(HashType::Sha1, &sha1)?;
    }
    Ok(hashes)
}

fn test_type_to_db(test: &Test) -> i64 {
    match test {
        Test::Data { op, .. } => match op {
            TestOp::Data => 0,
            TestOp::Or => 1,
            TestOp::And => 2,
            TestOp::Xor => 3,
        },
        Test::FileSize { compare, .. } => match compare {
            SizeCompare::Equal => 4,
            SizeCompare::Less => 5,
            SizeCompare::Greater => 6,
        },
    }
}

/// The reference catalog: games, files, disks, dat sources and detector
/// rules in one SQLite database.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    pub fn open(path: &Utf8Path, mode: OpenMode) -> Result<Self> {
        let conn = match mode {
            OpenMode::Read => Connection::open_with_flags(path, SqlOpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("cannot open database '{}'", path))?,
            OpenMode::Write => {
                Connection::open_with_flags(path, SqlOpenFlags::SQLITE_OPEN_READ_WRITE)
                    .with_context(|| format!("cannot open database '{}'", path))?
            }
            OpenMode::New => {
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("cannot truncate database '{}'", path))?;
                }
                Connection::open(path)
                    .with_context(|| format!("cannot create database '{}'", path))?
            }
        };

        let catalog = Catalog { conn };
        match mode {
            OpenMode::New => catalog.init()?,
            _ => catalog.check_version()?,
        }
        Ok(catalog)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!("begin;\n{}commit;", SQL_INIT))
            .context("cannot initialize database schema")?;
        self.conn
            .pragma_update(None, "user_version", user_version(Format::Catalog))?;
        Ok(())
    }

    fn check_version(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("pragma user_version", [], |row| row.get(0))
            .context("cannot read database version")?;
        if version != user_version(Format::Catalog) {
            bail!(
                "database has version {}, expected {}",
                version,
                user_version(Format::Catalog)
            );
        }
        Ok(())
    }

    pub fn transaction(&self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    pub fn read_dats(&self) -> Result<Vec<DatEntry>> {
        let mut stmt = self
            .conn
            .prepare_cached("select name, description, version from dat order by dat_idx")?;
        let dats = stmt
            .query_map([], |row| {
                Ok(DatEntry {
                    name: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    description: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    version: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dats)
    }

    pub fn write_dat(&self, index: i64, dat: &DatEntry) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "insert or replace into dat (dat_idx, name, description, version) \
             values (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![index, dat.name, dat.description, dat.version])?;
        Ok(())
    }

    pub fn read_detector(&self) -> Result<Option<Detector>> {
        let mut stmt = self
            .conn
            .prepare_cached("select name, author, version from detector")?;
        let header = stmt
            .query_row([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                ))
            })
            .optional()?;
        let Some((name, author, version)) = header else {
            return Ok(None);
        };

        let mut detector = Detector {
            name,
            author,
            version,
            rules: Vec::new(),
        };

        let mut rule_stmt = self.conn.prepare_cached(
            "select rule_idx, start_offset, end_offset, operation from rule order by rule_idx",
        )?;
        let mut test_stmt = self.conn.prepare_cached(
            "select type, offset, size, mask, value, result from test \
             where rule_idx = ?1 order by test_idx",
        )?;

        let rules = rule_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(RULE_OFFSET_EOF),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (rule_idx, start_offset, end_offset, operation) in rules {
            let mut rule = Rule {
                start_offset,
                end_offset: if end_offset == RULE_OFFSET_EOF {
                    EndOffset::Eof
                } else {
                    EndOffset::Offset(end_offset)
                },
                operation: match operation {
                    1 => Operation::BitSwap,
                    2 => Operation::ByteSwap,
                    3 => Operation::WordSwap,
                    _ => Operation::None,
                },
                tests: Vec::new(),
            };

            let tests = test_stmt
                .query_map([rule_idx], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                        row.get::<_, i64>(5)? != 0,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (test_type, offset, size, mask, value, result) in tests {
                let test = match test_type {
                    0..=3 => Test::Data {
                        op: match test_type {
                            1 => TestOp::Or,
                            2 => TestOp::And,
                            3 => TestOp::Xor,
                            _ => TestOp::Data,
                        },
                        offset: offset.unwrap_or(0),
                        mask: mask.filter(|mask| !mask.is_empty()),
                        value: value.unwrap_or_default(),
                        result,
                    },
                    4..=6 => Test::FileSize {
                        compare: match test_type {
                            5 => SizeCompare::Less,
                            6 => SizeCompare::Greater,
                            _ => SizeCompare::Equal,
                        },
                        size: match size {
                            Some(TEST_SIZE_POWER_OF_2) | None => SizeOperand::PowerOfTwo,
                            Some(size) => SizeOperand::Size(size as u64),
                        },
                        result,
                    },
                    other => bail!("unknown detector test type {} in database", other),
                };
                rule.tests.push(test);
            }

            detector.rules.push(rule);
        }

        Ok(Some(detector))
    }

    pub fn write_detector(&self, detector: &Detector) -> Result<()> {
        self.conn.execute("delete from detector", [])?;
        self.conn.execute("delete from rule", [])?;
        self.conn.execute("delete from test", [])?;

        self.conn.execute(
            "insert into detector (name, author, version) values (?1, ?2, ?3)",
            params![detector.name, detector.author, detector.version],
        )?;

        let mut rule_stmt = self.conn.prepare_cached(
            "insert into rule (rule_idx, start_offset, end_offset, operation) \
             values (?1, ?2, ?3, ?4)",
        )?;
        let mut test_stmt = self.conn.prepare_cached(
            "insert into test (rule_idx, test_idx, type, offset, size, mask, value, result) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for (rule_idx, rule) in detector.rules.iter().enumerate() {
            let end_offset = match rule.end_offset {
                EndOffset::Eof => RULE_OFFSET_EOF,
                EndOffset::Offset(offset) => offset,
            };
            let operation = match rule.operation {
                Operation::None => 0,
                Operation::BitSwap => 1,
                Operation::ByteSwap => 2,
                Operation::WordSwap => 3,
            };
            rule_stmt.execute(params![
                rule_idx as i64,
                rule.start_offset,
                end_offset,
                operation
            ])?;

            for (test_idx, test) in rule.tests.iter().enumerate() {
                match test {
                    Test::Data {
                        offset,
                        mask,
                        value,
                        result,
                        ..
                    } => {
                        test_stmt.execute(params![
                            rule_idx as i64,
                            test_idx as i64,
                            test_type_to_db(test),
                            offset,
                            Option::<i64>::None,
                            mask,
                            value,
                            *result as i64
                        ])?;
                    }
                    Test::FileSize { size, result, .. } => {
                        let size = match size {
                            SizeOperand::PowerOfTwo => TEST_SIZE_POWER_OF_2,
                            SizeOperand::Size(size) => *size as i64,
                        };
                        test_stmt.execute(params![
                            rule_idx as i64,
                            test_idx as i64,
                            test_type_to_db(test),
                            Option::<i64>::None,
                            size,
                            Option::<Vec<u8>>::None,
                            Option::<Vec<u8>>::None,
                            *result as i64
                        ])?;
                    }
                }
            }
        }

        Ok(())
    }

    fn game_id(&self, name: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("select game_id from game where name = ?1")?;
        Ok(stmt.query_row([name], |row| row.get(0)).optional()?)
    }

    pub fn delete_game(&self, name: &str) -> Result<()> {
        let Some(id) = self.game_id(name)? else {
            return Ok(());
        };
        self.conn
            .execute("delete from game where game_id = ?1", [id])?;
        self.conn
            .execute("delete from file where game_id = ?1", [id])?;
        Ok(())
    }

    /// Write a game, replacing any previous rows with the same name. The
    /// game's id is updated to the stored row id.
    pub fn write_game(&self, game: &mut Game) -> Result<()> {
        self.delete_game(&game.name)?;

        self.conn.execute(
            "insert into game (name, description, dat_idx, cloneof) values (?1, ?2, ?3, ?4)",
            params![game.name, game.description, game.dat_idx, game.cloneof[0]],
        )?;
        game.id = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare_cached(
            "insert into file (game_id, file_type, file_idx, name, merge, status, location, \
             size, crc, md5, sha1) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for filetype in [FileType::Rom, FileType::Disk] {
            for (index, file) in game.files(filetype).iter().enumerate() {
                let (crc, md5, sha1) = hashes_to_columns(&file.hashes);
                stmt.execute(params![
                    game.id,
                    filetype.as_db(),
                    index as i64,
                    file.name,
                    file.merge,
                    file.status.as_db(),
                    file.location.as_db(),
                    file.size.as_db(),
                    crc,
                    md5,
                    sha1
                ])?;
            }
        }

        Ok(())
    }

    fn read_files(&self, game_id: i64, filetype: FileType) -> Result<Vec<FileDesc>> {
        let mut stmt = self.conn.prepare_cached(
            "select name, merge, status, location, size, crc, md5, sha1 from file \
             where game_id = ?1 and file_type = ?2 order by file_idx",
        )?;
        let rows = stmt
            .query_map(params![game_id, filetype.as_db()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<Vec<u8>>>(6)?,
                    row.get::<_, Option<Vec<u8>>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut files = Vec::with_capacity(rows.len());
        for (name, merge, status, location, size, crc, md5, sha1) in rows {
            files.push(FileDesc {
                name,
                merge,
                status: Status::from_db(status)
                    .ok_or_else(|| anyhow!("invalid status {} in database", status))?,
                location: Location::from_db(location)
                    .ok_or_else(|| anyhow!("invalid location {} in database", location))?,
                size: FileSize::from_db(size),
                hashes: hashes_from_columns(crc, md5, sha1)?,
                mtime: None,
                detector_view: None,
            });
        }
        Ok(files)
    }

    pub fn read_game(&self, name: &str) -> Result<Option<Game>> {
        let mut stmt = self.conn.prepare_cached(
            "select game_id, description, dat_idx, cloneof from game where name = ?1",
        )?;
        let header = stmt
            .query_row([name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .optional()?;
        let Some((id, description, dat_idx, cloneof)) = header else {
            return Ok(None);
        };

        let mut game = Game {
            id,
            name: name.to_owned(),
            description,
            dat_idx,
            cloneof: [cloneof, None],
            roms: self.read_files(id, FileType::Rom)?,
            disks: self.read_files(id, FileType::Disk)?,
        };

        if let Some(parent) = game.cloneof[0].clone() {
            let mut stmt = self
                .conn
                .prepare_cached("select cloneof from game where name = ?1")?;
            game.cloneof[1] = stmt
                .query_row([parent.as_str()], |row| row.get::<_, Option<String>>(0))
                .optional()?
                .flatten();
        }

        Ok(Some(game))
    }

    /// All locations of files matching the given hashes, by the primary
    /// hash subset actually provided. Nodumps are never returned.
    pub fn read_file_by_hash(
        &self,
        filetype: FileType,
        hashes: &Hashes,
    ) -> Result<Vec<FileLocation>> {
        let mut conditions = vec![
            "file.file_type = ?1".to_owned(),
            format!("file.status <> {}", Status::NoDump.as_db()),
        ];
        let mut params_vec: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Integer(filetype.as_db())];

        if let Some(crc) = hashes.crc {
            params_vec.push(rusqlite::types::Value::Integer(i64::from(crc)));
            conditions.push(format!("file.crc = ?{}", params_vec.len()));
        }
        if let Some(md5) = &hashes.md5 {
            params_vec.push(rusqlite::types::Value::Blob(md5.to_vec()));
            conditions.push(format!("file.md5 = ?{}", params_vec.len()));
        }
        if let Some(sha1) = &hashes.sha1 {
            params_vec.push(rusqlite::types::Value::Blob(sha1.to_vec()));
            conditions.push(format!("file.sha1 = ?{}", params_vec.len()));
        }
        if params_vec.len() == 1 {
            bail!("hash lookup without any hash");
        }

        let query = format!(
            "select game.name, file.file_idx from file \
             join game on game.game_id = file.game_id where {}",
            conditions.join(" and ")
        );
        let mut stmt = self.conn.prepare_cached(&query)?;
        let locations = stmt
            .query_map(rusqlite::params_from_iter(params_vec), |row| {
                Ok(FileLocation {
                    game: row.get(0)?,
                    index: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locations)
    }

    /// All locations of files with the given name.
    pub fn read_file_by_name(&self, filetype: FileType, name: &str) -> Result<Vec<FileLocation>> {
        let mut stmt = self.conn.prepare_cached(
            "select game.name, file.file_idx from file \
             join game on game.game_id = file.game_id \
             where file.file_type = ?1 and file.name = ?2",
        )?;
        let locations = stmt
            .query_map(params![filetype.as_db(), name], |row| {
                Ok(FileLocation {
                    game: row.get(0)?,
                    index: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locations)
    }

    pub fn read_list(&self, kind: ListKind) -> Result<Vec<String>> {
        let query = match kind {
            ListKind::Games => "select name from game order by name",
            ListKind::Disks => {
                "select distinct file.name from file where file_type = 2 order by file.name"
            }
        };
        let mut stmt = self.conn.prepare_cached(query)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Which hash columns are populated for the given filetype.
    pub fn hash_types(&self, filetype: FileType) -> Result<HashTypes> {
        let mut types = HashTypes::empty();
        for (hash_type, column) in [
            (HashType::Crc, "crc"),
            (HashType::Md5, "md5"),
            (HashType::Sha1, "sha1"),
        ] {
            let query = format!(
                "select 1 from file where file_type = ?1 and {} is not null limit 1",
                column
            );
            let mut stmt = self.conn.prepare_cached(&query)?;
            if stmt
                .query_row([filetype.as_db()], |_| Ok(()))
                .optional()?
                .is_some()
            {
                types.insert(hash_type);
            }
        }
        Ok(types)
    }

    /// Persist only the location column of each of the game's files.
    pub fn update_file_locations(&self, game: &Game) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "update file set location = ?1 \
             where game_id = ?2 and file_type = ?3 and file_idx = ?4",
        )?;
        for filetype in [FileType::Rom, FileType::Disk] {
            for (index, file) in game.files(filetype).iter().enumerate() {
                if file.location == Location::InGame {
                    continue;
                }
                stmt.execute(params![
                    file.location.as_db(),
                    game.id,
                    filetype.as_db(),
                    index as i64
                ])?;
            }
        }
        Ok(())
    }

    pub fn update_game_parent(&self, game: &Game) -> Result<()> {
        self.conn.execute(
            "update game set cloneof = ?1 where game_id = ?2",
            params![game.cloneof[0], game.id],
        )?;
        Ok(())
    }

    pub fn has_disks(&self) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("select 1 from file where file_type = 2 limit 1")?;
        Ok(stmt.query_row([], |_| Ok(())).optional()?.is_some())
    }

    /// (game count, rom count, total rom size, disk count) for `dump /stats`.
    pub fn read_stats(&self) -> Result<(i64, i64, i64, i64)> {
        let games = self
            .conn
            .query_row("select count(*) from game", [], |row| row.get(0))?;
        let (roms, bytes) = self.conn.query_row(
            "select count(*), coalesce(sum(size), 0) from file where file_type = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let disks = self
            .conn
            .query_row("select count(*) from file where file_type = 2", [], |row| {
                row.get(0)
            })?;
        Ok((games, roms, bytes, disks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn test_game() -> Game {
        let mut hashes = Hashes::default();
        hashes.set_from_str("aabbccdd").unwrap();
        Game {
            id: 0,
            name: "pacman".to_owned(),
            description: "Pac-Man".to_owned(),
            dat_idx: 0,
            cloneof: [None, None],
            roms: vec![FileDesc {
                name: "rom.bin".to_owned(),
                size: FileSize::Known(4),
                hashes,
                ..FileDesc::default()
            }],
            disks: Vec::new(),
        }
    }

    fn open_new() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("mame.db")).unwrap();
        let catalog = Catalog::open(&path, OpenMode::New).unwrap();
        (dir, catalog)
    }

    #[test]
    fn write_then_read_game_round_trips() {
        let (_dir, catalog) = open_new();
        let mut game = test_game();
        catalog.write_game(&mut game).unwrap();
        assert!(game.id > 0);

        let read = catalog.read_game("pacman").unwrap().unwrap();
        assert_eq!(read.name, game.name);
        assert_eq!(read.description, game.description);
        assert_eq!(read.roms.len(), 1);
        assert_eq!(read.roms[0].name, "rom.bin");
        assert_eq!(read.roms[0].size, FileSize::Known(4));
        assert_eq!(read.roms[0].hashes.crc, Some(0xaabb_ccdd));

        assert!(catalog.read_game("missing").unwrap().is_none());
    }

    #[test]
    fn write_game_replaces_previous_rows() {
        let (_dir, catalog) = open_new();
        let mut game = test_game();
        catalog.write_game(&mut game).unwrap();
        game.roms[0].name = "renamed.bin".to_owned();
        catalog.write_game(&mut game).unwrap();

        let read = catalog.read_game("pacman").unwrap().unwrap();
        assert_eq!(read.roms.len(), 1);
        assert_eq!(read.roms[0].name, "renamed.bin");
    }

    #[test]
    fn grandparent_resolution_walks_two_hops() {
        let (_dir, catalog) = open_new();
        let mut grandparent = test_game();
        grandparent.name = "origin".to_owned();
        catalog.write_game(&mut grandparent).unwrap();

        let mut parent = test_game();
        parent.name = "parent".to_owned();
        parent.cloneof = [Some("origin".to_owned()), None];
        catalog.write_game(&mut parent).unwrap();

        let mut child = test_game();
        child.name = "child".to_owned();
        child.cloneof = [Some("parent".to_owned()), None];
        catalog.write_game(&mut child).unwrap();

        let read = catalog.read_game("child").unwrap().unwrap();
        assert_eq!(read.cloneof[0].as_deref(), Some("parent"));
        assert_eq!(read.cloneof[1].as_deref(), Some("origin"));
    }

    #[test]
    fn hash_lookup_excludes_nodumps() {
        let (_dir, catalog) = open_new();
        let mut game = test_game();
        catalog.write_game(&mut game).unwrap();

        let mut nodump_game = test_game();
        nodump_game.name = "broken".to_owned();
        nodump_game.roms[0].status = Status::NoDump;
        catalog.write_game(&mut nodump_game).unwrap();

        let hashes = Hashes::from_str("aabbccdd").unwrap();
        let locations = catalog.read_file_by_hash(FileType::Rom, &hashes).unwrap();
        assert_eq!(
            locations,
            vec![FileLocation {
                game: "pacman".to_owned(),
                index: 0
            }]
        );
    }

    #[test]
    fn version_mismatch_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("mame.db")).unwrap();
        {
            let catalog = Catalog::open(&path, OpenMode::New).unwrap();
            catalog.conn.pragma_update(None, "user_version", 1).unwrap();
        }
        assert!(Catalog::open(&path, OpenMode::Read).is_err());
    }

    #[test]
    fn detector_round_trips() {
        let (_dir, catalog) = open_new();
        let detector = Detector {
            name: "iNES".to_owned(),
            author: "someone".to_owned(),
            version: "1".to_owned(),
            rules: vec![Rule {
                start_offset: 16,
                end_offset: EndOffset::Eof,
                operation: Operation::None,
                tests: vec![
                    Test::Data {
                        op: TestOp::Data,
                        offset: 0,
                        mask: None,
                        value: vec![0x4e, 0x45, 0x53, 0x1a],
                        result: true,
                    },
                    Test::FileSize {
                        compare: SizeCompare::Greater,
                        size: SizeOperand::Size(16),
                        result: true,
                    },
                    Test::FileSize {
                        compare: SizeCompare::Equal,
                        size: SizeOperand::PowerOfTwo,
                        result: false,
                    },
                ],
            }],
        };
        catalog.write_detector(&detector).unwrap();
        let read = catalog.read_detector().unwrap().unwrap();
        assert_eq!(read, detector);
    }

    #[test]
    fn dats_round_trip() {
        let (_dir, catalog) = open_new();
        let dat = DatEntry {
            name: "Test Set".to_owned(),
            description: "testing".to_owned(),
            version: "1.0".to_owned(),
        };
        catalog.write_dat(0, &dat).unwrap();
        assert_eq!(catalog.read_dats().unwrap(), vec![dat.clone()]);
        // same index overwrites rather than duplicating
        catalog.write_dat(0, &dat).unwrap();
        assert_eq!(catalog.read_dats().unwrap().len(), 1);
    }

    #[test]
    fn lists_are_sorted() {
        let (_dir, catalog) = open_new();
        for name in ["zaxxon", "asteroid", "pacman"] {
            let mut game = test_game();
            game.name = name.to_owned();
            catalog.write_game(&mut game).unwrap();
        }
        assert_eq!(
            catalog.read_list(ListKind::Games).unwrap(),
            vec!["asteroid", "pacman", "zaxxon"]
        );
    }

    #[test]
    fn hash_types_reports_populated_columns() {
        let (_dir, catalog) = open_new();
        let mut game = test_game();
        catalog.write_game(&mut game).unwrap();
        let types = catalog.hash_types(FileType::Rom).unwrap();
        assert!(types.contains(HashType::Crc));
        assert!(!types.contains(HashType::Sha1));
    }
}
