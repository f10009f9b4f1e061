use camino::{Utf8Path, Utf8PathBuf};

use crate::archive::ArchiveKind;

/// Everything the check and fix engines need to know about this run,
/// built once from the CLI flags and environment.
#[derive(Clone, Debug)]
pub struct Settings {
    pub rom_dir: Utf8PathBuf,
    pub needed_dir: Utf8PathBuf,
    pub unknown_dir: Utf8PathBuf,
    pub search_dirs: Vec<Utf8PathBuf>,

    pub roms_unzipped: bool,
    pub fix: bool,
    pub dryrun: bool,
    pub verbose: bool,
    pub integrity: bool,
    pub torrentzip: bool,

    /// Move unknown files to the unknown quarantine instead of deleting.
    pub move_unknown: bool,
    /// Delete long originals after slicing instead of quarantining them.
    pub delete_long: bool,
    /// Delete files copied out of search directories.
    pub delete_found: bool,
    /// Delete files listed in the old catalog.
    pub delete_duplicate: bool,
    pub ignore_extra: bool,
    pub cleanup_extra: bool,

    pub report_correct: bool,
    pub report_fixable: bool,
    pub report_broken: bool,
    pub report_superfluous: bool,
    pub report_no_good_dumps: bool,
    pub report_warnings: bool,

    pub fixdat: Option<Utf8PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            rom_dir: Utf8PathBuf::from("roms"),
            needed_dir: Utf8PathBuf::from("needed"),
            unknown_dir: Utf8PathBuf::from("unknown"),
            search_dirs: Vec::new(),
            roms_unzipped: false,
            fix: false,
            dryrun: false,
            verbose: false,
            integrity: false,
            torrentzip: false,
            move_unknown: true,
            delete_long: false,
            delete_found: false,
            delete_duplicate: true,
            ignore_extra: false,
            cleanup_extra: false,
            report_correct: false,
            report_fixable: true,
            report_broken: true,
            report_superfluous: true,
            report_no_good_dumps: true,
            report_warnings: true,
            fixdat: None,
        }
    }
}

/// Database path from the flag, the MAMEDB variable, or the default.
pub fn resolve_db_path(arg: Option<Utf8PathBuf>) -> Utf8PathBuf {
    arg.or_else(|| std::env::var("MAMEDB").ok().map(Utf8PathBuf::from))
        .unwrap_or_else(|| Utf8PathBuf::from("mame.db"))
}

/// Old-dump database path from the flag or the MAMEDB_OLD variable.
pub fn resolve_old_db_path(arg: Option<Utf8PathBuf>) -> Option<Utf8PathBuf> {
    arg.or_else(|| std::env::var("MAMEDB_OLD").ok().map(Utf8PathBuf::from))
}

impl Settings {
    pub fn archive_kind(&self) -> ArchiveKind {
        if self.roms_unzipped {
            ArchiveKind::Dir
        } else {
            ArchiveKind::Zip
        }
    }

    /// On-disk archive path of a game in the ROM tree.
    pub fn game_archive_path(&self, game: &str) -> Utf8PathBuf {
        if self.roms_unzipped {
            self.rom_dir.join(game)
        } else {
            self.rom_dir.join(format!("{}.zip", game))
        }
    }

    /// Kind of an archive found at `path` during a scan.
    pub fn kind_of(path: &Utf8Path) -> ArchiveKind {
        if path.is_dir() {
            ArchiveKind::Dir
        } else {
            ArchiveKind::Zip
        }
    }
}
