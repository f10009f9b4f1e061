use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;
use clap::Args;

use crate::archive::{Archive, OpenFlags};
use crate::catalog::{Catalog, ListKind, OpenMode};
use crate::check::{check_disks, check_files, check_old, CheckContext, GameResult};
use crate::diagnostics::{print_game_result, print_summary, print_superfluous, Fixdat, Stats};
use crate::fix::{cleanup_superfluous, fix_disks, fix_game, FixCounts};
use crate::models::{FileType, Location};
use crate::scanner::{list_superfluous, DirMaps};
use crate::settings::Settings;

macro_rules! debug_log {
    ($debug:expr, $($arg:tt)*) => {
        if $debug {
            eprintln!("{}", format!("Debug: {}", format!($($arg)*)));
        }
    };
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the mame database
    #[arg(short = 'D', long = "db")]
    db: Option<Utf8PathBuf>,

    /// Path to the database of old, retired dumps
    #[arg(short = 'O', long = "old-db")]
    old_db: Option<Utf8PathBuf>,

    /// Look for roms in this directory
    #[arg(short = 'R', long = "rom-dir")]
    rom_dir: Option<Utf8PathBuf>,

    /// Search for missing files in this directory (repeatable)
    #[arg(short = 'e', long = "search")]
    search: Vec<Utf8PathBuf>,

    /// Read the games to check from this file, one per line
    #[arg(short = 'T', long = "games-from")]
    games_from: Option<Utf8PathBuf>,

    /// Fix the rom sets
    #[arg(short = 'F', long)]
    fix: bool,

    /// Don't actually fix anything, only report what would be done
    #[arg(short = 'n', long)]
    dryrun: bool,

    /// Ignore unknown files in the rom directories
    #[arg(short = 'X', long)]
    ignore_extra: bool,

    /// Delete unknown files when fixing
    #[arg(short = 'k', long)]
    delete_unknown: bool,

    /// Move unknown files to the unknown directory when fixing (default)
    #[arg(short = 'K', long)]
    move_unknown: bool,

    /// Delete long files after slicing
    #[arg(short = 'l', long)]
    delete_long: bool,

    /// Keep long originals in the unknown directory (default)
    #[arg(short = 'L', long)]
    move_long: bool,

    /// Keep files copied from search directories (default)
    #[arg(long)]
    keep_found: bool,

    /// Delete files copied from search directories
    #[arg(short = 'j', long)]
    delete_found: bool,

    /// Keep files also present in the old rom database
    #[arg(long)]
    keep_duplicate: bool,

    /// Delete files also present in the old rom database (default)
    #[arg(long)]
    delete_duplicate: bool,

    /// Only list superfluous files in the rom directory
    #[arg(long)]
    superfluous: bool,

    /// Clean up superfluous archives after checking
    #[arg(long)]
    cleanup_extra: bool,

    /// Roms are files on disk, not contained in zip archives
    #[arg(short = 'u', long)]
    roms_unzipped: bool,

    /// Write rom archives sorted by entry name
    #[arg(long)]
    torrentzip: bool,

    /// Don't report unfixable errors
    #[arg(short = 'b', long)]
    nobroken: bool,

    /// Don't report fixable errors
    #[arg(short = 'f', long)]
    nofixable: bool,

    /// Don't report superfluous files
    #[arg(short = 's', long)]
    nosuperfluous: bool,

    /// Print only unfixable errors
    #[arg(short = 'w', long)]
    nowarnings: bool,

    /// Report correct sets
    #[arg(short = 'c', long)]
    correct: bool,

    /// Don't report roms with no good dumps
    #[arg(short = 'd', long)]
    nonogooddumps: bool,

    /// Print fixes made
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Check integrity of disk images by rehashing them
    #[arg(short = 'i', long)]
    integrity: bool,

    /// Write a dat of all missing files
    #[arg(long)]
    fixdat: Option<Utf8PathBuf>,

    /// Games to check (default: all games in the database)
    games: Vec<String>,
}

fn settings_from_args(args: &CheckArgs) -> Settings {
    let rom_dir = args
        .rom_dir
        .clone()
        .or_else(|| std::env::var("ROMPATH").ok().map(Utf8PathBuf::from))
        .unwrap_or_else(|| Utf8PathBuf::from("roms"));

    Settings {
        rom_dir,
        search_dirs: args.search.clone(),
        roms_unzipped: args.roms_unzipped,
        fix: args.fix,
        dryrun: args.dryrun,
        verbose: args.verbose,
        integrity: args.integrity,
        torrentzip: args.torrentzip,
        move_unknown: !args.delete_unknown,
        delete_long: args.delete_long && !args.move_long,
        delete_found: args.delete_found && !args.keep_found,
        delete_duplicate: !args.keep_duplicate,
        ignore_extra: args.ignore_extra,
        cleanup_extra: args.cleanup_extra,
        report_correct: args.correct,
        report_fixable: !args.nofixable,
        report_broken: !args.nobroken,
        report_superfluous: !args.nosuperfluous,
        report_no_good_dumps: !args.nonogooddumps,
        report_warnings: !args.nowarnings,
        fixdat: args.fixdat.clone(),
        ..Settings::default()
    }
}

/// Very small wildcard match: '*' matches any run of characters.
fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            if !name.starts_with(prefix) {
                return false;
            }
            let mut remaining = &name[prefix.len()..];
            let mut parts = rest.split('*').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    return remaining.ends_with(part);
                }
                match remaining.find(part) {
                    Some(position) => remaining = &remaining[position + part.len()..],
                    None => return false,
                }
            }
            true
        }
    }
}

fn games_to_check(args: &CheckArgs, catalog: &Catalog) -> Result<Vec<String>> {
    let all = catalog.read_list(ListKind::Games)?;

    if let Some(list_path) = &args.games_from {
        let text = std::fs::read_to_string(list_path)
            .with_context(|| format!("cannot read games list '{}'", list_path))?;
        let wanted: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        let mut games: Vec<String> = all
            .into_iter()
            .filter(|name| wanted.iter().any(|pattern| name_matches(pattern, name)))
            .collect();
        games.sort();
        return Ok(games);
    }

    if args.games.is_empty() {
        return Ok(all);
    }

    let mut games: Vec<String> = all
        .into_iter()
        .filter(|name| args.games.iter().any(|pattern| name_matches(pattern, name)))
        .collect();
    games.sort();
    Ok(games)
}

pub fn handle_command(args: &CheckArgs, debug: bool) -> Result<()> {
    let settings = settings_from_args(args);

    let db_path = crate::settings::resolve_db_path(args.db.clone());
    let catalog =
        Catalog::open(&db_path, OpenMode::Read).context("failed to open rom database")?;
    debug_log!(debug, "using database: {}", db_path);

    let old_catalog = match crate::settings::resolve_old_db_path(args.old_db.clone()) {
        Some(path) => Some(
            Catalog::open(&path, OpenMode::Read)
                .with_context(|| format!("failed to open old database '{}'", path))?,
        ),
        None => None,
    };

    if args.superfluous {
        let superfluous = list_superfluous(&settings, &catalog)?;
        print_superfluous(&settings, &superfluous);
        return Ok(());
    }

    let detector = catalog.read_detector()?;
    debug_log!(
        debug,
        "detector: {}",
        detector.as_ref().map_or("none", |detector| &detector.name)
    );

    let mut maps = DirMaps::new()?;
    maps.ensure_romset(&settings, &catalog, detector.as_ref())?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let _ = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst));
    }

    let games = games_to_check(args, &catalog)?;
    let mut stats = Stats::default();
    let mut counts = FixCounts::default();
    let mut fixdat = Fixdat::default();

    for name in &games {
        if stop.load(Ordering::SeqCst) {
            eprintln!("romck: interrupted, pending changes rolled back");
            break;
        }

        let mut ctx = CheckContext {
            catalog: &catalog,
            old_catalog: old_catalog.as_ref(),
            settings: &settings,
            detector: detector.as_ref(),
            maps: &mut maps,
        };
        if let Err(err) = process_game(name, &mut ctx, &mut stats, &mut counts, &mut fixdat) {
            eprintln!("romck: {}: {:#}", name, err);
        }
    }

    if settings.fix && !stop.load(Ordering::SeqCst) {
        let mut ctx = CheckContext {
            catalog: &catalog,
            old_catalog: old_catalog.as_ref(),
            settings: &settings,
            detector: detector.as_ref(),
            maps: &mut maps,
        };
        counts += cleanup_superfluous(&mut ctx)?;
    } else {
        print_superfluous(&settings, &maps.superfluous);
    }

    if let Some(fixdat_path) = &settings.fixdat {
        if !fixdat.is_empty() {
            fixdat.write(fixdat_path)?;
            debug_log!(debug, "wrote fixdat: {}", fixdat_path);
        }
    }

    print_summary(&stats, &counts, settings.fix && !settings.dryrun);
    Ok(())
}

fn process_game(
    name: &str,
    ctx: &mut CheckContext,
    stats: &mut Stats,
    counts: &mut FixCounts,
    fixdat: &mut Fixdat,
) -> Result<()> {
    let Some(game) = ctx.catalog.read_game(name)? else {
        anyhow::bail!("game not found in database");
    };

    let settings = ctx.settings;
    let own_flags = if settings.fix && !settings.dryrun {
        OpenFlags::writable()
    } else {
        OpenFlags::readonly()
    };
    let mut archives: [Option<Archive>; 3] = [
        Archive::open(
            &settings.game_archive_path(&game.name),
            settings.archive_kind(),
            FileType::Rom,
            Location::InGame,
            own_flags,
        )
        .ok(),
        None,
        None,
    ];
    for (slot, parent) in game.cloneof.iter().enumerate() {
        if let Some(parent) = parent {
            // fixing may stage a delete of a now-duplicate ancestor entry
            archives[slot + 1] = Archive::open(
                &settings.game_archive_path(parent),
                settings.archive_kind(),
                FileType::Rom,
                Location::InGame,
                own_flags,
            )
            .ok();
        }
    }

    let mut result = GameResult::new(&game, archives[0].as_ref());
    check_old(&game, ctx, &mut result)?;
    check_files(&game, &mut archives, ctx, &mut result)?;
    check_disks(&game, ctx, &mut result)?;

    stats.add_game(result.game);
    print_game_result(ctx.settings, &game, &result);
    fixdat.record(&game, &result);

    if ctx.settings.fix {
        *counts += fix_game(&game, &mut archives, ctx, &result)?;
        *counts += fix_disks(&game, ctx, &result)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns() {
        assert!(name_matches("pacman", "pacman"));
        assert!(!name_matches("pacman", "pacman2"));
        assert!(name_matches("pac*", "pacman"));
        assert!(name_matches("*man", "pacman"));
        assert!(name_matches("p*n", "pacman"));
        assert!(name_matches("*", "anything"));
        assert!(!name_matches("pac*x", "pacman"));
    }
}
