use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;
use clap::Args;

use crate::archive::{Archive, ArchiveKind, OpenFlags};
use crate::detector_xml;
use crate::hashes::{HashType, HashTypes};
use crate::models::{FileType, Location};

#[derive(Args)]
pub struct InspectArgs {
    /// Archives to list (zip files or directories)
    paths: Vec<Utf8PathBuf>,

    /// Hash types to compute, comma separated
    #[arg(long = "hash-types", default_value = "crc")]
    hash_types: String,

    /// Apply this header-skip detector and show the derived values
    #[arg(long)]
    detector: Option<Utf8PathBuf>,

    /// Archives are directories of loose files
    #[arg(short = 'u', long)]
    roms_unzipped: bool,
}

pub fn handle_command(args: &InspectArgs, _debug: bool) -> Result<()> {
    let types = HashTypes::from_comma_list(&args.hash_types)?;
    let detector = args
        .detector
        .as_deref()
        .map(detector_xml::parse_file)
        .transpose()?;

    for path in &args.paths {
        let kind = if args.roms_unzipped || path.is_dir() {
            ArchiveKind::Dir
        } else {
            ArchiveKind::Zip
        };
        let mut archive = Archive::open(
            path,
            kind,
            FileType::Rom,
            Location::RomSet,
            OpenFlags::readonly(),
        )
        .with_context(|| format!("cannot inspect '{}'", path))?;

        println!("{}:", path);
        for index in 0..archive.num_files() {
            archive.file_compute_hashes(index, types, detector.as_ref())?;
            let file = &archive.files[index];

            let mut line = format!("\t{} size {}", file.name, file.size);
            for hash_type in [HashType::Crc, HashType::Md5, HashType::Sha1] {
                if !types.contains(hash_type) {
                    continue;
                }
                if let Some(hex) = file.hashes.to_string(hash_type) {
                    line.push_str(&format!(" {} {}", hash_type, hex));
                }
            }
            if let Some(view) = &file.detector_view {
                line.push_str(&format!(" (header skipped: size {}", view.size));
                if let Some(crc) = view.hashes.to_string(HashType::Crc) {
                    line.push_str(&format!(" crc {}", crc));
                }
                line.push(')');
            }
            println!("{}", line);
        }
    }
    Ok(())
}
