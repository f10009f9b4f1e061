use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::hashes::Hashes;

/// What kind of content an archive or catalog entry holds.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    Rom,
    Sample,
    Disk,
}

impl FileType {
    pub fn as_db(self) -> i64 {
        match self {
            FileType::Rom => 0,
            FileType::Sample => 1,
            FileType::Disk => 2,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(FileType::Rom),
            1 => Some(FileType::Sample),
            2 => Some(FileType::Disk),
            _ => None,
        }
    }
}

/// Dump status from the reference catalog.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    #[strum(serialize = "baddump")]
    BadDump,
    #[strum(serialize = "nodump")]
    NoDump,
}

impl Status {
    pub fn as_db(self) -> i64 {
        match self {
            Status::Ok => 0,
            Status::BadDump => 1,
            Status::NoDump => 2,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::BadDump),
            2 => Some(Status::NoDump),
            _ => None,
        }
    }
}

/// Where a file lives, or is expected to live, relative to its game.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq)]
pub enum Location {
    /// In the game's own archive.
    #[default]
    InGame,
    /// Inherited from the parent game.
    InParent,
    /// Inherited from the grandparent game.
    InGrandparent,
    /// Somewhere else in the ROM set.
    RomSet,
    /// In the needed quarantine.
    Needed,
    /// In an archive no game references.
    Superfluous,
    /// In an extra search directory.
    Extra,
    /// Known to the old catalog only.
    Old,
    /// Not found anywhere.
    Nowhere,
}

impl Location {
    pub fn as_db(self) -> i64 {
        match self {
            Location::InGame => 0,
            Location::InParent => 1,
            Location::InGrandparent => 2,
            Location::RomSet => 3,
            Location::Needed => 4,
            Location::Superfluous => 5,
            Location::Extra => 6,
            Location::Old => 7,
            Location::Nowhere => 8,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Location::InGame),
            1 => Some(Location::InParent),
            2 => Some(Location::InGrandparent),
            3 => Some(Location::RomSet),
            4 => Some(Location::Needed),
            5 => Some(Location::Superfluous),
            6 => Some(Location::Extra),
            7 => Some(Location::Old),
            8 => Some(Location::Nowhere),
            _ => None,
        }
    }

    /// Index into the [own, parent, grandparent] archive slots, if the
    /// location names an ancestor level.
    pub fn ancestor_slot(self) -> Option<usize> {
        match self {
            Location::InGame => Some(0),
            Location::InParent => Some(1),
            Location::InGrandparent => Some(2),
            _ => None,
        }
    }
}

/// File size as recorded in a catalog; dats may omit it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum FileSize {
    #[default]
    Unknown,
    Known(u64),
}

impl FileSize {
    pub fn known(self) -> Option<u64> {
        match self {
            FileSize::Known(size) => Some(size),
            FileSize::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, FileSize::Known(_))
    }

    pub fn as_db(self) -> Option<i64> {
        self.known().map(|size| size as i64)
    }

    pub fn from_db(value: Option<i64>) -> Self {
        match value {
            Some(size) if size >= 0 => FileSize::Known(size as u64),
            _ => FileSize::Unknown,
        }
    }
}

impl std::fmt::Display for FileSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSize::Known(size) => write!(f, "{}", size),
            FileSize::Unknown => write!(f, "-"),
        }
    }
}

/// Effective (size, hashes) of a file after stripping a recognized header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DetectorView {
    pub size: u64,
    pub hashes: Hashes,
}

/// One expected or actual file: a catalog rom/disk entry or an archive entry.
#[derive(Clone, Debug, Default)]
pub struct FileDesc {
    pub name: String,
    pub merge: Option<String>,
    pub size: FileSize,
    pub hashes: Hashes,
    pub status: Status,
    pub location: Location,
    pub mtime: Option<i64>,
    /// Present iff a detector rule accepted this file.
    pub detector_view: Option<DetectorView>,
}

impl FileDesc {
    /// Name under which this file appears in the parent game.
    pub fn merged_name(&self) -> &str {
        self.merge.as_deref().unwrap_or(&self.name)
    }

    /// Size and hashes match, looking through the detector view as well.
    /// Catalog entries without hashes only ever match by name, and a
    /// nodump never matches by content.
    pub fn size_and_checksum_match(&self, actual: &FileDesc) -> bool {
        use crate::hashes::HashCompare;

        if self.status == Status::NoDump || self.hashes.is_empty() {
            return false;
        }

        if let (Some(expected), Some(got)) = (self.size.known(), actual.size.known()) {
            if expected == got
                && !actual.hashes.is_empty()
                && self.hashes.compare(&actual.hashes) == HashCompare::Match
            {
                return true;
            }
        }

        if let Some(view) = &actual.detector_view {
            if self.size.known() == Some(view.size)
                && self.hashes.compare(&view.hashes) == HashCompare::Match
            {
                return true;
            }
        }

        false
    }
}

/// One game from the catalog with its expected roms and disks.
#[derive(Clone, Debug, Default)]
pub struct Game {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub dat_idx: i64,
    /// Parent and grandparent names; resolution walks at most two hops.
    pub cloneof: [Option<String>; 2],
    pub roms: Vec<FileDesc>,
    pub disks: Vec<FileDesc>,
}

impl Game {
    pub fn files(&self, filetype: FileType) -> &[FileDesc] {
        match filetype {
            FileType::Disk => &self.disks,
            _ => &self.roms,
        }
    }

    pub fn files_mut(&mut self, filetype: FileType) -> &mut Vec<FileDesc> {
        match filetype {
            FileType::Disk => &mut self.disks,
            _ => &mut self.roms,
        }
    }
}

/// One dat source imported into the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatEntry {
    pub name: String,
    pub description: String,
    pub version: String,
}

/// Where in the catalog a hash was found: game plus file index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLocation {
    pub game: String,
    pub index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_name_falls_back_to_name() {
        let mut rom = FileDesc {
            name: "child.bin".to_owned(),
            ..FileDesc::default()
        };
        assert_eq!(rom.merged_name(), "child.bin");
        rom.merge = Some("parent.bin".to_owned());
        assert_eq!(rom.merged_name(), "parent.bin");
    }

    #[test]
    fn db_round_trip_for_enums() {
        for location in [
            Location::InGame,
            Location::InParent,
            Location::InGrandparent,
            Location::RomSet,
            Location::Needed,
            Location::Superfluous,
            Location::Extra,
            Location::Old,
            Location::Nowhere,
        ] {
            assert_eq!(Location::from_db(location.as_db()), Some(location));
        }
        for status in [Status::Ok, Status::BadDump, Status::NoDump] {
            assert_eq!(Status::from_db(status.as_db()), Some(status));
        }
        for filetype in [FileType::Rom, FileType::Sample, FileType::Disk] {
            assert_eq!(FileType::from_db(filetype.as_db()), Some(filetype));
        }
    }

    #[test]
    fn nodump_does_not_match_by_content() {
        let bytes = b"abcd";
        let hashes = crate::hashes::hash_bytes(bytes, crate::hashes::HashTypes::ALL);
        let expected = FileDesc {
            name: "a".to_owned(),
            size: FileSize::Known(4),
            hashes: hashes.clone(),
            status: Status::NoDump,
            ..FileDesc::default()
        };
        let actual = FileDesc {
            name: "b".to_owned(),
            size: FileSize::Known(4),
            hashes,
            ..FileDesc::default()
        };
        assert!(!expected.size_and_checksum_match(&actual));
    }

    #[test]
    fn detector_view_matches_when_raw_differs() {
        let body_hashes = crate::hashes::hash_bytes(b"body", crate::hashes::HashTypes::ALL);
        let raw_hashes = crate::hashes::hash_bytes(b"headbody", crate::hashes::HashTypes::ALL);

        let expected = FileDesc {
            name: "game.nes".to_owned(),
            size: FileSize::Known(4),
            hashes: body_hashes.clone(),
            ..FileDesc::default()
        };
        let actual = FileDesc {
            name: "game.nes".to_owned(),
            size: FileSize::Known(8),
            hashes: raw_hashes,
            detector_view: Some(DetectorView {
                size: 4,
                hashes: body_hashes,
            }),
            ..FileDesc::default()
        };
        assert!(expected.size_and_checksum_match(&actual));
    }
}
