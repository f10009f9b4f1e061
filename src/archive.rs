use std::fs::File;
use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::detector::Detector;
use crate::hashes::{HashCompare, HashTypes, HashUpdate, Hashes};
use crate::models::{FileDesc, FileSize, FileType, Location, Status};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Name of the per-directory entry cache, never treated as an archive entry.
pub const CACHE_DB_NAME: &str = ".ckmame.db";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Dir,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct OpenFlags {
    pub readonly: bool,
    /// Open even if the backing store does not exist yet.
    pub create: bool,
    /// Do not remove the archive when committing it empty.
    pub keep_empty: bool,
}

impl OpenFlags {
    pub fn readonly() -> Self {
        OpenFlags {
            readonly: true,
            ..OpenFlags::default()
        }
    }

    pub fn writable() -> Self {
        OpenFlags::default()
    }

    pub fn create() -> Self {
        OpenFlags {
            create: true,
            ..OpenFlags::default()
        }
    }
}

/// Outcome of moving an original file aside before a staged mutation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MoveResult {
    NotNeeded,
    Moved,
}

/// Staged data backing a changed entry: a temp file next to the archive,
/// or explicitly empty content.
#[derive(Clone, Debug)]
enum StagedData {
    TempFile(Utf8PathBuf),
    Empty,
}

/// Pending change for one entry. Nothing touches the backing storage
/// until commit, except that the directory backend moves originals aside
/// (restored by rollback).
#[derive(Clone, Debug, Default)]
struct Change {
    /// New logical name, set on rename / add / replace.
    destination: Option<String>,
    /// New content; `None` with a destination means a pure rename.
    data: Option<StagedData>,
    deleted: bool,
    added: bool,
    /// Directory backend: where the original was moved out of the way.
    moved_aside: Option<Utf8PathBuf>,
}

impl Change {
    fn is_unchanged(&self) -> bool {
        self.destination.is_none() && !self.deleted && !self.added
    }

    fn is_renamed(&self) -> bool {
        self.destination.is_some() && self.data.is_none() && !self.deleted && !self.added
    }
}

/// A mutable collection of named byte-stream entries backed by a ZIP file
/// or a directory, with staged commit.
pub struct Archive {
    pub id: i64,
    pub path: Utf8PathBuf,
    pub kind: ArchiveKind,
    pub filetype: FileType,
    pub location: Location,
    pub files: Vec<FileDesc>,
    changes: Vec<Change>,
    flags: OpenFlags,
    /// Entry order to write on commit is sorted when set (torrentzip-style).
    pub sort_on_commit: bool,
    exists: bool,
}

fn sanitize_temp_prefix(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    format!("{}.", base)
}

fn make_temp(dir: &Utf8Path, name: &str) -> Result<Utf8PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create directory '{}'", dir))?;
    let file = tempfile::Builder::new()
        .prefix(&sanitize_temp_prefix(name))
        .tempfile_in(dir)
        .with_context(|| format!("cannot create temp file in '{}'", dir))?;
    let path = file
        .into_temp_path()
        .keep()
        .context("cannot keep temp file")?;
    Utf8PathBuf::from_path_buf(path).map_err(|path| anyhow!("temp path {:?} is not UTF-8", path))
}

/// Delete a file and any parent directories it leaves empty, up to but not
/// including `root`.
fn remove_file_and_empty_dirs(path: &Utf8Path, root: &Utf8Path) -> Result<()> {
    std::fs::remove_file(path).with_context(|| format!("cannot delete '{}'", path))?;
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}

fn mtime_of(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
}

impl Archive {
    pub fn open(
        path: &Utf8Path,
        kind: ArchiveKind,
        filetype: FileType,
        location: Location,
        flags: OpenFlags,
    ) -> Result<Self> {
        let mut archive = Archive {
            id: 0,
            path: path.to_owned(),
            kind,
            filetype,
            location,
            files: Vec::new(),
            changes: Vec::new(),
            flags,
            sort_on_commit: false,
            exists: false,
        };

        match kind {
            ArchiveKind::Zip => archive.read_zip_entries()?,
            ArchiveKind::Dir => archive.read_dir_entries()?,
        }
        archive.changes = vec![Change::default(); archive.files.len()];

        Ok(archive)
    }

    /// Archive view over a fixed entry list without a mutable backing
    /// store, used to index standalone files such as disk images.
    pub fn for_entries(
        path: &Utf8Path,
        kind: ArchiveKind,
        filetype: FileType,
        location: Location,
        files: Vec<FileDesc>,
    ) -> Self {
        let changes = vec![Change::default(); files.len()];
        Archive {
            id: 0,
            path: path.to_owned(),
            kind,
            filetype,
            location,
            files,
            changes,
            flags: OpenFlags::readonly(),
            sort_on_commit: false,
            exists: true,
        }
    }

    fn read_zip_entries(&mut self) -> Result<()> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.flags.create {
                    return Ok(());
                }
                return Err(err).with_context(|| format!("archive '{}' not found", self.path));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("cannot open archive '{}'", self.path))
            }
        };

        let mut zip = ZipArchive::new(file)
            .with_context(|| format!("'{}' is not a usable zip archive", self.path))?;
        self.exists = true;

        for i in 0..zip.len() {
            let entry = zip
                .by_index_raw(i)
                .with_context(|| format!("cannot read entry {} of '{}'", i, self.path))?;
            if entry.is_dir() {
                continue;
            }
            let mut hashes = Hashes::default();
            hashes.crc = Some(entry.crc32());
            self.files.push(FileDesc {
                name: entry.name().to_owned(),
                size: FileSize::Known(entry.size()),
                hashes,
                location: self.location,
                ..FileDesc::default()
            });
        }
        Ok(())
    }

    fn read_dir_entries(&mut self) -> Result<()> {
        if !self.path.exists() {
            if self.flags.create {
                return Ok(());
            }
            bail!("archive '{}' not found", self.path);
        }
        if !self.path.is_dir() {
            bail!("'{}' is not a directory", self.path);
        }
        self.exists = true;

        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&self.path).sort_by_file_name() {
            let entry = entry.with_context(|| format!("cannot read directory '{}'", self.path))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let full = Utf8PathBuf::from_path_buf(entry.path().to_path_buf())
                .map_err(|path| anyhow!("path {:?} is not UTF-8", path))?;
            let name = full
                .strip_prefix(&self.path)
                .map_err(|_| anyhow!("entry '{}' outside archive '{}'", full, self.path))?;
            if name.as_str() == CACHE_DB_NAME {
                continue;
            }
            let metadata = entry.metadata()?;
            entries.push(FileDesc {
                name: name.to_string(),
                size: FileSize::Known(metadata.len()),
                mtime: mtime_of(&metadata),
                location: self.location,
                ..FileDesc::default()
            });
        }
        self.files = entries;
        Ok(())
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, index: usize) -> &FileDesc {
        &self.files[index]
    }

    /// Current logical name of an entry, staged rename included.
    pub fn current_name(&self, index: usize) -> &str {
        self.changes[index]
            .destination
            .as_deref()
            .unwrap_or(&self.files[index].name)
    }

    pub fn name_index(&self, name: &str) -> Option<usize> {
        (0..self.files.len())
            .find(|&i| !self.changes[i].deleted && self.current_name(i) == name)
    }

    pub fn is_modified(&self) -> bool {
        self.changes.iter().any(|change| !change.is_unchanged())
    }

    /// True when every entry is staged for deletion (or there are none).
    pub fn is_empty_after_commit(&self) -> bool {
        self.changes.iter().all(|change| change.deleted)
    }

    fn check_writable(&self) -> Result<()> {
        if self.flags.readonly {
            bail!("archive '{}' is read-only", self.path);
        }
        Ok(())
    }

    fn dir_full_name(&self, index: usize) -> Utf8PathBuf {
        self.path.join(&self.files[index].name)
    }

    /// Path of the entry's current on-disk data (directory backend).
    fn dir_data_path(&self, index: usize) -> Utf8PathBuf {
        let change = &self.changes[index];
        if let Some(StagedData::TempFile(path)) = &change.data {
            return path.clone();
        }
        if let Some(path) = &change.moved_aside {
            return path.clone();
        }
        self.dir_full_name(index)
    }

    /// Run `body` over a reader of the entry's current content.
    fn with_entry_reader<T>(
        &mut self,
        index: usize,
        body: impl FnOnce(&mut dyn Read) -> Result<T>,
    ) -> Result<T> {
        if index >= self.files.len() {
            bail!("no entry {} in '{}'", index, self.path);
        }

        match &self.changes[index].data {
            Some(StagedData::Empty) => return body(&mut std::io::empty()),
            Some(StagedData::TempFile(path)) => {
                let mut file = File::open(path)
                    .with_context(|| format!("cannot open staged data '{}'", path))?;
                return body(&mut file);
            }
            None => {}
        }

        match self.kind {
            ArchiveKind::Dir => {
                let path = self.dir_data_path(index);
                let mut file = File::open(&path).with_context(|| {
                    format!("cannot open '{}' in archive '{}'", path, self.path)
                })?;
                body(&mut file)
            }
            ArchiveKind::Zip => {
                let file = File::open(&self.path)
                    .with_context(|| format!("cannot open archive '{}'", self.path))?;
                let mut zip = ZipArchive::new(file)
                    .with_context(|| format!("'{}' is not a usable zip archive", self.path))?;
                let name = self.files[index].name.clone();
                let mut entry = zip
                    .by_name(&name)
                    .with_context(|| format!("cannot read '{}' from '{}'", name, self.path))?;
                body(&mut entry)
            }
        }
    }

    /// Read the entry's current content into memory.
    pub fn file_open(&mut self, index: usize) -> Result<Vec<u8>> {
        self.with_entry_reader(index, |reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            Ok(data)
        })
    }

    /// Fill in the entry's missing hash types by streaming its content;
    /// already-present hashes are kept. Runs the header-skip detector once
    /// per entry when one is given.
    pub fn file_compute_hashes(
        &mut self,
        index: usize,
        types: HashTypes,
        detector: Option<&Detector>,
    ) -> Result<()> {
        let wanted = types;
        if !self.files[index].hashes.has_all_types(wanted) {
            let mut computed = Hashes::default();
            let mut size = 0u64;
            {
                let mut update = HashUpdate::new(&mut computed, wanted);
                self.with_entry_reader(index, |reader| {
                    let mut buf = vec![0u8; COPY_BUF_SIZE];
                    loop {
                        let n = reader.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        size += n as u64;
                        update.update(&buf[..n]);
                    }
                    Ok(())
                })?;
                update.finish();
            }

            let file = &mut self.files[index];
            if let Some(known) = file.size.known() {
                if known != size {
                    file.status = Status::BadDump;
                }
            }
            file.size = FileSize::Known(size);
            // Keep a declared CRC that disagrees visible as a bad dump.
            if let (Some(declared), Some(got)) = (file.hashes.crc, computed.crc) {
                if declared != got {
                    file.status = Status::BadDump;
                }
            }
            file.hashes.merge(&computed);
        }

        if let Some(detector) = detector {
            if self.files[index].detector_view.is_none() && self.filetype != FileType::Disk {
                let size = self.files[index].size.known().unwrap_or(0);
                let view =
                    self.with_entry_reader(index, |reader| detector.execute(size, reader))?;
                self.files[index].detector_view = view;
            }
        }

        Ok(())
    }

    /// Compare the entry against `hashes`, computing whatever types the
    /// comparison needs first.
    pub fn file_compare_hashes(&mut self, index: usize, hashes: &Hashes) -> Result<HashCompare> {
        self.file_compute_hashes(index, hashes.types(), None)?;
        let file = &self.files[index];
        let raw = file.hashes.compare(hashes);
        if raw == HashCompare::Match {
            return Ok(HashCompare::Match);
        }
        if let Some(view) = &file.detector_view {
            if view.hashes.compare(hashes) == HashCompare::Match {
                return Ok(HashCompare::Match);
            }
        }
        Ok(raw)
    }

    /// Scan the entry for the first offset at which a `length`-byte window
    /// matches `hashes`. Used to find a ROM concatenated into a longer file.
    pub fn file_find_offset(
        &mut self,
        index: usize,
        length: u64,
        hashes: &Hashes,
    ) -> Result<Option<u64>> {
        let data = self.file_open(index)?;
        if (data.len() as u64) < length {
            return Ok(None);
        }

        let window = length as usize;
        for offset in 0..=(data.len() - window) {
            let slice = &data[offset..offset + window];
            if let Some(expected_crc) = hashes.crc {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(slice);
                if hasher.finalize() != expected_crc {
                    continue;
                }
            }
            let candidate = crate::hashes::hash_bytes(slice, hashes.types());
            if candidate.compare(hashes) == HashCompare::Match {
                return Ok(Some(offset as u64));
            }
        }
        Ok(None)
    }

    /// Directory backend: move the original file out of the destination's
    /// way before a staged rename/replace/delete lands.
    fn move_original_out_of_the_way(&mut self, index: usize) -> Result<MoveResult> {
        if self.kind != ArchiveKind::Dir {
            return Ok(MoveResult::NotNeeded);
        }
        if self.changes[index].added || self.changes[index].moved_aside.is_some() {
            return Ok(MoveResult::NotNeeded);
        }

        let full_name = self.dir_full_name(index);
        let parent = full_name
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| self.path.clone());
        let temp = make_temp(&parent, &self.files[index].name)?;
        std::fs::rename(&full_name, &temp)
            .with_context(|| format!("cannot move '{}' to '{}'", full_name, temp))?;
        self.changes[index].moved_aside = Some(temp);
        Ok(MoveResult::Moved)
    }

    /// True if `name` is taken by a surviving entry or staged destination.
    fn name_will_exist_after_commit(&self, name: &str) -> bool {
        (0..self.files.len()).any(|i| !self.changes[i].deleted && self.current_name(i) == name)
    }

    /// Stage an empty entry under `name`.
    pub fn file_add_empty(&mut self, name: &str) -> Result<usize> {
        self.check_writable()?;
        if self.name_will_exist_after_commit(name) {
            bail!("'{}' already exists in '{}'", name, self.path);
        }

        self.files.push(FileDesc {
            name: name.to_owned(),
            size: FileSize::Known(0),
            hashes: crate::hashes::hash_bytes(&[], HashTypes::ALL),
            location: self.location,
            ..FileDesc::default()
        });
        self.changes.push(Change {
            destination: Some(name.to_owned()),
            data: Some(StagedData::Empty),
            added: true,
            ..Change::default()
        });
        Ok(self.files.len() - 1)
    }

    /// Stage a copy of `length` bytes starting at `start` of an entry of
    /// `source` into this archive under `name`. `length` of `None` copies
    /// to the end.
    pub fn file_copy_part(
        &mut self,
        source: &mut Archive,
        source_index: usize,
        name: &str,
        start: u64,
        length: Option<u64>,
    ) -> Result<usize> {
        self.check_writable()?;
        if self.name_will_exist_after_commit(name) {
            bail!("'{}' already exists in '{}'", name, self.path);
        }

        let temp_dir = match self.kind {
            ArchiveKind::Dir => {
                let full = self.path.join(name);
                full.parent()
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|| self.path.clone())
            }
            ArchiveKind::Zip => self
                .path
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from(".")),
        };
        let temp = make_temp(&temp_dir, name)?;

        let mut hashes = Hashes::default();
        let mut written = 0u64;
        let copy_result = (|| -> Result<()> {
            let mut update = HashUpdate::new(&mut hashes, HashTypes::ALL);
            let mut out = File::create(&temp)
                .with_context(|| format!("cannot open temp file '{}'", temp))?;
            source.with_entry_reader(source_index, |reader| {
                let mut remaining_skip = start;
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                while remaining_skip > 0 {
                    let want = remaining_skip.min(COPY_BUF_SIZE as u64) as usize;
                    let n = reader.read(&mut buf[..want])?;
                    if n == 0 {
                        bail!("source entry shorter than copy offset");
                    }
                    remaining_skip -= n as u64;
                }
                let mut remaining = length;
                loop {
                    let want = match remaining {
                        Some(0) => break,
                        Some(left) => left.min(COPY_BUF_SIZE as u64) as usize,
                        None => COPY_BUF_SIZE,
                    };
                    let n = reader.read(&mut buf[..want])?;
                    if n == 0 {
                        if let Some(left) = remaining {
                            if left > 0 {
                                bail!("source entry shorter than copy length");
                            }
                        }
                        break;
                    }
                    out.write_all(&buf[..n])?;
                    update.update(&buf[..n]);
                    written += n as u64;
                    if let Some(left) = remaining.as_mut() {
                        *left -= n as u64;
                    }
                }
                Ok(())
            })?;
            update.finish();
            Ok(())
        })();

        if let Err(err) = copy_result {
            let _ = std::fs::remove_file(&temp);
            return Err(err).with_context(|| {
                format!(
                    "cannot copy '{}' from '{}' into '{}'",
                    source.files[source_index].name, source.path, self.path
                )
            });
        }

        self.files.push(FileDesc {
            name: name.to_owned(),
            size: FileSize::Known(written),
            hashes,
            location: self.location,
            ..FileDesc::default()
        });
        self.changes.push(Change {
            destination: Some(name.to_owned()),
            data: Some(StagedData::TempFile(temp)),
            added: true,
            ..Change::default()
        });
        Ok(self.files.len() - 1)
    }

    /// Stage a whole-entry copy.
    pub fn file_copy(&mut self, source: &mut Archive, source_index: usize, name: &str) -> Result<usize> {
        self.file_copy_part(source, source_index, name, 0, None)
    }

    /// Replace an entry by a slice of itself: the slice is materialized
    /// through a temp file, the original is staged for deletion, and the
    /// slice takes over `name` (usually the original's own name).
    pub fn extract_slice(
        &mut self,
        index: usize,
        name: &str,
        start: u64,
        length: u64,
    ) -> Result<usize> {
        self.check_writable()?;

        let temp_dir = match self.kind {
            ArchiveKind::Dir => {
                let full = self.path.join(name);
                full.parent()
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|| self.path.clone())
            }
            ArchiveKind::Zip => self
                .path
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from(".")),
        };
        let temp = make_temp(&temp_dir, name)?;

        let mut hashes = Hashes::default();
        let copy_result = (|| -> Result<()> {
            let mut update = HashUpdate::new(&mut hashes, HashTypes::ALL);
            let mut out = File::create(&temp)?;
            self.with_entry_reader(index, |reader| {
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                let mut to_skip = start;
                while to_skip > 0 {
                    let want = to_skip.min(COPY_BUF_SIZE as u64) as usize;
                    let n = reader.read(&mut buf[..want])?;
                    if n == 0 {
                        bail!("entry shorter than slice offset");
                    }
                    to_skip -= n as u64;
                }
                let mut remaining = length;
                while remaining > 0 {
                    let want = remaining.min(COPY_BUF_SIZE as u64) as usize;
                    let n = reader.read(&mut buf[..want])?;
                    if n == 0 {
                        bail!("entry shorter than slice");
                    }
                    out.write_all(&buf[..n])?;
                    update.update(&buf[..n]);
                    remaining -= n as u64;
                }
                Ok(())
            })?;
            update.finish();
            Ok(())
        })();
        if let Err(err) = copy_result {
            let _ = std::fs::remove_file(&temp);
            return Err(err)
                .with_context(|| format!("cannot slice '{}' in '{}'", self.files[index].name, self.path));
        }

        self.file_delete(index)?;
        if self.name_will_exist_after_commit(name) {
            let _ = std::fs::remove_file(&temp);
            bail!("'{}' already exists in '{}'", name, self.path);
        }

        self.files.push(FileDesc {
            name: name.to_owned(),
            size: FileSize::Known(length),
            hashes,
            location: self.location,
            ..FileDesc::default()
        });
        self.changes.push(Change {
            destination: Some(name.to_owned()),
            data: Some(StagedData::TempFile(temp)),
            added: true,
            ..Change::default()
        });
        Ok(self.files.len() - 1)
    }

    /// Stage deletion of an entry.
    pub fn file_delete(&mut self, index: usize) -> Result<()> {
        self.check_writable()?;
        if self.changes[index].deleted {
            return Ok(());
        }
        if !self.changes[index].added {
            self.move_original_out_of_the_way(index)?;
        }
        let change = &mut self.changes[index];
        if let Some(StagedData::TempFile(path)) = change.data.take() {
            let _ = std::fs::remove_file(path);
        }
        change.destination = None;
        change.deleted = true;
        Ok(())
    }

    /// Stage a rename; renaming onto a surviving name is a policy error.
    pub fn file_rename(&mut self, index: usize, name: &str) -> Result<()> {
        self.check_writable()?;
        if self.changes[index].deleted {
            bail!(
                "cannot rename deleted entry '{}' in '{}'",
                self.files[index].name,
                self.path
            );
        }
        if self.name_will_exist_after_commit(name) {
            bail!("cannot rename to existing name '{}' in '{}'", name, self.path);
        }

        if !self.changes[index].added {
            self.move_original_out_of_the_way(index)?;
        }
        self.changes[index].destination = Some(name.to_owned());
        Ok(())
    }

    /// Apply staged changes to the backing store. On failure the remaining
    /// changes are rolled back; already-applied ones stay.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_modified() {
            return Ok(());
        }
        self.check_writable()?;

        let result = match self.kind {
            ArchiveKind::Dir => self.commit_dir(),
            ArchiveKind::Zip => self.commit_zip(),
        };

        match result {
            Ok(()) => {
                // Fold changes into the entry list.
                let changes = std::mem::take(&mut self.changes);
                let mut files = Vec::new();
                for (mut file, change) in std::mem::take(&mut self.files).into_iter().zip(changes) {
                    if change.deleted {
                        continue;
                    }
                    if let Some(name) = change.destination {
                        file.name = name;
                    }
                    files.push(file);
                }
                self.files = files;
                self.changes = vec![Change::default(); self.files.len()];
                Ok(())
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    fn commit_dir(&mut self) -> Result<()> {
        for index in 0..self.files.len() {
            let change = self.changes[index].clone();
            if change.is_unchanged() {
                continue;
            }

            if change.deleted {
                if let Some(moved) = &change.moved_aside {
                    remove_file_and_empty_dirs(moved, &self.path)?;
                }
                self.changes[index].moved_aside = None;
                continue;
            }

            let Some(destination) = &change.destination else {
                continue;
            };
            let final_path = self.path.join(destination);
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create directory '{}'", parent))?;
            }

            match &change.data {
                Some(StagedData::TempFile(temp)) => {
                    std::fs::rename(temp, &final_path)
                        .with_context(|| format!("cannot move '{}' to '{}'", temp, final_path))?;
                    if let Some(moved) = &change.moved_aside {
                        remove_file_and_empty_dirs(moved, &self.path)?;
                    }
                }
                Some(StagedData::Empty) => {
                    File::create(&final_path)
                        .with_context(|| format!("cannot create '{}'", final_path))?;
                    if let Some(moved) = &change.moved_aside {
                        remove_file_and_empty_dirs(moved, &self.path)?;
                    }
                }
                None => {
                    // Pure rename: the data is the moved-aside original.
                    let source = change
                        .moved_aside
                        .clone()
                        .unwrap_or_else(|| self.dir_full_name(index));
                    std::fs::rename(&source, &final_path)
                        .with_context(|| format!("cannot rename '{}' to '{}'", source, final_path))?;
                    // Prune directories the rename may have emptied.
                    if let Some(parent) = source.parent() {
                        let mut dir = Some(parent);
                        while let Some(current) = dir {
                            if current == self.path || std::fs::remove_dir(current).is_err() {
                                break;
                            }
                            dir = current.parent();
                        }
                    }
                }
            }

            let file = &mut self.files[index];
            file.name = destination.clone();
            if let Ok(metadata) = std::fs::metadata(&final_path) {
                file.mtime = mtime_of(&metadata);
            }
            // the change is applied; rollback must not touch it again
            self.changes[index] = Change {
                destination: self.changes[index].destination.clone(),
                added: self.changes[index].added,
                ..Change::default()
            };
        }

        if self.is_empty_after_commit() && !self.flags.keep_empty && self.exists {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => self.exists = false,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.exists = false,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("cannot remove empty archive '{}'", self.path))
                }
            }
        }

        Ok(())
    }

    fn commit_zip(&mut self) -> Result<()> {
        let survivors: Vec<usize> = (0..self.files.len())
            .filter(|&i| !self.changes[i].deleted)
            .collect();

        if survivors.is_empty() {
            if self.flags.keep_empty {
                // leave an empty archive behind
            } else if self.exists {
                std::fs::remove_file(&self.path)
                    .with_context(|| format!("cannot remove empty archive '{}'", self.path))?;
                self.exists = false;
                self.cleanup_staged_temps();
                return Ok(());
            } else {
                self.cleanup_staged_temps();
                return Ok(());
            }
        }

        let parent = self
            .path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("cannot create directory '{}'", parent))?;
        let temp = tempfile::Builder::new()
            .prefix(".romck.")
            .suffix(".zip")
            .tempfile_in(&parent)
            .with_context(|| format!("cannot create temp archive in '{}'", parent))?;

        {
            let mut writer = ZipWriter::new(temp.reopen()?);
            let options = SimpleFileOptions::default();

            let mut order = survivors;
            if self.sort_on_commit {
                order.sort_by(|&a, &b| self.current_name(a).cmp(self.current_name(b)));
            }

            let mut source = if self.exists {
                let file = File::open(&self.path)
                    .with_context(|| format!("cannot open archive '{}'", self.path))?;
                Some(ZipArchive::new(file).with_context(|| {
                    format!("'{}' is not a usable zip archive", self.path)
                })?)
            } else {
                None
            };

            for index in order {
                let change = &self.changes[index];
                let name = self.current_name(index).to_owned();

                match &change.data {
                    Some(StagedData::Empty) => {
                        writer.start_file(&*name, options)?;
                    }
                    Some(StagedData::TempFile(path)) => {
                        writer.start_file(&*name, options)?;
                        let mut data = File::open(path)
                            .with_context(|| format!("cannot open staged data '{}'", path))?;
                        std::io::copy(&mut data, &mut writer)?;
                    }
                    None => {
                        let zip = source
                            .as_mut()
                            .ok_or_else(|| anyhow!("no backing zip for '{}'", self.path))?;
                        let original = zip
                            .index_for_name(&self.files[index].name)
                            .ok_or_else(|| {
                                anyhow!("'{}' vanished from '{}'", self.files[index].name, self.path)
                            })?;
                        let entry = zip.by_index_raw(original)?;
                        if change.is_renamed() {
                            writer.raw_copy_file_rename(entry, &*name)?;
                        } else {
                            writer.raw_copy_file(entry)?;
                        }
                    }
                }
            }
            writer.finish()?;
        }

        temp.persist(self.path.as_std_path())
            .with_context(|| format!("cannot replace archive '{}'", self.path))?;
        self.exists = true;
        self.cleanup_staged_temps();
        Ok(())
    }

    fn cleanup_staged_temps(&mut self) {
        for change in &mut self.changes {
            if let Some(StagedData::TempFile(path)) = change.data.take() {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Discard all staged changes, restoring moved-aside originals.
    pub fn rollback(&mut self) -> Result<()> {
        let added: Vec<bool> = self.changes.iter().map(|change| change.added).collect();

        for index in 0..self.changes.len() {
            let change = std::mem::take(&mut self.changes[index]);
            if let Some(moved) = change.moved_aside {
                let original = self.dir_full_name(index);
                std::fs::rename(&moved, &original)
                    .with_context(|| format!("cannot restore '{}'", original))?;
            }
            if let Some(StagedData::TempFile(path)) = change.data {
                let _ = std::fs::remove_file(path);
            }
        }

        // Drop staged additions.
        let mut keep = added.iter().map(|added| !added);
        self.files.retain(|_| keep.next().unwrap_or(true));
        self.changes = vec![Change::default(); self.files.len()];
        Ok(())
    }

    /// Commit pending changes and drop the archive.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.is_modified() {
            let _ = self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn write_zip(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_zip(path: &Utf8Path) -> Vec<(String, Vec<u8>)> {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.push((entry.name().to_owned(), data));
        }
        entries
    }

    #[test]
    fn zip_open_lists_entries_with_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("rom.bin", b"abcd"), ("other.bin", b"xyz")]);

        let archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::readonly(),
        )
        .unwrap();
        assert_eq!(archive.num_files(), 2);
        assert_eq!(archive.file(0).name, "rom.bin");
        assert_eq!(archive.file(0).size, FileSize::Known(4));
        assert!(archive.file(0).hashes.crc.is_some());
    }

    #[test]
    fn zip_rename_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("wrong.bin", b"abcd")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        archive.file_rename(0, "rom.bin").unwrap();
        archive.commit().unwrap();

        let entries = read_zip(&path);
        assert_eq!(entries, vec![("rom.bin".to_owned(), b"abcd".to_vec())]);
    }

    #[test]
    fn zip_rollback_then_commit_leaves_archive_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("a.bin", b"aaaa"), ("b.bin", b"bbbb")]);
        let before = std::fs::read(&path).unwrap();

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        archive.file_rename(0, "c.bin").unwrap();
        archive.file_delete(1).unwrap();
        archive.file_add_empty("d.bin").unwrap();
        archive.rollback().unwrap();
        archive.commit().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn zip_delete_last_entry_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("a.bin", b"aaaa")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        archive.file_delete(0).unwrap();
        archive.commit().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn zip_copy_from_other_archive() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = utf8(dir.path()).join("source.zip");
        let dest_path = utf8(dir.path()).join("dest.zip");
        write_zip(&source_path, &[("payload.bin", b"payload data")]);

        let mut source = Archive::open(
            &source_path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::RomSet,
            OpenFlags::readonly(),
        )
        .unwrap();
        let mut dest = Archive::open(
            &dest_path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::create(),
        )
        .unwrap();

        dest.file_copy(&mut source, 0, "copied.bin").unwrap();
        dest.commit().unwrap();

        assert_eq!(
            read_zip(&dest_path),
            vec![("copied.bin".to_owned(), b"payload data".to_vec())]
        );
    }

    #[test]
    fn zip_copy_slice_extracts_window() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = utf8(dir.path()).join("source.zip");
        write_zip(&source_path, &[("long.bin", b"junkGOODtail")]);

        let mut source = Archive::open(
            &source_path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        let dest_path = utf8(dir.path()).join("dest.zip");
        let mut dest = Archive::open(
            &dest_path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::create(),
        )
        .unwrap();
        dest.file_copy_part(&mut source, 0, "good.bin", 4, Some(4))
            .unwrap();
        dest.commit().unwrap();

        assert_eq!(
            read_zip(&dest_path),
            vec![("good.bin".to_owned(), b"GOOD".to_vec())]
        );
    }

    #[test]
    fn dir_rename_and_delete_commit() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path()).join("game");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("wrong.bin"), b"abcd").unwrap();
        std::fs::write(root.join("junk.bin"), b"junk").unwrap();

        let mut archive = Archive::open(
            &root,
            ArchiveKind::Dir,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        let wrong = archive.name_index("wrong.bin").unwrap();
        let junk = archive.name_index("junk.bin").unwrap();
        archive.file_rename(wrong, "rom.bin").unwrap();
        archive.file_delete(junk).unwrap();
        archive.commit().unwrap();

        assert_eq!(std::fs::read(root.join("rom.bin")).unwrap(), b"abcd");
        assert!(!root.join("wrong.bin").exists());
        assert!(!root.join("junk.bin").exists());
    }

    #[test]
    fn dir_rollback_restores_moved_originals() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path()).join("game");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.bin"), b"aaaa").unwrap();

        let mut archive = Archive::open(
            &root,
            ArchiveKind::Dir,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        archive.file_delete(0).unwrap();
        assert!(!root.join("a.bin").exists());
        archive.rollback().unwrap();
        assert_eq!(std::fs::read(root.join("a.bin")).unwrap(), b"aaaa");
    }

    #[test]
    fn dir_delete_prunes_empty_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path()).join("game");
        std::fs::create_dir_all(root.join("sub/deeper")).unwrap();
        std::fs::write(root.join("sub/deeper/a.bin"), b"aaaa").unwrap();
        std::fs::write(root.join("keep.bin"), b"keep").unwrap();

        let mut archive = Archive::open(
            &root,
            ArchiveKind::Dir,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        let index = archive.name_index("sub/deeper/a.bin").unwrap();
        archive.file_delete(index).unwrap();
        archive.commit().unwrap();

        assert!(!root.join("sub").exists());
        assert!(root.join("keep.bin").exists());
        assert!(root.exists());
    }

    #[test]
    fn compute_hashes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("rom.bin", b"stable content")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::readonly(),
        )
        .unwrap();
        archive
            .file_compute_hashes(0, HashTypes::ALL, None)
            .unwrap();
        let first = archive.file(0).hashes.clone();
        archive
            .file_compute_hashes(0, HashTypes::ALL, None)
            .unwrap();
        assert_eq!(first, archive.file(0).hashes);
        assert_eq!(archive.file(0).size, FileSize::Known(14));
    }

    #[test]
    fn find_offset_locates_embedded_rom() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("long.bin", b"XXXXwanted")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::readonly(),
        )
        .unwrap();
        let wanted = crate::hashes::hash_bytes(b"wanted", HashTypes::ALL);
        assert_eq!(
            archive.file_find_offset(0, 6, &wanted).unwrap(),
            Some(4)
        );
        let absent = crate::hashes::hash_bytes(b"absent", HashTypes::ALL);
        assert_eq!(archive.file_find_offset(0, 6, &absent).unwrap(), None);
    }

    #[test]
    fn rename_to_existing_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("a.bin", b"aaaa"), ("b.bin", b"bbbb")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap();
        assert!(archive.file_rename(0, "b.bin").is_err());
        // after b.bin is gone the name becomes free
        archive.file_delete(1).unwrap();
        archive.file_rename(0, "b.bin").unwrap();
        archive.commit().unwrap();
        assert_eq!(read_zip(&path), vec![("b.bin".to_owned(), b"aaaa".to_vec())]);
    }

    #[test]
    fn readonly_archive_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join("game.zip");
        write_zip(&path, &[("a.bin", b"aaaa")]);

        let mut archive = Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::readonly(),
        )
        .unwrap();
        assert!(archive.file_delete(0).is_err());
        assert!(archive.file_rename(0, "b.bin").is_err());
        assert!(archive.file_add_empty("c.bin").is_err());
    }
}
