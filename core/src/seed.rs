//! The seed archive: operator configuration stored as a plain tar stream on
//! its own partition, one `<seed>.<ext>` file per configuration domain.

use crate::StrataError;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Extensions a reader accepts, in lookup order. Writers only emit the first.
pub const SEED_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

const SEED_FILE_MODE: u32 = 0o600;

/// The POSIX archive magic sits at a fixed offset in the first header block.
const ARCHIVE_MAGIC: &[u8] = b"ustar";
const ARCHIVE_MAGIC_OFFSET: usize = 257;

/// Split `network.yaml` into `("network", "yaml")` if the extension is one we
/// recognise.
pub fn split_seed_name(file_name: &str) -> Option<(&str, &str)> {
    let (seed, ext) = file_name.rsplit_once('.')?;
    if seed.is_empty() || !SEED_EXTENSIONS.contains(&ext) {
        return None;
    }
    Some((seed, ext))
}

/// Archive contents keyed by file name.
///
/// Going through [`SeedBundle::insert`] keeps at most one file per seed name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedBundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl SeedBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` as `<seed>.json`, dropping any earlier variant.
    pub fn insert(&mut self, seed: &str, payload: Vec<u8>) {
        self.remove(seed);
        self.files.insert(format!("{}.{}", seed, SEED_EXTENSIONS[0]), payload);
    }

    /// Remove every variant of `seed`. Returns whether anything was removed.
    pub fn remove(&mut self, seed: &str) -> bool {
        let before = self.files.len();
        for ext in SEED_EXTENSIONS {
            self.files.remove(&format!("{}.{}", seed, ext));
        }
        self.files.len() != before
    }

    /// File name and payload for `seed`, whichever extension it was stored under.
    pub fn get(&self, seed: &str) -> Option<(&str, &[u8])> {
        SEED_EXTENSIONS.iter().find_map(|ext| {
            self.files
                .get_key_value(&format!("{}.{}", seed, ext))
                .map(|(name, payload)| (name.as_str(), payload.as_slice()))
        })
    }

    pub fn contains(&self, seed: &str) -> bool {
        self.get(seed).is_some()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(name, payload)| (name.as_str(), payload.as_slice()))
    }

    /// Seed names present, without extensions.
    pub fn seed_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .files
            .keys()
            .filter_map(|name| split_seed_name(name).map(|(seed, _)| seed))
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Decode `seed` according to the extension it was stored under.
    pub fn parse<T: DeserializeOwned>(&self, seed: &str) -> Result<Option<T>, StrataError> {
        let Some((name, payload)) = self.get(seed) else {
            return Ok(None);
        };

        let decoded = match split_seed_name(name) {
            Some((_, "json")) => serde_json::from_slice(payload).map_err(|e| e.to_string()),
            _ => serde_yaml::from_slice(payload).map_err(|e| e.to_string()),
        };

        decoded.map(Some).map_err(|reason| StrataError::InvalidSeedPayload {
            seed: name.to_string(),
            reason,
        })
    }

    fn insert_file(&mut self, name: String, payload: Vec<u8>) {
        self.files.insert(name, payload);
    }
}

/// Check that `payload` is a JSON object.
pub fn validate_seed_payload(seed: &str, payload: &[u8]) -> Result<(), StrataError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| StrataError::InvalidSeedPayload {
            seed: seed.to_string(),
            reason: e.to_string(),
        })?;

    if !value.is_object() {
        return Err(StrataError::InvalidSeedPayload {
            seed: seed.to_string(),
            reason: "expected a JSON object".to_string(),
        });
    }

    Ok(())
}

/// Read every regular file from the archive on `partition`. A partition
/// that doesn't start with an archive header holds no seeds.
pub fn read_existing(partition: &Path) -> Result<SeedBundle, StrataError> {
    let mut file = File::open(partition)?;
    if !has_archive_header(&mut file)? {
        log::debug!("No seed archive on {}", partition.display());
        return Ok(SeedBundle::new());
    }
    file.seek(SeekFrom::Start(0))?;

    let mut archive = tar::Archive::new(file);
    let mut bundle = SeedBundle::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.to_string_lossy().to_string();
        let expected = entry.header().size()?;
        let payload = read_exact_entry(&mut entry, &name, expected)?;
        bundle.insert_file(name, payload);
    }

    log::debug!("Read {} seed file(s) from {}", bundle.len(), partition.display());
    Ok(bundle)
}

fn has_archive_header(reader: &mut impl Read) -> std::io::Result<bool> {
    let mut header = Vec::with_capacity(512);
    reader.take(512).read_to_end(&mut header)?;

    Ok(header
        .get(ARCHIVE_MAGIC_OFFSET..ARCHIVE_MAGIC_OFFSET + ARCHIVE_MAGIC.len())
        .map_or(false, |magic| magic == ARCHIVE_MAGIC))
}

fn read_exact_entry<R: Read>(reader: &mut R, name: &str, expected: u64) -> Result<Vec<u8>, StrataError> {
    let len = usize::try_from(expected).map_err(|_| StrataError::TruncatedArchiveEntry {
        name: name.to_string(),
        read: 0,
        expected,
    })?;

    let mut payload = vec![0u8; len];
    let mut read = 0;
    while read < len {
        match reader.read(&mut payload[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if read < len {
        return Err(StrataError::TruncatedArchiveEntry {
            name: name.to_string(),
            read: read as u64,
            expected,
        });
    }

    Ok(payload)
}

/// Replace the contents of `partition` with a fresh archive holding exactly
/// the files in `bundle`.
pub fn write_bundle(partition: &Path, bundle: &SeedBundle) -> Result<(), StrataError> {
    log::info!("Writing {} seed file(s) to {}", bundle.len(), partition.display());

    let file = File::create(partition)?;
    let mut builder = tar::Builder::new(file);

    for (name, payload) in bundle.files() {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path(name)?;
        header.set_mode(SEED_FILE_MODE);
        header.set_size(payload.len() as u64);
        header.set_cksum();
        builder.append(&header, payload)?;
    }

    let mut file = builder.into_inner()?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}
