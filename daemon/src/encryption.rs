//! LUKS drive encryption with per-drive key files.
//!
//! Each encrypted drive is addressed by its name in the stable-ID namespace.
//! Its raw 32 byte key lives in `<key_dir>/luks.<id>.key`, outside any
//! encrypted volume, and the unlocked drive shows up as
//! `<mapper>/luks-<id>`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use strata_core::{CommandRunner, HostPaths, StrataError};
use strata_platform::Sgdisk;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

pub const KEY_LENGTH: usize = 32;

const KEY_FILE_PREFIX: &str = "luks.";
const KEY_FILE_SUFFIX: &str = ".key";
const MAPPED_PREFIX: &str = "luks-";

/// A drive key as stored on disk.
pub struct EncryptionKeyRecord {
    pub device_id: String,
    pub key_file: PathBuf,
    raw_key: Zeroizing<Vec<u8>>,
}

impl EncryptionKeyRecord {
    pub fn encoded_key(&self) -> String {
        BASE64.encode(self.raw_key.as_slice())
    }
}

impl std::fmt::Debug for EncryptionKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyRecord")
            .field("device_id", &self.device_id)
            .field("key_file", &self.key_file)
            .finish_non_exhaustive()
    }
}

pub struct EncryptionManager {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
}

impl EncryptionManager {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths) -> Self {
        Self { runner, paths }
    }

    /// Wipe `device`, format it with a fresh random key and unlock it.
    pub async fn encrypt_drive(&self, device: &Path) -> Result<EncryptionKeyRecord, StrataError> {
        let id = self.stable_id(device)?;
        let key_file = self.key_file(&id);
        let device_arg = device.to_string_lossy();

        log::info!("Wiping {} for encryption", device.display());
        self.runner.run_checked("wipefs", &["-a", &device_arg]).await?;
        self.format_and_unlock(device, &id, &key_file)
            .await
            .map_err(|e| e.interrupted("Encrypting the drive"))
    }

    async fn format_and_unlock(
        &self,
        device: &Path,
        id: &str,
        key_file: &Path,
    ) -> Result<EncryptionKeyRecord, StrataError> {
        let device_arg = device.to_string_lossy();
        Sgdisk::new(self.runner.as_ref()).zap(device).await?;

        let mut raw_key = Zeroizing::new(vec![0u8; KEY_LENGTH]);
        OsRng.fill_bytes(raw_key.as_mut_slice());
        write_key_file(key_file, &raw_key)?;

        log::info!("Formatting {} as an encrypted volume", device.display());
        let key_arg = key_file.to_string_lossy();
        self.runner
            .run_checked("cryptsetup", &["luksFormat", "-q", &device_arg, &key_arg])
            .await?;

        self.unlock(device, id).await?;

        Ok(EncryptionKeyRecord {
            device_id: id.to_string(),
            key_file: key_file.to_path_buf(),
            raw_key,
        })
    }

    /// Unlock an already encrypted drive with an operator supplied key.
    ///
    /// The key is only kept if the unlock succeeds.
    pub async fn import_encrypted_drive(&self, device: &Path, encoded_key: &str) -> Result<(), StrataError> {
        let id = self.stable_id(device)?;

        let raw_key = Zeroizing::new(
            BASE64
                .decode(encoded_key.trim())
                .map_err(|e| StrataError::InvalidInput(format!("Invalid base64 key: {}", e)))?,
        );
        if raw_key.len() != KEY_LENGTH {
            return Err(StrataError::InvalidKeyLength(raw_key.len()));
        }

        let key_file = self.key_file(&id);
        write_key_file(&key_file, &raw_key)?;

        if let Err(e) = self.unlock(device, &id).await {
            if let Err(remove_err) = fs::remove_file(&key_file) {
                log::warn!("Failed to remove key file {}: {}", key_file.display(), remove_err);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Unlock every drive we hold a key for. Returns the IDs of the drives
    /// that are unlocked afterwards; missing drives and failed unlocks are
    /// logged and skipped.
    pub async fn decrypt_drives(&self) -> Result<Vec<String>, StrataError> {
        let mut unlocked = Vec::new();

        for (id, _) in self.key_files()? {
            let device = self.paths.by_id.join(&id);
            if !device.exists() {
                log::warn!("Couldn't find encrypted drive {}", device.display());
                continue;
            }

            match self.unlock(&device, &id).await {
                Ok(()) => unlocked.push(id),
                Err(e) => log::warn!("Couldn't unlock encrypted drive {}: {}", device.display(), e),
            }
        }

        Ok(unlocked)
    }

    /// Device ID to base64 key, for every stored key.
    pub fn get_drive_keys(&self) -> Result<BTreeMap<String, String>, StrataError> {
        Ok(self
            .key_records()?
            .into_iter()
            .map(|record| {
                let key = record.encoded_key();
                (record.device_id, key)
            })
            .collect())
    }

    pub fn key_records(&self) -> Result<Vec<EncryptionKeyRecord>, StrataError> {
        self.key_files()?
            .into_iter()
            .map(|(device_id, key_file)| {
                let raw_key = Zeroizing::new(fs::read(&key_file)?);
                Ok(EncryptionKeyRecord {
                    device_id,
                    key_file,
                    raw_key,
                })
            })
            .collect()
    }

    pub fn key_file(&self, id: &str) -> PathBuf {
        self.paths
            .key_dir
            .join(format!("{}{}{}", KEY_FILE_PREFIX, id, KEY_FILE_SUFFIX))
    }

    pub fn mapped_device(&self, id: &str) -> PathBuf {
        self.paths.mapper.join(format!("{}{}", MAPPED_PREFIX, id))
    }

    async fn unlock(&self, device: &Path, id: &str) -> Result<(), StrataError> {
        if self.mapped_device(id).exists() {
            log::debug!("{} is already unlocked", device.display());
            return Ok(());
        }

        let key_file = self.key_file(id);
        let key_arg = key_file.to_string_lossy();
        let device_arg = device.to_string_lossy();
        let mapped_name = format!("{}{}", MAPPED_PREFIX, id);

        log::info!("Unlocking {} as {}", device.display(), mapped_name);
        self.runner
            .run_checked(
                "cryptsetup",
                &["open", "--type=luks", "-d", &key_arg, &device_arg, &mapped_name],
            )
            .await?;
        Ok(())
    }

    /// The name of `device` inside the stable-ID namespace.
    fn stable_id(&self, device: &Path) -> Result<String, StrataError> {
        let invalid = || StrataError::InvalidDeviceId(device.display().to_string());

        let rest = device.strip_prefix(&self.paths.by_id).map_err(|_| invalid())?;
        let mut components = rest.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(name.to_string_lossy().to_string()),
            _ => Err(invalid()),
        }
    }

    /// Stored key files as (device ID, path), ordered by device ID.
    fn key_files(&self) -> Result<Vec<(String, PathBuf)>, StrataError> {
        let entries = match fs::read_dir(&self.paths.key_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name
                .strip_prefix(KEY_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(KEY_FILE_SUFFIX))
            else {
                continue;
            };
            if id.is_empty() {
                continue;
            }
            keys.push((id.to_string(), entry.path()));
        }

        keys.sort();
        Ok(keys)
    }
}

/// Atomically write a key file readable only by its owner.
fn write_key_file(path: &Path, key: &[u8]) -> Result<(), StrataError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StrataError::IoError(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::test_utils::FakeCommandRunner;
    use strata_core::CommandOutput;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        paths: HostPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let paths = HostPaths {
                by_id: dir.path().join("by-id"),
                mapper: dir.path().join("mapper"),
                key_dir: dir.path().join("keys"),
                ..HostPaths::default()
            };
            fs::create_dir_all(&paths.by_id).unwrap();
            fs::create_dir_all(&paths.mapper).unwrap();
            Self { _dir: dir, paths }
        }

        fn add_drive(&self, id: &str) -> PathBuf {
            let path = self.paths.by_id.join(id);
            fs::write(&path, "").unwrap();
            path
        }

        fn manager(&self, runner: &Arc<FakeCommandRunner>) -> EncryptionManager {
            EncryptionManager::new(runner.clone(), self.paths.clone())
        }
    }

    #[tokio::test]
    async fn test_encrypt_requires_stable_id_path() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());

        let err = fixture
            .manager(&runner)
            .encrypt_drive(Path::new("/dev/sdb"))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::InvalidDeviceId(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_encrypt_wipes_formats_and_unlocks() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        let device = fixture.add_drive("ata-QEMU_HARDDISK_QM00002");

        let record = fixture.manager(&runner).encrypt_drive(&device).await.unwrap();

        let key_file = fixture.paths.key_dir.join("luks.ata-QEMU_HARDDISK_QM00002.key");
        assert_eq!(record.device_id, "ata-QEMU_HARDDISK_QM00002");
        assert_eq!(record.key_file, key_file);
        assert_eq!(fs::read(&key_file).unwrap().len(), KEY_LENGTH);
        assert_eq!(fs::metadata(&key_file).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(BASE64.decode(record.encoded_key()).unwrap(), fs::read(&key_file).unwrap());

        let device = device.display().to_string();
        let key = key_file.display().to_string();
        assert_eq!(
            runner.calls(),
            vec![
                format!("wipefs -a {}", device),
                format!("sgdisk -Z {}", device),
                format!("cryptsetup luksFormat -q {} {}", device, key),
                format!(
                    "cryptsetup open --type=luks -d {} {} luks-ata-QEMU_HARDDISK_QM00002",
                    key, device
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_encrypt_failure_reports_whether_drive_was_wiped() {
        let fixture = Fixture::new();
        let device = fixture.add_drive("ata-QEMU_HARDDISK_QM00002");

        let runner = Arc::new(FakeCommandRunner::new().on(
            "wipefs",
            &[],
            CommandOutput::failed(1, "wipefs: error: probing initialization failed: Device or resource busy"),
        ));
        let err = fixture.manager(&runner).encrypt_drive(&device).await.unwrap_err();
        assert!(err.is_pre_mutation());

        let runner = Arc::new(FakeCommandRunner::new().on(
            "cryptsetup",
            &["luksFormat"],
            CommandOutput::failed(5, "Cannot format device in use."),
        ));
        let err = fixture.manager(&runner).encrypt_drive(&device).await.unwrap_err();
        assert!(!err.is_pre_mutation());
        assert!(matches!(err.root_cause(), StrataError::SubprocessFailure { status: Some(5), .. }));
    }

    #[tokio::test]
    async fn test_import_rejects_wrong_key_length() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        let device = fixture.add_drive("nvme-eui.0025388b91b3a5c1");

        let err = fixture
            .manager(&runner)
            .import_encrypted_drive(&device, &BASE64.encode([7u8; 16]))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::InvalidKeyLength(16)));
        assert!(!fixture.paths.key_dir.join("luks.nvme-eui.0025388b91b3a5c1.key").exists());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_import_removes_key_file() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new().on(
            "cryptsetup",
            &["open"],
            CommandOutput::failed(2, "No key available with this passphrase."),
        ));
        let device = fixture.add_drive("nvme-eui.0025388b91b3a5c1");

        let err = fixture
            .manager(&runner)
            .import_encrypted_drive(&device, &BASE64.encode([7u8; 32]))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::SubprocessFailure { .. }));
        assert!(!fixture.paths.key_dir.join("luks.nvme-eui.0025388b91b3a5c1.key").exists());
    }

    #[tokio::test]
    async fn test_successful_import_keeps_key() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        let device = fixture.add_drive("nvme-eui.0025388b91b3a5c1");

        let manager = fixture.manager(&runner);
        manager
            .import_encrypted_drive(&device, &BASE64.encode([7u8; 32]))
            .await
            .unwrap();

        let keys = manager.get_drive_keys().unwrap();
        assert_eq!(keys.get("nvme-eui.0025388b91b3a5c1"), Some(&BASE64.encode([7u8; 32])));
    }

    #[tokio::test]
    async fn test_unlock_is_a_no_op_when_mapped() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        let device = fixture.add_drive("scsi-0QEMU_QEMU_HARDDISK_drive1");
        fs::write(fixture.paths.mapper.join("luks-scsi-0QEMU_QEMU_HARDDISK_drive1"), "").unwrap();

        fixture
            .manager(&runner)
            .import_encrypted_drive(&device, &BASE64.encode([1u8; 32]))
            .await
            .unwrap();

        assert!(runner.calls_to("cryptsetup").is_empty());
    }

    #[tokio::test]
    async fn test_decrypt_drives_is_best_effort() {
        let fixture = Fixture::new();
        fixture.add_drive("ata-present");
        fixture.add_drive("ata-broken");
        write_key_file(&fixture.paths.key_dir.join("luks.ata-present.key"), &[1; 32]).unwrap();
        write_key_file(&fixture.paths.key_dir.join("luks.ata-broken.key"), &[2; 32]).unwrap();
        write_key_file(&fixture.paths.key_dir.join("luks.ata-gone.key"), &[3; 32]).unwrap();
        fs::write(fixture.paths.key_dir.join("unrelated.txt"), "x").unwrap();

        let broken = fixture.paths.by_id.join("ata-broken").display().to_string();
        let runner = Arc::new(FakeCommandRunner::new());
        let key = fixture.paths.key_dir.join("luks.ata-broken.key").display().to_string();
        runner.respond(
            "cryptsetup",
            &["open", "--type=luks", "-d", &key, &broken],
            CommandOutput::failed(1, "Device is busy"),
        );

        let unlocked = fixture.manager(&runner).decrypt_drives().await.unwrap();

        assert_eq!(unlocked, vec!["ata-present"]);
        assert_eq!(runner.calls_to("cryptsetup").len(), 2);
    }

    #[test]
    fn test_drive_keys_are_ordered_by_id() {
        let fixture = Fixture::new();
        write_key_file(&fixture.paths.key_dir.join("luks.wwn-0x2.key"), &[2; 32]).unwrap();
        write_key_file(&fixture.paths.key_dir.join("luks.ata-1.key"), &[1; 32]).unwrap();

        let runner = Arc::new(FakeCommandRunner::new());
        let keys = fixture.manager(&runner).get_drive_keys().unwrap();

        let ids: Vec<&String> = keys.keys().collect();
        assert_eq!(ids, vec!["ata-1", "wwn-0x2"]);
        assert_eq!(keys["ata-1"], BASE64.encode([1u8; 32]));
    }

    #[test]
    fn test_missing_key_dir_means_no_keys() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        assert!(fixture.manager(&runner).get_drive_keys().unwrap().is_empty());
    }

    #[test]
    fn test_nested_paths_are_not_stable_ids() {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeCommandRunner::new());
        let manager = fixture.manager(&runner);

        assert!(manager.stable_id(&fixture.paths.by_id.join("a/b")).is_err());
        assert!(manager.stable_id(&fixture.paths.by_id).is_err());
        assert_eq!(manager.stable_id(&fixture.paths.by_id.join("ata-x")).unwrap(), "ata-x");
    }
}
