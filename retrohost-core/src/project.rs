//! On-disk project layout.
//!
//! A project directory holds everything needed to reopen an edit session:
//!
//! ```text
//! <project>/Editor/<name>.json      settings
//! <project>/Editor/<id>_rom.bin     the imported game image
//! <project>/Editor/<id>_state.bin   snapshot taken at import
//! <project>/Editor/<id>_Ram.json    persisted RAM patches
//! <project>/Editor/<id>_Rom.json    persisted ROM patches
//! <project>/LibRetro/               core libraries used by the project
//! ```

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{HostError, HostResult};
use crate::patch::AddressKind;
use crate::system::SystemProfile;

/// Settings format written by this version.
pub const SETTINGS_VERSION: &str = "1";

const EDITOR_DIR: &str = "Editor";
const CORE_DIR: &str = "LibRetro";

/// Persisted project settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    pub version: String,
    /// Uppercase hex id prefixing every data file of the project
    pub core_id: String,
    pub system: SystemProfile,
    /// File name of the image as it was imported
    pub original_rom_name: String,
}

/// An opened project directory.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    name: String,
    settings: ProjectSettings,
}

impl Project {
    /// Create a project at `root`, importing the image at `rom_path`.
    ///
    /// ZIP archives are unpacked (see [`read_rom_image`]).
    pub fn create(root: &Path, name: &str, system: SystemProfile, rom_path: &Path) -> HostResult<Self> {
        let (original_rom_name, rom) = read_rom_image(rom_path, system)?;
        std::fs::create_dir_all(root.join(EDITOR_DIR))?;
        std::fs::create_dir_all(root.join(CORE_DIR))?;

        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let settings = ProjectSettings {
            version: SETTINGS_VERSION.to_string(),
            core_id: project_id(&rom, name, created),
            system,
            original_rom_name,
        };
        let project = Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            settings,
        };
        project.save_settings()?;
        std::fs::write(project.rom_path(), &rom)?;
        info!(
            project = name,
            id = %project.settings.core_id,
            system = %system,
            bytes = rom.len(),
            "project created"
        );
        Ok(project)
    }

    /// Open the project at `root`; its name is the directory name.
    pub fn open(root: &Path) -> HostResult<Self> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HostError::Project(format!("not a project directory: {}", root.display())))?;
        Self::open_named(root, &name)
    }

    /// Open the project `name` stored at `root`.
    pub fn open_named(root: &Path, name: &str) -> HostResult<Self> {
        let path = root.join(EDITOR_DIR).join(format!("{}.json", name));
        if !path.exists() {
            return Err(HostError::Project(format!("no settings at {}", path.display())));
        }
        let settings: ProjectSettings = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if settings.version != SETTINGS_VERSION {
            debug!(found = %settings.version, "settings written by another version");
        }
        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            settings,
        })
    }

    pub fn save_settings(&self) -> HostResult<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        std::fs::write(self.settings_path(), json)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    pub fn system(&self) -> SystemProfile {
        self.settings.system
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(EDITOR_DIR).join(format!("{}.json", self.name))
    }

    fn data_path(&self, suffix: &str) -> PathBuf {
        self.root
            .join(EDITOR_DIR)
            .join(format!("{}_{}", self.settings.core_id, suffix))
    }

    pub fn rom_path(&self) -> PathBuf {
        self.data_path("rom.bin")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_path("state.bin")
    }

    /// File holding the persisted patch pool for `kind`.
    pub fn patch_path(&self, kind: AddressKind) -> PathBuf {
        self.data_path(&format!("{}.json", kind.file_tag()))
    }

    /// Where the project expects its core library.
    pub fn core_library_path(&self) -> PathBuf {
        self.root.join(CORE_DIR).join(format!(
            "{}.{}",
            self.settings.system.core_name(),
            std::env::consts::DLL_EXTENSION
        ))
    }

    /// Copy a core library into the project.
    pub fn install_core(&self, library: &Path) -> HostResult<PathBuf> {
        let target = self.core_library_path();
        std::fs::create_dir_all(self.root.join(CORE_DIR))?;
        std::fs::copy(library, &target)?;
        Ok(target)
    }

    pub fn load_rom(&self) -> HostResult<Vec<u8>> {
        Ok(std::fs::read(self.rom_path())?)
    }
}

/// Read a game image, unpacking ZIP archives.
///
/// From an archive the first file whose extension the system accepts is
/// taken, or the first file if none matches. Returns the image's file name
/// and its bytes.
pub fn read_rom_image(path: &Path, system: SystemProfile) -> HostResult<(String, Vec<u8>)> {
    let is_zip = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if is_zip {
        return read_zip_image(File::open(path)?, system);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((name, std::fs::read(path)?))
}

fn read_zip_image<R: Read + Seek>(reader: R, system: SystemProfile) -> HostResult<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(reader)?;

    let mut first_file = None;
    let mut preferred = None;
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        first_file.get_or_insert(i);
        let extension = Path::new(file.name())
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if system.extensions().contains(&extension.as_str()) {
            preferred = Some(i);
            break;
        }
    }

    let index = preferred
        .or(first_file)
        .ok_or_else(|| HostError::Project("archive contains no files".to_string()))?;
    let mut file = archive.by_index(index)?;
    // Nested paths: keep just the file name
    let name = file.name().rsplit('/').next().unwrap_or_default().to_string();
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    debug!(entry = %name, bytes = content.len(), "extracted image from archive");
    Ok((name, content))
}

/// Uppercase hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data).iter().map(|b| format!("{:02X}", b)).collect()
}

/// Project id: digest over the digests of the image, the project name and
/// the creation time.
fn project_id(rom: &[u8], name: &str, created: u128) -> String {
    let mut hasher = Md5::new();
    hasher.update(Md5::digest(rom));
    hasher.update(Md5::digest(name.as_bytes()));
    hasher.update(Md5::digest(created.to_le_bytes()));
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b""), "D41D8CD98F00B204E9800998ECF8427E");
    }

    #[test]
    fn test_project_id_depends_on_all_inputs() {
        let a = project_id(b"rom", "game", 1);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(a, project_id(b"rom", "game", 2));
        assert_ne!(a, project_id(b"rom", "other", 1));
        assert_eq!(a, project_id(b"rom", "game", 1));
    }

    #[test]
    fn test_zip_prefers_system_extension() {
        let data = zip_with(&[("readme.txt", b"hello"), ("roms/Sonic.MD", b"\x01\x02")]);
        let (name, rom) = read_zip_image(Cursor::new(data), SystemProfile::Megadrive).unwrap();
        assert_eq!(name, "Sonic.MD");
        assert_eq!(rom, vec![1, 2]);
    }

    #[test]
    fn test_zip_falls_back_to_first_file() {
        let data = zip_with(&[("game.rom", b"\x07"), ("other.rom", b"\x08")]);
        let (name, rom) = read_zip_image(Cursor::new(data), SystemProfile::Nes).unwrap();
        assert_eq!(name, "game.rom");
        assert_eq!(rom, vec![7]);
    }

    #[test]
    fn test_empty_zip_is_an_error() {
        let data = zip_with(&[]);
        assert!(matches!(
            read_zip_image(Cursor::new(data), SystemProfile::Nes),
            Err(HostError::Project(_))
        ));
    }

    #[test]
    fn test_settings_json_shape() {
        let settings = ProjectSettings {
            version: "1".to_string(),
            core_id: "ABC".to_string(),
            system: SystemProfile::ZxSpectrum,
            original_rom_name: "jsw.tap".to_string(),
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["coreId"], "ABC");
        assert_eq!(json["system"], "ZXSpectrum");
        assert_eq!(json["originalRomName"], "jsw.tap");
    }
}
