//! The device's partition table: which root paths exist and what may be done to each.

use serde::Deserialize;

use std::fs;
use std::path::Path;

/// Where a device may describe its own partitions
pub const PARTITIONS_PATH: &str = "/etc/recovery/partitions.toml";

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartitionFlags {
    pub mountable: bool,
    pub wipeable: bool,
    pub saveable: bool,
    pub restoreable: bool,
}

impl PartitionFlags {
    const ALL: Self = Self {
        mountable: true,
        wipeable: true,
        saveable: true,
        restoreable: true,
    };
    const IMAGE: Self = Self {
        mountable: false,
        wipeable: true,
        saveable: true,
        restoreable: true,
    };
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct PartitionDescriptor {
    pub id: usize,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub flags: PartitionFlags,
}

/// The partitions, indexed by id. Entries whose id disagrees with their index are corrupt and
/// never handed out.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct PartitionTable {
    #[serde(rename = "partition", default)]
    partitions: Vec<PartitionDescriptor>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<PartitionDescriptor>) -> Self {
        let table = Self { partitions };
        for (index, part) in table.partitions.iter().enumerate() {
            if part.id != index {
                log::warn!(
                    "partition {:?} has id {} at index {index}; ignoring it",
                    part.name,
                    part.id
                );
            }
        }
        table
    }

    /// The table used when the device does not ship its own
    pub fn builtin() -> Self {
        let entry = |id, name: &str, path: &str, flags| PartitionDescriptor {
            id,
            name: name.to_string(),
            path: path.to_string(),
            flags,
        };
        let sdcard = PartitionFlags {
            mountable: true,
            wipeable: true,
            ..Default::default()
        };
        let recovery = PartitionFlags {
            saveable: true,
            ..Default::default()
        };

        Self::new(vec![
            entry(0, "boot", "/boot", PartitionFlags::IMAGE),
            entry(1, "system", "/system", PartitionFlags::ALL),
            entry(2, "data", "/data", PartitionFlags::ALL),
            entry(3, "datadata", "/datadata", PartitionFlags::ALL),
            entry(4, "cache", "/cache", PartitionFlags::ALL),
            entry(5, "sd-ext", "/sd-ext", PartitionFlags::ALL),
            entry(6, "sdcard", "/sdcard", sdcard),
            entry(7, "recovery", "/recovery", recovery),
        ])
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let table: Self = toml::from_str(text)?;
        Ok(Self::new(table.partitions))
    }

    /// Load the device's table, falling back to the built-in one if it is missing or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::builtin();
        }

        match fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|text| Self::from_toml(&text))
        {
            Ok(table) => {
                log::info!("loaded partition table from {}", path.display());
                table
            }
            Err(e) => {
                log::warn!("ignoring partition table {}: {e}", path.display());
                Self::builtin()
            }
        }
    }

    /// The partition with this id, if its entry is sound
    pub fn get(&self, id: usize) -> Option<&PartitionDescriptor> {
        self.partitions.get(id).filter(|p| p.id == id)
    }

    /// Every sound partition, in id order
    pub fn iter(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(index, p)| p.id == *index)
            .map(|(_, p)| p)
    }

    pub fn by_name(&self, name: &str) -> Option<&PartitionDescriptor> {
        self.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[test]
fn test_builtin_is_sound() {
    let table = PartitionTable::builtin();
    assert_eq!(table.iter().count(), table.len());
    assert_eq!(table.by_name("cache").map(|p| p.path.as_str()), Some("/cache"));
    assert!(!table.get(0).unwrap().flags.mountable);
    assert!(!table.by_name("sdcard").unwrap().flags.saveable);
}

#[test]
fn test_from_toml() -> anyhow::Result<()> {
    let table = PartitionTable::from_toml(
        r#"
        [[partition]]
        id = 0
        name = "boot"
        path = "/boot"
        flags = { saveable = true, restoreable = true }

        [[partition]]
        id = 1
        name = "cache"
        path = "/cache"
        flags = { mountable = true, wipeable = true, saveable = true, restoreable = true }

        [[partition]]
        id = 7
        name = "misplaced"
        path = "/misc"
        "#,
    )?;

    assert_eq!(table.len(), 3);
    assert_eq!(table.iter().map(|p| p.id).collect::<Vec<_>>(), [0, 1]);
    assert!(table.get(2).is_none());
    assert_eq!(
        table.get(0).unwrap().flags,
        PartitionFlags {
            saveable: true,
            restoreable: true,
            ..Default::default()
        }
    );
    Ok(())
}

#[test]
fn test_load_falls_back() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    assert_eq!(
        PartitionTable::load(dir.path().join("missing.toml")),
        PartitionTable::builtin()
    );

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "[[partition]]\nid = \"zero\"\n")?;
    assert_eq!(PartitionTable::load(&broken), PartitionTable::builtin());
    Ok(())
}
