use anyhow::{anyhow, Context, Result};
use std::{
    fmt,
    path::{Path, PathBuf},
};

use super::identity::DeviceIdentity;
use crate::{config::BridgeConfig, protocol::SensorCommand};

/// Holding registers exposed when the map is small.
pub const DEFAULT_CAPACITY: u16 = 256;
/// Spare words kept after the last mapped register.
pub const RESERVED_WORDS: u16 = 4;

/// One sensor register block and where it lands in the Modbus table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorMapEntry {
    pub register_offset: u16,
    pub description: String,
    /// Sensor bus on the board, 1 or 2.
    pub bus: u8,
    /// Modbus node id on that bus, 1..=247.
    pub node: u8,
    pub source_address: u16,
    /// Register count.
    pub size: u16,
}

impl SensorMapEntry {
    pub fn new(
        register_offset: u16,
        description: &str,
        bus: u8,
        node: u8,
        source_address: u16,
        size: u16,
    ) -> Self {
        Self {
            register_offset,
            description: description.to_string(),
            bus,
            node,
            source_address,
            size,
        }
    }

    /// First register past this entry.
    pub fn end(&self) -> u32 {
        self.register_offset as u32 + self.size as u32
    }

    pub fn read_command(&self) -> SensorCommand {
        SensorCommand::ReadHoldingRegisters {
            bus: self.bus,
            node: self.node,
            address: self.source_address,
            size: self.size,
        }
    }

    /// Parse one `offset, description, bus, node, address, size` line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            return Err(anyhow!("expected 6 fields, found {}", fields.len()));
        }

        let register_offset: u16 = fields[0]
            .parse()
            .with_context(|| format!("bad register offset '{}'", fields[0]))?;
        let description = fields[1].to_string();
        let bus: u8 = fields[2]
            .parse()
            .with_context(|| format!("bad bus '{}'", fields[2]))?;
        let node: u8 = fields[3]
            .parse()
            .with_context(|| format!("bad node '{}'", fields[3]))?;
        let source_address: u16 = fields[4]
            .parse()
            .with_context(|| format!("bad source address '{}'", fields[4]))?;
        let size: u16 = fields[5]
            .parse()
            .with_context(|| format!("bad size '{}'", fields[5]))?;

        if !(1..=2).contains(&bus) {
            return Err(anyhow!("bus {bus} out of range [1, 2]"));
        }
        if !(1..=247).contains(&node) {
            return Err(anyhow!("node {node} out of range [1, 247]"));
        }
        if size == 0 {
            return Err(anyhow!("size must not be zero"));
        }

        let entry = Self {
            register_offset,
            description,
            bus,
            node,
            source_address,
            size,
        };
        if entry.end() > u16::MAX as u32 {
            return Err(anyhow!("register block ends past the Modbus address space"));
        }
        Ok(entry)
    }
}

impl fmt::Display for SensorMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, '{}', bus {}, node {}, addr {}, size {}]",
            self.register_offset,
            self.description,
            self.bus,
            self.node,
            self.source_address,
            self.size
        )
    }
}

/// Where the active register map came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapSource {
    BuiltIn,
    Device(PathBuf),
    Common(PathBuf),
}

/// Ordered sensor map plus the size of the Modbus table that backs it.
///
/// Entry order is the polling order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    entries: Vec<SensorMapEntry>,
    capacity: u16,
    source: MapSource,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegisterMap {
    /// Map used when neither a device nor a common file is available.
    pub fn builtin() -> Self {
        Self::from_entries(
            vec![
                SensorMapEntry::new(0, "wind speed", 1, 1, 0, 2),
                SensorMapEntry::new(2, "wind direction", 1, 2, 0, 2),
                SensorMapEntry::new(4, "temp and herm", 1, 3, 0, 4),
                SensorMapEntry::new(8, "window", 1, 4, 0, 6),
            ],
            MapSource::BuiltIn,
        )
    }

    pub fn from_entries(entries: Vec<SensorMapEntry>, source: MapSource) -> Self {
        warn_overlaps(&entries);
        let needed = entries
            .iter()
            .map(|e| e.end() + RESERVED_WORDS as u32)
            .max()
            .unwrap_or(0)
            .min(u16::MAX as u32) as u16;
        Self {
            entries,
            capacity: needed.max(DEFAULT_CAPACITY),
            source,
        }
    }

    /// Parse a map file body; malformed lines are logged and skipped.
    pub fn parse(content: &str) -> Vec<SensorMapEntry> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
            .filter_map(|(idx, line)| match SensorMapEntry::parse_line(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    log::warn!("ignore illegal line {}: '{}' ({err})", idx + 1, line.trim());
                    None
                }
            })
            .collect()
    }

    pub fn from_file(path: &Path, source: MapSource) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read register map {}", path.display()))?;
        let entries = Self::parse(&content);
        if entries.is_empty() {
            log::warn!("register map {} has no usable entries", path.display());
        }
        Ok(Self::from_entries(entries, source))
    }

    /// Select the map for a board: its own file, then the common file,
    /// then the built-in default.
    pub fn load(config: &BridgeConfig, identity: &DeviceIdentity) -> Self {
        let mut candidates = Vec::new();
        match identity.cpuid() {
            Some(cpuid) => {
                let path = config.device_map_path(cpuid);
                candidates.push((path.clone(), MapSource::Device(path)));
            }
            None => log::info!("CPUID unknown, skipping device config file"),
        }
        let common = config.common_map_path();
        candidates.push((common.clone(), MapSource::Common(common)));

        for (path, source) in candidates {
            if !path.exists() {
                log::info!("config file {} not found", path.display());
                continue;
            }
            match Self::from_file(&path, source) {
                Ok(map) => {
                    log::info!("updated sensor map from file {}", path.display());
                    map.log_entries();
                    return map;
                }
                Err(err) => log::warn!("{err:#}"),
            }
        }

        log::info!("using built-in sensor map");
        let map = Self::builtin();
        map.log_entries();
        map
    }

    pub fn entries(&self) -> &[SensorMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of holding registers the Modbus table must provide.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn source(&self) -> &MapSource {
        &self.source
    }

    fn log_entries(&self) {
        for entry in &self.entries {
            log::info!("{entry}");
        }
        log::info!("holding register table size: {}", self.capacity);
    }
}

fn warn_overlaps(entries: &[SensorMapEntry]) {
    let mut sorted: Vec<&SensorMapEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.register_offset);
    for pair in sorted.windows(2) {
        if pair[0].end() > pair[1].register_offset as u32 {
            log::warn!(
                "register map entries '{}' and '{}' overlap",
                pair[0].description,
                pair[1].description
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MAP_FILE: &str = "\
# reg, description, bus, node, addr, size
0, wind speed, 1, 1, 0, 2

2, wind direction, 1, 2, 0, 2
this line is broken
4, temp, 1, 3, 0
10, rain, 2, 7, 16, 3
";

    fn config_in(dir: &Path) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.files.config_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_parse_keeps_file_order_and_skips_malformed() {
        let entries = RegisterMap::parse(MAP_FILE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], SensorMapEntry::new(0, "wind speed", 1, 1, 0, 2));
        assert_eq!(entries[1].description, "wind direction");
        assert_eq!(entries[2], SensorMapEntry::new(10, "rain", 2, 7, 16, 3));
    }

    #[test]
    fn test_parse_rejects_out_of_range_fields() {
        assert!(SensorMapEntry::parse_line("0, x, 3, 1, 0, 2").is_err());
        assert!(SensorMapEntry::parse_line("0, x, 1, 0, 0, 2").is_err());
        assert!(SensorMapEntry::parse_line("0, x, 1, 248, 0, 2").is_err());
        assert!(SensorMapEntry::parse_line("0, x, 1, 1, 0, 0").is_err());
        assert!(SensorMapEntry::parse_line("65535, x, 1, 1, 0, 2").is_err());
        assert!(SensorMapEntry::parse_line("a, x, 1, 1, 0, 2").is_err());
    }

    #[test]
    fn test_capacity_grows_to_fit_last_entry() {
        let map = RegisterMap::from_entries(
            vec![SensorMapEntry::new(300, "far", 1, 1, 0, 10)],
            MapSource::BuiltIn,
        );
        assert_eq!(map.capacity(), 314);

        let small = RegisterMap::from_entries(
            vec![SensorMapEntry::new(0, "near", 1, 1, 0, 2)],
            MapSource::BuiltIn,
        );
        assert_eq!(small.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_builtin_map() {
        let map = RegisterMap::builtin();
        assert_eq!(map.len(), 4);
        assert_eq!(map.source(), &MapSource::BuiltIn);
        assert_eq!(
            map.entries()[2].read_command().to_string(),
            "read_hold_reg(1,3,0,4)"
        );
    }

    #[test]
    fn test_load_prefers_device_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::write(dir.path().join("dstABC.conf"), "0, device, 1, 1, 0, 2\n").unwrap();
        fs::write(dir.path().join("dstcommon.conf"), MAP_FILE).unwrap();

        let map = RegisterMap::load(&config, &DeviceIdentity::known("ABC"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.entries()[0].description, "device");
        assert_eq!(
            map.source(),
            &MapSource::Device(dir.path().join("dstABC.conf"))
        );
    }

    #[test]
    fn test_load_falls_back_to_common_then_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let map = RegisterMap::load(&config, &DeviceIdentity::known("XYZ"));
        assert_eq!(map, RegisterMap::builtin());

        fs::write(dir.path().join("dstcommon.conf"), MAP_FILE).unwrap();
        let map = RegisterMap::load(&config, &DeviceIdentity::known("XYZ"));
        assert_eq!(map.len(), 3);
        assert!(matches!(map.source(), MapSource::Common(_)));

        let map = RegisterMap::load(&config, &DeviceIdentity::unknown());
        assert_eq!(map.len(), 3);
    }
}
