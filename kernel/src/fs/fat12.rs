//! FAT12 volume implementation.
//!
//! Geometry is fixed at compile time to the classic 1.44 MiB floppy
//! layout: one reserved sector, two FAT copies of nine sectors, a 224
//! entry root directory, then data clusters of one sector each. Every FAT
//! write is mirrored into the second copy in the same operation.
//!
//! Cluster values: 0 free, 1 reserved, [2, N) chain links, >= 0xFF8 end
//! of chain. The 12-bit entry for cluster `c` lives at byte offset
//! `c + c/2`; even clusters take the low 12 bits of the little-endian
//! 16-bit word there, odd clusters the high 12.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::device::{BlockDevice, SECTOR_SIZE};
use super::ShortName;
use crate::error::FsError;

pub const RESERVED_SECTORS: usize = 1;
pub const FAT_COUNT: usize = 2;
pub const SECTORS_PER_FAT: usize = 9;
pub const ROOT_ENTRIES: usize = 224;

const DIR_ENTRY_SIZE: usize = 32;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

const FAT_START: usize = RESERVED_SECTORS;
const ROOT_DIR_START: usize = FAT_START + FAT_COUNT * SECTORS_PER_FAT;
const ROOT_DIR_SECTORS: usize = (ROOT_ENTRIES * DIR_ENTRY_SIZE).div_ceil(SECTOR_SIZE);
const DATA_START: usize = ROOT_DIR_START + ROOT_DIR_SECTORS;

/// Chain values at or above this mark end-of-chain.
pub const END_OF_CHAIN: u16 = 0xFF8;
const EOC_VALUE: u16 = 0xFFF;
const FIRST_DATA_CLUSTER: u16 = 2;
/// Highest addressable data-cluster count (0xFF7 is the bad marker).
const MAX_CLUSTERS: usize = 0xFF7 - 2;

const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

bitflags! {
    /// Directory-entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// Decoded 32-byte directory entry. Timestamps are carried but unused.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    pub first_cluster: u16,
    pub size: u32,
}

impl DirEntry {
    fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            name: ShortName(name),
            attributes: Attributes::from_bits_truncate(raw[11]),
            first_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        raw[0..11].copy_from_slice(&self.name.0);
        raw[11] = self.attributes.bits();
        raw[26..28].copy_from_slice(&self.first_cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
    }

    fn is_listable(&self) -> bool {
        !self
            .attributes
            .intersects(Attributes::VOLUME_ID | Attributes::HIDDEN)
    }
}

/// A directory listing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: usize,
    pub is_directory: bool,
}

/// A mounted FAT12 volume.
pub struct Fat12Volume<D> {
    device: D,
    cluster_count: usize,
}

impl<D: BlockDevice> Fat12Volume<D> {
    /// Mount an already-formatted volume.
    pub fn mount(device: D) -> Result<Self, FsError> {
        let sectors = device.sector_count();
        if sectors <= DATA_START {
            return Err(FsError::IoError);
        }
        Ok(Self {
            cluster_count: (sectors - DATA_START).min(MAX_CLUSTERS),
            device,
        })
    }

    /// Write empty FATs and an empty root directory, then mount.
    pub fn format(device: D) -> Result<Self, FsError> {
        let mut volume = Self::mount(device)?;
        let zero = [0u8; SECTOR_SIZE];
        for lba in FAT_START..DATA_START {
            volume.device.write_sector(lba, &zero)?;
        }
        // Media descriptor and reserved entry, mirrored like any write.
        volume.set_fat_entry(0, 0xFF0)?;
        volume.set_fat_entry(1, EOC_VALUE)?;
        Ok(volume)
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    /// Bytes available in unallocated clusters.
    pub fn free_space(&self) -> usize {
        let mut free = 0;
        for cluster in FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + self.cluster_count as u16 {
            if self.fat_entry(cluster).unwrap_or(EOC_VALUE) == 0 {
                free += 1;
            }
        }
        free * SECTOR_SIZE
    }

    /// Total data-area capacity in bytes.
    pub fn total_space(&self) -> usize {
        self.cluster_count * SECTOR_SIZE
    }

    // ---- FAT access -----------------------------------------------------

    fn fat_byte(&self, offset: usize) -> Result<u8, FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.device
            .read_sector(FAT_START + offset / SECTOR_SIZE, &mut sector)?;
        Ok(sector[offset % SECTOR_SIZE])
    }

    fn set_fat_byte(&mut self, offset: usize, value: u8) -> Result<(), FsError> {
        for copy in 0..FAT_COUNT {
            let lba = FAT_START + copy * SECTORS_PER_FAT + offset / SECTOR_SIZE;
            let mut sector = [0u8; SECTOR_SIZE];
            self.device.read_sector(lba, &mut sector)?;
            sector[offset % SECTOR_SIZE] = value;
            self.device.write_sector(lba, &sector)?;
        }
        Ok(())
    }

    /// Read the 12-bit chain value for `cluster`.
    pub fn fat_entry(&self, cluster: u16) -> Result<u16, FsError> {
        let offset = cluster as usize + cluster as usize / 2;
        let word = u16::from_le_bytes([self.fat_byte(offset)?, self.fat_byte(offset + 1)?]);
        Ok(if cluster & 1 == 1 {
            word >> 4
        } else {
            word & 0x0FFF
        })
    }

    fn set_fat_entry(&mut self, cluster: u16, value: u16) -> Result<(), FsError> {
        let offset = cluster as usize + cluster as usize / 2;
        let word = u16::from_le_bytes([self.fat_byte(offset)?, self.fat_byte(offset + 1)?]);
        let word = if cluster & 1 == 1 {
            (word & 0x000F) | (value << 4)
        } else {
            (word & 0xF000) | (value & 0x0FFF)
        };
        let [lo, hi] = word.to_le_bytes();
        self.set_fat_byte(offset, lo)?;
        self.set_fat_byte(offset + 1, hi)
    }

    /// Whether the two FAT copies are byte-identical.
    pub fn fat_copies_agree(&self) -> bool {
        let mut a = [0u8; SECTOR_SIZE];
        let mut b = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_FAT {
            if self.device.read_sector(FAT_START + i, &mut a).is_err()
                || self
                    .device
                    .read_sector(FAT_START + SECTORS_PER_FAT + i, &mut b)
                    .is_err()
            {
                return false;
            }
            if a != b {
                return false;
            }
        }
        true
    }

    /// Linear first-fit cluster allocation starting at cluster 2.
    fn alloc_cluster(&self) -> Result<Option<u16>, FsError> {
        for cluster in FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + self.cluster_count as u16 {
            if self.fat_entry(cluster)? == 0 {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Walk a chain writing 0 at each step.
    fn free_chain(&mut self, first: u16) -> Result<(), FsError> {
        let mut cluster = first;
        let mut guard = 0;
        while (FIRST_DATA_CLUSTER..END_OF_CHAIN).contains(&cluster) {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            cluster = next;
            guard += 1;
            if guard > self.cluster_count {
                return Err(FsError::IoError);
            }
        }
        Ok(())
    }

    /// Chain as a cluster list, tail last.
    fn chain_of(&self, first: u16) -> Result<Vec<u16>, FsError> {
        let mut chain = Vec::new();
        let mut cluster = first;
        while (FIRST_DATA_CLUSTER..END_OF_CHAIN).contains(&cluster) {
            chain.push(cluster);
            if chain.len() > self.cluster_count {
                return Err(FsError::IoError);
            }
            cluster = self.fat_entry(cluster)?;
        }
        Ok(chain)
    }

    fn data_lba(cluster: u16) -> usize {
        DATA_START + cluster as usize - FIRST_DATA_CLUSTER as usize
    }

    // ---- root directory -------------------------------------------------

    fn read_raw_entry(&self, index: usize) -> Result<[u8; DIR_ENTRY_SIZE], FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.device
            .read_sector(ROOT_DIR_START + index / ENTRIES_PER_SECTOR, &mut sector)?;
        let off = (index % ENTRIES_PER_SECTOR) * DIR_ENTRY_SIZE;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&sector[off..off + DIR_ENTRY_SIZE]);
        Ok(raw)
    }

    fn write_entry(&mut self, index: usize, entry: &DirEntry) -> Result<(), FsError> {
        let lba = ROOT_DIR_START + index / ENTRIES_PER_SECTOR;
        let off = (index % ENTRIES_PER_SECTOR) * DIR_ENTRY_SIZE;
        let mut sector = [0u8; SECTOR_SIZE];
        self.device.read_sector(lba, &mut sector)?;
        entry.encode(&mut sector[off..off + DIR_ENTRY_SIZE]);
        self.device.write_sector(lba, &sector)
    }

    fn tombstone_entry(&mut self, index: usize) -> Result<(), FsError> {
        let lba = ROOT_DIR_START + index / ENTRIES_PER_SECTOR;
        let off = (index % ENTRIES_PER_SECTOR) * DIR_ENTRY_SIZE;
        let mut sector = [0u8; SECTOR_SIZE];
        self.device.read_sector(lba, &mut sector)?;
        sector[off] = ENTRY_DELETED;
        self.device.write_sector(lba, &sector)
    }

    /// Scan the root directory; the first 0x00 name byte ends the scan,
    /// 0xE5 marks a deleted slot.
    fn find_entry(&self, name: &ShortName) -> Result<Option<(usize, DirEntry)>, FsError> {
        for index in 0..ROOT_ENTRIES {
            let raw = self.read_raw_entry(index)?;
            match raw[0] {
                ENTRY_END => return Ok(None),
                ENTRY_DELETED => continue,
                _ => {}
            }
            let entry = DirEntry::decode(&raw);
            if entry.name == *name {
                return Ok(Some((index, entry)));
            }
        }
        Ok(None)
    }

    fn find_free_slot(&self) -> Result<Option<usize>, FsError> {
        for index in 0..ROOT_ENTRIES {
            let raw = self.read_raw_entry(index)?;
            if raw[0] == ENTRY_END || raw[0] == ENTRY_DELETED {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    // ---- public operations ----------------------------------------------

    /// Listable root entries, volume label and hidden files skipped.
    pub fn list_directory(&self) -> Result<Vec<DirEntryInfo>, FsError> {
        let mut out = Vec::new();
        for index in 0..ROOT_ENTRIES {
            let raw = self.read_raw_entry(index)?;
            match raw[0] {
                ENTRY_END => break,
                ENTRY_DELETED => continue,
                _ => {}
            }
            let entry = DirEntry::decode(&raw);
            if !entry.is_listable() {
                continue;
            }
            out.push(DirEntryInfo {
                name: entry.name.display(),
                size: entry.size as usize,
                is_directory: entry.attributes.contains(Attributes::DIRECTORY),
            });
        }
        Ok(out)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        ShortName::parse(name)
            .ok()
            .and_then(|sn| self.find_entry(&sn).ok().flatten())
            .is_some()
    }

    pub fn size(&self, name: &str) -> Result<usize, FsError> {
        let sn = ShortName::parse(name)?;
        let (_, entry) = self.find_entry(&sn)?.ok_or(FsError::NotFound)?;
        Ok(entry.size as usize)
    }

    /// Create an empty file. The first cluster stays 0 until data arrives.
    pub fn create(&mut self, name: &str) -> Result<(), FsError> {
        let sn = ShortName::parse(name)?;
        if self.find_entry(&sn)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let index = self.find_free_slot()?.ok_or(FsError::DiskFull)?;
        let entry = DirEntry {
            name: sn,
            attributes: Attributes::ARCHIVE,
            first_cluster: 0,
            size: 0,
        };
        self.write_entry(index, &entry)
    }

    /// Read file contents into `buf`; returns the bytes copied
    /// (`min(file size, buf.len())`).
    pub fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        let sn = ShortName::parse(name)?;
        let (_, entry) = self.find_entry(&sn)?.ok_or(FsError::NotFound)?;
        if entry.attributes.contains(Attributes::DIRECTORY) {
            return Err(FsError::NotAFile);
        }
        let mut remaining = (entry.size as usize).min(buf.len());
        let mut cluster = entry.first_cluster;
        let mut copied = 0;
        let mut guard = 0;
        while remaining > 0 && (FIRST_DATA_CLUSTER..END_OF_CHAIN).contains(&cluster) {
            let mut sector = [0u8; SECTOR_SIZE];
            self.device.read_sector(Self::data_lba(cluster), &mut sector)?;
            let chunk = remaining.min(SECTOR_SIZE);
            buf[copied..copied + chunk].copy_from_slice(&sector[..chunk]);
            copied += chunk;
            remaining -= chunk;
            cluster = self.fat_entry(cluster)?;
            guard += 1;
            if guard > self.cluster_count {
                return Err(FsError::IoError);
            }
        }
        Ok(copied)
    }

    /// Truncating overwrite. The old chain is freed first; clusters are
    /// then allocated one at a time, each data sector written in place
    /// with a zeroed tail. Running out of clusters mid-write records the
    /// bytes actually written in the entry and returns `DiskFull`.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<usize, FsError> {
        let sn = ShortName::parse(name)?;
        let (index, mut entry) = match self.find_entry(&sn)? {
            Some(found) => found,
            None => {
                // Implicit create keeps write() usable as an upsert.
                let index = self.find_free_slot()?.ok_or(FsError::DiskFull)?;
                let entry = DirEntry {
                    name: sn,
                    attributes: Attributes::ARCHIVE,
                    first_cluster: 0,
                    size: 0,
                };
                self.write_entry(index, &entry)?;
                (index, entry)
            }
        };
        if entry.attributes.contains(Attributes::DIRECTORY) {
            return Err(FsError::NotAFile);
        }

        if entry.first_cluster >= FIRST_DATA_CLUSTER {
            self.free_chain(entry.first_cluster)?;
        }
        entry.first_cluster = 0;
        entry.size = 0;

        #[cfg(feature = "fs_debug")]
        log::debug!("fat12: write {} bytes to {}", data.len(), name);

        let written = self.stream_clusters(index, &mut entry, data, 0, None)?;
        Ok(written)
    }

    /// Extend an existing file. The partially filled tail sector is
    /// completed first, then fresh clusters continue the chain.
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<usize, FsError> {
        let sn = ShortName::parse(name)?;
        let (index, mut entry) = self.find_entry(&sn)?.ok_or(FsError::NotFound)?;
        if entry.attributes.contains(Attributes::DIRECTORY) {
            return Err(FsError::NotAFile);
        }

        let old_size = entry.size as usize;
        let mut filled = 0;
        let tail = if entry.first_cluster >= FIRST_DATA_CLUSTER {
            let chain = self.chain_of(entry.first_cluster)?;
            let tail = *chain.last().ok_or(FsError::IoError)?;
            let tail_used = old_size - (chain.len() - 1) * SECTOR_SIZE;
            if tail_used < SECTOR_SIZE {
                let n = (SECTOR_SIZE - tail_used).min(data.len());
                let mut sector = [0u8; SECTOR_SIZE];
                self.device.read_sector(Self::data_lba(tail), &mut sector)?;
                sector[tail_used..tail_used + n].copy_from_slice(&data[..n]);
                self.device.write_sector(Self::data_lba(tail), &sector)?;
                filled = n;
            }
            Some(tail)
        } else {
            None
        };

        if filled == data.len() {
            entry.size = (old_size + filled) as u32;
            self.write_entry(index, &entry)?;
            return Ok(filled);
        }

        let streamed =
            self.stream_clusters(index, &mut entry, &data[filled..], old_size + filled, tail);
        match streamed {
            Ok(n) => Ok(filled + n),
            Err(e) => Err(e),
        }
    }

    /// Allocate clusters for `data`, linking each onto `prev` (or into the
    /// directory entry when the file was empty). `base_size` is the byte
    /// count already owned by the file; the entry's size is updated to
    /// `base_size` plus whatever actually landed, which on `DiskFull` is
    /// the partial count.
    fn stream_clusters(
        &mut self,
        index: usize,
        entry: &mut DirEntry,
        data: &[u8],
        base_size: usize,
        mut prev: Option<u16>,
    ) -> Result<usize, FsError> {
        let mut written = 0;
        while written < data.len() {
            let cluster = match self.alloc_cluster()? {
                Some(c) => c,
                None => {
                    entry.size = (base_size + written) as u32;
                    self.write_entry(index, entry)?;
                    return Err(FsError::DiskFull);
                }
            };
            let chunk = (data.len() - written).min(SECTOR_SIZE);
            let mut sector = [0u8; SECTOR_SIZE];
            sector[..chunk].copy_from_slice(&data[written..written + chunk]);
            self.device.write_sector(Self::data_lba(cluster), &sector)?;
            self.set_fat_entry(cluster, EOC_VALUE)?;
            match prev {
                Some(p) => self.set_fat_entry(p, cluster)?,
                None => entry.first_cluster = cluster,
            }
            prev = Some(cluster);
            written += chunk;
        }
        entry.size = (base_size + written) as u32;
        self.write_entry(index, entry)?;
        Ok(written)
    }

    /// Tombstone the entry and free its chain.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        let sn = ShortName::parse(name)?;
        let (index, entry) = self.find_entry(&sn)?.ok_or(FsError::NotFound)?;
        if entry.attributes.contains(Attributes::DIRECTORY) {
            return Err(FsError::NotAFile);
        }
        if entry.first_cluster >= FIRST_DATA_CLUSTER {
            self.free_chain(entry.first_cluster)?;
        }
        self.tombstone_entry(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::device::RamDisk;
    use alloc::vec;

    /// A formatted 1.44 MiB volume.
    fn volume() -> Fat12Volume<RamDisk> {
        let disk = RamDisk::new(vec![0u8; 1_474_560].leak());
        Fat12Volume::format(disk).unwrap()
    }

    #[test]
    fn geometry_matches_the_floppy_layout() {
        assert_eq!(ROOT_DIR_SECTORS, 14);
        assert_eq!(DATA_START, 33);
        let v = volume();
        assert_eq!(v.cluster_count(), 2880 - 33);
        assert_eq!(v.total_space(), (2880 - 33) * 512);
        assert_eq!(v.free_space(), v.total_space());
    }

    #[test]
    fn fat12_pairing_even_and_odd() {
        let mut v = volume();
        v.set_fat_entry(2, 0xABC).unwrap();
        v.set_fat_entry(3, 0xDEF).unwrap();
        assert_eq!(v.fat_entry(2).unwrap(), 0xABC);
        assert_eq!(v.fat_entry(3).unwrap(), 0xDEF);
        // Clusters 2 and 3 share byte 3 of the FAT; updating one must not
        // disturb the other.
        v.set_fat_entry(2, 0x123).unwrap();
        assert_eq!(v.fat_entry(3).unwrap(), 0xDEF);
        assert!(v.fat_copies_agree());
    }

    #[test]
    fn create_write_read_round_trip() {
        let mut v = volume();
        v.create("A.TXT").unwrap();
        let data = vec![b'x'; 5000];
        assert_eq!(v.write("A.TXT", &data).unwrap(), 5000);
        assert_eq!(v.size("A.TXT").unwrap(), 5000);

        let mut buf = vec![0u8; 5000];
        assert_eq!(v.read("A.TXT", &mut buf).unwrap(), 5000);
        assert_eq!(buf, data);
        assert!(v.fat_copies_agree());
    }

    #[test]
    fn free_space_accounting_exact() {
        let mut v = volume();
        let initial = v.free_space();
        v.create("A.TXT").unwrap();
        assert_eq!(v.free_space(), initial, "empty file owns no clusters");
        v.write("A.TXT", &vec![b'x'; 5000]).unwrap();
        assert_eq!(v.free_space(), initial - 5000usize.div_ceil(512) * 512);
        v.delete("A.TXT").unwrap();
        assert_eq!(v.free_space(), initial);
        assert!(v.fat_copies_agree());
    }

    #[test]
    fn deleted_file_is_gone_and_name_reusable() {
        let mut v = volume();
        v.create("GONE.BIN").unwrap();
        v.write("GONE.BIN", b"abc").unwrap();
        v.delete("GONE.BIN").unwrap();
        assert!(!v.file_exists("GONE.BIN"));
        assert_eq!(v.size("GONE.BIN"), Err(FsError::NotFound));
        v.create("GONE.BIN").unwrap();
        assert_eq!(v.size("GONE.BIN").unwrap(), 0);
    }

    #[test]
    fn append_concatenates() {
        let mut v = volume();
        v.create("LOG.TXT").unwrap();
        let a = vec![b'a'; 700];
        let b = vec![b'b'; 900];
        assert_eq!(v.append("LOG.TXT", &a).unwrap(), 700);
        assert_eq!(v.append("LOG.TXT", &b).unwrap(), 900);
        assert_eq!(v.size("LOG.TXT").unwrap(), 1600);

        let mut buf = vec![0u8; 1600];
        v.read("LOG.TXT", &mut buf).unwrap();
        assert!(buf[..700].iter().all(|&c| c == b'a'));
        assert!(buf[700..].iter().all(|&c| c == b'b'));
        assert!(v.fat_copies_agree());
    }

    #[test]
    fn append_to_sector_aligned_tail() {
        let mut v = volume();
        v.create("B.BIN").unwrap();
        v.write("B.BIN", &vec![1u8; 1024]).unwrap();
        v.append("B.BIN", &vec![2u8; 10]).unwrap();
        assert_eq!(v.size("B.BIN").unwrap(), 1034);
        let mut buf = vec![0u8; 1034];
        v.read("B.BIN", &mut buf).unwrap();
        assert_eq!(buf[1023], 1);
        assert_eq!(buf[1024], 2);
    }

    #[test]
    fn truncating_write_releases_old_clusters() {
        let mut v = volume();
        v.create("C.BIN").unwrap();
        v.write("C.BIN", &vec![9u8; 10_000]).unwrap();
        let free_after_big = v.free_space();
        v.write("C.BIN", b"tiny").unwrap();
        assert_eq!(v.size("C.BIN").unwrap(), 4);
        assert_eq!(v.free_space(), free_after_big + 10_000usize.div_ceil(512) * 512 - 512);
        assert!(v.fat_copies_agree());
    }

    #[test]
    fn disk_full_records_partial_size() {
        // A small volume: 40 sectors leaves 7 data clusters.
        let disk = RamDisk::new(vec![0u8; 40 * 512].leak());
        let mut v = Fat12Volume::format(disk).unwrap();
        assert_eq!(v.cluster_count(), 7);

        v.create("BIG.BIN").unwrap();
        let result = v.write("BIG.BIN", &vec![7u8; 10 * 512]);
        assert_eq!(result, Err(FsError::DiskFull));
        assert_eq!(v.size("BIG.BIN").unwrap(), 7 * 512);
        assert_eq!(v.free_space(), 0);
        assert!(v.fat_copies_agree());

        // The partial contents are still readable.
        let mut buf = vec![0u8; 10 * 512];
        assert_eq!(v.read("BIG.BIN", &mut buf).unwrap(), 7 * 512);
        assert!(buf[..7 * 512].iter().all(|&c| c == 7));

        // Deleting recovers every cluster.
        v.delete("BIG.BIN").unwrap();
        assert_eq!(v.free_space(), 7 * 512);
    }

    #[test]
    fn create_rejects_duplicates() {
        let mut v = volume();
        v.create("DUP.TXT").unwrap();
        assert_eq!(v.create("DUP.TXT"), Err(FsError::AlreadyExists));
        // Lookup is case-insensitive through canonicalization.
        assert_eq!(v.create("dup.txt"), Err(FsError::AlreadyExists));
    }

    #[test]
    fn listing_skips_deleted_and_stops_at_end() {
        let mut v = volume();
        v.create("ONE.TXT").unwrap();
        v.create("TWO.TXT").unwrap();
        v.create("THREE.TXT").unwrap();
        v.delete("TWO.TXT").unwrap();
        let names: Vec<String> = v
            .list_directory()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["ONE.TXT", "THREE.TXT"]);
    }

    #[test]
    fn empty_write_leaves_no_chain() {
        let mut v = volume();
        v.create("NIL.TXT").unwrap();
        assert_eq!(v.write("NIL.TXT", b"").unwrap(), 0);
        assert_eq!(v.size("NIL.TXT").unwrap(), 0);
        assert_eq!(v.free_space(), v.total_space());
        let mut buf = [0u8; 8];
        assert_eq!(v.read("NIL.TXT", &mut buf).unwrap(), 0);
    }

    #[test]
    fn chain_invariant_holds_after_writes() {
        // chain length * 512 >= size > (chain length - 1) * 512
        let mut v = volume();
        for (name, len) in [("S1.BIN", 1usize), ("S2.BIN", 512), ("S3.BIN", 513), ("S4.BIN", 2048)]
        {
            v.create(name).unwrap();
            v.write(name, &vec![0xEE; len]).unwrap();
            let sn = ShortName::parse(name).unwrap();
            let (_, entry) = v.find_entry(&sn).unwrap().unwrap();
            let chain = v.chain_of(entry.first_cluster).unwrap();
            assert!(chain.len() * 512 >= len, "{}", name);
            assert!(len > (chain.len() - 1) * 512, "{}", name);
        }
    }
}
