//! GPT rewrite engine.
//!
//! Grows the final partition of the boot disk to cover every usable LBA:
//! rewrites the tail partition entry, updates the primary header, writes a
//! fresh backup header at the new end of the device, relocates the backup
//! partition-entry array and fixes the protective MBR. All structures are
//! serialized bit-exact (little-endian, packed) before CRC computation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use vinitd_shared::{VinitdError, VinitdResult};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const SECTOR_SIZE: u64 = 512;
pub const PARTITION_ENTRY_SIZE: usize = 128;

/// Number of sectors occupied by one partition-entry array (128 * 128 B).
const PE_ARRAY_SECTORS: u64 = 32;

/// GPT header, one sector on disk.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub struct GptHeader {
    pub signature: U64,
    pub revision: [u8; 4],
    pub header_size: U32,
    pub crc: U32,
    pub reserved0: U32,
    pub current_lba: U64,
    pub backup_lba: U64,
    pub first_usable_lba: U64,
    pub last_usable_lba: U64,
    pub guid: [u8; 16],
    pub start_lba_parts: U64,
    pub no_of_parts: U32,
    pub size_part_entry: U32,
    pub crc_parts: U32,
    pub reserved1: [u8; 420],
}

/// One 128-byte partition entry. The first entry with `first_lba == 0`
/// terminates iteration.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub part_guid: [u8; 16],
    pub first_lba: U64,
    pub last_lba: U64,
    pub attributes: U64,
    pub name: [u8; 72],
}

/// Protective MBR at LBA 0 with a single partition record covering the
/// whole device.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub struct ProtectiveMbr {
    pub bootstrap: [u8; 446],
    pub status: u8,
    pub chs_first: [u8; 3],
    pub partition_type: u8,
    pub chs_last: [u8; 3],
    pub first_lba: U32,
    pub number_of_sectors: U32,
    pub reserved: [u8; 48],
    pub magic: [u8; 2],
}

fn disk_err<E: std::fmt::Display>(what: &str, e: E) -> VinitdError {
    VinitdError::Disk(format!("{}: {}", what, e))
}

/// In-place modifier for the boot disk's partition table.
pub struct GptModifier {
    file: File,
    size: u64,

    header: GptHeader,
    backup_header: Option<GptHeader>,
    tail_entry: Option<PartitionEntry>,
    original_backup_lba: u64,
    sectors_added: u64,
}

impl GptModifier {
    pub fn new(mut file: File) -> VinitdResult<GptModifier> {
        let header = read_header(&mut file, SECTOR_SIZE)?;
        let original_backup_lba = header.backup_lba.get();
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| disk_err("can not size disk", e))?;

        Ok(GptModifier {
            file,
            size,
            header,
            backup_header: None,
            tail_entry: None,
            original_backup_lba,
            sectors_added: 0,
        })
    }

    /// Highest addressable data LBA once the table covers the full device.
    fn last_usable_lba(&self) -> u64 {
        self.size / SECTOR_SIZE - 34
    }

    fn device_sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// The disk needs growing when usable space ends short of the device.
    pub fn needs_resize(&self) -> bool {
        (self.header.last_usable_lba.get() + 35) * SECTOR_SIZE < self.size
    }

    /// The partition entry that was extended, available after `grow`.
    pub fn tail_entry(&self) -> Option<&PartitionEntry> {
        self.tail_entry.as_ref()
    }

    pub fn sectors_added(&self) -> u64 {
        self.sectors_added
    }

    /// Hand the underlying device back for the follow-up ioctls.
    pub fn into_file(self) -> File {
        self.file
    }

    /// Run the full grow sequence. Idempotent: a no-op when the table
    /// already covers the device.
    pub fn grow(&mut self) -> VinitdResult<()> {
        if !self.needs_resize() {
            return Ok(());
        }

        self.sectors_added = self.extend_final_partition()?;
        self.update_primary_header()?;
        self.update_backup_header()?;
        self.relocate_backup_table()?;
        self.update_mbr()?;

        Ok(())
    }

    /// Extend the last populated partition entry to the new last usable
    /// LBA. Returns the number of sectors added.
    fn extend_final_partition(&mut self) -> VinitdResult<u64> {
        let table_offset = SECTOR_SIZE * 2;
        let (entry, index) = self.find_tail_entry(table_offset)?;

        let mut entry = entry;
        let added = self.last_usable_lba() - entry.last_lba.get();
        entry.last_lba = U64::new(self.last_usable_lba());

        let entry_offset = table_offset + (index * PARTITION_ENTRY_SIZE) as u64;
        self.file
            .seek(SeekFrom::Start(entry_offset))
            .map_err(|e| disk_err("can not seek partition entry", e))?;
        self.file
            .write_all(entry.as_bytes())
            .map_err(|e| disk_err("can not write partition entry", e))?;

        self.tail_entry = Some(entry);
        Ok(added)
    }

    fn find_tail_entry(&mut self, table_offset: u64) -> VinitdResult<(PartitionEntry, usize)> {
        self.file
            .seek(SeekFrom::Start(table_offset))
            .map_err(|e| disk_err("can not seek partition table", e))?;

        let mut tail: Option<(PartitionEntry, usize)> = None;
        let mut buf = [0u8; PARTITION_ENTRY_SIZE];

        for i in 0..128 {
            self.file
                .read_exact(&mut buf)
                .map_err(|e| disk_err("can not read partition entry", e))?;
            let pe = PartitionEntry::read_from_bytes(&buf)
                .map_err(|_| VinitdError::Disk("partition entry malformed".into()))?;

            if pe.first_lba.get() == 0 {
                break;
            }
            tail = Some((pe, i));
        }

        tail.ok_or_else(|| VinitdError::Disk("no partitions on boot disk".into()))
    }

    fn update_primary_header(&mut self) -> VinitdResult<()> {
        self.header.last_usable_lba = U64::new(self.last_usable_lba());
        self.header.backup_lba = U64::new(self.device_sectors() - 1);

        let mut hdr = self.header.clone();
        self.calculate_crcs(&mut hdr, false)?;
        self.header = hdr;

        self.file
            .seek(SeekFrom::Start(SECTOR_SIZE))
            .map_err(|e| disk_err("can not seek primary header", e))?;
        self.file
            .write_all(self.header.as_bytes())
            .map_err(|e| disk_err("can not write primary header", e))?;
        Ok(())
    }

    /// Build the backup header from the freshly written primary: swapped
    /// current/backup LBAs, partition array right below it, the primary's
    /// partition-array CRC.
    fn update_backup_header(&mut self) -> VinitdResult<()> {
        let mut g = read_header(&mut self.file, SECTOR_SIZE)?;

        g.current_lba = self.header.backup_lba;
        g.backup_lba = self.header.current_lba;
        g.start_lba_parts = U64::new(g.current_lba.get() - PE_ARRAY_SECTORS);

        self.calculate_crcs(&mut g, true)?;

        self.file
            .seek(SeekFrom::Start(g.current_lba.get() * SECTOR_SIZE))
            .map_err(|e| disk_err("can not seek backup header", e))?;
        self.file
            .write_all(g.as_bytes())
            .map_err(|e| disk_err("can not write backup header", e))?;

        self.backup_header = Some(g);
        Ok(())
    }

    /// Zero the previous backup table location and copy the primary
    /// partition-entry array below the new backup header.
    fn relocate_backup_table(&mut self) -> VinitdResult<()> {
        let old_offset = (self.original_backup_lba - PE_ARRAY_SECTORS) * SECTOR_SIZE;
        let zeroes = vec![0u8; (PE_ARRAY_SECTORS as usize + 1) * SECTOR_SIZE as usize];
        self.file
            .seek(SeekFrom::Start(old_offset))
            .map_err(|e| disk_err("can not seek old backup table", e))?;
        self.file
            .write_all(&zeroes)
            .map_err(|e| disk_err("can not clear old backup table", e))?;

        let backup = self
            .backup_header
            .as_ref()
            .ok_or_else(|| VinitdError::Disk("backup header not written".into()))?;
        let src = self.header.start_lba_parts.get() * SECTOR_SIZE;
        let dst = backup.start_lba_parts.get() * SECTOR_SIZE;

        let mut sector = [0u8; SECTOR_SIZE as usize];
        for i in 0..PE_ARRAY_SECTORS {
            read_at(&mut self.file, src + i * SECTOR_SIZE, &mut sector)?;
            write_at(&mut self.file, dst + i * SECTOR_SIZE, &sector)?;
        }

        Ok(())
    }

    fn update_mbr(&mut self) -> VinitdResult<()> {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        read_at(&mut self.file, 0, &mut buf)?;

        let mut mbr = ProtectiveMbr::read_from_bytes(&buf)
            .map_err(|_| VinitdError::Disk("protective mbr malformed".into()))?;
        mbr.number_of_sectors = U32::new(self.device_sectors() as u32 - 1);

        write_at(&mut self.file, 0, mbr.as_bytes())
    }

    /// Recompute the CRC pair of a header. The partition-array CRC covers
    /// 32 sectors at the header's `start_lba_parts`; the header CRC covers
    /// the first `header_size` bytes with the CRC field zeroed. The backup
    /// header reuses the primary's partition-array CRC.
    fn calculate_crcs(&mut self, g: &mut GptHeader, skip_parts: bool) -> VinitdResult<()> {
        g.crc = U32::new(0);

        if !skip_parts {
            let mut pea = vec![0u8; (PE_ARRAY_SECTORS * SECTOR_SIZE) as usize];
            read_at(&mut self.file, g.start_lba_parts.get() * SECTOR_SIZE, &mut pea)?;
            g.crc_parts = U32::new(crc32fast::hash(&pea));
        } else {
            g.crc_parts = self.header.crc_parts;
        }

        let bytes = g.as_bytes();
        let covered = g.header_size.get() as usize;
        if covered > bytes.len() {
            return Err(VinitdError::Disk("gpt header size out of range".into()));
        }
        let crc = crc32fast::hash(&bytes[..covered]);
        g.crc = U32::new(crc);

        Ok(())
    }
}

fn read_header(file: &mut File, offset: u64) -> VinitdResult<GptHeader> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    read_at(file, offset, &mut buf)?;
    GptHeader::read_from_bytes(&buf).map_err(|_| VinitdError::Disk("gpt header malformed".into()))
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> VinitdResult<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| disk_err("seek failed", e))?;
    file.read_exact(buf).map_err(|e| disk_err("read failed", e))
}

fn write_at(file: &mut File, offset: u64, buf: &[u8]) -> VinitdResult<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| disk_err("seek failed", e))?;
    file.write_all(buf).map_err(|e| disk_err("write failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART"
    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<GptHeader>(), 512);
        assert_eq!(std::mem::size_of::<PartitionEntry>(), 128);
        assert_eq!(std::mem::size_of::<ProtectiveMbr>(), 512);
    }

    /// Build a disk image laid out for `image_sectors` on a backing file of
    /// `device_sectors`, with one partition ending at `part_last_lba`.
    fn build_image(device_sectors: u64, image_sectors: u64, part_last_lba: u64) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.set_len(device_sectors * SECTOR_SIZE).unwrap();

        // protective MBR
        let mut mbr = ProtectiveMbr::read_from_bytes(&[0u8; 512]).unwrap();
        mbr.status = 0x00;
        mbr.partition_type = 0xee;
        mbr.first_lba = U32::new(1);
        mbr.number_of_sectors = U32::new(image_sectors as u32 - 1);
        mbr.magic = [0x55, 0xaa];
        write_at(&mut f, 0, mbr.as_bytes()).unwrap();

        // one partition entry
        let mut pe = PartitionEntry::read_from_bytes(&[0u8; 128]).unwrap();
        pe.type_guid[0] = 0xaf;
        pe.part_guid[0] = 0x01;
        pe.first_lba = U64::new(2048);
        pe.last_lba = U64::new(part_last_lba);
        write_at(&mut f, 2 * SECTOR_SIZE, pe.as_bytes()).unwrap();

        // primary header
        let mut hdr = GptHeader::read_from_bytes(&[0u8; 512]).unwrap();
        hdr.signature = U64::new(GPT_SIGNATURE);
        hdr.revision = [0, 0, 1, 0];
        hdr.header_size = U32::new(92);
        hdr.current_lba = U64::new(1);
        hdr.backup_lba = U64::new(image_sectors - 1);
        hdr.first_usable_lba = U64::new(34);
        hdr.last_usable_lba = U64::new(image_sectors - 34);
        hdr.start_lba_parts = U64::new(2);
        hdr.no_of_parts = U32::new(128);
        hdr.size_part_entry = U32::new(128);

        let mut pea = vec![0u8; (PE_ARRAY_SECTORS * SECTOR_SIZE) as usize];
        read_at(&mut f, 2 * SECTOR_SIZE, &mut pea).unwrap();
        hdr.crc_parts = U32::new(crc32fast::hash(&pea));
        hdr.crc = U32::new(0);
        let crc = crc32fast::hash(&hdr.as_bytes()[..92]);
        hdr.crc = U32::new(crc);

        write_at(&mut f, SECTOR_SIZE, hdr.as_bytes()).unwrap();
        f
    }

    fn check_header_crc(f: &mut File, offset: u64) -> GptHeader {
        let hdr = read_header(f, offset).unwrap();
        let mut copy = hdr.clone();
        copy.crc = U32::new(0);
        let crc = crc32fast::hash(&copy.as_bytes()[..copy.header_size.get() as usize]);
        assert_eq!(crc, hdr.crc.get(), "header crc at {:#x}", offset);
        hdr
    }

    #[test]
    fn test_grow_expands_to_device() {
        // 4 MiB image on an 8 MiB backing device, partition ends at 7000
        let device_sectors = 8 * MIB / SECTOR_SIZE;
        let image_sectors = 4 * MIB / SECTOR_SIZE;
        let f = build_image(device_sectors, image_sectors, 7000);

        let mut m = GptModifier::new(f).unwrap();
        assert!(m.needs_resize());
        m.grow().unwrap();

        let expected_last_usable = device_sectors - 34;
        assert_eq!(m.tail_entry().unwrap().last_lba.get(), expected_last_usable);
        assert_eq!(m.sectors_added(), expected_last_usable - 7000);

        let mut f = m.into_file();

        // primary header postconditions
        let primary = check_header_crc(&mut f, SECTOR_SIZE);
        assert_eq!(
            (primary.backup_lba.get() + 1) * SECTOR_SIZE,
            device_sectors * SECTOR_SIZE
        );
        assert_eq!(
            primary.last_usable_lba.get() * SECTOR_SIZE,
            device_sectors * SECTOR_SIZE - 34 * SECTOR_SIZE
        );

        // backup header valid, swapped, array right below it
        let backup = check_header_crc(&mut f, primary.backup_lba.get() * SECTOR_SIZE);
        assert_eq!(backup.current_lba.get(), primary.backup_lba.get());
        assert_eq!(backup.backup_lba.get(), primary.current_lba.get());
        assert_eq!(
            backup.start_lba_parts.get(),
            backup.current_lba.get() - PE_ARRAY_SECTORS
        );
        assert_eq!(backup.crc_parts.get(), primary.crc_parts.get());

        // partition-entry array crc matches, backup array byte-equal
        let mut primary_pea = vec![0u8; (PE_ARRAY_SECTORS * SECTOR_SIZE) as usize];
        read_at(&mut f, primary.start_lba_parts.get() * SECTOR_SIZE, &mut primary_pea).unwrap();
        assert_eq!(crc32fast::hash(&primary_pea), primary.crc_parts.get());

        let mut backup_pea = vec![0u8; (PE_ARRAY_SECTORS * SECTOR_SIZE) as usize];
        read_at(&mut f, backup.start_lba_parts.get() * SECTOR_SIZE, &mut backup_pea).unwrap();
        assert_eq!(primary_pea, backup_pea);

        // protective MBR covers the device
        let mut buf = [0u8; 512];
        read_at(&mut f, 0, &mut buf).unwrap();
        let mbr = ProtectiveMbr::read_from_bytes(&buf).unwrap();
        assert_eq!(mbr.number_of_sectors.get() as u64, device_sectors - 1);
        assert_eq!(mbr.magic, [0x55, 0xaa]);

        // grown partition visible in the table
        let entry_buf = {
            let mut b = [0u8; 128];
            read_at(&mut f, 2 * SECTOR_SIZE, &mut b).unwrap();
            b
        };
        let pe = PartitionEntry::read_from_bytes(&entry_buf).unwrap();
        assert_eq!(pe.last_lba.get(), expected_last_usable);
    }

    #[test]
    fn test_grow_is_idempotent() {
        let device_sectors = 8 * MIB / SECTOR_SIZE;
        let image_sectors = 4 * MIB / SECTOR_SIZE;
        let f = build_image(device_sectors, image_sectors, 7000);

        let mut m = GptModifier::new(f).unwrap();
        m.grow().unwrap();
        let f = m.into_file();

        let mut m2 = GptModifier::new(f).unwrap();
        assert!(!m2.needs_resize());
        m2.grow().unwrap();
        assert!(m2.tail_entry().is_none());
    }

    #[test]
    fn test_full_size_disk_is_noop() {
        let sectors = 8 * MIB / SECTOR_SIZE;
        let f = build_image(sectors, sectors, 7000);
        let m = GptModifier::new(f).unwrap();
        assert!(!m.needs_resize());
    }

    #[test]
    fn test_empty_table_fails() {
        let sectors = 8 * MIB / SECTOR_SIZE;
        let mut f = tempfile::tempfile().unwrap();
        f.set_len(sectors * SECTOR_SIZE).unwrap();

        let mut hdr = GptHeader::read_from_bytes(&[0u8; 512]).unwrap();
        hdr.signature = U64::new(GPT_SIGNATURE);
        hdr.header_size = U32::new(92);
        hdr.start_lba_parts = U64::new(2);
        hdr.last_usable_lba = U64::new(100);
        write_at(&mut f, SECTOR_SIZE, hdr.as_bytes()).unwrap();

        let mut m = GptModifier::new(f).unwrap();
        assert!(m.grow().is_err());
    }
}
