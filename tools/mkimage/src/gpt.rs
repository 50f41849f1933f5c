//! Protective MBR + GPT header/partition-table writer for UEFI images
//! (spec §4.4.1). Header CRC-32 (property 10) is recomputed over the first
//! 92 header bytes with the CRC field itself zeroed, per the UEFI spec.

use crate::crc32::crc32;

pub const SECTOR_SIZE: u64 = 512;
const GPT_ENTRY_SIZE: u32 = 128;
const GPT_ENTRY_COUNT: u32 = 128;
const EFI_SYSTEM_PARTITION_GUID: [u8; 16] = [
    0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b,
];
const BASIC_DATA_GUID: [u8; 16] = [
    0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99, 0xc7,
];

pub struct Partition {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: &'static str,
}

pub fn esp_partition(first_lba: u64, last_lba: u64, unique_guid: [u8; 16]) -> Partition {
    Partition { type_guid: EFI_SYSTEM_PARTITION_GUID, unique_guid, first_lba, last_lba, name: "EFI System" }
}

pub fn data_partition(first_lba: u64, last_lba: u64, unique_guid: [u8; 16]) -> Partition {
    Partition { type_guid: BASIC_DATA_GUID, unique_guid, first_lba, last_lba, name: "System" }
}

/// The first and last LBAs available for partition data, given the fixed
/// 128-entry partition table reserved at both ends of the disk. Callers
/// size a trailing data partition against `last_usable_lba` so it ends
/// right before the backup GPT entries.
pub fn usable_range(total_sectors: u64) -> (u64, u64) {
    let entry_table_sectors = (GPT_ENTRY_SIZE as u64 * GPT_ENTRY_COUNT as u64).div_ceil(SECTOR_SIZE);
    let first_usable_lba = 2 + entry_table_sectors;
    let backup_entries_lba = total_sectors - 1 - entry_table_sectors;
    let last_usable_lba = backup_entries_lba - 1;
    (first_usable_lba, last_usable_lba)
}

fn protective_mbr(total_sectors: u64) -> [u8; 512] {
    let mut mbr = [0u8; 512];
    let part = &mut mbr[446..462];
    part[4] = 0xEE; // partition type: GPT protective
    part[8..12].copy_from_slice(&1u32.to_le_bytes()); // starting LBA
    let size = (total_sectors - 1).min(0xFFFF_FFFF) as u32;
    part[12..16].copy_from_slice(&size.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

fn name_utf16(name: &str) -> [u8; 72] {
    let mut out = [0u8; 72];
    for (i, u) in name.encode_utf16().take(36).enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
    }
    out
}

fn partition_entries(partitions: &[Partition]) -> Vec<u8> {
    let mut table = vec![0u8; (GPT_ENTRY_SIZE * GPT_ENTRY_COUNT) as usize];
    for (i, p) in partitions.iter().enumerate() {
        let e = &mut table[i * GPT_ENTRY_SIZE as usize..(i + 1) * GPT_ENTRY_SIZE as usize];
        e[0..16].copy_from_slice(&p.type_guid);
        e[16..32].copy_from_slice(&p.unique_guid);
        e[32..40].copy_from_slice(&p.first_lba.to_le_bytes());
        e[40..48].copy_from_slice(&p.last_lba.to_le_bytes());
        e[56..56 + 72].copy_from_slice(&name_utf16(p.name));
    }
    table
}

#[allow(clippy::too_many_arguments)]
fn header(
    my_lba: u64,
    alt_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entry_lba: u64,
    num_entries: u32,
    entries_crc: u32,
) -> [u8; 512] {
    let mut h = [0u8; 512];
    h[0..8].copy_from_slice(b"EFI PART");
    h[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes()); // revision 1.0
    h[12..16].copy_from_slice(&92u32.to_le_bytes()); // header size
    // CRC32 field (16..20) left zero during the first pass.
    h[24..32].copy_from_slice(&my_lba.to_le_bytes());
    h[32..40].copy_from_slice(&alt_lba.to_le_bytes());
    h[40..48].copy_from_slice(&first_usable_lba.to_le_bytes());
    h[48..56].copy_from_slice(&last_usable_lba.to_le_bytes());
    h[56..72].copy_from_slice(&disk_guid);
    h[72..80].copy_from_slice(&partition_entry_lba.to_le_bytes());
    h[80..84].copy_from_slice(&num_entries.to_le_bytes());
    h[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());

    let crc = crc32(&h[0..92]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

/// `(protective_mbr, primary_header, primary_entries, backup_entries, backup_header)`.
pub type GptRegions = (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>);

/// Builds the full GPT region of an image: protective MBR (LBA0), primary
/// header (LBA1) + entries (LBA2..), and a backup header + entries at the
/// end of the disk. Returns `(protective_mbr, primary_header, primary_entries, backup_entries, backup_header)`
/// so the caller can place each piece at the right offset.
pub fn build(total_sectors: u64, disk_guid: [u8; 16], partitions: &[Partition]) -> GptRegions {
    let entries = partition_entries(partitions);
    let entries_crc = crc32(&entries);

    let entry_table_sectors = (GPT_ENTRY_SIZE as u64 * GPT_ENTRY_COUNT as u64).div_ceil(SECTOR_SIZE);
    let primary_entries_lba = 2u64;
    let backup_entries_lba = total_sectors - 1 - entry_table_sectors;
    let backup_header_lba = total_sectors - 1;
    let first_usable_lba = primary_entries_lba + entry_table_sectors;
    let last_usable_lba = backup_entries_lba - 1;

    let primary_header = header(1, backup_header_lba, first_usable_lba, last_usable_lba, disk_guid, primary_entries_lba, GPT_ENTRY_COUNT, entries_crc);
    let backup_header = header(backup_header_lba, 1, first_usable_lba, last_usable_lba, disk_guid, backup_entries_lba, GPT_ENTRY_COUNT, entries_crc);

    (
        protective_mbr(total_sectors).to_vec(),
        primary_header.to_vec(),
        entries.clone(),
        entries,
        backup_header.to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_crc_is_recomputed_over_first_92_bytes_with_crc_zeroed() {
        let h = header(1, 100, 2, 90, [7u8; 16], 2, GPT_ENTRY_COUNT, 0xdead_beef);
        let stored_crc = u32::from_le_bytes(h[16..20].try_into().unwrap());
        let mut zeroed = h;
        zeroed[16..20].fill(0);
        assert_eq!(crc32(&zeroed[0..92]), stored_crc);
    }

    proptest::proptest! {
        // Property 10 (spec.md §8): for any header field values, recomputing
        // the CRC-32 over the first 92 bytes with the CRC field zeroed
        // equals the stored value.
        #[test]
        fn header_crc_holds_for_arbitrary_field_values(
            my_lba in proptest::prelude::any::<u64>(),
            alt_lba in proptest::prelude::any::<u64>(),
            first_usable_lba in proptest::prelude::any::<u64>(),
            last_usable_lba in proptest::prelude::any::<u64>(),
            disk_guid in proptest::prelude::any::<[u8; 16]>(),
            partition_entry_lba in proptest::prelude::any::<u64>(),
            entries_crc in proptest::prelude::any::<u32>(),
        ) {
            let h = header(my_lba, alt_lba, first_usable_lba, last_usable_lba, disk_guid, partition_entry_lba, GPT_ENTRY_COUNT, entries_crc);
            let stored_crc = u32::from_le_bytes(h[16..20].try_into().unwrap());
            let mut zeroed = h;
            zeroed[16..20].fill(0);
            proptest::prop_assert_eq!(crc32(&zeroed[0..92]), stored_crc);
        }
    }

    #[test]
    fn protective_mbr_has_signature_and_ee_type() {
        let mbr = protective_mbr(131072);
        assert_eq!(mbr[510], 0x55);
        assert_eq!(mbr[511], 0xAA);
        assert_eq!(mbr[446 + 4], 0xEE);
    }

    #[test]
    fn build_places_backup_header_at_last_sector() {
        let esp = esp_partition(2048, 2048 + 6143, [1u8; 16]);
        let (_, primary, _, _, backup) = build(131072, [9u8; 16], &[esp]);
        let primary_alt_lba = u64::from_le_bytes(primary[32..40].try_into().unwrap());
        assert_eq!(primary_alt_lba, 131072 - 1);
        let backup_my_lba = u64::from_le_bytes(backup[24..32].try_into().unwrap());
        assert_eq!(backup_my_lba, 131072 - 1);
    }
}
