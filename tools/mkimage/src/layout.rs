//! Address-space layout assembly for the three image modes (spec §4.4.1).
//! Delegates formatting of each region to `exfat`, `fat16`, `gpt`, and
//! `iso9660`; this module only knows where each region starts.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::{exfat, fat16, gpt, iso9660};

pub const SECTOR_SIZE: u64 = 512;
const BIOS_STAGE1_SECTORS: u64 = 1;
const BIOS_KERNEL_START_SECTOR: u64 = 64;
const UEFI_ESP_START_LBA: u64 = 2048;
const UEFI_ESP_SECTORS: u64 = 3 * 1024 * 1024 / SECTOR_SIZE; // 3 MiB

/// The region of a freshly-built image that holds the exFAT partition, so
/// the caller can re-run `exfat::incremental_update` in place against an
/// existing output file instead of discarding it.
pub struct Layout {
    pub image: Vec<u8>,
    pub exfat_region: std::ops::Range<usize>,
}

/// Deterministic pseudo-GUID derived from a label, so repeated builds of
/// the same inputs produce byte-identical images (mirrors exfat's fixed
/// volume serial number).
fn derive_guid(label: &str) -> [u8; 16] {
    let mut guid = [0u8; 16];
    let mut seed = crate::crc32::crc32(label.as_bytes());
    for chunk in guid.chunks_mut(4) {
        chunk.copy_from_slice(&seed.to_le_bytes());
        seed = crate::crc32::crc32(&seed.to_le_bytes());
    }
    guid
}

pub fn build_bios(
    stage1: &[u8],
    stage2: &[u8],
    kernel: &[u8],
    sysroot: Option<&Path>,
    image_size: u64,
    fs_start: u64,
) -> Result<Layout> {
    if stage1.len() > (BIOS_STAGE1_SECTORS * SECTOR_SIZE) as usize {
        bail!("stage1 ({} bytes) does not fit in one sector", stage1.len());
    }
    let stage2_sectors = BIOS_KERNEL_START_SECTOR - BIOS_STAGE1_SECTORS;
    if stage2.len() > (stage2_sectors * SECTOR_SIZE) as usize {
        bail!("stage2 ({} bytes) does not fit in {stage2_sectors} sectors", stage2.len());
    }
    let kernel_sectors = (kernel.len() as u64).div_ceil(SECTOR_SIZE);
    if BIOS_KERNEL_START_SECTOR + kernel_sectors > fs_start {
        bail!("kernel ({kernel_sectors} sectors) overruns the exFAT partition at sector {fs_start}");
    }

    let total_sectors = image_size / SECTOR_SIZE;
    if fs_start >= total_sectors {
        bail!("fs-start sector {fs_start} is past the end of a {image_size}-byte image");
    }

    let mut image = vec![0u8; image_size as usize];
    image[0..stage1.len()].copy_from_slice(stage1);
    image[510] = 0x55;
    image[511] = 0xAA;

    let mut stage2_patched = stage2.to_vec();
    if stage2_patched.len() < 8 {
        stage2_patched.resize(8, 0);
    }
    stage2_patched[2..4].copy_from_slice(&(kernel_sectors as u16).to_le_bytes());
    stage2_patched[4..8].copy_from_slice(&(BIOS_KERNEL_START_SECTOR as u32).to_le_bytes());
    let stage2_off = (BIOS_STAGE1_SECTORS * SECTOR_SIZE) as usize;
    image[stage2_off..stage2_off + stage2_patched.len()].copy_from_slice(&stage2_patched);

    let kernel_off = (BIOS_KERNEL_START_SECTOR * SECTOR_SIZE) as usize;
    image[kernel_off..kernel_off + kernel.len()].copy_from_slice(kernel);

    let exfat_off = (fs_start * SECTOR_SIZE) as usize;
    let exfat_bytes = image_size - exfat_off as u64;
    let exfat = exfat::format(exfat_bytes, sysroot).context("formatting exFAT partition")?;
    image[exfat_off..exfat_off + exfat.len()].copy_from_slice(&exfat);

    Ok(Layout { image, exfat_region: exfat_off..exfat_off + exfat.len() })
}

pub fn build_uefi(
    bootloader: &[u8],
    kernel: Option<&[u8]>,
    sysroot: Option<&Path>,
    image_size: u64,
) -> Result<Layout> {
    let total_sectors = image_size / SECTOR_SIZE;
    let esp_last_lba = UEFI_ESP_START_LBA + UEFI_ESP_SECTORS - 1;
    let (_, data_last_lba) = gpt::usable_range(total_sectors);
    if esp_last_lba >= data_last_lba {
        bail!("image of {image_size} bytes is too small to hold the ESP and a data partition");
    }
    let data_first_lba = esp_last_lba + 1;

    let esp_guid = derive_guid("mkimage.esp");
    let data_guid = derive_guid("mkimage.data");
    let disk_guid = derive_guid("mkimage.disk");
    let esp = gpt::esp_partition(UEFI_ESP_START_LBA, esp_last_lba, esp_guid);
    let data = gpt::data_partition(data_first_lba, data_last_lba, data_guid);
    let (mbr, primary_header, primary_entries, backup_entries, backup_header) =
        gpt::build(total_sectors, disk_guid, &[esp, data]);

    let mut image = vec![0u8; image_size as usize];
    image[0..mbr.len()].copy_from_slice(&mbr);
    image[512..512 + primary_header.len()].copy_from_slice(&primary_header);
    image[1024..1024 + primary_entries.len()].copy_from_slice(&primary_entries);

    let backup_entries_off = ((total_sectors - 1 - (backup_entries.len() as u64 / SECTOR_SIZE)) * SECTOR_SIZE) as usize;
    image[backup_entries_off..backup_entries_off + backup_entries.len()].copy_from_slice(&backup_entries);
    let backup_header_off = ((total_sectors - 1) * SECTOR_SIZE) as usize;
    image[backup_header_off..backup_header_off + backup_header.len()].copy_from_slice(&backup_header);

    let mut esp_files = vec![("EFI/BOOT/BOOTX64.EFI".to_string(), bootloader.to_vec())];
    if let Some(kernel) = kernel {
        esp_files.push(("System/kernel.bin".to_string(), kernel.to_vec()));
    }
    let esp_image = fat16::build(UEFI_ESP_SECTORS as u32, &esp_files).context("formatting ESP")?;
    let esp_off = (UEFI_ESP_START_LBA * SECTOR_SIZE) as usize;
    image[esp_off..esp_off + esp_image.len()].copy_from_slice(&esp_image);

    let data_off = (data_first_lba * SECTOR_SIZE) as usize;
    let data_bytes = (data_last_lba - data_first_lba + 1) * SECTOR_SIZE;
    let exfat = exfat::format(data_bytes, sysroot).context("formatting exFAT data partition")?;
    image[data_off..data_off + exfat.len()].copy_from_slice(&exfat);

    Ok(Layout { image, exfat_region: data_off..data_off + exfat.len() })
}

pub fn build_iso(stage1: &[u8], stage2: &[u8], sysroot: Option<&Path>) -> Result<Vec<u8>> {
    const SYSTEM_AREA_BYTES: usize = 32 * 1024;
    if stage1.len() + stage2.len() > SYSTEM_AREA_BYTES {
        bail!("stage1+stage2 ({} bytes) does not fit in the 32 KiB system area", stage1.len() + stage2.len());
    }
    let mut boot_image = vec![0u8; SYSTEM_AREA_BYTES];
    boot_image[0..stage1.len()].copy_from_slice(stage1);
    boot_image[BIOS_STAGE1_SECTORS as usize * SECTOR_SIZE as usize
        ..BIOS_STAGE1_SECTORS as usize * SECTOR_SIZE as usize + stage2.len()]
        .copy_from_slice(stage2);

    iso9660::build(&boot_image, sysroot)
}
