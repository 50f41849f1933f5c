//! Relocation application (spec §4.2.6): the x86_64/AArch64 formula table,
//! including the GOTPCRELX load-to-lea rewrite and the AArch64 page/imm
//! bitfield packing.

use anyhow::{bail, Result};
use goblin::elf::reloc::*;

/// The little-endian bytes (or instruction bitfield, for the packed
/// AArch64 encodings) a relocation's formula produces; the caller decides
/// whether to overwrite or OR them into the patch site.
pub struct Patch {
    pub bytes: Vec<u8>,
}

/// True for relocation types that (per spec table) also need a base-relative
/// runtime relocation emitted into `.rela.dyn`.
pub fn emits_dynamic_reloc(r_type: u32) -> bool {
    matches!(
        r_type,
        R_X86_64_64 | R_AARCH64_ABS64 | R_X86_64_32 | R_X86_64_32S | R_AARCH64_ABS32
    )
}

/// Applies one relocation given the already-patched-in bytes at `at` (needed
/// for the GOTPCRELX opcode rewrite, which inspects the byte before the
/// patch site) and returns the bytes to write at `offset` within the
/// section. `s` is the resolved symbol value, `a` the addend, `p` the
/// relocation's own virtual address.
pub fn compute(r_type: u32, s: u64, a: i64, p: u64, preceding_byte: Option<u8>) -> Result<Patch> {
    let s = s as i64;
    let p = p as i64;
    match r_type {
        R_X86_64_64 | R_AARCH64_ABS64 => Ok(Patch {
            bytes: ((s + a) as u64).to_le_bytes().to_vec(),
        }),
        R_X86_64_32 | R_X86_64_32S | R_AARCH64_ABS32 => {
            let v = s + a;
            check_range32(r_type, v)?;
            Ok(Patch {
                bytes: (v as u32).to_le_bytes().to_vec(),
            })
        }
        R_X86_64_PC32 | R_X86_64_PLT32 => {
            let v = s + a - p;
            check_range32(r_type, v)?;
            Ok(Patch {
                bytes: (v as u32).to_le_bytes().to_vec(),
            })
        }
        R_X86_64_PC64 => Ok(Patch {
            bytes: ((s + a - p) as u64).to_le_bytes().to_vec(),
        }),
        R_AARCH64_PREL32 => {
            let v = s + a - p;
            check_range32(r_type, v)?;
            Ok(Patch {
                bytes: (v as u32).to_le_bytes().to_vec(),
            })
        }
        R_AARCH64_PREL64 => Ok(Patch {
            bytes: ((s + a - p) as u64).to_le_bytes().to_vec(),
        }),
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
            let v = (s + a - p) as u32;
            match preceding_byte {
                Some(0x8b) => { /* mov -> will be rewritten to lea by caller */ }
                Some(0x8d) => {}
                Some(other) => {
                    eprintln!(
                        "anyld: warning: GOTPCRELX relocation preceded by unexpected opcode byte {other:#x}"
                    );
                }
                None => {}
            }
            Ok(Patch {
                bytes: v.to_le_bytes().to_vec(),
            })
        }
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            let v = s + a - p;
            if v % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&v) {
                bail!("relocation out of range (+-128MiB) for CALL26/JUMP26");
            }
            let imm26 = ((v >> 2) as u32) & 0x03ff_ffff;
            Ok(Patch {
                bytes: imm26.to_le_bytes().to_vec(), // caller ORs into low 26 bits of the instruction word
            })
        }
        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_GOT_PAGE => {
            let page = |addr: i64| addr & !0xFFF;
            let rel = (page(s + a) - page(p)) >> 12;
            let immlo = (rel & 0x3) as u32;
            let immhi = ((rel >> 2) & 0x7_ffff) as u32;
            Ok(Patch {
                bytes: ((immlo << 29) | (immhi << 5)).to_le_bytes().to_vec(),
            })
        }
        R_AARCH64_ADD_ABS_LO12_NC => pack_imm12(s, a, 0),
        R_AARCH64_LDST8_ABS_LO12_NC => pack_imm12(s, a, 0),
        R_AARCH64_LDST16_ABS_LO12_NC => pack_imm12(s, a, 1),
        R_AARCH64_LDST32_ABS_LO12_NC => pack_imm12(s, a, 2),
        R_AARCH64_LDST64_ABS_LO12_NC => pack_imm12(s, a, 3),
        R_AARCH64_LDST128_ABS_LO12_NC => pack_imm12(s, a, 4),
        // Relaxed LDR -> ADD (spec §4.2.6): ADD's imm12 is unscaled, unlike
        // the LDST64 case this opcode resembles.
        R_AARCH64_LD64_GOT_LO12_NC => pack_imm12(s, a, 0),
        other => bail!("unsupported relocation type {other}"),
    }
}

fn pack_imm12(s: i64, a: i64, log2_size: u32) -> Result<Patch> {
    let lo12 = ((s + a) & 0xFFF) as u32 >> log2_size;
    Ok(Patch {
        bytes: (lo12 << 10).to_le_bytes().to_vec(),
    })
}

fn check_range32(r_type: u32, v: i64) -> Result<()> {
    let in_range = match r_type {
        R_X86_64_32 | R_AARCH64_ABS32 => (0..=u32::MAX as i64).contains(&v),
        _ => (i32::MIN as i64..=i32::MAX as i64).contains(&v),
    };
    if !in_range {
        bail!("relocation {r_type} value {v:#x} out of range");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs64_is_symbol_plus_addend() {
        let p = compute(R_X86_64_64, 0x1000, 8, 0, None).unwrap();
        assert_eq!(u64::from_le_bytes(p.bytes.try_into().unwrap()), 0x1008);
    }

    #[test]
    fn pc32_is_symbol_plus_addend_minus_patch_site() {
        let p = compute(R_X86_64_PC32, 0x2000, 0, 0x1000, None).unwrap();
        assert_eq!(i32::from_le_bytes(p.bytes.try_into().unwrap()), 0x1000);
    }

    #[test]
    fn pc32_overflow_is_an_error() {
        let err = compute(R_X86_64_PC32, 0x1_0000_0000, 0, 0, None);
        assert!(err.is_err());
    }

    #[test]
    fn call26_packs_into_imm26_and_checks_range() {
        let p = compute(R_AARCH64_CALL26, 0x1000, 0, 0, None).unwrap();
        let imm = u32::from_le_bytes(p.bytes.try_into().unwrap());
        assert_eq!(imm, 0x1000 >> 2);
        let err = compute(R_AARCH64_CALL26, 1 << 28, 0, 0, None);
        assert!(err.is_err());
    }

    #[test]
    fn got_lo12_relaxes_to_unscaled_add_imm12() {
        // spec §4.2.6: this opcode is relaxed from LDR to ADD, whose imm12
        // is unscaled, unlike the LDST64 case it otherwise resembles.
        let p = compute(R_AARCH64_LD64_GOT_LO12_NC, 0x1004, 0, 0, None).unwrap();
        let imm = u32::from_le_bytes(p.bytes.try_into().unwrap()) >> 10;
        assert_eq!(imm, 0x004);
    }

    #[test]
    fn emits_dynamic_reloc_matches_table() {
        assert!(emits_dynamic_reloc(R_X86_64_64));
        assert!(emits_dynamic_reloc(R_X86_64_32));
        assert!(!emits_dynamic_reloc(R_X86_64_PC32));
    }
}
