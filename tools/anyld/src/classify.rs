//! Section classification (spec §4.2.2): maps an input section's name and
//! flags onto one of the five output buckets.

use goblin::elf::section_header::{SectionHeader, SHF_EXECINSTR, SHF_WRITE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutKind {
    Text,
    Rodata,
    Data,
    Bss,
    Discarded,
}

pub fn classify(name: &str, sh: &SectionHeader) -> OutKind {
    if name.starts_with(".text") || name.starts_with(".init") {
        return OutKind::Text;
    }
    if name.starts_with(".rodata") || name.starts_with(".data.rel.ro") {
        return OutKind::Rodata;
    }
    if name.starts_with(".data")
        || name == ".init_array"
        || name == ".fini_array"
        || name.starts_with(".got")
        || name.starts_with(".tdata")
    {
        return OutKind::Data;
    }
    if name.starts_with(".bss") || name.starts_with(".tbss") {
        return OutKind::Bss;
    }
    if name.starts_with(".eh_frame")
        || name.starts_with(".debug")
        || name.starts_with(".note")
        || name == ".comment"
        || name == ".group"
    {
        return OutKind::Discarded;
    }
    if sh.sh_flags as u32 & SHF_EXECINSTR != 0 {
        OutKind::Text
    } else if sh.sh_flags as u32 & SHF_WRITE != 0 {
        OutKind::Data
    } else {
        OutKind::Rodata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(flags: u32) -> SectionHeader {
        SectionHeader {
            sh_name: 0,
            sh_type: 1,
            sh_flags: flags as u64,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        }
    }

    #[test]
    fn named_sections_use_explicit_rules() {
        assert_eq!(classify(".text.hot", &sh(0)), OutKind::Text);
        assert_eq!(classify(".rodata.str1.1", &sh(0)), OutKind::Rodata);
        assert_eq!(classify(".data.rel.ro", &sh(0)), OutKind::Rodata);
        assert_eq!(classify(".bss", &sh(0)), OutKind::Bss);
        assert_eq!(classify(".debug_info", &sh(0)), OutKind::Discarded);
    }

    #[test]
    fn unknown_allocated_sections_fall_back_to_flags() {
        assert_eq!(classify(".custom", &sh(SHF_EXECINSTR as u32)), OutKind::Text);
        assert_eq!(classify(".custom", &sh(SHF_WRITE as u32)), OutKind::Data);
        assert_eq!(classify(".custom", &sh(0)), OutKind::Rodata);
    }
}
