//! Canonical register table and target-description documents.
//!
//! `REGISTERS` is indexed by GDB register number. The `g`/`G` blob, `p`/`P`
//! and `target.xml` are all derived from it, so their layouts cannot drift.

use std::fmt::Write;
use std::sync::{Arc, LazyLock};

use xgdb_engine::{Module, NUM_FPRS, NUM_GPRS, Register};

use crate::packet::parse_hex;

/// Architecture string reported in `target.xml`.
pub const ARCHITECTURE: &str = "powerpc:common64";

/// Number of registers in the table.
pub const NUM_REGISTERS: usize = NUM_GPRS + NUM_FPRS + 7;

/// Target-description feature a register belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    Core,
    Fpu,
}

impl Feature {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Core => "org.gnu.gdb.power.core",
            Self::Fpu => "org.gnu.gdb.power.fpu",
        }
    }
}

/// One row of the register table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterDesc {
    pub register: Register,
    pub bits: u32,
    pub feature: Feature,
    /// GDB type name, if not the default integer type.
    pub kind: Option<&'static str>,
}

impl RegisterDesc {
    const fn new(register: Register, bits: u32, feature: Feature, kind: Option<&'static str>) -> Self {
        Self {
            register,
            bits,
            feature,
            kind,
        }
    }

    /// Width of the value in bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        (self.bits / 8) as usize
    }

    /// Append the value as big-endian hex, truncated to the register width.
    pub fn encode(&self, value: u64, out: &mut String) {
        let bytes = value.to_be_bytes();
        for byte in &bytes[bytes.len() - self.bytes()..] {
            let _ = write!(out, "{byte:02x}");
        }
    }

    /// Parse a big-endian hex value of exactly the register width.
    #[must_use]
    pub fn decode(&self, hex: &str) -> Option<u64> {
        if hex.len() != self.bytes() * 2 {
            return None;
        }
        parse_hex(hex)
    }
}

const fn build_table() -> [RegisterDesc; NUM_REGISTERS] {
    let placeholder = RegisterDesc::new(Register::Pc, 64, Feature::Core, None);
    let mut table = [placeholder; NUM_REGISTERS];
    let mut i = 0;
    let mut n: u8 = 0;
    while i < NUM_GPRS {
        table[i] = RegisterDesc::new(Register::Gpr(n), 64, Feature::Core, None);
        i += 1;
        n += 1;
    }
    let mut j = 0;
    let mut n: u8 = 0;
    while j < NUM_FPRS {
        table[NUM_GPRS + j] =
            RegisterDesc::new(Register::Fpr(n), 64, Feature::Fpu, Some("ieee_double"));
        j += 1;
        n += 1;
    }
    let tail = NUM_GPRS + NUM_FPRS;
    table[tail] = RegisterDesc::new(Register::Pc, 64, Feature::Core, Some("code_ptr"));
    table[tail + 1] = RegisterDesc::new(Register::Msr, 64, Feature::Core, None);
    table[tail + 2] = RegisterDesc::new(Register::Cr, 32, Feature::Core, None);
    table[tail + 3] = RegisterDesc::new(Register::Lr, 64, Feature::Core, Some("code_ptr"));
    table[tail + 4] = RegisterDesc::new(Register::Ctr, 64, Feature::Core, None);
    table[tail + 5] = RegisterDesc::new(Register::Xer, 32, Feature::Core, None);
    table[tail + 6] = RegisterDesc::new(Register::Fpscr, 32, Feature::Fpu, None);
    table
}

/// Registers in GDB numbering order.
pub static REGISTERS: [RegisterDesc; NUM_REGISTERS] = build_table();

/// GDB register number of the program counter.
pub const PC_REGNUM: usize = NUM_GPRS + NUM_FPRS;

/// Total size of the `g` blob in bytes.
#[must_use]
pub fn register_blob_size() -> usize {
    REGISTERS.iter().map(RegisterDesc::bytes).sum()
}

static TARGET_XML: LazyLock<String> = LazyLock::new(build_target_xml);

/// The `target.xml` document.
#[must_use]
pub fn target_xml() -> &'static str {
    &TARGET_XML
}

fn build_target_xml() -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n<target version=\"1.0\">\n",
    );
    let _ = writeln!(xml, "<architecture>{ARCHITECTURE}</architecture>");
    for feature in [Feature::Core, Feature::Fpu] {
        let _ = writeln!(xml, "<feature name=\"{}\">", feature.name());
        for (regnum, desc) in REGISTERS.iter().enumerate() {
            if desc.feature != feature {
                continue;
            }
            let _ = write!(
                xml,
                "<reg name=\"{}\" bitsize=\"{}\" regnum=\"{regnum}\"",
                desc.register, desc.bits
            );
            if let Some(kind) = desc.kind {
                let _ = write!(xml, " type=\"{kind}\"");
            }
            let group = match feature {
                Feature::Core => "general",
                Feature::Fpu => "float",
            };
            let _ = writeln!(xml, " group=\"{group}\"/>");
        }
        xml.push_str("</feature>\n");
    }
    xml.push_str("</target>\n");
    xml
}

/// `qXfer:libraries:read` document for the loaded modules.
#[must_use]
pub fn library_list_xml(modules: &[Arc<Module>]) -> String {
    let mut xml = String::from("<library-list>\n");
    for module in modules {
        let _ = writeln!(
            xml,
            "<library name=\"{}\"><segment address=\"{:#x}\"/></library>",
            escape_xml(&module.name),
            module.base
        );
    }
    xml.push_str("</library-list>\n");
    xml
}

/// Escape markup characters; non-ASCII becomes a character reference so the
/// document stays byte-addressable for paging.
fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c if c.is_ascii() => out.push(c),
            c => {
                let _ = write!(out, "&#x{:x};", u32::from(c));
            }
        }
    }
    out
}

/// One `qXfer` page: `m<chunk>` if more follows, `l<chunk>` for the last one.
#[must_use]
pub fn xfer_page(document: &str, offset: usize, length: usize) -> String {
    let bytes = document.as_bytes();
    if offset >= bytes.len() {
        return "l".to_owned();
    }
    let end = offset.saturating_add(length).min(bytes.len());
    let marker = if end < bytes.len() { 'm' } else { 'l' };
    let chunk = String::from_utf8_lossy(&bytes[offset..end]);
    format!("{marker}{chunk}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout() {
        assert_eq!(REGISTERS.len(), 71);
        assert_eq!(REGISTERS[0].register, Register::Gpr(0));
        assert_eq!(REGISTERS[31].register, Register::Gpr(31));
        assert_eq!(REGISTERS[32].register, Register::Fpr(0));
        assert_eq!(REGISTERS[PC_REGNUM].register, Register::Pc);
        assert_eq!(REGISTERS[66].register, Register::Cr);
        assert_eq!(REGISTERS[66].bits, 32);
        assert_eq!(REGISTERS[70].register, Register::Fpscr);
        assert_eq!(register_blob_size(), 68 * 8 + 3 * 4);
    }

    #[test]
    fn test_value_encoding() {
        let mut out = String::new();
        REGISTERS[PC_REGNUM].encode(0x8200_1234, &mut out);
        assert_eq!(out, "0000000082001234");

        out.clear();
        REGISTERS[66].encode(0xdead_beef_2400_0088, &mut out);
        assert_eq!(out, "24000088");

        assert_eq!(REGISTERS[66].decode("24000088"), Some(0x2400_0088));
        assert_eq!(REGISTERS[66].decode("0024000088"), None);
        assert_eq!(REGISTERS[66].decode("+4000088"), None);
    }

    #[test]
    fn test_target_xml_matches_table() {
        let xml = target_xml();
        assert!(xml.contains("<architecture>powerpc:common64</architecture>"));
        for (regnum, desc) in REGISTERS.iter().enumerate() {
            let needle = format!(
                "<reg name=\"{}\" bitsize=\"{}\" regnum=\"{regnum}\"",
                desc.register, desc.bits
            );
            assert!(xml.contains(&needle), "missing {needle}");
        }
        assert!(xml.find("org.gnu.gdb.power.core") < xml.find("org.gnu.gdb.power.fpu"));
    }

    #[test]
    fn test_xfer_paging() {
        let doc = "abcdefghij";
        assert_eq!(xfer_page(doc, 0, 4), "mabcd");
        assert_eq!(xfer_page(doc, 4, 4), "mefgh");
        assert_eq!(xfer_page(doc, 8, 4), "lij");
        assert_eq!(xfer_page(doc, 10, 4), "l");
        assert_eq!(xfer_page(doc, 0, 100), "labcdefghij");
    }

    #[test]
    fn test_library_list_escapes_names() {
        let modules = vec![Arc::new(Module {
            name: "a&b<é>.xex".to_owned(),
            base: 0x8200_0000,
            size: 0x1000,
        })];
        let xml = library_list_xml(&modules);
        assert!(xml.contains("name=\"a&amp;b&lt;&#xe9;&gt;.xex\""));
        assert!(xml.contains("address=\"0x82000000\""));
        assert!(xml.is_ascii());
    }
}
