//! MZ executable header parsing and the relocated load image.

use crate::{Address, TranslateError};

/// Size of the program segment prefix, in paragraphs.
pub const PSP_PARAGRAPHS: u16 = 0x10;

const HEADER_LEN: usize = 0x1c;
const PAGE: usize = 512;

/// The fixed part of an MZ header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MzHeader {
    pub last_page_size: u16,
    pub page_count: u16,
    pub relocation_count: u16,
    pub header_paragraphs: u16,
    pub min_extra_paragraphs: u16,
    pub max_extra_paragraphs: u16,
    pub ss: u16,
    pub sp: u16,
    pub ip: u16,
    pub cs: u16,
    pub relocation_offset: u16,
}

fn word(bytes: &[u8], at: usize) -> Result<u16, TranslateError> {
    bytes
        .get(at..at + 2)
        .map(|w| u16::from_le_bytes([w[0], w[1]]))
        .ok_or_else(|| TranslateError::Header(format!("truncated at byte 0x{:x}", at)))
}

impl MzHeader {
    /// Decode the fixed 28-byte header.
    pub fn parse(bytes: &[u8]) -> Result<Self, TranslateError> {
        if bytes.len() < HEADER_LEN {
            return Err(TranslateError::Header(format!(
                "{} bytes is too short for an MZ header",
                bytes.len()
            )));
        }
        if &bytes[..2] != b"MZ" && &bytes[..2] != b"ZM" {
            return Err(TranslateError::Header("missing MZ signature".into()));
        }
        Ok(MzHeader {
            last_page_size: word(bytes, 0x02)?,
            page_count: word(bytes, 0x04)?,
            relocation_count: word(bytes, 0x06)?,
            header_paragraphs: word(bytes, 0x08)?,
            min_extra_paragraphs: word(bytes, 0x0a)?,
            max_extra_paragraphs: word(bytes, 0x0c)?,
            ss: word(bytes, 0x0e)?,
            sp: word(bytes, 0x10)?,
            ip: word(bytes, 0x14)?,
            cs: word(bytes, 0x16)?,
            relocation_offset: word(bytes, 0x18)?,
        })
    }

    /// File offset where the load module starts.
    pub fn header_size(&self) -> usize {
        self.header_paragraphs as usize * 16
    }

    /// Bytes in the file covered by the header's page count, header included.
    pub fn file_size(&self) -> Result<usize, TranslateError> {
        if self.page_count == 0 {
            return Err(TranslateError::Header("page count is zero".into()));
        }
        if self.last_page_size as usize > PAGE {
            return Err(TranslateError::Header(format!(
                "last page size {} exceeds {}",
                self.last_page_size, PAGE
            )));
        }
        let pages = self.page_count as usize;
        Ok(match self.last_page_size {
            0 => pages * PAGE,
            last => (pages - 1) * PAGE + last as usize,
        })
    }

    /// Size of the load module (everything after the header).
    pub fn load_module_size(&self) -> Result<usize, TranslateError> {
        self.file_size()?
            .checked_sub(self.header_size())
            .ok_or_else(|| TranslateError::Header("header is larger than the file".into()))
    }
}

/// A load module relocated to its load segment.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Where the first byte of the load module lives
    pub base: Address,
    pub bytes: Vec<u8>,
    pub entry: Address,
    /// Initial SS:SP
    pub stack: Address,
    pub psp_segment: u16,
    pub min_extra_paragraphs: u16,
}

impl LoadedImage {
    /// Bytes of memory the program needs, counting from linear address 0:
    /// PSP, load module, minimum extra allocation and the initial stack.
    pub fn memory_size(&self) -> u32 {
        let module_end = self.base.linear()
            + self.bytes.len() as u32
            + self.min_extra_paragraphs as u32 * 16;
        let top = module_end.max(self.stack.linear());
        (top + 15) & !15
    }

    /// Linear address one past the load module.
    pub fn end(&self) -> u32 {
        self.base.linear() + self.bytes.len() as u32
    }

    /// Whether `addr` falls inside the load module.
    pub fn contains(&self, addr: Address) -> bool {
        addr.linear() >= self.base.linear() && addr.linear() < self.end()
    }

    /// Up to `max` bytes of the image starting at `addr`; empty when `addr`
    /// lies outside the load module.
    pub fn code_at(&self, addr: Address, max: usize) -> &[u8] {
        if !self.contains(addr) {
            return &[];
        }
        let start = (addr.linear() - self.base.linear()) as usize;
        let end = start.saturating_add(max).min(self.bytes.len());
        &self.bytes[start..end]
    }

    /// Image bytes between two linear addresses, clamped to the module.
    pub fn slice_linear(&self, from: u32, to: u32) -> &[u8] {
        let base = self.base.linear();
        let start = from.saturating_sub(base).min(self.bytes.len() as u32) as usize;
        let end = to.saturating_sub(base).min(self.bytes.len() as u32) as usize;
        &self.bytes[start..end.max(start)]
    }
}

/// Parse an MZ executable and relocate it to `load_segment`, the segment
/// of the first load-module byte. The PSP sits just below it.
pub fn parse_mz(bytes: &[u8], load_segment: u16) -> Result<LoadedImage, TranslateError> {
    if load_segment < PSP_PARAGRAPHS {
        return Err(TranslateError::Config(format!(
            "load segment 0x{:04x} leaves no room for the PSP",
            load_segment
        )));
    }
    let header = MzHeader::parse(bytes)?;
    let start = header.header_size();
    let size = header.load_module_size()?;
    let end = start + size;
    if end > bytes.len() {
        return Err(TranslateError::Header(format!(
            "load module needs {} bytes, file has {}",
            end,
            bytes.len()
        )));
    }
    let mut module = bytes[start..end].to_vec();

    let table = header.relocation_offset as usize;
    for i in 0..header.relocation_count as usize {
        let entry = table + i * 4;
        let offset = word(bytes, entry)?;
        let segment = word(bytes, entry + 2)?;
        let at = Address::new(segment, offset).linear() as usize;
        let slot = module.get_mut(at..at + 2).ok_or_else(|| {
            TranslateError::Header(format!(
                "relocation {} at {:04X}:{:04X} is outside the load module",
                i, segment, offset
            ))
        })?;
        let value = u16::from_le_bytes([slot[0], slot[1]]).wrapping_add(load_segment);
        slot.copy_from_slice(&value.to_le_bytes());
    }

    let image = LoadedImage {
        base: Address::new(load_segment, 0),
        bytes: module,
        entry: Address::new(load_segment.wrapping_add(header.cs), header.ip),
        stack: Address::new(load_segment.wrapping_add(header.ss), header.sp),
        psp_segment: load_segment - PSP_PARAGRAPHS,
        min_extra_paragraphs: header.min_extra_paragraphs,
    };
    log::info!(
        "loaded {} byte module at {}, entry {}, stack {}, {} relocations",
        image.bytes.len(),
        image.base,
        image.entry,
        image.stack,
        header.relocation_count
    );
    Ok(image)
}

/// Assemble a minimal MZ file around `code`, for tests.
#[cfg(test)]
pub(crate) fn build_mz(
    code: &[u8],
    relocations: &[(u16, u16)],
    entry: (u16, u16),
    stack: (u16, u16),
    min_extra: u16,
) -> Vec<u8> {
    let table_end = HEADER_LEN + relocations.len() * 4;
    let header_paragraphs = table_end.div_ceil(16);
    let header_size = header_paragraphs * 16;
    let total = header_size + code.len();

    let mut out = vec![0u8; header_size];
    let mut put = |at: usize, value: u16| out[at..at + 2].copy_from_slice(&value.to_le_bytes());
    put(0x02, (total % PAGE) as u16);
    put(0x04, total.div_ceil(PAGE) as u16);
    put(0x06, relocations.len() as u16);
    put(0x08, header_paragraphs as u16);
    put(0x0a, min_extra);
    put(0x0c, 0xffff);
    put(0x0e, stack.0);
    put(0x10, stack.1);
    put(0x14, entry.1);
    put(0x16, entry.0);
    put(0x18, HEADER_LEN as u16);
    for (i, (seg, off)) in relocations.iter().enumerate() {
        put(HEADER_LEN + i * 4, *off);
        put(HEADER_LEN + i * 4 + 2, *seg);
    }
    out[..2].copy_from_slice(b"MZ");
    out.extend_from_slice(code);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_header_fields() {
        let file = build_mz(&[0x90; 40], &[], (0x0001, 0x0004), (0x0003, 0x0100), 0x20);
        let header = MzHeader::parse(&file).unwrap();
        assert_eq!(header.cs, 0x0001);
        assert_eq!(header.ip, 0x0004);
        assert_eq!(header.ss, 0x0003);
        assert_eq!(header.sp, 0x0100);
        assert_eq!(header.min_extra_paragraphs, 0x20);
        assert_eq!(header.load_module_size().unwrap(), 40);
    }

    #[rstest]
    #[case(0, 3, 3 * 512)]
    #[case(1, 1, 1)]
    #[case(100, 2, 612)]
    fn test_file_size_last_page_rule(#[case] last: u16, #[case] pages: u16, #[case] size: usize) {
        let header = MzHeader {
            last_page_size: last,
            page_count: pages,
            relocation_count: 0,
            header_paragraphs: 0,
            min_extra_paragraphs: 0,
            max_extra_paragraphs: 0,
            ss: 0,
            sp: 0,
            ip: 0,
            cs: 0,
            relocation_offset: 0,
        };
        assert_eq!(header.file_size().unwrap(), size);
    }

    #[test]
    fn test_entry_and_stack_are_relocated() {
        let file = build_mz(&[0xc3; 32], &[], (0x0001, 0x0002), (0x0002, 0x0080), 0);
        let image = parse_mz(&file, 0x1000).unwrap();
        assert_eq!(image.base, Address::new(0x1000, 0));
        assert_eq!(image.entry, Address::new(0x1001, 0x0002));
        assert_eq!(image.stack, Address::new(0x1002, 0x0080));
        assert_eq!(image.psp_segment, 0x0ff0);
    }

    #[test]
    fn test_relocations_applied() {
        // mov ax, seg 0x0002 ; the word at offset 1 is relocated
        let code = [0xb8, 0x02, 0x00, 0xc3];
        let file = build_mz(&code, &[(0x0000, 0x0001)], (0, 0), (0, 0x100), 0);
        let image = parse_mz(&file, 0x1000).unwrap();
        assert_eq!(&image.bytes[..3], &[0xb8, 0x02, 0x10]);
    }

    #[test]
    fn test_code_at_and_memory_size() {
        let code: Vec<u8> = (0..64).collect();
        let file = build_mz(&code, &[], (0, 0), (0, 0x40), 2);
        let image = parse_mz(&file, 0x1000).unwrap();

        assert_eq!(image.code_at(Address::new(0x1000, 0x10), 4), &[16, 17, 18, 19]);
        assert_eq!(image.code_at(Address::new(0x1001, 0x3e), 8).len(), 0);
        assert_eq!(image.code_at(Address::new(0x1000, 0x3e), 8), &[62, 63]);
        assert!(image.code_at(Address::new(0x0fff, 0), 8).is_empty());
        assert_eq!(image.memory_size(), 0x10000 + 64 + 32);
        assert_eq!(image.slice_linear(0x10004, 0x10008), &[4, 5, 6, 7]);
    }

    #[rstest]
    #[case(b"XX".to_vec())]
    #[case(vec![b'P', b'K', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])]
    fn test_rejects_non_mz(#[case] bytes: Vec<u8>) {
        let err = parse_mz(&bytes, 0x1000).unwrap_err();
        assert!(matches!(err, TranslateError::Header(_)));
    }

    #[test]
    fn test_rejects_truncated_module() {
        let mut file = build_mz(&[0x90; 600], &[], (0, 0), (0, 0), 0);
        file.truncate(file.len() - 100);
        assert!(matches!(parse_mz(&file, 0x1000), Err(TranslateError::Header(_))));
    }

    #[test]
    fn test_rejects_relocation_outside_module() {
        let file = build_mz(&[0x90; 8], &[(0x0001, 0x0000)], (0, 0), (0, 0), 0);
        assert!(matches!(parse_mz(&file, 0x1000), Err(TranslateError::Header(_))));
    }

    #[test]
    fn test_rejects_low_load_segment() {
        let file = build_mz(&[0x90; 8], &[], (0, 0), (0, 0), 0);
        assert!(matches!(parse_mz(&file, 0x0008), Err(TranslateError::Config(_))));
    }
}
