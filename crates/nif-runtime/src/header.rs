use nif_contracts::{NIF_VERSION_MAX, NIF_VERSION_MIN};
use serde::Serialize;

use crate::block::ReadContext;
use crate::error::{DecodeError, NifResult};
use crate::stream::{Endian, NifStream};
use crate::version::{known, VersionNumber};

const HEADER_PREFIXES: &[&str] = &[
    "Gamebryo File Format, Version ",
    "NetImmerse File Format, Version ",
];
const NDS_PREFIX: &str = "NDSNIF";
const NDS_VERSION_MARKER: &str = ", Version ";

/// Block type indices may carry a flag in the high bit.
const BLOCK_TYPE_INDEX_MASK: u16 = 0x7fff;

/// Bethesda export information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BsStreamHeader {
    pub bs_version: u32,
    pub author: String,
    pub unknown: Option<u32>,
    pub process_script: Option<String>,
    pub export_script: String,
    pub max_filepath: Option<String>,
}

/// The container header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Header {
    pub header_line: String,
    pub version: VersionNumber,
    pub endian: Endian,
    pub user_version: u32,
    pub num_blocks: u32,
    pub bs_header: Option<BsStreamHeader>,
    pub block_types: Vec<String>,
    pub block_type_index: Vec<u16>,
    pub block_sizes: Vec<u32>,
    pub max_string_length: u32,
    pub strings: Vec<String>,
    pub groups: Vec<u32>,
}

impl Header {
    /// `User Version 2` is the Bethesda stream version when present.
    pub fn user_version_2(&self) -> u32 {
        self.bs_header.as_ref().map_or(0, |bs| bs.bs_version)
    }

    pub fn read_context(&self) -> ReadContext {
        ReadContext::new(self.version.raw(), self.user_version, self.user_version_2())
    }

    /// True when type names are stored inline before each block rather than in a table.
    pub fn has_inline_type_names(&self) -> bool {
        self.version < known::V5_0_0_1
    }

    pub fn has_block_sizes(&self) -> bool {
        self.version >= known::V20_2_0_5
    }

    /// Type tag of block `index`, when the header carries a type table.
    pub fn block_type_name(&self, index: usize) -> Option<&str> {
        let ty = *self.block_type_index.get(index)?;
        self.block_types
            .get(usize::from(ty & BLOCK_TYPE_INDEX_MASK))
            .map(String::as_str)
    }

    pub fn block_size(&self, index: usize) -> Option<u32> {
        self.block_sizes.get(index).copied()
    }

    /// Reads the header, failing fatally on an unknown magic line or an unsupported version.
    pub fn read(stream: &mut dyn NifStream) -> NifResult<Header> {
        let header_line = stream.read_line_string()?;
        let line_version = parse_header_line(&header_line)?;
        check_supported(line_version)?;

        let mut h = Header {
            header_line,
            version: line_version,
            ..Header::default()
        };

        if h.version >= known::V3_1_0_1 {
            // the binary version is always little endian; it wins over the text line
            stream.set_endian(Endian::Little);
            let binary = VersionNumber::from_raw(stream.read_u32()?);
            check_supported(binary)?;
            h.version = binary;
        }
        if h.version >= known::V20_0_0_3 {
            h.endian = match stream.read_u8()? {
                0 => Endian::Big,
                _ => Endian::Little,
            };
            stream.set_endian(h.endian);
        }
        if h.version >= known::V10_0_1_8 {
            h.user_version = stream.read_u32()?;
        }
        if h.version >= known::V3_1_0_1 {
            h.num_blocks = stream.read_u32()?;
        }
        if has_bs_stream_header(h.version, h.user_version) {
            h.bs_header = Some(read_bs_stream_header(stream)?);
        }
        if h.version >= known::V5_0_0_1 {
            let num_block_types = stream.read_u16()?;
            h.block_types = read_list(stream, u32::from(num_block_types), |s| {
                s.read_sized_string()
            })?;
            h.block_type_index = read_list(stream, h.num_blocks, |s| s.read_u16())?;
        }
        if h.version >= known::V20_2_0_5 {
            h.block_sizes = read_list(stream, h.num_blocks, |s| s.read_u32())?;
        }
        if h.version >= known::V20_1_0_1 {
            let num_strings = stream.read_u32()?;
            h.max_string_length = stream.read_u32()?;
            h.strings = read_list(stream, num_strings, |s| s.read_sized_string())?;
        }
        if h.version >= known::V5_0_0_6 {
            let num_groups = stream.read_u32()?;
            h.groups = read_list(stream, num_groups, |s| s.read_u32())?;
        }
        Ok(h)
    }
}

/// Extracts the version from the magic line.
pub fn parse_header_line(line: &str) -> NifResult<VersionNumber> {
    let line = line.trim_end_matches('\r');
    let version_text = HEADER_PREFIXES
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
        .or_else(|| {
            if line.starts_with(NDS_PREFIX) {
                line.rsplit_once(NDS_VERSION_MARKER).map(|(_, v)| v)
            } else {
                None
            }
        })
        .ok_or_else(|| DecodeError::BadMagic(line.to_string()))?;
    VersionNumber::parse(version_text).ok_or_else(|| DecodeError::BadMagic(line.to_string()))
}

pub fn check_supported(version: VersionNumber) -> NifResult<()> {
    let min = VersionNumber::from_raw(NIF_VERSION_MIN);
    let max = VersionNumber::from_raw(NIF_VERSION_MAX);
    if version < min || version > max {
        return Err(DecodeError::UnsupportedVersion { version, min, max });
    }
    Ok(())
}

fn has_bs_stream_header(version: VersionNumber, user_version: u32) -> bool {
    if user_version < 3 {
        return false;
    }
    version == known::V10_0_1_2
        || version == known::V20_0_0_5
        || version == known::V20_2_0_7
        || (version >= known::V10_1_0_0 && version <= known::V20_0_0_4 && user_version <= 11)
}

fn read_bs_stream_header(stream: &mut dyn NifStream) -> NifResult<BsStreamHeader> {
    let bs_version = stream.read_u32()?;
    let author = stream.read_short_string()?;
    let unknown = if bs_version > 130 {
        Some(stream.read_u32()?)
    } else {
        None
    };
    let process_script = if bs_version < 131 {
        Some(stream.read_short_string()?)
    } else {
        None
    };
    let export_script = stream.read_short_string()?;
    let max_filepath = if bs_version >= 103 {
        Some(stream.read_short_string()?)
    } else {
        None
    };
    Ok(BsStreamHeader {
        bs_version,
        author,
        unknown,
        process_script,
        export_script,
        max_filepath,
    })
}

fn read_list<T>(
    stream: &mut dyn NifStream,
    count: u32,
    read_one: impl FnMut(&mut dyn NifStream) -> NifResult<T>,
) -> NifResult<Vec<T>> {
    crate::stream::read_array(stream, i64::from(count), read_one)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_line_variants() {
        assert_eq!(
            parse_header_line("Gamebryo File Format, Version 20.2.0.7").unwrap(),
            known::V20_2_0_7
        );
        assert_eq!(
            parse_header_line("NetImmerse File Format, Version 4.0.0.2\r").unwrap(),
            VersionNumber::new(4, 0, 0, 2)
        );
        assert_eq!(
            parse_header_line("NDSNIF....@....@...., Version 20.3.0.9").unwrap(),
            VersionNumber::new(20, 3, 0, 9)
        );
    }

    #[test]
    fn bad_magic_is_fatal() {
        assert!(matches!(
            parse_header_line("PNG image"),
            Err(DecodeError::BadMagic(_))
        ));
        assert!(matches!(
            parse_header_line("Gamebryo File Format, Version x.y"),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn version_window() {
        assert!(check_supported(known::V20_2_0_7).is_ok());
        assert!(check_supported(known::V3_3_0_13).is_ok());
        assert!(matches!(
            check_supported(VersionNumber::new(2, 3, 0, 0)),
            Err(DecodeError::UnsupportedVersion { .. })
        ));
        assert!(check_supported(VersionNumber::new(30, 0, 0, 0)).is_err());
    }

    #[test]
    fn bs_header_detection() {
        assert!(has_bs_stream_header(known::V20_2_0_7, 12));
        assert!(!has_bs_stream_header(known::V20_2_0_7, 0));
        assert!(has_bs_stream_header(VersionNumber::new(20, 0, 0, 4), 11));
        assert!(!has_bs_stream_header(VersionNumber::new(20, 0, 0, 4), 12));
        assert!(!has_bs_stream_header(VersionNumber::new(20, 1, 0, 3), 12));
    }

    #[test]
    fn block_type_index_high_bit_is_masked() {
        let h = Header {
            block_types: vec!["NiNode".to_string(), "NiPhysXProp".to_string()],
            block_type_index: vec![0x8001, 0],
            ..Header::default()
        };
        assert_eq!(h.block_type_name(0), Some("NiPhysXProp"));
        assert_eq!(h.block_type_name(1), Some("NiNode"));
        assert_eq!(h.block_type_name(2), None);
    }
}
