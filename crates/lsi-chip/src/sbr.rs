//! Serial Boot Record (SBR) layout.
//!
//! The SBR is the 256-byte EEPROM record the IOC reads at power-on. It
//! carries PCI identity (vendor/device/subsystem IDs), a hardware config
//! word and the SAS address.
//!
//! ```text
//! 0x00..0x4c  manufacturing block (75 packed little-endian bytes + checksum)
//! 0x4c..0x98  second copy of the manufacturing block
//! 0x98..0xd8  zero
//! 0xd8..0xe0  SAS address, big-endian (all zero when unset)
//! 0xef        SAS address checksum
//! ```
//!
//! Checksums are `0x5b - sum(bytes)` modulo 256.

use std::fmt;

/// Size of a complete SBR record.
pub const SBR_SIZE: usize = 256;

/// Manufacturing block length, checksum included.
pub const MFG_BLOCK_LEN: usize = 0x4c;
/// Offset of the second manufacturing block copy.
pub const MFG_COPY_OFFSET: usize = MFG_BLOCK_LEN;
/// Offset of the SAS address.
pub const SAS_ADDRESS_OFFSET: usize = 0xd8;
/// Offset of the SAS address checksum.
pub const SAS_CHECKSUM_OFFSET: usize = 0xef;

const CHECKSUM_SEED: u8 = 0x5b;

/// SBR checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(CHECKSUM_SEED, |acc, b| acc.wrapping_sub(*b))
}

/// Width of one manufacturing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    /// One byte.
    U8,
    /// Two bytes, little-endian.
    U16,
    /// Four bytes, little-endian.
    U32,
}

impl FieldWidth {
    /// Size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 => 4,
        }
    }

    const fn max(self) -> u64 {
        match self {
            FieldWidth::U8 => 0xff,
            FieldWidth::U16 => 0xffff,
            FieldWidth::U32 => 0xffff_ffff,
        }
    }
}

/// One named field of the manufacturing block.
#[derive(Debug, Clone, Copy)]
pub struct MfgField {
    /// Key used in the text config.
    pub name: &'static str,
    /// Storage width.
    pub width: FieldWidth,
}

const fn field(name: &'static str, width: FieldWidth) -> MfgField {
    MfgField { name, width }
}

/// Manufacturing block fields in storage order.
pub const MFG_FIELDS: [MfgField; 25] = [
    field("Unk00", FieldWidth::U32),
    field("Unk04", FieldWidth::U32),
    field("Unk08", FieldWidth::U32),
    field("PCIVID", FieldWidth::U16),
    field("PCIPID", FieldWidth::U16),
    field("Unk10", FieldWidth::U16),
    field("HwConfig", FieldWidth::U16),
    field("SubsysVID", FieldWidth::U16),
    field("SubsysPID", FieldWidth::U16),
    field("Unk18", FieldWidth::U32),
    field("Unk1c", FieldWidth::U32),
    field("Unk20", FieldWidth::U32),
    field("Unk24", FieldWidth::U32),
    field("Unk28", FieldWidth::U32),
    field("Unk2c", FieldWidth::U32),
    field("Unk30", FieldWidth::U32),
    field("Unk34", FieldWidth::U32),
    field("Unk38", FieldWidth::U32),
    field("Unk3c", FieldWidth::U32),
    field("Interface", FieldWidth::U8),
    field("Unk41", FieldWidth::U8),
    field("Unk42", FieldWidth::U16),
    field("Unk44", FieldWidth::U32),
    field("Unk48", FieldWidth::U16),
    field("Unk4a", FieldWidth::U8),
];

const SAS_KEY: &str = "SASAddr";

/// Non-fatal inconsistencies found while parsing a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbrWarning {
    /// The two manufacturing block copies differ; the first one was used.
    CopiesDiffer,
    /// Manufacturing block checksum mismatch.
    MfgChecksum {
        /// Byte stored in the record.
        stored: u8,
        /// Checksum computed over the block.
        computed: u8,
    },
    /// SAS address checksum mismatch.
    SasChecksum {
        /// Byte stored in the record.
        stored: u8,
        /// Checksum computed over the address.
        computed: u8,
    },
}

impl fmt::Display for SbrWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbrWarning::CopiesDiffer => f.write_str("Mfg data copies differ, using first"),
            SbrWarning::MfgChecksum { stored, computed } => write!(
                f,
                "Mfg data checksum error (stored {stored:#04x}, expected {computed:#04x})"
            ),
            SbrWarning::SasChecksum { stored, computed } => write!(
                f,
                "SAS address checksum error (stored {stored:#04x}, expected {computed:#04x})"
            ),
        }
    }
}

/// Errors from decoding a record or its text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbrFormatError {
    /// Record is not exactly [`SBR_SIZE`] bytes.
    Length {
        /// Length that was supplied.
        actual: usize,
    },
    /// Config line without `=`.
    MalformedLine {
        /// 1-based line number.
        line: usize,
    },
    /// Config key that is not a known field.
    UnknownKey {
        /// The offending key.
        key: String,
    },
    /// Value that is not a number.
    BadValue {
        /// Field name.
        key: String,
        /// Raw value text.
        value: String,
    },
    /// Value does not fit the field width.
    OutOfRange {
        /// Field name.
        key: String,
        /// Parsed value.
        value: u64,
    },
}

impl fmt::Display for SbrFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbrFormatError::Length { actual } => {
                write!(f, "SBR must be {SBR_SIZE} bytes, got {actual}")
            }
            SbrFormatError::MalformedLine { line } => write!(f, "line {line}: expected key = value"),
            SbrFormatError::UnknownKey { key } => write!(f, "Unknown key {key}"),
            SbrFormatError::BadValue { key, value } => write!(f, "{key}: bad value {value:?}"),
            SbrFormatError::OutOfRange { key, value } => {
                write!(f, "{key}: value {value:#x} does not fit the field")
            }
        }
    }
}

impl std::error::Error for SbrFormatError {}

/// Decoded SBR contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SbrImage {
    values: [u32; MFG_FIELDS.len()],
    /// SAS address. `None` when absent; `parse` reads an all-zero field as absent.
    pub sas_address: Option<u64>,
}

impl SbrImage {
    /// Decode a raw record. Inconsistencies are reported as warnings, never
    /// as errors.
    ///
    /// # Errors
    ///
    /// Returns [`SbrFormatError::Length`] if `raw` is not [`SBR_SIZE`] bytes.
    pub fn parse(raw: &[u8]) -> Result<(Self, Vec<SbrWarning>), SbrFormatError> {
        if raw.len() != SBR_SIZE {
            return Err(SbrFormatError::Length { actual: raw.len() });
        }

        let mut warnings = Vec::new();
        let mfg = &raw[..MFG_BLOCK_LEN];
        let copy = &raw[MFG_COPY_OFFSET..MFG_COPY_OFFSET + MFG_BLOCK_LEN];
        if mfg != copy {
            warnings.push(SbrWarning::CopiesDiffer);
        }

        let (body, stored) = mfg.split_at(MFG_BLOCK_LEN - 1);
        let computed = checksum(body);
        if stored[0] != computed {
            warnings.push(SbrWarning::MfgChecksum {
                stored: stored[0],
                computed,
            });
        }

        let mut values = [0u32; MFG_FIELDS.len()];
        let mut pos = 0;
        for (slot, f) in values.iter_mut().zip(MFG_FIELDS.iter()) {
            let bytes = &body[pos..pos + f.width.bytes()];
            *slot = bytes
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            pos += f.width.bytes();
        }

        let mut sas = [0u8; 8];
        sas.copy_from_slice(&raw[SAS_ADDRESS_OFFSET..SAS_ADDRESS_OFFSET + 8]);
        let sas_address = if sas == [0u8; 8] {
            None
        } else {
            let computed = checksum(&sas);
            let stored = raw[SAS_CHECKSUM_OFFSET];
            if stored != computed {
                warnings.push(SbrWarning::SasChecksum { stored, computed });
            }
            Some(u64::from_be_bytes(sas))
        };

        Ok((Self { values, sas_address }, warnings))
    }

    /// Value of a manufacturing field by name.
    pub fn field(&self, name: &str) -> Option<u32> {
        MFG_FIELDS
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.values[i])
    }

    /// Set a manufacturing field by name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or values wider than the field.
    pub fn set_field(&mut self, name: &str, value: u64) -> Result<(), SbrFormatError> {
        let index = MFG_FIELDS
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| SbrFormatError::UnknownKey {
                key: name.to_string(),
            })?;
        if value > MFG_FIELDS[index].width.max() {
            return Err(SbrFormatError::OutOfRange {
                key: name.to_string(),
                value,
            });
        }
        // Range-checked above against at most u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        {
            self.values[index] = value as u32;
        }
        Ok(())
    }

    /// Encode the full 256-byte record.
    pub fn build(&self) -> [u8; SBR_SIZE] {
        let mut out = [0u8; SBR_SIZE];

        let mut pos = 0;
        for (value, f) in self.values.iter().zip(MFG_FIELDS.iter()) {
            let n = f.width.bytes();
            out[pos..pos + n].copy_from_slice(&value.to_le_bytes()[..n]);
            pos += n;
        }
        out[MFG_BLOCK_LEN - 1] = checksum(&out[..MFG_BLOCK_LEN - 1]);
        out.copy_within(..MFG_BLOCK_LEN, MFG_COPY_OFFSET);

        if let Some(sas) = self.sas_address {
            let bytes = sas.to_be_bytes();
            out[SAS_ADDRESS_OFFSET..SAS_ADDRESS_OFFSET + 8].copy_from_slice(&bytes);
            out[SAS_CHECKSUM_OFFSET] = checksum(&bytes);
        }

        out
    }

    /// Render as `Name = 0x...` lines.
    pub fn to_config(&self) -> String {
        let mut text = String::new();
        for (value, f) in self.values.iter().zip(MFG_FIELDS.iter()) {
            let digits = f.width.bytes() * 2;
            text.push_str(&format!("{} = 0x{value:0digits$x}\n", f.name));
        }
        if let Some(sas) = self.sas_address {
            text.push_str(&format!("{SAS_KEY} = 0x{sas:016x}\n"));
        }
        text
    }

    /// Parse the text form produced by [`SbrImage::to_config`]. Missing
    /// fields default to zero; blank lines and `#` comments are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed lines, unknown keys and bad values.
    pub fn from_config(text: &str) -> Result<Self, SbrFormatError> {
        let mut image = Self::default();

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(SbrFormatError::MalformedLine { line: n + 1 })?;
            let key = key.trim();
            let raw = value.trim();
            let value = parse_int(raw).ok_or_else(|| SbrFormatError::BadValue {
                key: key.to_string(),
                value: raw.to_string(),
            })?;

            if key == SAS_KEY {
                image.sas_address = Some(value);
            } else {
                image.set_field(key, value)?;
            }
        }

        Ok(image)
    }
}

/// Integer literal with an optional `0x`/`0o`/`0b` prefix.
fn parse_int(s: &str) -> Option<u64> {
    let lower = s.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        (lower.as_str(), 10)
    };
    u64::from_str_radix(&digits.replace('_', ""), radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_table_fills_block() {
        let total: usize = MFG_FIELDS.iter().map(|f| f.width.bytes()).sum();
        assert_eq!(total, MFG_BLOCK_LEN - 1);
    }

    #[test]
    fn checksum_matches_seed() {
        assert_eq!(checksum(&[]), 0x5b);
        assert_eq!(checksum(&[0x5b]), 0);
        assert_eq!(checksum(&[0x60]), 0xfb);
    }

    #[test]
    fn build_lays_out_both_copies_and_sas() {
        let mut image = SbrImage::default();
        image.set_field("PCIVID", 0x1000).unwrap();
        image.set_field("PCIPID", 0x0072).unwrap();
        image.set_field("Interface", 0x01).unwrap();
        image.sas_address = Some(0x5000_6048_1234_5678);

        let raw = image.build();
        assert_eq!(&raw[0x0c..0x10], &[0x00, 0x10, 0x72, 0x00]);
        assert_eq!(raw[0x40], 0x01);
        assert_eq!(raw[..MFG_BLOCK_LEN], raw[MFG_COPY_OFFSET..MFG_COPY_OFFSET + MFG_BLOCK_LEN]);
        assert!(raw[0x98..0xd8].iter().all(|b| *b == 0));
        assert_eq!(&raw[0xd8..0xe0], &0x5000_6048_1234_5678u64.to_be_bytes());
        assert_eq!(raw[SAS_CHECKSUM_OFFSET], checksum(&raw[0xd8..0xe0]));
        assert!(raw[0xf0..].iter().all(|b| *b == 0));

        let (parsed, warnings) = SbrImage::parse(&raw).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(parsed, image);
    }

    #[test]
    fn explicit_zero_sas_address_still_gets_checksum() {
        let image = SbrImage::from_config("SASAddr = 0\n").unwrap();
        assert_eq!(image.sas_address, Some(0));
        let raw = image.build();
        assert!(raw[0xd8..0xe0].iter().all(|b| *b == 0));
        assert_eq!(raw[SAS_CHECKSUM_OFFSET], 0x5b);

        let absent = SbrImage::from_config("").unwrap().build();
        assert_eq!(absent[SAS_CHECKSUM_OFFSET], 0);
    }

    #[test]
    fn parse_reports_warnings_without_failing() {
        let mut raw = SbrImage::default().build();
        raw[0x4c + 3] ^= 0xff;
        raw[0x4b] ^= 0x01;
        raw[0xd8] = 0x50;

        let (image, warnings) = SbrImage::parse(&raw).unwrap();
        assert!(warnings.contains(&SbrWarning::CopiesDiffer));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, SbrWarning::MfgChecksum { .. })));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, SbrWarning::SasChecksum { .. })));
        assert_eq!(image.sas_address, Some(0x5000_0000_0000_0000));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            SbrImage::parse(&[0u8; 255]).unwrap_err(),
            SbrFormatError::Length { actual: 255 }
        );
    }

    #[test]
    fn config_text_round_trip() {
        let text = "\
PCIVID = 0x1000
PCIPID = 0x0087
HwConfig = 0x0107
SubsysVID = 4096
SubsysPID = 0x3020

# trailing comment
SASAddr = 0x500605b0deadbeef
";
        let image = SbrImage::from_config(text).unwrap();
        assert_eq!(image.field("PCIPID"), Some(0x87));
        assert_eq!(image.field("SubsysVID"), Some(0x1000));
        assert_eq!(image.sas_address, Some(0x5006_05b0_dead_beef));

        let rendered = image.to_config();
        assert!(rendered.contains("PCIVID = 0x1000\n"));
        assert!(rendered.contains("Interface = 0x00\n"));
        assert!(rendered.contains("Unk44 = 0x00000000\n"));
        assert!(rendered.ends_with("SASAddr = 0x500605b0deadbeef\n"));
        assert_eq!(SbrImage::from_config(&rendered).unwrap(), image);
    }

    #[test]
    fn config_rejects_unknown_and_oversized() {
        assert!(matches!(
            SbrImage::from_config("Bogus = 1"),
            Err(SbrFormatError::UnknownKey { .. })
        ));
        assert!(matches!(
            SbrImage::from_config("Interface = 0x100"),
            Err(SbrFormatError::OutOfRange { .. })
        ));
        assert!(matches!(
            SbrImage::from_config("PCIVID 0x1000"),
            Err(SbrFormatError::MalformedLine { line: 1 })
        ));
        assert!(matches!(
            SbrImage::from_config("PCIVID = zz"),
            Err(SbrFormatError::BadValue { .. })
        ));
    }
}
