/// Controls how much of each frame is logged when monitor mode is enabled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameDecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Log the MBAP header of every received and sent frame
    Header,
    /// Log the MBAP header and a hex dump of the payload
    Payload,
}

/// Decoding verbosity applied by the frame layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeLevel {
    pub(crate) frame: FrameDecodeLevel,
}

impl DecodeLevel {
    /// Log nothing (the default)
    pub fn nothing() -> Self {
        Self {
            frame: FrameDecodeLevel::Nothing,
        }
    }

    /// Full monitor output: header fields plus payload hex for every frame
    pub fn monitor() -> Self {
        Self {
            frame: FrameDecodeLevel::Payload,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.frame != FrameDecodeLevel::Nothing
    }

    pub(crate) fn payload_enabled(&self) -> bool {
        self.frame == FrameDecodeLevel::Payload
    }
}

const BYTES_PER_DECODE_LINE: usize = 18;

/// Hex dump of a byte slice, wrapped into lines
pub(crate) struct BytesDisplay<'a>(pub(crate) &'a [u8]);

impl std::fmt::Display for BytesDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for chunk in self.0.chunks(BYTES_PER_DECODE_LINE) {
            writeln!(f)?;
            let mut first = true;
            for byte in chunk {
                if !first {
                    f.write_str(" ")?;
                }
                first = false;
                write!(f, "{byte:02X}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_in_hex_lines() {
        let rendered = format!("{}", BytesDisplay(&[0xCA, 0xFE, 0x00]));
        assert_eq!(rendered, "\nCA FE 00");
    }

    #[test]
    fn monitor_enables_payload_output() {
        assert!(DecodeLevel::monitor().payload_enabled());
        assert!(!DecodeLevel::nothing().enabled());
        assert!(!DecodeLevel::default().enabled());
    }
}
