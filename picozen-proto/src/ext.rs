//! Protocol extension framework.
//!
//! When the `Z` bit of a message header is set, an extension block
//! follows the message's fixed fields (and precedes any trailing
//! variable payload such as Frame bodies). The block is a zint count of
//! extensions; each extension is one header byte plus an optional
//! length-prefixed payload:
//!
//! ```text
//!  7 6 5 4 3 2 1 0
//! +-+-+-+-+-+-+-+-+
//! |Z|P|M|   ID    |
//! +-+-+-+---------+
//! ~   <u8;zlen>   ~ if P==1
//! +---------------+
//! ```
//!
//! `Z` chains to the next extension, `P` marks a payload, `M` marks the
//! extension as mandatory. Unknown non-mandatory extensions are skipped;
//! an unknown mandatory extension fails the whole message.

use bytes::{Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::reader::{Reader, WireWrite};

pub const FLAG_Z: u8 = 0x80;
pub const FLAG_P: u8 = 0x40;
pub const FLAG_M: u8 = 0x20;
pub const ID_MASK: u8 = 0x1F;

/// One decoded extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub mandatory: bool,
    pub payload: Option<Bytes>,
}

/// Encode an extension block. Must only be called with a nonempty list;
/// the caller sets the message's `Z` flag accordingly.
pub fn encode_extensions(buf: &mut BytesMut, exts: &[Extension]) {
    debug_assert!(!exts.is_empty());
    buf.write_zint(exts.len() as u64);
    for (i, ext) in exts.iter().enumerate() {
        let mut header = ext.id & ID_MASK;
        if ext.mandatory {
            header |= FLAG_M;
        }
        if ext.payload.is_some() {
            header |= FLAG_P;
        }
        if i + 1 < exts.len() {
            header |= FLAG_Z;
        }
        buf.write_u8(header);
        if let Some(payload) = &ext.payload {
            buf.write_zbytes(payload);
        }
    }
}

/// Decode an extension block, failing close on any mandatory extension
/// whose id is not in `known_ids`.
pub fn decode_extensions(reader: &mut Reader<'_>, known_ids: &[u8]) -> Result<Vec<Extension>> {
    let count = reader.read_zint_usize()?;
    let mut exts = Vec::new();
    for i in 0..count {
        let header = reader.read_u8()?;
        let id = header & ID_MASK;
        let mandatory = header & FLAG_M != 0;
        let payload = if header & FLAG_P != 0 {
            Some(Bytes::copy_from_slice(reader.read_zbytes()?))
        } else {
            None
        };
        let chained = header & FLAG_Z != 0;
        if chained != (i + 1 < count) {
            return Err(CodecError::BadFlag);
        }
        if known_ids.contains(&id) {
            exts.push(Extension {
                id,
                mandatory,
                payload,
            });
        } else if mandatory {
            return Err(CodecError::UnknownMandatoryExtension);
        } else {
            tracing::trace!(id, "skipping unknown non-mandatory extension");
        }
    }
    Ok(exts)
}

/// Skip an extension block entirely, failing only on mandatory
/// extensions. Used by decoders of messages we attach no extensions to.
pub fn skip_extensions(reader: &mut Reader<'_>) -> Result<()> {
    decode_extensions(reader, &[]).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_known_extension() {
        let mut buf = BytesMut::new();
        let exts = vec![
            Extension {
                id: 3,
                mandatory: false,
                payload: Some(Bytes::from_static(b"abc")),
            },
            Extension {
                id: 7,
                mandatory: true,
                payload: None,
            },
        ];
        encode_extensions(&mut buf, &exts);
        let mut r = Reader::new(&buf);
        let got = decode_extensions(&mut r, &[3, 7]).unwrap();
        assert_eq!(got, exts);
        assert!(r.is_empty());
    }

    #[test]
    fn unknown_non_mandatory_is_skipped() {
        let mut buf = BytesMut::new();
        encode_extensions(
            &mut buf,
            &[Extension {
                id: 9,
                mandatory: false,
                payload: Some(Bytes::from_static(b"xyz")),
            }],
        );
        let mut r = Reader::new(&buf);
        assert!(skip_extensions(&mut r).is_ok());
        assert!(r.is_empty());
    }

    #[test]
    fn unknown_mandatory_fails_close() {
        let mut buf = BytesMut::new();
        encode_extensions(
            &mut buf,
            &[Extension {
                id: 9,
                mandatory: true,
                payload: None,
            }],
        );
        let mut r = Reader::new(&buf);
        assert_eq!(
            skip_extensions(&mut r),
            Err(CodecError::UnknownMandatoryExtension)
        );
    }

    #[test]
    fn broken_chain_bit_rejected() {
        let mut buf = BytesMut::new();
        buf.write_zint(2);
        buf.write_u8(1); // missing Z although another follows
        buf.write_u8(2);
        let mut r = Reader::new(&buf);
        assert_eq!(skip_extensions(&mut r), Err(CodecError::BadFlag));
    }
}
