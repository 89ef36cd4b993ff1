use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;

/// DSHP TLV field type ids. 0x0100-0x01FF is reserved for future use.
pub mod field {
    pub const MAGIC: u16 = 0x0001;
    pub const VERSION: u16 = 0x0002;
    pub const MESSAGE_TYPE: u16 = 0x0003;
    pub const STATUS: u16 = 0x0004;
    pub const SESSION_ID: u16 = 0x0005;
    pub const SESSION_TIMEOUT: u16 = 0x0006;
    pub const ENC_TYPE: u16 = 0x0010;
    pub const PKEY_EXCHANGE_TYPE: u16 = 0x0011;
    pub const PKEY_EXCHANGE_SIZE: u16 = 0x0012;
    pub const BLOCK_KEY_SIZE: u16 = 0x0013;
    pub const ALICE_PUB_KEY: u16 = 0x0020;
    pub const BOB_PUB_KEY: u16 = 0x0021;
    pub const ALICE_SIGNATURE: u16 = 0x0022;
    pub const CHANNELS: u16 = 0x0030;
    pub const ERROR_CODE: u16 = 0x0040;
    pub const ERROR_MESSAGE: u16 = 0x0041;
}

const TLV_HDR_SIZE: usize = 4;

/// Serializes a TLV bundle: `{type: u16 BE, length: u16 BE, value}` records
/// back to back.
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    #[inline]
    pub fn new() -> TlvWriter {
        TlvWriter { buf: Vec::new() }
    }

    pub fn put(&mut self, ty: u16, value: &[u8]) -> &mut TlvWriter {
        if value.len() > u16::max_value() as usize {
            panic!("TLV value too large: {} bytes", value.len());
        }

        let mut hdr = [0u8; TLV_HDR_SIZE];
        BigEndian::write_u16(&mut hdr[..2], ty);
        BigEndian::write_u16(&mut hdr[2..], value.len() as u16);

        self.buf.extend_from_slice(&hdr);
        self.buf.extend_from_slice(value);
        self
    }

    #[inline]
    pub fn put_u8(&mut self, ty: u16, value: u8) -> &mut TlvWriter {
        self.put(ty, &[value])
    }

    #[inline]
    pub fn put_u16(&mut self, ty: u16, value: u16) -> &mut TlvWriter {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.put(ty, &bytes)
    }

    #[inline]
    pub fn put_u32(&mut self, ty: u16, value: u32) -> &mut TlvWriter {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.put(ty, &bytes)
    }

    #[inline]
    pub fn put_str(&mut self, ty: u16, value: &str) -> &mut TlvWriter {
        self.put(ty, value.as_bytes())
    }

    #[inline]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parsed view of a TLV bundle. Duplicate types keep the first occurrence.
pub struct TlvBundle<'a> {
    fields: HashMap<u16, &'a [u8]>,
}

impl<'a> TlvBundle<'a> {
    /// Walks the whole buffer; any truncated record is a protocol error.
    pub fn parse(buf: &'a [u8]) -> NetworkResult<TlvBundle<'a>> {
        let mut fields = HashMap::new();
        let mut offset = 0usize;

        while offset < buf.len() {
            if buf.len() - offset < TLV_HDR_SIZE {
                return Err(NetworkError::Fatal(ErrorType::Protocol));
            }

            let ty = BigEndian::read_u16(&buf[offset..]);
            let length = BigEndian::read_u16(&buf[offset + 2..]) as usize;
            offset += TLV_HDR_SIZE;

            if buf.len() - offset < length {
                return Err(NetworkError::Fatal(ErrorType::Protocol));
            }

            fields.entry(ty).or_insert(&buf[offset..offset + length]);
            offset += length;
        }

        Ok(TlvBundle { fields })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn bytes(&self, ty: u16) -> Option<&'a [u8]> {
        self.fields.get(&ty).copied()
    }

    /// A field the message cannot be interpreted without.
    #[inline]
    pub fn required(&self, ty: u16) -> NetworkResult<&'a [u8]> {
        self.bytes(ty).ok_or(NetworkError::Fatal(ErrorType::Protocol))
    }

    pub fn u8(&self, ty: u16) -> NetworkResult<u8> {
        match self.required(ty)? {
            [value] => Ok(*value),
            _ => Err(NetworkError::Fatal(ErrorType::Protocol)),
        }
    }

    pub fn u16(&self, ty: u16) -> NetworkResult<u16> {
        let bytes = self.required(ty)?;

        match bytes.len() {
            2 => Ok(BigEndian::read_u16(bytes)),
            _ => Err(NetworkError::Fatal(ErrorType::Protocol)),
        }
    }

    pub fn u32(&self, ty: u16) -> NetworkResult<u32> {
        let bytes = self.required(ty)?;

        match bytes.len() {
            4 => Ok(BigEndian::read_u32(bytes)),
            _ => Err(NetworkError::Fatal(ErrorType::Protocol)),
        }
    }

    pub fn u32_opt(&self, ty: u16) -> NetworkResult<Option<u32>> {
        match self.bytes(ty) {
            None => Ok(None),
            Some(bytes) if bytes.len() == 4 => Ok(Some(BigEndian::read_u32(bytes))),
            Some(_) => Err(NetworkError::Fatal(ErrorType::Protocol)),
        }
    }

    pub fn str(&self, ty: u16) -> NetworkResult<&'a str> {
        std::str::from_utf8(self.required(ty)?).map_err(|_| NetworkError::Fatal(ErrorType::Protocol))
    }

    pub fn str_opt(&self, ty: u16) -> NetworkResult<Option<&'a str>> {
        match self.bytes(ty) {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| NetworkError::Fatal(ErrorType::Protocol)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_parse_round_trip() {
        let mut writer = TlvWriter::new();
        writer
            .put_u32(field::MAGIC, 0xDA4A_1A48)
            .put_u32(field::VERSION, 0x0100_0000)
            .put_u16(field::MESSAGE_TYPE, 1)
            .put_u8(field::ENC_TYPE, 0x01)
            .put_str(field::CHANNELS, "E|C|N")
            .put(field::ALICE_PUB_KEY, &[0xAA; 32]);

        let buf = writer.finish();
        let bundle = TlvBundle::parse(&buf).unwrap();

        assert_eq!(bundle.len(), 6);
        assert_eq!(bundle.u32(field::MAGIC).unwrap(), 0xDA4A_1A48);
        assert_eq!(bundle.u32(field::VERSION).unwrap(), 0x0100_0000);
        assert_eq!(bundle.u16(field::MESSAGE_TYPE).unwrap(), 1);
        assert_eq!(bundle.u8(field::ENC_TYPE).unwrap(), 0x01);
        assert_eq!(bundle.str(field::CHANNELS).unwrap(), "E|C|N");
        assert_eq!(bundle.bytes(field::ALICE_PUB_KEY).unwrap(), &[0xAA; 32][..]);
    }

    #[test]
    fn empty_values_are_representable() {
        let mut writer = TlvWriter::new();
        writer.put(field::BOB_PUB_KEY, &[]);

        let buf = writer.finish();
        let bundle = TlvBundle::parse(&buf).unwrap();

        assert_eq!(bundle.bytes(field::BOB_PUB_KEY).unwrap().len(), 0);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(TlvBundle::parse(&[0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn truncated_value_rejected() {
        // Claims 8 bytes of value, carries 2.
        assert!(TlvBundle::parse(&[0x00, 0x01, 0x00, 0x08, 0xde, 0xad]).is_err());
    }

    #[test]
    fn missing_required_field_rejected() {
        let mut writer = TlvWriter::new();
        writer.put_u32(field::MAGIC, 1);
        let buf = writer.finish();

        let bundle = TlvBundle::parse(&buf).unwrap();
        assert!(bundle.u32(field::VERSION).is_err());
        assert!(bundle.u32_opt(field::SESSION_TIMEOUT).unwrap().is_none());
    }

    #[test]
    fn wrong_width_rejected() {
        let mut writer = TlvWriter::new();
        writer.put_u16(field::MAGIC, 7);
        let buf = writer.finish();

        let bundle = TlvBundle::parse(&buf).unwrap();
        assert!(bundle.u32(field::MAGIC).is_err());
    }

    #[test]
    fn duplicate_fields_keep_first() {
        let mut writer = TlvWriter::new();
        writer.put_u8(field::STATUS, 0).put_u8(field::STATUS, 9);
        let buf = writer.finish();

        let bundle = TlvBundle::parse(&buf).unwrap();
        assert_eq!(bundle.u8(field::STATUS).unwrap(), 0);
    }
}
