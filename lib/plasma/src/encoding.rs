//! Base64 framing used by the stream wire format. Every framed packet is
//! transmitted as one standard padded base64 string; the decoder operates on
//! the concatenation of any number of such strings.

use base64 as b64;

/// Encodes the supplied bytes into standard padded base64.
#[inline]
pub fn encode(data: &[u8]) -> String {
    b64::encode(data)
}

/// Decodes a standalone standard padded base64 string.
#[inline]
pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, b64::DecodeError> {
    b64::decode(data)
}

/// Incrementally decodes the longest prefix of `raw` consisting of whole
/// base64 quartets, appending the clear bytes to `out`. Returns the number of
/// input bytes consumed.
///
/// Padding only occurs in the final quartet of an encoded packet, and a padded
/// quartet simply decodes to fewer than three bytes, so packet boundaries in
/// the input are invisible to the caller: the output is one contiguous byte
/// stream that downstream framing delimits by itself.
pub fn decode_stream(raw: &[u8], out: &mut Vec<u8>) -> Result<usize, b64::DecodeError> {
    let usable = raw.len() - raw.len() % 4;
    let mut consumed = 0;

    while consumed < usable {
        // Decode the whole run up to and including the next padded quartet in
        // one pass.
        let mut end = usable;

        for quartet in (consumed..usable).step_by(4) {
            if raw[quartet..quartet + 4].contains(&b'=') {
                end = quartet + 4;
                break;
            }
        }

        out.extend_from_slice(&b64::decode(&raw[consumed..end])?);
        consumed = end;
    }

    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single() {
        let data = b"hello, world!";
        let encoded = encode(data);

        let mut out = Vec::new();
        let consumed = decode_stream(encoded.as_bytes(), &mut out).unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(out, data);
    }

    #[test]
    fn round_trip_concatenated() {
        // Lengths chosen so every padding variant (0, 1 and 2 '=' chars)
        // appears somewhere in the joined stream.
        let packets: Vec<Vec<u8>> = vec![
            (0..13u8).collect(),
            (0..96u8).collect(),
            (0..7u8).collect(),
            (0..32u8).collect(),
        ];

        let mut wire = String::new();
        for packet in &packets {
            wire.push_str(&encode(packet));
        }

        let mut out = Vec::new();
        let consumed = decode_stream(wire.as_bytes(), &mut out).unwrap();

        let expected: Vec<u8> = packets.into_iter().flatten().collect();
        assert_eq!(consumed, wire.len());
        assert_eq!(out, expected);
    }

    #[test]
    fn partial_quartet_left_unconsumed() {
        let encoded = encode(b"stream data");
        let (head, tail) = encoded.as_bytes().split_at(encoded.len() - 2);

        let mut out = Vec::new();
        let consumed = decode_stream(head, &mut out).unwrap();

        // The trailing partial quartet stays in the input buffer.
        assert_eq!(consumed, head.len() - head.len() % 4);

        let mut rest = Vec::from(&head[consumed..]);
        rest.extend_from_slice(tail);
        decode_stream(&rest, &mut out).unwrap();

        assert_eq!(out, b"stream data");
    }
}
