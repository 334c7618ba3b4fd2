use super::checksum::checksum;
use super::DecodeError;

pub const IPPROTO_TCP: u8 = 6;

const MIN_HEADER_LEN: usize = 20;

/// Fixed-size IPv4 header, no options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub proto: u8,
}

impl Ipv4Header {
    pub fn new(src: [u8; 4], dst: [u8; 4], proto: u8) -> Self {
        Self {
            version: 4,
            src,
            dst,
            proto,
        }
    }

    /// Build the 20-byte header for a payload of `payload_len` bytes.
    /// The checksum is computed last and stored big-endian.
    pub fn build(&self, payload_len: usize) -> Vec<u8> {
        let total_len = (MIN_HEADER_LEN + payload_len) as u16;
        let ident: u16 = 1;
        let mut hdr = vec![
            self.version << 4 | 5, // version + IHL
            0,                     // DSCP and ECN
            (total_len >> 8) as u8,
            total_len as u8,
            (ident >> 8) as u8,
            ident as u8,
            0, // flags and fragment offset
            0,
            255, // TTL
            self.proto,
            0, // checksum placeholder
            0,
        ];
        hdr.extend_from_slice(&self.src);
        hdr.extend_from_slice(&self.dst);
        let ck = checksum(&hdr);
        hdr[10..12].copy_from_slice(&ck.to_be_bytes());
        hdr
    }

    /// Parse a header, returning it along with the payload slice.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if data.len() < MIN_HEADER_LEN {
            return Err(DecodeError::Truncated("ip"));
        }
        let ihl = (data[0] & 0x0f) as usize * 4;
        if ihl < MIN_HEADER_LEN || data.len() < ihl {
            return Err(DecodeError::HeaderLen(ihl));
        }
        // tolerate both one's-complement representations of zero
        let ck = checksum(&data[..ihl]);
        if ck != 0 && ck != 0xffff {
            return Err(DecodeError::Checksum(ck));
        }
        let hdr = Self {
            version: data[0] >> 4,
            src: data[12..16].try_into().unwrap(),
            dst: data[16..20].try_into().unwrap(),
            proto: data[9],
        };
        Ok((hdr, &data[ihl..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_built_header_is_zero() {
        let hdr = Ipv4Header::new([192, 168, 2, 1], [192, 168, 2, 2], 0);
        assert_eq!(checksum(&hdr.build(0)), 0);
    }

    #[test]
    fn parse_round_trip() {
        let hdr = Ipv4Header::new([192, 168, 2, 1], [192, 168, 2, 2], IPPROTO_TCP);
        let built = hdr.build(0);
        let (parsed, rest) = Ipv4Header::parse(&built).unwrap();
        assert_eq!(parsed, hdr);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_rejects_corrupt_checksum() {
        let mut built = Ipv4Header::new([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP).build(0);
        built[10] ^= 0xff;
        assert!(matches!(
            Ipv4Header::parse(&built),
            Err(DecodeError::Checksum(_))
        ));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert_eq!(
            Ipv4Header::parse(&[0x45, 0x00]),
            Err(DecodeError::Truncated("ip"))
        );
    }
}
