use super::checksum::checksum;
use super::ip::{Ipv4Header, IPPROTO_TCP};
use super::DecodeError;

const HEADER_LEN: usize = 20;

/// Receive window advertised on every segment we emit.
pub const WINDOW_SIZE: u16 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn is_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }
}

/// Fixed-size TCP header; we never emit options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

fn pseudo_header(src: &[u8; 4], dst: &[u8; 4], tcp_len: usize) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(12 + tcp_len);
    pseudo.extend_from_slice(src);
    pseudo.extend_from_slice(dst);
    pseudo.push(0);
    pseudo.push(IPPROTO_TCP);
    pseudo.extend_from_slice(&(tcp_len as u16).to_be_bytes());
    pseudo
}

impl TcpHeader {
    /// Parse a segment, validating the pseudo-header checksum. Returns the
    /// header and the payload slice.
    pub fn parse<'a>(ip: &Ipv4Header, data: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated("tcp"));
        }
        let mut covered = pseudo_header(&ip.src, &ip.dst, data.len());
        covered.extend_from_slice(data);
        let ck = checksum(&covered);
        if ck != 0 && ck != 0xffff {
            return Err(DecodeError::Checksum(ck));
        }
        // the peer is a real OS stack and sends options on SYN; honor the
        // data offset so the payload slice starts at the right place
        let offset = (data[12] >> 4) as usize * 4;
        if offset < HEADER_LEN || offset > data.len() {
            return Err(DecodeError::HeaderLen(offset));
        }
        let hdr = Self {
            sport: u16::from_be_bytes([data[0], data[1]]),
            dport: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags(data[13]),
        };
        Ok((hdr, &data[offset..]))
    }

    /// Build header plus payload. The checksum covers the pseudo-header and
    /// the whole segment and is stored big-endian.
    pub fn build(&self, src_ip: &[u8; 4], dst_ip: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut seg = Vec::with_capacity(HEADER_LEN + payload.len());
        seg.extend_from_slice(&self.sport.to_be_bytes());
        seg.extend_from_slice(&self.dport.to_be_bytes());
        seg.extend_from_slice(&self.seq.to_be_bytes());
        seg.extend_from_slice(&self.ack.to_be_bytes());
        seg.push(5 << 4); // data offset
        seg.push(self.flags.0);
        seg.extend_from_slice(&WINDOW_SIZE.to_be_bytes());
        seg.extend_from_slice(&[0, 0]); // checksum placeholder
        seg.extend_from_slice(&[0, 0]); // urgent pointer
        seg.extend_from_slice(payload);

        let mut covered = pseudo_header(src_ip, dst_ip, seg.len());
        covered.extend_from_slice(&seg);
        let ck = checksum(&covered);
        seg[16..18].copy_from_slice(&ck.to_be_bytes());
        seg
    }
}
