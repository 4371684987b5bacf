// Modem Manager Core - Netlink Wire Format
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Encoding of netlink requests and decoding of replies.
//!
//! Everything here works on byte slices in native byte order, so the
//! parsers can be fed captured buffers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;

pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_STATS: u16 = 7;
pub const IFLA_STATS64: u16 = 23;

pub const IFF_UP: u32 = 0x1;
pub const IFF_RUNNING: u32 = 0x40;

/// TCP_CLOSING, the last state included in connection dumps.
pub const TCP_CLOSING: u8 = 11;

const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_MSG_LEN: usize = 72;
const IFINFOMSG_LEN: usize = 16;
const RTATTR_HDRLEN: usize = 4;

/// Round `len` up to the netlink alignment of 4 bytes.
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_ne_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// One decoded netlink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMessage<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: &'a [u8],
}

/// Iterator over the messages packed into one receive buffer.
#[derive(Debug, Clone)]
pub struct NlMessages<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for NlMessages<'a> {
    type Item = NlMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = read_u32(self.buf, 0)? as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }

        let message = NlMessage {
            kind: read_u16(self.buf, 4)?,
            flags: read_u16(self.buf, 6)?,
            seq: read_u32(self.buf, 8)?,
            pid: read_u32(self.buf, 12)?,
            payload: &self.buf[NLMSG_HDRLEN..len],
        };

        let advance = align(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some(message)
    }
}

pub fn messages(buf: &[u8]) -> NlMessages<'_> {
    NlMessages { buf }
}

fn header(total_len: usize, kind: u16, flags: u16, seq: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(&flags.to_ne_bytes());
    out.extend_from_slice(&seq.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out
}

/// Dump request for every TCP socket of `family` up to the closing state.
pub fn encode_connections_request(family: u8, seq: u32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;
    let mut out = header(total, SOCK_DIAG_BY_FAMILY, NLM_F_REQUEST | NLM_F_DUMP, seq);
    out.push(family);
    out.push(libc::IPPROTO_TCP as u8);
    out.push(0); // idiag_ext
    out.push(0); // pad
    let states: u32 = (1u32 << (TCP_CLOSING + 1)) - 1;
    out.extend_from_slice(&states.to_ne_bytes());
    // Zeroed socket id matches every socket.
    out.resize(total, 0);
    out
}

/// Request for the attributes of one link.
pub fn encode_link_request(index: u32, seq: u32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + IFINFOMSG_LEN;
    let mut out = header(total, RTM_GETLINK, NLM_F_REQUEST, seq);
    out.push(libc::AF_UNSPEC as u8);
    out.push(0);
    out.extend_from_slice(&0u16.to_ne_bytes());
    out.extend_from_slice(&(index as i32).to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&u32::MAX.to_ne_bytes());
    out
}

/// Error code carried by an `NLMSG_ERROR` payload. Zero is an acknowledgement.
pub fn error_code(payload: &[u8]) -> Option<i32> {
    read_u32(payload, 0).map(|v| v as i32)
}

/// One socket from a diagnostic dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagRecord {
    pub family: u8,
    pub state: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Receive plus send queue.
    pub queue_depth: u32,
    pub uid: u32,
    pub inode: u64,
}

fn parse_addr(family: u8, raw: &[u8]) -> Option<IpAddr> {
    if family as i32 == libc::AF_INET {
        let octets: [u8; 4] = raw.get(..4)?.try_into().ok()?;
        Some(IpAddr::V4(Ipv4Addr::from(octets)))
    } else if family as i32 == libc::AF_INET6 {
        let octets: [u8; 16] = raw.get(..16)?.try_into().ok()?;
        Some(IpAddr::V6(Ipv6Addr::from(octets)))
    } else {
        None
    }
}

/// Decode an `inet_diag_msg` payload.
pub fn parse_diag(payload: &[u8]) -> Option<DiagRecord> {
    if payload.len() < INET_DIAG_MSG_LEN {
        return None;
    }

    let family = payload[0];
    let state = payload[1];
    // Ports are big endian on the wire.
    let src_port = u16::from_be_bytes([payload[4], payload[5]]);
    let dst_port = u16::from_be_bytes([payload[6], payload[7]]);
    let src = parse_addr(family, &payload[8..24])?;
    let dst = parse_addr(family, &payload[24..40])?;
    let rqueue = read_u32(payload, 56)?;
    let wqueue = read_u32(payload, 60)?;
    let uid = read_u32(payload, 64)?;
    let inode = read_u32(payload, 68)? as u64;

    Some(DiagRecord {
        family,
        state,
        src,
        dst,
        src_port,
        dst_port,
        queue_depth: rqueue.wrapping_add(wqueue),
        uid,
        inode,
    })
}

/// Link attributes relevant to traffic accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkRecord {
    pub index: u32,
    pub flags: u32,
    pub name: Option<String>,
    /// Receive and transmit byte counters from the 32-bit statistics.
    pub stats32: Option<(u64, u64)>,
    /// Receive and transmit byte counters from the 64-bit statistics.
    pub stats64: Option<(u64, u64)>,
}

impl LinkRecord {
    /// Byte counters, preferring the 64-bit statistics.
    pub fn counters(&self) -> Option<(u64, u64)> {
        self.stats64.or(self.stats32)
    }
}

/// Decode an `ifinfomsg` payload with its attributes.
pub fn parse_link(payload: &[u8]) -> Option<LinkRecord> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }

    let mut record = LinkRecord {
        index: read_u32(payload, 4)?,
        flags: read_u32(payload, 8)?,
        ..LinkRecord::default()
    };

    let mut attrs = &payload[IFINFOMSG_LEN..];
    while attrs.len() >= RTATTR_HDRLEN {
        let len = read_u16(attrs, 0)? as usize;
        let kind = read_u16(attrs, 2)? & 0x3fff;
        if len < RTATTR_HDRLEN || len > attrs.len() {
            break;
        }
        let data = &attrs[RTATTR_HDRLEN..len];

        match kind {
            IFLA_IFNAME => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                record.name = Some(String::from_utf8_lossy(&data[..end]).into_owned());
            }
            IFLA_STATS => {
                if let (Some(rx), Some(tx)) = (read_u32(data, 8), read_u32(data, 12)) {
                    record.stats32 = Some((rx as u64, tx as u64));
                }
            }
            IFLA_STATS64 => {
                if let (Some(rx), Some(tx)) = (read_u64(data, 16), read_u64(data, 24)) {
                    record.stats64 = Some((rx, tx));
                }
            }
            _ => {}
        }

        attrs = &attrs[align(len).min(attrs.len())..];
    }

    Some(record)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Builders for captured-style buffers.

    use super::*;

    pub fn message(kind: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = header(NLMSG_HDRLEN + payload.len(), kind, 0, seq);
        out.extend_from_slice(payload);
        out.resize(align(out.len()), 0);
        out
    }

    pub fn attr(kind: u16, data: &[u8]) -> Vec<u8> {
        let len = RTATTR_HDRLEN + data.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(data);
        out.resize(align(len), 0);
        out
    }

    pub fn link_payload(index: u32, flags: u32, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0u8; IFINFOMSG_LEN];
        out[4..8].copy_from_slice(&index.to_ne_bytes());
        out[8..12].copy_from_slice(&flags.to_ne_bytes());
        for a in attrs {
            out.extend_from_slice(a);
        }
        out
    }

    pub fn stats32(rx: u32, tx: u32) -> Vec<u8> {
        let mut data = vec![0u8; 96];
        data[8..12].copy_from_slice(&rx.to_ne_bytes());
        data[12..16].copy_from_slice(&tx.to_ne_bytes());
        attr(IFLA_STATS, &data)
    }

    pub fn stats64(rx: u64, tx: u64) -> Vec<u8> {
        let mut data = vec![0u8; 192];
        data[16..24].copy_from_slice(&rx.to_ne_bytes());
        data[24..32].copy_from_slice(&tx.to_ne_bytes());
        attr(IFLA_STATS64, &data)
    }

    pub fn ifname(name: &str) -> Vec<u8> {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        attr(IFLA_IFNAME, &data)
    }

    pub fn diag_payload(state: u8, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, uid: u32, inode: u32, queues: (u32, u32)) -> Vec<u8> {
        let mut out = vec![0u8; INET_DIAG_MSG_LEN];
        out[0] = libc::AF_INET as u8;
        out[1] = state;
        out[4..6].copy_from_slice(&sport.to_be_bytes());
        out[6..8].copy_from_slice(&dport.to_be_bytes());
        out[8..12].copy_from_slice(&src);
        out[24..28].copy_from_slice(&dst);
        out[56..60].copy_from_slice(&queues.0.to_ne_bytes());
        out[60..64].copy_from_slice(&queues.1.to_ne_bytes());
        out[64..68].copy_from_slice(&uid.to_ne_bytes());
        out[68..72].copy_from_slice(&inode.to_ne_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_connections_request_layout() {
        let req = encode_connections_request(libc::AF_INET6 as u8, 7);
        assert_eq!(req.len(), 72);
        let msg = messages(&req).next().unwrap();
        assert_eq!(msg.kind, SOCK_DIAG_BY_FAMILY);
        assert_eq!(msg.flags, NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.payload[0], libc::AF_INET6 as u8);
        assert_eq!(msg.payload[1], libc::IPPROTO_TCP as u8);
        assert_eq!(read_u32(msg.payload, 4), Some(0xfff));
    }

    #[test]
    fn test_link_request_layout() {
        let req = encode_link_request(3, 100000);
        assert_eq!(req.len(), 32);
        let msg = messages(&req).next().unwrap();
        assert_eq!(msg.kind, RTM_GETLINK);
        assert_eq!(msg.seq, 100000);
        assert_eq!(read_u32(msg.payload, 4), Some(3));
        assert_eq!(read_u32(msg.payload, 12), Some(u32::MAX));
    }

    #[test]
    fn test_messages_split_buffer() {
        let mut buf = message(RTM_NEWLINK, 1, &[1, 2, 3]);
        buf.extend(message(NLMSG_DONE, 2, &[0, 0, 0, 0]));
        let kinds: Vec<u16> = messages(&buf).map(|m| m.kind).collect();
        assert_eq!(kinds, vec![RTM_NEWLINK, NLMSG_DONE]);
        assert_eq!(messages(&buf).next().unwrap().payload, &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_message_stops_iteration() {
        let mut buf = message(RTM_NEWLINK, 1, &[0; 8]);
        buf.truncate(20);
        assert_eq!(messages(&buf).count(), 0);
        assert_eq!(messages(&[]).count(), 0);
    }

    #[test]
    fn test_parse_diag_ipv4() {
        let payload = diag_payload(1, [10, 0, 0, 2], 40000, [93, 184, 216, 34], 443, 1000, 5555, (3, 4));
        let record = parse_diag(&payload).unwrap();
        assert_eq!(record.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(record.dst, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(record.src_port, 40000);
        assert_eq!(record.dst_port, 443);
        assert_eq!(record.queue_depth, 7);
        assert_eq!(record.uid, 1000);
        assert_eq!(record.inode, 5555);
        assert!(parse_diag(&payload[..40]).is_none());
    }

    #[test]
    fn test_parse_link_prefers_64bit_counters() {
        let payload = link_payload(
            4,
            IFF_UP | IFF_RUNNING,
            &[ifname("wwan0"), stats32(10, 20), stats64(5_000_000_000, 7)],
        );
        let record = parse_link(&payload).unwrap();
        assert_eq!(record.index, 4);
        assert_eq!(record.name.as_deref(), Some("wwan0"));
        assert_eq!(record.stats32, Some((10, 20)));
        assert_eq!(record.counters(), Some((5_000_000_000, 7)));
    }

    #[test]
    fn test_parse_link_32bit_fallback() {
        let payload = link_payload(2, 0, &[stats32(10, 20)]);
        let record = parse_link(&payload).unwrap();
        assert_eq!(record.counters(), Some((10, 20)));
        assert!(record.name.is_none());
    }
}
