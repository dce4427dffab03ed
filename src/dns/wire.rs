//! DNS wire format.
//!
//! Only the subset this intermediary needs: one question per message,
//! A/AAAA/CNAME answers, an optional EDNS Client Subnet record on
//! outgoing queries, and the two response builders — one honest, one
//! not. Decoders check every declared length against the bytes actually
//! present and answer with a neutral empty value on mismatch.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use tracing::debug;

/// A record
pub const QTYPE_A: u16 = 1;
/// CNAME record
pub const QTYPE_CNAME: u16 = 5;
/// AAAA record
pub const QTYPE_AAAA: u16 = 28;

const HEADER_LEN: usize = 12;
/// Answer TTL on honest responses (3600 seconds).
const ANSWER_TTL: u16 = 0x0E10;
/// Answer TTL on lies (16 seconds).
const LIE_TTL: u16 = 0x0010;
/// Pointer to the question name at offset 12.
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Encode a dotted name into DNS label form with a zero terminator.
pub fn pack_qname(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Build a query for `name` with ID 0 and recursion desired. A non-empty
/// `ecs` address appends an OPT record carrying the client subnet option
/// (a /24 for IPv4, a /56 for IPv6).
pub fn pack_request(name: &str, qtype: u16, ecs: &str) -> Vec<u8> {
    let ecs_ip: Option<IpAddr> = if ecs.is_empty() {
        None
    } else {
        ecs.parse().ok()
    };

    let mut buf = BytesMut::with_capacity(512);
    buf.put_u16(0); // ID
    buf.put_u16(0x0100); // flags: RD
    buf.put_u16(1); // QDCount
    buf.put_u16(0); // ANCount
    buf.put_u16(0); // NSCount
    buf.put_u16(u16::from(ecs_ip.is_some())); // ARCount

    buf.put_slice(&pack_qname(name));
    buf.put_u16(qtype);
    buf.put_u16(1); // QClass: IN

    if let Some(ip) = ecs_ip {
        buf.put_u8(0); // root name
        buf.put_u16(41); // OPT
        buf.put_u16(4096); // UDP payload size
        buf.put_u8(0); // extended RCODE
        buf.put_u8(0); // EDNS version
        buf.put_u16(0x0800); // Z
        match ip {
            IpAddr::V4(v4) => {
                buf.put_u16(11); // RDATA length
                buf.put_u16(8); // option: client subnet
                buf.put_u16(7); // option length
                buf.put_u16(1); // family
                buf.put_u8(24); // source netmask
                buf.put_u8(0); // scope netmask
                buf.put_slice(&v4.octets()[..3]);
            }
            IpAddr::V6(v6) => {
                buf.put_u16(15);
                buf.put_u16(8);
                buf.put_u16(11);
                buf.put_u16(2);
                buf.put_u8(56);
                buf.put_u8(0);
                buf.put_slice(&v6.octets()[..7]);
            }
        }
    }

    buf.to_vec()
}

/// Decode the first question of a request.
///
/// Returns the dotted name, the qtype, and the offset just past the
/// question section, or `None` on any underrun.
pub fn get_qname(buf: &[u8]) -> Option<(String, u16, usize)> {
    if buf.len() < HEADER_LEN + 1 {
        return None;
    }
    let mut offset = HEADER_LEN + 1;
    let mut end = offset + buf[HEADER_LEN] as usize;
    if end > buf.len() {
        return None;
    }
    let mut qname = String::from_utf8_lossy(&buf[offset..end]).into_owned();
    offset = end;

    loop {
        if offset >= buf.len() {
            return None;
        }
        let length = buf[offset] as usize;
        offset += 1;
        if length == 0 {
            break;
        }
        end = offset + length;
        if end > buf.len() {
            return None;
        }
        qname.push('.');
        qname.push_str(&String::from_utf8_lossy(&buf[offset..end]));
        offset = end;
    }

    let qtype = read_u16(buf, offset)?;
    let end = offset + 4;
    if end > buf.len() {
        return None;
    }
    Some((qname, qtype, end))
}

/// Decode a possibly compressed name starting at `offset`.
///
/// Follows this codec's single-byte pointer form a bounded number of
/// times; returns the empty string on underrun.
pub(crate) fn get_name(buf: &[u8], mut offset: usize) -> (String, usize) {
    let mut name = String::new();
    let mut end = 0usize;
    let mut followed = false;
    let mut jumps = 0;

    loop {
        let Some(&length_byte) = buf.get(offset) else {
            return (String::new(), offset);
        };
        let length = length_byte as usize;
        offset += 1;
        if length == 0 {
            break;
        }
        if length < 63 {
            let Some(label) = buf.get(offset..offset + length) else {
                return (String::new(), offset);
            };
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&String::from_utf8_lossy(label));
            offset += length;
            if offset + 2 > buf.len() {
                return (String::new(), offset);
            }
        } else {
            let Some(&target) = buf.get(offset) else {
                return (String::new(), offset);
            };
            if !followed {
                end = offset + 1;
                followed = true;
            }
            jumps += 1;
            if jumps > 8 {
                return (String::new(), end);
            }
            offset = target as usize;
        }
    }

    (name, if followed { end } else { offset })
}

/// Skip a (possibly compressed) name and return the offset just past it.
pub(crate) fn get_name_offset(buf: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        if offset >= buf.len() {
            return None;
        }
        let length = buf[offset] as usize;
        offset += 1;
        if length == 0 {
            break;
        }
        if length < 63 {
            offset += length;
            if offset + 2 > buf.len() {
                return None;
            }
        } else {
            offset += 1;
            break;
        }
    }
    Some(offset)
}

/// Collect the A and AAAA addresses from a response's answer section.
/// CNAMEs are logged, not chased. A malformed section yields no addresses.
pub fn get_answers(response: &[u8]) -> Vec<IpAddr> {
    if response.len() < HEADER_LEN {
        return Vec::new();
    }
    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
    if ancount == 0 {
        return Vec::new();
    }

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        let Some(next) = get_name_offset(response, offset) else {
            return Vec::new();
        };
        offset = next + 4;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        let Some(next) = get_name_offset(response, offset) else {
            return Vec::new();
        };
        offset = next;
        let Some(rtype) = read_u16(response, offset) else {
            return Vec::new();
        };
        offset += 8; // type + class + ttl
        let Some(data_len) = read_u16(response, offset) else {
            return Vec::new();
        };
        offset += 2;

        match rtype {
            QTYPE_A => {
                let Some(data) = response.get(offset..offset + 4) else {
                    return Vec::new();
                };
                ips.push(IpAddr::V4(Ipv4Addr::new(data[0], data[1], data[2], data[3])));
            }
            QTYPE_AAAA => {
                let Some(data) = response.get(offset..offset + 16) else {
                    return Vec::new();
                };
                let mut octets = [0u8; 16];
                octets.copy_from_slice(data);
                ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            QTYPE_CNAME => {
                let (cname, _) = get_name(response, offset);
                debug!(%cname, "answer carries cname");
            }
            _ => {}
        }

        offset += data_len as usize;
    }

    ips
}

fn as_ipv4(ip: &IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Pack the addresses matching `qtype` into answer records.
pub(crate) fn pack_answers(ips: &[IpAddr], qtype: u16) -> (usize, Vec<u8>) {
    let mut count = 0;
    let mut answers = BytesMut::new();
    for ip in ips {
        match as_ipv4(ip) {
            Some(v4) => {
                if qtype == QTYPE_A {
                    count += 1;
                    answers.put_slice(&NAME_POINTER);
                    answers.put_u16(QTYPE_A);
                    answers.put_u16(1); // class IN
                    answers.put_u16(0);
                    answers.put_u16(ANSWER_TTL);
                    answers.put_u16(4);
                    answers.put_slice(&v4.octets());
                }
            }
            None => {
                if qtype == QTYPE_AAAA {
                    if let IpAddr::V6(v6) = ip {
                        count += 1;
                        answers.put_slice(&NAME_POINTER);
                        answers.put_u16(QTYPE_AAAA);
                        answers.put_u16(1);
                        answers.put_u16(0);
                        answers.put_u16(ANSWER_TTL);
                        answers.put_u16(16);
                        answers.put_slice(&v6.octets());
                    }
                }
            }
        }
    }
    (count, answers.to_vec())
}

/// Clone the request into a response carrying the given addresses.
///
/// Sets the QR|RD|RA flags; the answer count is only touched when there
/// is something to append.
pub fn build_response(request: &[u8], ips: &[IpAddr], qtype: u16) -> Vec<u8> {
    let mut response = request.to_vec();
    if response.len() < HEADER_LEN {
        return response;
    }
    response[2] = 0x81;
    response[3] = 0x80;
    if ips.is_empty() {
        return response;
    }

    let (count, answers) = pack_answers(ips, qtype);
    response[6..8].copy_from_slice(&(count as u16).to_be_bytes());
    if count > 0 {
        response.extend_from_slice(&answers);
    }
    response
}

/// Clone the request into a response whose single answer encodes a Nose
/// index: `6.0.<hi>.<lo>` for A, `2000::<id>` for AAAA.
pub fn build_lie(request: &[u8], id: usize, qtype: u16) -> Vec<u8> {
    let mut response = request.to_vec();
    if response.len() < HEADER_LEN {
        return response;
    }
    response[2] = 0x81;
    response[3] = 0x80;
    match qtype {
        QTYPE_A => {
            let mut answer = BytesMut::with_capacity(16);
            answer.put_slice(&NAME_POINTER);
            answer.put_u16(QTYPE_A);
            answer.put_u16(1);
            answer.put_u16(0);
            answer.put_u16(LIE_TTL);
            answer.put_u16(4);
            answer.put_u8(6);
            answer.put_u8(0);
            answer.put_u16(id as u16);
            response.extend_from_slice(&answer);
            response[6..8].copy_from_slice(&1u16.to_be_bytes());
        }
        QTYPE_AAAA => {
            let mut answer = BytesMut::with_capacity(28);
            answer.put_slice(&NAME_POINTER);
            answer.put_u16(QTYPE_AAAA);
            answer.put_u16(1);
            answer.put_u16(0);
            answer.put_u16(LIE_TTL);
            answer.put_u16(16);
            answer.put_u16(0x2000);
            answer.put_slice(&[0u8; 10]);
            answer.put_u32(id as u32);
            response.extend_from_slice(&answer);
            response[6..8].copy_from_slice(&1u16.to_be_bytes());
        }
        _ => {}
    }
    response
}

/// Recover the Nose index a lie address was built with, if it is one of
/// the sentinel forms.
pub fn lie_index(ip: &IpAddr) -> Option<usize> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if o[0] == 6 && o[1] == 0 {
                Some(usize::from(o[2]) << 8 | usize::from(o[3]))
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            if o[0] == 0x20 && o[1] == 0 && o[2..12].iter().all(|&b| b == 0) {
                Some(u32::from_be_bytes([o[12], o[13], o[14], o[15]]) as usize)
            } else {
                None
            }
        }
    }
}
