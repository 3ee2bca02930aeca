use std::fmt;

use bytes::Bytes;

use crate::protocol::types::*;

/// Deserialise a full DNS message from wire format.
pub fn deserialise_message(octets: &[u8]) -> Result<Message, Error> {
    let mut buffer = ConsumableBuffer::new(octets);

    let id = buffer.read_u16().ok_or(Error::Incomplete)?;
    let flags1 = buffer.read_u8().ok_or(Error::Incomplete)?;
    let flags2 = buffer.read_u8().ok_or(Error::Incomplete)?;

    let is_response = flags1 & HEADER_MASK_QR != 0;
    let opcode = Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE);
    let is_authoritative = flags1 & HEADER_MASK_AA != 0;
    let is_truncated = flags1 & HEADER_MASK_TC != 0;
    let recursion_desired = flags1 & HEADER_MASK_RD != 0;
    let recursion_available = flags2 & HEADER_MASK_RA != 0;
    let rcode = Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE);

    let qdcount = buffer.read_u16().ok_or(Error::Incomplete)?;
    let ancount = buffer.read_u16().ok_or(Error::Incomplete)?;
    let nscount = buffer.read_u16().ok_or(Error::Incomplete)?;
    let arcount = buffer.read_u16().ok_or(Error::Incomplete)?;

    let mut questions = Vec::with_capacity(qdcount.into());
    for _ in 0..qdcount {
        let name = buffer.read_domain_name()?;
        let qtype = QueryType::from(buffer.read_u16().ok_or(Error::Incomplete)?);
        let qclass = QueryClass::from(buffer.read_u16().ok_or(Error::Incomplete)?);
        questions.push(Question {
            id,
            name,
            qtype,
            qclass,
        });
    }

    let mut answers = Vec::with_capacity(ancount.into());
    for _ in 0..ancount {
        answers.push(deserialise_rr(&mut buffer)?);
    }

    let mut authority = Vec::with_capacity(nscount.into());
    for _ in 0..nscount {
        authority.push(deserialise_rr(&mut buffer)?);
    }

    let mut additional = Vec::with_capacity(arcount.into());
    for _ in 0..arcount {
        additional.push(deserialise_rr(&mut buffer)?);
    }

    Ok(Message {
        header: Header {
            id,
            is_response,
            opcode,
            is_authoritative,
            is_truncated,
            recursion_desired,
            recursion_available,
            rcode,
        },
        questions,
        answers,
        authority,
        additional,
    })
}

fn deserialise_rr(buffer: &mut ConsumableBuffer) -> Result<ResourceRecord, Error> {
    let name = buffer.read_domain_name()?;
    let rtype = RecordType::from(buffer.read_u16().ok_or(Error::Incomplete)?);
    let rclass = RecordClass::from(buffer.read_u16().ok_or(Error::Incomplete)?);
    let ttl = buffer.read_u32().ok_or(Error::Incomplete)?;
    let rdlength = buffer.read_u16().ok_or(Error::Incomplete)?;

    let rdata_start = buffer.position;
    let rdata = buffer
        .peek_octets(rdlength.into())
        .ok_or(Error::Incomplete)?;

    let rtype_with_data = if rtype.is_not_implemented() {
        buffer.position += usize::from(rdlength);
        RecordTypeWithData::NotImplemented {
            rtype,
            octets: Bytes::copy_from_slice(rdata),
        }
    } else {
        match rtype {
            RecordType::A => {
                let octets = buffer.read_octets(4).ok_or(Error::Incomplete)?;
                RecordTypeWithData::A {
                    address: std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
                }
            }
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: buffer.read_domain_name()?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: buffer.read_domain_name()?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: buffer.read_domain_name()?,
                rname: buffer.read_domain_name()?,
                serial: buffer.read_u32().ok_or(Error::Incomplete)?,
                refresh: buffer.read_u32().ok_or(Error::Incomplete)?,
                retry: buffer.read_u32().ok_or(Error::Incomplete)?,
                expire: buffer.read_u32().ok_or(Error::Incomplete)?,
                minimum: buffer.read_u32().ok_or(Error::Incomplete)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: buffer.read_domain_name()?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.read_u16().ok_or(Error::Incomplete)?,
                exchange: buffer.read_domain_name()?,
            },
            RecordType::TXT => {
                let mut segments = Vec::new();
                let end = rdata_start + usize::from(rdlength);
                while buffer.position < end {
                    let len = buffer.read_u8().ok_or(Error::Incomplete)?;
                    let segment = buffer.read_octets(len.into()).ok_or(Error::Incomplete)?;
                    segments.push(Bytes::copy_from_slice(segment));
                }
                RecordTypeWithData::TXT { segments }
            }
            RecordType::AAAA => {
                let octets = buffer.read_octets(16).ok_or(Error::Incomplete)?;
                let mut arr = [0u8; 16];
                arr.copy_from_slice(octets);
                RecordTypeWithData::AAAA {
                    address: std::net::Ipv6Addr::from(arr),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.read_u16().ok_or(Error::Incomplete)?,
                weight: buffer.read_u16().ok_or(Error::Incomplete)?,
                port: buffer.read_u16().ok_or(Error::Incomplete)?,
                target: buffer.read_domain_name()?,
            },
            RecordType::CAA => {
                let flags = buffer.read_u8().ok_or(Error::Incomplete)?;
                let tag_len = buffer.read_u8().ok_or(Error::Incomplete)?;
                let tag = buffer.read_octets(tag_len.into()).ok_or(Error::Incomplete)?;
                let end = rdata_start + usize::from(rdlength);
                let value_len = end.checked_sub(buffer.position).ok_or(Error::FormatError)?;
                let value = buffer.read_octets(value_len).ok_or(Error::Incomplete)?;
                RecordTypeWithData::CAA {
                    flags,
                    tag: Bytes::copy_from_slice(tag),
                    value: Bytes::copy_from_slice(value),
                }
            }
            RecordType::Unknown(tag) => {
                buffer.position += usize::from(rdlength);
                RecordTypeWithData::Unknown {
                    tag,
                    octets: Bytes::copy_from_slice(rdata),
                }
            }
            RecordType::OPT
            | RecordType::NAPTR
            | RecordType::DS
            | RecordType::RRSIG
            | RecordType::NSEC
            | RecordType::DNSKEY
            | RecordType::TLSA
            | RecordType::SVCB
            | RecordType::HTTPS => unreachable!("handled by is_not_implemented above"),
        }
    };

    if buffer.position != rdata_start + usize::from(rdlength) {
        return Err(Error::FormatError);
    }

    Ok(ResourceRecord {
        name,
        rtype_with_data,
        rclass,
        ttl,
        origin: Origin::Cached,
        expires_at: None,
    })
}

/// A cursor over a byte buffer, tracking position for sequential
/// reads and supporting the jump-to-offset behaviour compression
/// pointers need.
struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    fn new(octets: &'a [u8]) -> Self {
        Self { octets, position: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let octet = *self.octets.get(self.position)?;
        self.position += 1;
        Some(octet)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn read_u32(&mut self) -> Option<u32> {
        let a = self.read_u8()?;
        let b = self.read_u8()?;
        let c = self.read_u8()?;
        let d = self.read_u8()?;
        Some(u32::from_be_bytes([a, b, c, d]))
    }

    fn read_octets(&mut self, len: usize) -> Option<&'a [u8]> {
        let octets = self.peek_octets(len)?;
        self.position += len;
        Some(octets)
    }

    fn peek_octets(&self, len: usize) -> Option<&'a [u8]> {
        self.octets.get(self.position..self.position + len)
    }

    /// Read a domain name, following compression pointers.  Each
    /// pointer must point strictly backwards relative to the point at
    /// which it is encountered, which bounds the number of pointers
    /// that can be followed by the message length and rules out
    /// pointer loops.
    fn read_domain_name(&mut self) -> Result<DomainName, Error> {
        let mut labels = Vec::new();
        let mut cursor = self.position;
        let mut jumped = false;
        let mut furthest_pointer_target = cursor;
        let mut post_pointer_position = None;

        loop {
            let len = *self.octets.get(cursor).ok_or(Error::Incomplete)?;

            if len == 0 {
                labels.push(Label::new());
                cursor += 1;
                break;
            } else if len & 0b1100_0000 == 0b1100_0000 {
                let hi = len & 0b0011_1111;
                let lo = *self.octets.get(cursor + 1).ok_or(Error::Incomplete)?;
                let target = usize::from(u16::from_be_bytes([hi, lo]));

                if !jumped {
                    post_pointer_position = Some(cursor + 2);
                }

                // a pointer must strictly decrease, or we could loop
                // forever chasing pointers that point forward or at
                // themselves
                if target >= furthest_pointer_target {
                    return Err(Error::FormatError);
                }
                furthest_pointer_target = target;

                jumped = true;
                cursor = target;
            } else if len & 0b1100_0000 != 0 {
                return Err(Error::FormatError);
            } else {
                let label_start = cursor + 1;
                let label_end = label_start + usize::from(len);
                let octets = self
                    .octets
                    .get(label_start..label_end)
                    .ok_or(Error::Incomplete)?;
                let label = Label::try_from(octets).map_err(|_| Error::FormatError)?;
                labels.push(label);
                cursor = label_end;
            }
        }

        self.position = post_pointer_position.unwrap_or(cursor);

        DomainName::from_labels(labels).ok_or(Error::FormatError)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The buffer ended before a complete message could be read.
    Incomplete,
    /// The buffer contained bytes that do not form a valid message:
    /// an oversized name, a forward or self-referential compression
    /// pointer, a length field that does not match what was decoded.
    FormatError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => write!(f, "message ended unexpectedly"),
            Error::FormatError => write!(f, "message is not well-formed"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::serialise::serialise_message;
    use crate::protocol::types::test_util::*;

    #[test]
    fn rejects_forward_pointer() {
        // a name pointing forward at itself: must be rejected rather
        // than looping forever
        let octets = vec![
            0x00, 0x01, // id
            0x00, 0x00, // flags
            0x00, 0x01, // qdcount
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // an/ns/ar count
            0xc0, 0x0c, // pointer to offset 12, i.e. itself
            0x00, 0x01, 0x00, 0x01,
        ];
        assert_eq!(deserialise_message(&octets), Err(Error::FormatError));
    }

    #[test]
    fn roundtrips_a_record_response() {
        let mut message = Message::from_question(
            42,
            question("example.com.", QueryType::Record(RecordType::A)),
        );
        message.header.is_response = true;
        message
            .answers
            .push(a_record("example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4)));

        let octets = serialise_message(&message).unwrap();
        let parsed = deserialise_message(&octets).unwrap();

        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].rtype_with_data, message.answers[0].rtype_with_data);
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(deserialise_message(&[0, 1, 2]), Err(Error::Incomplete));
    }
}
