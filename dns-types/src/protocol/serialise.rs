use std::collections::HashMap;
use std::fmt;

use crate::protocol::types::*;

/// Serialise a full DNS message to wire format.
///
/// Owner names, and names appearing in RDATA that this server
/// understands, are compressed with pointers to previous occurrences
/// of the same name, per section 4.1.4 of RFC 1035.  Uncompressible
/// names (a name this server does not interpret, inside
/// `NotImplemented`/`Unknown` RDATA) are written out in full.
pub fn serialise_message(message: &Message) -> Result<Vec<u8>, Error> {
    let mut buffer = WritableBuffer::default();

    buffer.write_u16(message.header.id);

    let mut flags1 = 0u8;
    if message.header.is_response {
        flags1 |= HEADER_MASK_QR;
    }
    flags1 |= u8::from(message.header.opcode) << HEADER_OFFSET_OPCODE;
    if message.header.is_authoritative {
        flags1 |= HEADER_MASK_AA;
    }
    if message.header.is_truncated {
        flags1 |= HEADER_MASK_TC;
    }
    if message.header.recursion_desired {
        flags1 |= HEADER_MASK_RD;
    }
    buffer.write_u8(flags1);

    let mut flags2 = 0u8;
    if message.header.recursion_available {
        flags2 |= HEADER_MASK_RA;
    }
    flags2 |= u8::from(message.header.rcode) << HEADER_OFFSET_RCODE;
    buffer.write_u8(flags2);

    buffer.write_u16(u16::try_from(message.questions.len()).map_err(|_| Error::TooManyRecords)?);
    buffer.write_u16(u16::try_from(message.answers.len()).map_err(|_| Error::TooManyRecords)?);
    buffer.write_u16(u16::try_from(message.authority.len()).map_err(|_| Error::TooManyRecords)?);
    buffer.write_u16(u16::try_from(message.additional.len()).map_err(|_| Error::TooManyRecords)?);

    for question in &message.questions {
        buffer.write_domain_name(&question.name);
        buffer.write_u16(question.qtype.into());
        buffer.write_u16(question.qclass.into());
    }

    for rr in &message.answers {
        serialise_rr(&mut buffer, rr)?;
    }
    for rr in &message.authority {
        serialise_rr(&mut buffer, rr)?;
    }
    for rr in &message.additional {
        serialise_rr(&mut buffer, rr)?;
    }

    Ok(buffer.octets)
}

fn serialise_rr(buffer: &mut WritableBuffer, rr: &ResourceRecord) -> Result<(), Error> {
    buffer.write_domain_name(&rr.name);
    buffer.write_u16(rr.rtype_with_data.rtype().into());
    buffer.write_u16(rr.rclass.into());
    buffer.write_u32(rr.ttl);

    let rdlength_index = buffer.octets.len();
    buffer.write_u16(0);
    let rdata_start = buffer.octets.len();

    match &rr.rtype_with_data {
        RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
        RecordTypeWithData::NS { nsdname } => buffer.write_domain_name(nsdname),
        RecordTypeWithData::CNAME { cname } => buffer.write_domain_name(cname),
        RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            buffer.write_domain_name(mname);
            buffer.write_domain_name(rname);
            buffer.write_u32(*serial);
            buffer.write_u32(*refresh);
            buffer.write_u32(*retry);
            buffer.write_u32(*expire);
            buffer.write_u32(*minimum);
        }
        RecordTypeWithData::PTR { ptrdname } => buffer.write_domain_name(ptrdname),
        RecordTypeWithData::MX {
            preference,
            exchange,
        } => {
            buffer.write_u16(*preference);
            buffer.write_domain_name(exchange);
        }
        RecordTypeWithData::TXT { segments } => {
            for segment in segments {
                let len = u8::try_from(segment.len()).map_err(|_| Error::TxtSegmentTooLong)?;
                buffer.write_u8(len);
                buffer.write_octets(segment);
            }
        }
        RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
        RecordTypeWithData::SRV {
            priority,
            weight,
            port,
            target,
        } => {
            buffer.write_u16(*priority);
            buffer.write_u16(*weight);
            buffer.write_u16(*port);
            buffer.write_domain_name(target);
        }
        RecordTypeWithData::CAA { flags, tag, value } => {
            buffer.write_u8(*flags);
            let tag_len = u8::try_from(tag.len()).map_err(|_| Error::CaaTagTooLong)?;
            buffer.write_u8(tag_len);
            buffer.write_octets(tag);
            buffer.write_octets(value);
        }
        RecordTypeWithData::NotImplemented { rtype, .. } => {
            return Err(Error::NotImplemented(*rtype));
        }
        RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
    }

    let rdlength = buffer.octets.len() - rdata_start;
    let rdlength = u16::try_from(rdlength).map_err(|_| Error::RdataTooLong)?;
    buffer.octets[rdlength_index..rdlength_index + 2].copy_from_slice(&rdlength.to_be_bytes());

    Ok(())
}

/// An append-only byte buffer tracking which domain names have
/// already been written, so subsequent occurrences can be replaced
/// with a compression pointer.
#[derive(Default)]
struct WritableBuffer {
    octets: Vec<u8>,
    name_offsets: HashMap<Vec<Label>, u16>,
}

impl WritableBuffer {
    fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }

    /// Write a domain name, compressing as much of its label suffix
    /// as has already been written.  The 14 low bits of an offset
    /// limit pointer targets to the first 16384 bytes of the message,
    /// which is enforced by only recording/using offsets that fit.
    fn write_domain_name(&mut self, name: &DomainName) {
        let labels = &name.labels;

        for i in 0..labels.len() {
            let suffix = &labels[i..];
            if let Some(offset) = self.name_offsets.get(&suffix.to_vec()) {
                self.write_u16(0b1100_0000_0000_0000 | offset);
                return;
            }

            if let Ok(offset) = u16::try_from(self.octets.len()) {
                if offset <= 0b0011_1111_1111_1111 {
                    self.name_offsets.insert(suffix.to_vec(), offset);
                }
            }

            self.write_u8(labels[i].len());
            self.write_octets(labels[i].octets());
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    TooManyRecords,
    RdataTooLong,
    TxtSegmentTooLong,
    CaaTagTooLong,
    NotImplemented(RecordType),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TooManyRecords => write!(f, "too many records in one section"),
            Error::RdataTooLong => write!(f, "rdata exceeds 65535 octets"),
            Error::TxtSegmentTooLong => write!(f, "TXT segment exceeds 255 octets"),
            Error::CaaTagTooLong => write!(f, "CAA tag exceeds 255 octets"),
            Error::NotImplemented(rtype) => write!(f, "cannot serialise {rtype} rdata"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::deserialise::deserialise_message;
    use crate::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    #[test]
    fn roundtrips_simple_query() {
        let message = Message::from_question(
            1234,
            question("example.com.", QueryType::Record(RecordType::A)),
        );
        let octets = serialise_message(&message).unwrap();
        let parsed = deserialise_message(&octets).unwrap();
        assert_eq!(message.header.id, parsed.header.id);
        assert_eq!(message.questions, parsed.questions);
    }

    #[test]
    fn compresses_repeated_names() {
        let mut message = Message::from_question(
            1,
            question("example.com.", QueryType::Record(RecordType::A)),
        );
        message.header.is_response = true;
        message.answers.push(a_record("example.com.", Ipv4Addr::new(93, 184, 216, 34)));
        message.answers.push(a_record("example.com.", Ipv4Addr::new(93, 184, 216, 35)));

        let compressed = serialise_message(&message).unwrap();

        let mut uncompressed_answers = Vec::new();
        for answer in &message.answers {
            uncompressed_answers.push(answer.name.to_dotted_string());
        }

        // two identical owner names plus the question name should
        // compress to far less than three uncompressed copies
        assert!(compressed.len() < 12 + 3 * (5 + "example.com".len() + 20));
    }

    #[test]
    fn rejects_not_implemented_rdata() {
        let rr = ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::NotImplemented {
                rtype: RecordType::DNSKEY,
                octets: bytes::Bytes::from_static(b"\x00"),
            },
            rclass: RecordClass::IN,
            ttl: 300,
            origin: Origin::Authoritative,
            expires_at: None,
        };
        let mut message = Message::from_question(
            1,
            question("example.com.", QueryType::Record(RecordType::DNSKEY)),
        );
        message.header.is_response = true;
        message.answers.push(rr);

        assert_eq!(
            serialise_message(&message),
            Err(Error::NotImplemented(RecordType::DNSKEY))
        );
    }
}
