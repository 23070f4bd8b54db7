use pnet::packet::{Packet, icmp, ipv4};

pub const ICMP_HEADER_SIZE: usize = 8;

/// Fixed payload carried by every echo request.
pub const ECHO_PAYLOAD: &[u8] = b"HELO";

pub(crate) const ECHO_REQUEST_BUFFER_SIZE: usize = ICMP_HEADER_SIZE + ECHO_PAYLOAD.len();

#[derive(thiserror::Error, Debug)]
pub enum PacketError {
    #[error("invalid size")]
    InvalidSize,
    #[error("invalid packet")]
    InvalidPacket,
    #[error("ipv4 header failed to parse")]
    BadIpv4,
    #[error("not an echo reply")]
    NotEchoReply,
}

/// An outbound ICMP echo request (type 8, code 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub ident: u16,
    pub seq_cnt: u16,
}

impl EchoRequest {
    pub fn encode(&self, buffer: &mut [u8]) -> Result<(), PacketError> {
        let mut packet = icmp::echo_request::MutableEchoRequestPacket::new(buffer)
            .ok_or(PacketError::InvalidSize)?;
        packet.set_icmp_type(icmp::IcmpTypes::EchoRequest);
        packet.set_identifier(self.ident);
        packet.set_sequence_number(self.seq_cnt);
        packet.set_payload(ECHO_PAYLOAD);

        let checksum = icmp::checksum(
            &icmp::IcmpPacket::new(packet.packet()).ok_or(PacketError::InvalidSize)?,
        );
        packet.set_checksum(checksum);
        Ok(())
    }
}

/// An inbound ICMP echo reply (type 0), as routed to a probe job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub ident: u16,
    pub seq_cnt: u16,
}

impl EchoReply {
    /// Decode a reply from a raw-socket datagram. Raw ICMP sockets hand back
    /// the full IPv4 datagram, so the IP header is stripped first.
    pub fn decode(buffer: &[u8]) -> Result<Self, PacketError> {
        let ipv4_packet = ipv4::Ipv4Packet::new(buffer).ok_or(PacketError::BadIpv4)?;
        let buffer = ipv4_packet.payload();

        let packet = icmp::IcmpPacket::new(buffer).ok_or(PacketError::InvalidPacket)?;
        if packet.get_icmp_type() != icmp::IcmpTypes::EchoReply {
            return Err(PacketError::NotEchoReply);
        }
        let packet =
            icmp::echo_reply::EchoReplyPacket::new(buffer).ok_or(PacketError::InvalidPacket)?;
        if packet.payload().is_empty() {
            return Err(PacketError::InvalidSize);
        }

        Ok(Self {
            ident: packet.get_identifier(),
            seq_cnt: packet.get_sequence_number(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::MutableIpv4Packet;

    const IPV4_HEADER_SIZE: usize = 20;

    /// Wrap an ICMP message in a minimal IPv4 header, the way the raw socket
    /// hands datagrams to the read loop.
    fn wrap_ipv4(icmp_bytes: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; IPV4_HEADER_SIZE + icmp_bytes.len()];
        let mut packet = MutableIpv4Packet::new(&mut buf).unwrap();
        packet.set_version(4);
        packet.set_header_length(5);
        packet.set_total_length((IPV4_HEADER_SIZE + icmp_bytes.len()) as u16);
        packet.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
        packet.set_payload(icmp_bytes);
        buf
    }

    fn encode_with_type(
        ident: u16,
        seq_cnt: u16,
        icmp_type: icmp::IcmpType,
    ) -> [u8; ECHO_REQUEST_BUFFER_SIZE] {
        let mut buf = [0u8; ECHO_REQUEST_BUFFER_SIZE];
        EchoRequest { ident, seq_cnt }.encode(&mut buf).unwrap();
        let mut packet = icmp::MutableIcmpPacket::new(&mut buf).unwrap();
        packet.set_icmp_type(icmp_type);
        buf
    }

    #[test]
    fn encode_sets_header_fields() {
        let mut buf = [0u8; ECHO_REQUEST_BUFFER_SIZE];
        EchoRequest {
            ident: 0x1234,
            seq_cnt: 7,
        }
        .encode(&mut buf)
        .unwrap();

        let packet = icmp::echo_request::EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(packet.get_icmp_type(), icmp::IcmpTypes::EchoRequest);
        assert_eq!(packet.get_identifier(), 0x1234);
        assert_eq!(packet.get_sequence_number(), 7);
        assert_eq!(packet.payload(), ECHO_PAYLOAD);
        assert_ne!(packet.get_checksum(), 0);
    }

    #[test]
    fn encode_rejects_short_buffer() {
        let mut buf = [0u8; ICMP_HEADER_SIZE - 1];
        let err = EchoRequest {
            ident: 1,
            seq_cnt: 1,
        }
        .encode(&mut buf)
        .unwrap_err();
        assert!(matches!(err, PacketError::InvalidSize));
    }

    #[test]
    fn decode_round_trips_ident_and_seq() {
        let datagram = wrap_ipv4(&encode_with_type(4321, 3, icmp::IcmpTypes::EchoReply));
        let reply = EchoReply::decode(&datagram).unwrap();
        assert_eq!(reply.ident, 4321);
        assert_eq!(reply.seq_cnt, 3);
    }

    #[test]
    fn decode_discards_non_reply_types() {
        // an echo *request* must not be routed as a reply (loopback echoes both)
        let datagram = wrap_ipv4(&encode_with_type(1, 1, icmp::IcmpTypes::EchoRequest));
        assert!(matches!(
            EchoReply::decode(&datagram),
            Err(PacketError::NotEchoReply)
        ));

        let datagram = wrap_ipv4(&encode_with_type(1, 1, icmp::IcmpTypes::DestinationUnreachable));
        assert!(matches!(
            EchoReply::decode(&datagram),
            Err(PacketError::NotEchoReply)
        ));
    }

    #[test]
    fn decode_rejects_truncated_datagram() {
        assert!(EchoReply::decode(&[0u8; 4]).is_err());
    }
}
