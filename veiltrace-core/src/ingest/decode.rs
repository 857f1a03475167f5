use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use veiltrace_model::{FlowKey, Transport};

/// The flow-relevant fields of one decoded packet.
#[derive(Debug)]
pub(crate) struct DecodedPacket<'a> {
    pub key: FlowKey,
    pub payload: &'a [u8],
}

/// Slice an Ethernet frame down to its 5-tuple and transport payload.
///
/// Returns `None` for anything the pipeline does not aggregate: malformed
/// headers, non-IP network layers, and non-TCP/UDP transports. Callers
/// count these as skipped packets.
pub(crate) fn decode_ethernet(data: &[u8]) -> Option<DecodedPacket<'_>> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src_addr, dst_addr) = match sliced.net.as_ref()? {
        NetSlice::Ipv4(v4) => (
            IpAddr::V4(v4.header().source_addr()),
            IpAddr::V4(v4.header().destination_addr()),
        ),
        NetSlice::Ipv6(v6) => (
            IpAddr::V6(v6.header().source_addr()),
            IpAddr::V6(v6.header().destination_addr()),
        ),
        _ => return None,
    };

    let (transport, src_port, dst_port, payload) =
        match sliced.transport.as_ref()? {
            TransportSlice::Tcp(tcp) => (
                Transport::Tcp,
                tcp.source_port(),
                tcp.destination_port(),
                tcp.payload(),
            ),
            TransportSlice::Udp(udp) => (
                Transport::Udp,
                udp.source_port(),
                udp.destination_port(),
                udp.payload(),
            ),
            _ => return None,
        };

    Some(DecodedPacket {
        key: FlowKey {
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            transport,
        },
        payload,
    })
}
