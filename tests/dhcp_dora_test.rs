//! End-to-end DHCP DISCOVER -> OFFER -> REQUEST -> ACK, per spec §8
//! scenario 1: the guest should come up on the lowest free pool address
//! and learn the gateway as its router/DNS server.

mod common;

use std::net::Ipv4Addr;

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use mvirt_net::address::Mac;
use mvirt_net::packet::{ParsedPacket, build_udp_datagram, parse};

const GUEST_MAC_OCTETS: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
const XID: u32 = 0x1234;

fn guest_mac() -> Mac {
    Mac::new(GUEST_MAC_OCTETS)
}

fn dhcp_discover_frame() -> Vec<u8> {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest);
    msg.set_xid(XID);
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&GUEST_MAC_OCTETS);
    msg.set_chaddr(&chaddr);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));

    let mut bytes = Vec::new();
    msg.encode(&mut Encoder::new(&mut bytes)).unwrap();

    build_udp_datagram(
        guest_mac(),
        Mac::BROADCAST,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &bytes,
    )
}

fn dhcp_request_frame(requested_ip: Ipv4Addr) -> Vec<u8> {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest);
    msg.set_xid(XID);
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&GUEST_MAC_OCTETS);
    msg.set_chaddr(&chaddr);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Request));
    msg.opts_mut()
        .insert(DhcpOption::RequestedIpAddress(requested_ip));

    let mut bytes = Vec::new();
    msg.encode(&mut Encoder::new(&mut bytes)).unwrap();

    build_udp_datagram(
        guest_mac(),
        Mac::BROADCAST,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &bytes,
    )
}

fn dhcp_message_from_frame(frame: &[u8]) -> Message {
    match parse(frame) {
        Some(ParsedPacket::Udp { datagram, .. }) => {
            Message::decode(&mut Decoder::new(datagram.payload)).expect("valid DHCP message")
        }
        other => panic!("expected a UDP frame carrying DHCP, got {other:?}"),
    }
}

#[tokio::test]
async fn dhcp_dora_assigns_first_pool_address_and_acks() {
    let (router, mut handle, _inbox) = common::start_router(common::base_config()).await;

    handle.inbound_tx.send(dhcp_discover_frame()).unwrap();
    let offer_frame = common::recv_reply(&mut handle).await;
    let offer = dhcp_message_from_frame(&offer_frame);
    assert_eq!(offer.xid(), XID);
    assert_eq!(
        offer.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Offer))
    );
    let offered_ip = offer.yiaddr();
    assert_eq!(offered_ip, Ipv4Addr::new(10, 100, 0, 10));

    handle
        .inbound_tx
        .send(dhcp_request_frame(offered_ip))
        .unwrap();
    let ack_frame = common::recv_reply(&mut handle).await;
    let ack = dhcp_message_from_frame(&ack_frame);
    assert_eq!(ack.xid(), XID);
    assert_eq!(
        ack.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Ack))
    );
    assert_eq!(ack.yiaddr(), offered_ip);
    assert_eq!(
        ack.opts().get(OptionCode::Router),
        Some(&DhcpOption::Router(vec![common::GATEWAY]))
    );

    let snapshot = router.snapshot();
    assert_eq!(snapshot.leases.len(), 1);
    assert_eq!(snapshot.leases[0].ip, offered_ip);
    assert_eq!(snapshot.leases[0].mac, guest_mac());
    // The gateway should also have learned the guest's MAC from the ACK,
    // so a subsequent ARP lookup for it would succeed without a round trip.
    assert!(snapshot.arp_table.iter().any(|(ip, mac)| *ip == offered_ip && *mac == guest_mac()));

    router.stop().unwrap();
}
