//! Spec §8 scenario 5: a guest TCP SYN opens a NAT flow and gets a
//! SYN-ACK back; the guest's ACK completes the handshake, after which
//! payload bytes are relayed to the upstream socket and acked back to
//! the guest — the observable proof that the flow reached `Established`
//! (the router has no public API for per-flow state, only the aggregate
//! entry count from spec §4.9, so the transition is inferred from
//! behavior rather than read directly).

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};

use mvirt_net::address::Mac;
use mvirt_net::packet::{ParsedPacket, TcpFlags, build_tcp_segment, parse};

fn guest_mac() -> Mac {
    Mac::new([0x52, 0x54, 0x00, 0x00, 0x00, 0x02])
}

#[tokio::test]
async fn tcp_syn_reaches_established_and_relays_payload() {
    let (router, mut handle, inbox) = common::start_router(common::base_config()).await;

    let guest_ip = Ipv4Addr::new(10, 100, 0, 40);
    let remote = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);

    let syn = build_tcp_segment(
        guest_mac(),
        router.config().lan.gateway_mac,
        guest_ip,
        *remote.ip(),
        51000,
        remote.port(),
        1000,
        None,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        65535,
        &[],
    );
    handle.inbound_tx.send(syn).unwrap();

    let syn_ack_frame = common::recv_reply(&mut handle).await;
    let (router_isn, guest_next_expected) = match parse(&syn_ack_frame) {
        Some(ParsedPacket::Tcp { segment, .. }) => {
            assert!(segment.flags.syn && segment.flags.ack);
            assert_eq!(segment.ack, Some(1001));
            (segment.seq, segment.ack.unwrap())
        }
        other => panic!("expected SYN-ACK, got {other:?}"),
    };
    assert_eq!(router.snapshot().nat_entries, 1);

    // Guest ACKs the handshake with an HTTP request as payload in the
    // same segment, same as a real TCP stack coalescing the final ACK
    // with the first data segment.
    let request = b"GET / HTTP/1.1\r\n\r\n";
    let ack_with_data = build_tcp_segment(
        guest_mac(),
        router.config().lan.gateway_mac,
        guest_ip,
        *remote.ip(),
        51000,
        remote.port(),
        guest_next_expected,
        Some(router_isn.wrapping_add(1)),
        TcpFlags {
            ack: true,
            ..Default::default()
        },
        65535,
        request,
    );
    handle.inbound_tx.send(ack_with_data).unwrap();

    // The router should ack the received bytes...
    let data_ack = common::recv_reply(&mut handle).await;
    match parse(&data_ack) {
        Some(ParsedPacket::Tcp { segment, .. }) => {
            assert!(segment.flags.ack && !segment.flags.syn && !segment.flags.fin);
            assert_eq!(segment.ack, Some(guest_next_expected + request.len() as u32));
        }
        other => panic!("expected data ACK, got {other:?}"),
    }

    // ...and relay the payload onward to the upstream socket, proving the
    // flow is carrying data (i.e. reached `Established`) rather than
    // still being half-open.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(inbox.sent(remote), vec![request.to_vec()]);

    router.stop().unwrap();
}
