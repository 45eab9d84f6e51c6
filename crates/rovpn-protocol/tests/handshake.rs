//! End-to-end protocol exercises against a scripted server
//!
//! A minimal in-test server speaks enough of the wire protocol to take a
//! client from hard reset through key exchange, push and data traffic.
//! `PlainCrypto` stands in for TLS so the key-method-2 blobs are readable
//! on the wire and both sides derive data keys through the legacy PRF.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use rovpn_config::ClientConfig;
use rovpn_crypto::{derive_master_secret, CipherKind, KeyBlock, StaticKey};
use rovpn_protocol::{
    ClientState, ControlHeader, ControlWrap, InboundPacket, KeyId, OpCode, PacketReader,
    PacketWriter, PlainCrypto, ProtocolError, ReliableConfig, SessionPacket, SessionPacketHeader,
    TunnelFrame, VpnClient,
};

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

const SERVER_SID: [u8; 8] = *b"SRV-SESS";
const SERVER_RANDOM1: [u8; 32] = [0xA1; 32];
const SERVER_RANDOM2: [u8; 32] = [0xA2; 32];
const PEER_ID: u32 = 7;

/// A recognizable IPv4-looking frame for each direction
const CLIENT_FRAME: [u8; 20] = [
    0x45, 0x00, 0x00, 0x14, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 10, 8, 0, 6, 10, 8,
    0, 1,
];
const SERVER_FRAME: [u8; 20] = [
    0x45, 0x00, 0x00, 0x14, 0x00, 0x02, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 10, 8, 0, 1, 10, 8,
    0, 6,
];

fn client_config(port: u16, wrap_key: Option<&str>) -> ClientConfig {
    let wrapper = match wrap_key {
        Some(pem) => format!("control_wrapper = '''\n{pem}'''\n"),
        None => String::new(),
    };
    ClientConfig::from_toml_str(&format!(
        r#"
            remote_host = "127.0.0.1"
            remote_port = {port}
            {wrapper}
            [control_crypto]
            certificate = "CERT"
            private_key = "KEY"
            ca = "CA"
        "#
    ))
    .expect("test config parses")
}

fn fast_reliable() -> ReliableConfig {
    ReliableConfig {
        initial_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn static_key_pem() -> String {
    let mut body = String::new();
    for line in 0..16u32 {
        for col in 0..16u32 {
            body.push_str(&format!("{:02x}", (line * 16 + col + 13) % 256));
        }
        body.push('\n');
    }
    format!(
        "-----BEGIN OpenVPN Static key V1-----\n{body}-----END OpenVPN Static key V1-----\n"
    )
}

async fn recv_packet(
    socket: &UdpSocket,
    wrap: &mut Option<ControlWrap>,
) -> Result<(SessionPacket, SocketAddr)> {
    let mut buf = [0u8; 4096];
    let (n, addr) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .context("server timed out waiting for a packet")??;
    let raw = &buf[..n];

    let opcode = OpCode::from_byte(raw[0])?;
    let bytes = match wrap {
        Some(w) if opcode.is_control() => w.unwrap(raw)?,
        _ => Bytes::copy_from_slice(raw),
    };
    Ok((SessionPacket::parse(&bytes)?, addr))
}

async fn send_packet(
    socket: &UdpSocket,
    addr: SocketAddr,
    wrap: &mut Option<ControlWrap>,
    packet: SessionPacket,
) -> Result<()> {
    let bytes = packet.serialize()?;
    let bytes = match (&packet.header, wrap) {
        (SessionPacketHeader::Control(_), Some(w)) => w.wrap(&bytes)?,
        _ => bytes,
    };
    socket.send_to(&bytes, addr).await?;
    Ok(())
}

fn control(
    opcode: OpCode,
    acks: Vec<u32>,
    client_sid: Option<[u8; 8]>,
    message_id: Option<u32>,
    payload: &[u8],
) -> SessionPacket {
    SessionPacket {
        header: SessionPacketHeader::Control(ControlHeader {
            opcode,
            key_id: KeyId::default(),
            session_id: SERVER_SID,
            remote_session_id: if acks.is_empty() { None } else { client_sid },
            acks,
            message_id,
        }),
        payload: Bytes::copy_from_slice(payload),
    }
}

struct ClientKeyMethod2 {
    pre_master: [u8; 48],
    random1: [u8; 32],
    random2: [u8; 32],
    occ: String,
}

fn parse_client_km2(data: &[u8]) -> Result<Option<ClientKeyMethod2>> {
    // marker(4) + method(1) + key source(112) + occ length(2)
    if data.len() < 119 {
        return Ok(None);
    }
    let mut r = PacketReader::new(data);
    if r.read_u32()? != 0 {
        bail!("bad key-method marker");
    }
    if r.read_u8()? != 2 {
        bail!("bad key method");
    }
    let pre_master = r.read_array::<48>()?;
    let random1 = r.read_array::<32>()?;
    let random2 = r.read_array::<32>()?;
    let occ_len = r.read_u16()? as usize;
    if r.remaining() < occ_len {
        return Ok(None);
    }
    let raw = r.read_bytes(occ_len)?;
    let occ = String::from_utf8(raw[..raw.len().saturating_sub(1)].to_vec())?;
    Ok(Some(ClientKeyMethod2 {
        pre_master,
        random1,
        random2,
        occ,
    }))
}

fn server_km2(options: &str) -> Bytes {
    let mut w = PacketWriter::new();
    w.write_u32(0);
    w.write_u8(2);
    w.write_bytes(&SERVER_RANDOM1);
    w.write_bytes(&SERVER_RANDOM2);
    let occ = options.as_bytes();
    w.write_u16(occ.len() as u16 + 1);
    w.write_bytes(occ);
    w.write_u8(0);
    w.freeze()
}

/// Drive a client from hard reset to an established session with one data
/// frame exchanged in each direction.
async fn run_scripted_server(socket: UdpSocket, mut wrap: Option<ControlWrap>) -> Result<()> {
    // Hard reset exchange
    let (packet, addr) = recv_packet(&socket, &mut wrap).await?;
    let SessionPacketHeader::Control(reset) = &packet.header else {
        bail!("expected control packet first");
    };
    assert_eq!(reset.opcode, OpCode::HardResetClientV2);
    assert_eq!(reset.message_id, Some(0));
    assert!(reset.acks.is_empty());
    let client_sid = reset.session_id;

    send_packet(
        &socket,
        addr,
        &mut wrap,
        control(OpCode::HardResetServerV2, vec![0], Some(client_sid), Some(0), &[]),
    )
    .await?;

    // Collect the client's key material; the first packet after our reset
    // must piggy-back ACK 0 and carry our session id back.
    let mut app = Vec::new();
    let mut seen = HashSet::new();
    let mut first_after_reset = true;
    let km2 = loop {
        let (packet, _) = recv_packet(&socket, &mut wrap).await?;
        let SessionPacketHeader::Control(header) = &packet.header else {
            bail!("unexpected data packet during key exchange");
        };
        if header.opcode == OpCode::HardResetClientV2 {
            // Retransmitted reset racing our reply; answer it again
            send_packet(
                &socket,
                addr,
                &mut wrap,
                control(OpCode::HardResetServerV2, vec![0], Some(client_sid), Some(0), &[]),
            )
            .await?;
            continue;
        }
        if first_after_reset && header.opcode != OpCode::AckV1 {
            assert!(header.acks.contains(&0), "reset ACK not piggy-backed");
            assert_eq!(header.remote_session_id, Some(SERVER_SID));
            first_after_reset = false;
        }
        if let Some(id) = header.message_id {
            send_packet(
                &socket,
                addr,
                &mut wrap,
                control(OpCode::AckV1, vec![id], Some(client_sid), None, &[]),
            )
            .await?;
            if seen.insert(id) {
                app.extend_from_slice(&packet.payload);
            }
        }
        if let Some(km2) = parse_client_km2(&app)? {
            break km2;
        }
    };
    assert!(km2.occ.starts_with("V4,"), "unexpected OCC string {:?}", km2.occ);

    // Server key material, then wait for PUSH_REQUEST
    send_packet(
        &socket,
        addr,
        &mut wrap,
        control(OpCode::ControlV1, vec![], Some(client_sid), Some(1), &server_km2("V4,dev-type tun")),
    )
    .await?;

    let mut app = Vec::new();
    let mut push_seen = HashSet::new();
    loop {
        let (packet, _) = recv_packet(&socket, &mut wrap).await?;
        let SessionPacketHeader::Control(header) = &packet.header else {
            bail!("unexpected data packet before push");
        };
        if let Some(id) = header.message_id {
            send_packet(
                &socket,
                addr,
                &mut wrap,
                control(OpCode::AckV1, vec![id], Some(client_sid), None, &[]),
            )
            .await?;
            if push_seen.insert(id) {
                app.extend_from_slice(&packet.payload);
            }
        }
        if app.windows(13).any(|w| w == b"PUSH_REQUEST\0") {
            break;
        }
    }

    send_packet(
        &socket,
        addr,
        &mut wrap,
        control(
            OpCode::ControlV1,
            vec![],
            Some(client_sid),
            Some(2),
            b"PUSH_REPLY,ifconfig 10.8.0.6 255.255.255.0,tun-mtu 1500,ping 10,\
              ping-restart 60,topology subnet,cipher AES-256-GCM,peer-id 7\0",
        ),
    )
    .await?;

    // Derive the same keys the client will and exchange one frame each way
    let master = derive_master_secret(&km2.pre_master, &km2.random1, &SERVER_RANDOM1)?;
    let block = KeyBlock::from_master(
        &master,
        &km2.random2,
        &SERVER_RANDOM2,
        &client_sid,
        &SERVER_SID,
    )?;
    let client_dir = block.client_key(CipherKind::Aes256Gcm)?.cipher();
    let server_dir = block.server_key(CipherKind::Aes256Gcm)?.cipher();

    let aad = [OpCode::DataV2.to_byte(KeyId::default())];
    loop {
        let (packet, _) = recv_packet(&socket, &mut wrap).await?;
        let SessionPacketHeader::Data(header) = &packet.header else {
            continue; // stray ACKs
        };
        assert_eq!(header.peer_id, Some(PEER_ID));

        let mut r = PacketReader::new(&packet.payload);
        let packet_id = r.read_u32()?;
        let plaintext = client_dir.open(packet_id, &aad, r.rest())?;
        assert_eq!(plaintext, CLIENT_FRAME);
        break;
    }

    let ciphertext = server_dir.seal(1, &aad, &SERVER_FRAME)?;
    let mut w = PacketWriter::new();
    w.write_u8(aad[0]);
    w.write_u24(PEER_ID);
    w.write_u32(1);
    w.write_bytes(&ciphertext);
    socket.send_to(&w.freeze(), addr).await?;

    Ok(())
}

async fn establish_and_exchange(wrap_pem: Option<String>) -> Result<()> {
    init_tracing();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let server_wrap = wrap_pem
        .as_deref()
        .map(|pem| Ok::<_, anyhow::Error>(ControlWrap::server(&StaticKey::from_pem(pem)?)))
        .transpose()?;
    let server = tokio::spawn(run_scripted_server(socket, server_wrap));

    let config = client_config(port, wrap_pem.as_deref());
    let mut client = VpnClient::with_control_crypto(config, Box::new(PlainCrypto::new()))
        .await?
        .with_reliable_config(fast_reliable());

    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(10), client.connect(&cancel))
        .await
        .context("connect timed out")??;
    assert_eq!(client.state(), ClientState::Established);

    let Some(InboundPacket::Connect(settings)) = client.read() else {
        bail!("expected the Connect event first");
    };
    assert_eq!(settings.peer_id, PEER_ID);
    assert_eq!(settings.cipher, CipherKind::Aes256Gcm);
    assert_eq!(settings.push.tun_mtu, Some(1500));
    assert_eq!(settings.push.ping, Some(10));
    assert_eq!(
        settings.push.ifconfig.as_deref(),
        Some("10.8.0.6 255.255.255.0")
    );

    // Send a frame, then wait for the server's reply frame
    client.write(&CLIENT_FRAME)?;
    client.send(&cancel).await?;

    let frame = loop {
        client.wait_for_data(&cancel).await?;
        client.receive(&cancel).await?;
        if let Some(InboundPacket::Frame(frame)) = client.read() {
            break frame;
        }
        client.send(&cancel).await?;
    };
    match frame {
        TunnelFrame::Ipv4(payload) => assert_eq!(&payload[..], &SERVER_FRAME),
        other => bail!("expected an IPv4 frame, got {other:?}"),
    }

    server.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_establishes_and_exchanges_data() -> Result<()> {
    establish_and_exchange(None).await
}

#[tokio::test]
async fn handshake_with_tls_crypt_wrap() -> Result<()> {
    establish_and_exchange(Some(static_key_pem())).await
}

#[tokio::test]
async fn retransmits_hard_reset_with_unchanged_ids() -> Result<()> {
    init_tracing();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let config = client_config(port, None);
    let mut client = VpnClient::with_control_crypto(config, Box::new(PlainCrypto::new()))
        .await?
        .with_reliable_config(fast_reliable());

    let cancel = CancellationToken::new();
    let driver = {
        let cancel = cancel.clone();
        tokio::spawn(async move { client.connect(&cancel).await })
    };

    // First attempt, then the retransmission: identical ids, no reply sent
    let mut wrap = None;
    let (first, _) = recv_packet(&socket, &mut wrap).await?;
    let (second, _) = recv_packet(&socket, &mut wrap).await?;

    for packet in [&first, &second] {
        let SessionPacketHeader::Control(header) = &packet.header else {
            bail!("expected a control packet");
        };
        assert_eq!(header.opcode, OpCode::HardResetClientV2);
        assert_eq!(header.message_id, Some(0));
    }
    assert_eq!(first.header, second.header);

    cancel.cancel();
    let result = driver.await?;
    assert!(matches!(result, Err(ProtocolError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn control_timeout_after_retry_budget() -> Result<()> {
    init_tracing();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let config = client_config(port, None);
    let mut client = VpnClient::with_control_crypto(config, Box::new(PlainCrypto::new()))
        .await?
        .with_reliable_config(ReliableConfig {
            initial_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(20),
            max_retries: 3,
            ..Default::default()
        });

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(5), client.connect(&cancel)).await?;
    assert!(matches!(result, Err(ProtocolError::ControlTimeout)));
    assert_eq!(client.state(), ClientState::Failed);
    Ok(())
}

#[tokio::test]
async fn auth_failed_surfaces_from_connect() -> Result<()> {
    init_tracing();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let config = client_config(port, None);
    let client = VpnClient::with_control_crypto(config, Box::new(PlainCrypto::new()))
        .await?
        .with_reliable_config(fast_reliable());

    let cancel = CancellationToken::new();
    let driver = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut client = client;
            let result = client.connect(&cancel).await;
            (result, client.state())
        })
    };

    let mut wrap = None;
    let (packet, addr) = recv_packet(&socket, &mut wrap).await?;
    let SessionPacketHeader::Control(reset) = &packet.header else {
        bail!("expected hard reset");
    };
    let client_sid = reset.session_id;
    send_packet(
        &socket,
        addr,
        &mut wrap,
        control(OpCode::HardResetServerV2, vec![0], Some(client_sid), Some(0), &[]),
    )
    .await?;

    // Swallow the key material, then reject it
    loop {
        let (packet, _) = recv_packet(&socket, &mut wrap).await?;
        let SessionPacketHeader::Control(header) = &packet.header else {
            continue;
        };
        if let Some(id) = header.message_id {
            send_packet(
                &socket,
                addr,
                &mut wrap,
                control(OpCode::AckV1, vec![id], Some(client_sid), None, &[]),
            )
            .await?;
            if !packet.payload.is_empty() {
                break;
            }
        }
    }
    send_packet(
        &socket,
        addr,
        &mut wrap,
        control(
            OpCode::ControlV1,
            vec![],
            Some(client_sid),
            Some(1),
            b"AUTH_FAILED,bad credentials\0",
        ),
    )
    .await?;

    let (result, state) = driver.await?;
    match result {
        Err(ProtocolError::AuthFailed(reason)) => assert_eq!(reason, "bad credentials"),
        other => bail!("expected AuthFailed, got {other:?}"),
    }
    assert_eq!(state, ClientState::Failed);
    Ok(())
}
