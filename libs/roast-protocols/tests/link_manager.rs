//! Link manager against scripted and emulated devices
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use roast_comlink::{
    Clock, ManualClock, MockHandle, MockTransport, SystemClock, TransportConfig, TransportKind,
};
use roast_protocols::modbus::rtu;
use roast_protocols::s7::reply;
use roast_protocols::{
    FrameError, LinkError, LinkEvent, LinkManager, ModbusOp, ModbusRequest, ModbusResponse,
    LinkState, ModbusSlave, Protocol, Request, Response, S7Area, S7Request, S7Response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_test::traced_test;

fn read_holding(address: u16) -> Request {
    Request::Modbus(ModbusRequest::new(
        1,
        ModbusOp::ReadHoldingRegisters { address, count: 1 },
    ))
}

fn modbus_link(
    config: TransportConfig,
    mock: MockTransport,
) -> (LinkManager, MockHandle, Arc<ManualClock>) {
    let handle = mock.handle();
    let clock = Arc::new(ManualClock::new());
    let link = LinkManager::with_transport(
        "roaster",
        config,
        Protocol::ModbusRtu.codec(0, 0),
        Box::new(mock),
        clock.clone(),
    );
    (link, handle, clock)
}

fn corrupt(mut frame: Vec<u8>) -> Vec<u8> {
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;
    frame
}

#[tokio::test]
async fn test_crc_errors_exhaust_retries_and_report_once() {
    let config = TransportConfig::serial("COM4", 9600).with_retries(2);
    let (link, handle, _clock) = modbus_link(config, MockTransport::new("COM4"));
    let mut events = link.subscribe();

    let good = rtu::encode_response(1, 0x03, &ModbusResponse::Registers(vec![1452]));
    for _ in 0..6 {
        handle.push_reply(corrupt(good.clone()));
    }

    let err = link.request(&read_holding(0)).await.unwrap_err();
    assert!(matches!(err, LinkError::CommunicationFailed { attempts: 3, .. }));
    assert!(matches!(
        err.root(),
        LinkError::Frame(FrameError::CrcMismatch { .. })
    ));
    assert_eq!(handle.sent_count(), 3);
    assert!(!link.is_healthy());

    // A second failing request does not repeat the error event
    assert!(link.request(&read_holding(0)).await.is_err());
    assert_eq!(handle.sent_count(), 6);

    handle.push_reply(good);
    let response = link.request(&read_holding(0)).await.unwrap();
    assert_eq!(response, Response::Modbus(ModbusResponse::Registers(vec![1452])));

    assert!(matches!(
        events.try_recv(),
        Ok(LinkEvent::CommunicationError { ref link, .. }) if link == "roaster"
    ));
    assert_eq!(
        events.try_recv(),
        Ok(LinkEvent::CommunicationResumed {
            link: "roaster".to_string()
        })
    );
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_retry_delay_runs_on_injected_clock() {
    let mut config = TransportConfig::serial("COM4", 9600).with_retries(3);
    config.inter_command_delay_ms = 250;
    let (link, handle, clock) = modbus_link(config, MockTransport::new("COM4"));
    for _ in 0..4 {
        handle.push_silence();
    }

    let err = link.request(&read_holding(0)).await.unwrap_err();
    assert!(matches!(err, LinkError::CommunicationFailed { attempts: 4, .. }));
    assert_eq!(clock.now(), Duration::from_millis(750));
}

#[tokio::test]
async fn test_concurrent_requests_never_interleave() {
    let config = TransportConfig::serial("COM5", 19200);
    let (link, handle, _clock) = modbus_link(config, MockTransport::new("COM5"));
    let slave = ModbusSlave::new(1);
    for address in 0..8 {
        slave.set_holding(address, 100 + address);
    }
    let responder = slave.clone();
    handle.set_responder(move |frame| responder.respond_rtu(frame));

    let link = Arc::new(link);
    let requests: Vec<_> = (0..8u16)
        .map(|address| {
            let link = link.clone();
            async move { (address, link.request(&read_holding(address)).await) }
        })
        .collect();

    for (address, result) in join_all(requests).await {
        assert_eq!(
            result.unwrap(),
            Response::Modbus(ModbusResponse::Registers(vec![100 + address]))
        );
    }
    assert_eq!(handle.sent_count(), 8);
    assert_eq!(slave.requests().len(), 8);
}

#[tokio::test]
async fn test_reset_on_error_reopens_socket() {
    let mut config = TransportConfig::tcp("127.0.0.1:502").with_retries(1);
    config.reset_on_error = true;
    let mock = MockTransport::new("127.0.0.1:502").with_kind(TransportKind::Tcp);
    let (link, handle, _clock) = modbus_link(config, mock);

    handle.push_silence();
    handle.push_reply(rtu::encode_response(
        1,
        0x03,
        &ModbusResponse::Registers(vec![9]),
    ));

    link.request(&read_holding(0)).await.unwrap();
    assert_eq!(handle.disconnect_count(), 1);
    assert_eq!(handle.connect_count(), 2);
}

#[tokio::test]
async fn test_serial_link_is_not_reset() {
    let mut config = TransportConfig::serial("COM6", 9600).with_retries(1);
    config.reset_on_error = true;
    let (link, handle, _clock) = modbus_link(config, MockTransport::new("COM6"));

    handle.push_silence();
    handle.push_reply(rtu::encode_response(
        1,
        0x03,
        &ModbusResponse::Registers(vec![9]),
    ));

    link.request(&read_holding(0)).await.unwrap();
    assert_eq!(handle.disconnect_count(), 0);
    assert_eq!(handle.connect_count(), 1);
}

#[traced_test]
#[tokio::test]
async fn test_resumed_is_logged_with_family() {
    let config = TransportConfig::serial("COM7", 9600);
    let (link, handle, _clock) = modbus_link(config, MockTransport::new("COM7"));

    handle.push_silence();
    assert!(link.request(&read_holding(0)).await.is_err());
    handle.push_reply(rtu::encode_response(
        1,
        0x03,
        &ModbusResponse::Registers(vec![1]),
    ));
    assert!(link.request(&read_holding(0)).await.is_ok());

    assert!(logs_contain("Modbus Communication Error"));
    assert!(logs_contain("Modbus Communication Resumed"));
}

#[tokio::test]
async fn test_s7_link_handshakes_then_reads() {
    let mock = MockTransport::new("192.168.0.1:102").with_kind(TransportKind::Tcp);
    let handle = mock.handle();
    handle.set_responder(|frame| {
        // COTP connection request
        if frame.get(5) == Some(&0xE0) {
            return Some(reply::connection_confirm());
        }
        let pdu_ref = u16::from_be_bytes([frame[11], frame[12]]);
        match frame[17] {
            0xF0 => Some(reply::setup_ack(pdu_ref, 480)),
            0x04 => Some(reply::read_ack(pdu_ref, &[0x07, 0xD0])),
            _ => None,
        }
    });

    let link = LinkManager::with_transport(
        "plc",
        TransportConfig::tcp("192.168.0.1:102"),
        Protocol::S7.codec(0, 1),
        Box::new(mock),
        Arc::new(ManualClock::new()),
    );
    assert_eq!(link.family(), "S7");

    let request = Request::S7(S7Request::Read {
        area: S7Area::DataBlock,
        db: 2,
        start: 10,
        size: 2,
    });
    let response = link.request(&request).await.unwrap();
    assert_eq!(response, Response::S7(S7Response::Data(vec![0x07, 0xD0])));
    // Connection request, setup communication, read var
    assert_eq!(handle.sent_count(), 3);

    link.request(&request).await.unwrap();
    assert_eq!(handle.sent_count(), 4);
}

#[tokio::test]
async fn test_s7_handshake_failure_leaves_link_failed() {
    let mock = MockTransport::new("192.168.0.1:102").with_kind(TransportKind::Tcp);
    let handle = mock.handle();
    // PLC never confirms the connection
    handle.set_responder(|_| None);

    let link = LinkManager::with_transport(
        "plc",
        TransportConfig::tcp("192.168.0.1:102").with_retries(3),
        Protocol::S7.codec(0, 1),
        Box::new(mock),
        Arc::new(ManualClock::new()),
    );
    let request = Request::S7(S7Request::Read {
        area: S7Area::Flags,
        db: 0,
        start: 0,
        size: 1,
    });
    assert!(matches!(
        link.request(&request).await,
        Err(LinkError::PortUnavailable(_))
    ));
    assert!(matches!(
        link.request(&request).await,
        Err(LinkError::PortUnavailable(_))
    ));
    // Only the first connection request went out
    assert_eq!(handle.sent_count(), 1);
}

#[tokio::test]
async fn test_dropped_connection_reopens_before_next_request() {
    let config = TransportConfig::tcp("127.0.0.1:502");
    let mock = MockTransport::new("127.0.0.1:502").with_kind(TransportKind::Tcp);
    let (link, handle, _clock) = modbus_link(config, mock);
    let reply = rtu::encode_response(1, 0x03, &ModbusResponse::Registers(vec![3]));

    handle.push_reply(reply.clone());
    link.request(&read_holding(0)).await.unwrap();

    handle.drop_connection();
    handle.push_reply(reply);
    link.request(&read_holding(0)).await.unwrap();
    assert_eq!(handle.connect_count(), 2);
    assert_eq!(link.state().await, LinkState::Connected);
}

#[tokio::test]
async fn test_failed_reconnect_stays_transient() {
    let config = TransportConfig::tcp("127.0.0.1:502").with_retries(2);
    let mock = MockTransport::new("127.0.0.1:502").with_kind(TransportKind::Tcp);
    let (link, handle, _clock) = modbus_link(config, mock);
    let mut events = link.subscribe();
    let reply = rtu::encode_response(1, 0x03, &ModbusResponse::Registers(vec![3]));

    handle.push_reply(reply.clone());
    link.request(&read_holding(0)).await.unwrap();

    // Device briefly unreachable
    handle.drop_connection();
    handle.fail_connect(true);
    let err = link.request(&read_holding(0)).await.unwrap_err();
    assert!(matches!(err, LinkError::CommunicationFailed { attempts: 3, .. }));
    assert!(matches!(err.root(), LinkError::Reconnect(_)));
    assert_eq!(link.state().await, LinkState::Lost);
    assert!(!link.is_healthy());

    handle.fail_connect(false);
    handle.push_reply(reply);
    link.request(&read_holding(0)).await.unwrap();
    assert!(link.is_healthy());
    assert!(matches!(
        events.try_recv(),
        Ok(LinkEvent::CommunicationError { .. })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(LinkEvent::CommunicationResumed { .. })
    ));
}

#[tokio::test]
async fn test_tcp_link_recovers_after_peer_closes() {
    let slave = ModbusSlave::new(1);
    slave.set_holding(0, 2105);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    // First connection answers once and hangs up, later ones are served normally
    let server = slave.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = [0u8; 260];
        let n = stream.read(&mut buffer).await.unwrap();
        let reply = server.respond_tcp(&buffer[..n]).unwrap();
        stream.write_all(&reply).await.unwrap();
        drop(stream);
        server.serve_tcp(listener).await;
    });

    let mut config = TransportConfig::tcp(address.to_string()).with_retries(1);
    config.timeout_ms = 1000;
    let link = LinkManager::new(
        "roaster",
        config,
        Protocol::ModbusTcp.codec(0, 0),
        Arc::new(SystemClock::new()),
    );

    let expected = Response::Modbus(ModbusResponse::Registers(vec![2105]));
    assert_eq!(link.request(&read_holding(0)).await.unwrap(), expected);
    for _ in 0..3 {
        assert_eq!(link.request(&read_holding(0)).await.unwrap(), expected);
    }
    assert_eq!(link.state().await, LinkState::Connected);
    link.shutdown().await;
}
