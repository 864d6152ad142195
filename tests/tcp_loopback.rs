//! End-to-end tests over a real loopback TCP connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use modbus_node::{
    BitSpace, ClientConfig, Frame, FrameDecoder, ServerConfig, TableLayout, TcpClient, TcpServer,
    WordSpace,
};

fn server_config() -> ServerConfig {
    ServerConfig::new()
        .with_bind_address("127.0.0.1:0".parse().unwrap())
        .with_layout(TableLayout::uniform(64))
}

#[tokio::test]
async fn write_multiple_registers_reaches_server_table() {
    let server = TcpServer::bind(&server_config()).await.unwrap().spawn().unwrap();
    let config = ClientConfig::new()
        .with_server_address(server.local_addr())
        .with_request_timeout(Duration::from_secs(2));
    let mut client = TcpClient::connect(&config).await.unwrap();

    let values: Vec<u16> = (0x30..=0x39).collect();
    client.write_multiple_registers(0, &values).await.unwrap();

    let stored = server
        .table()
        .read()
        .unwrap()
        .get_registers(WordSpace::HoldingRegisters, 0, 10)
        .unwrap();
    assert_eq!(stored, values);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_mirrors_server_coils() {
    let server = TcpServer::bind(&server_config()).await.unwrap().spawn().unwrap();
    server
        .table()
        .write()
        .unwrap()
        .set_bits(
            BitSpace::Coils,
            0,
            &[true, false, true, false, true, false, true, false],
        )
        .unwrap();

    let config = ClientConfig::new().with_server_address(server.local_addr());
    let mut client = TcpClient::connect(&config).await.unwrap();

    let coils = client.read_coils(0, 8).await.unwrap();
    assert_eq!(
        coils,
        vec![true, false, true, false, true, false, true, false]
    );
    assert_eq!(
        client.table().get_bits(BitSpace::Coils, 0, 8).unwrap(),
        coils
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_reassembles_byte_at_a_time_requests() {
    let server = TcpServer::bind(&server_config()).await.unwrap().spawn().unwrap();
    server
        .table()
        .write()
        .unwrap()
        .set_register(WordSpace::InputRegisters, 2, 0x1234)
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.set_nodelay(true).unwrap();

    let request = Frame {
        transaction_id: 0x0102,
        protocol_id: 0,
        unit_id: 1,
        function_code: 0x04,
        payload: vec![0x00, 0x02, 0x00, 0x01],
    }
    .encode()
    .unwrap();
    for byte in &request {
        stream.write_all(std::slice::from_ref(byte)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 64];
    let response = loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(n, 0, "server closed the connection");
        if let Some(frame) = decoder.feed(&buffer[..n]).pop() {
            break frame;
        }
    };

    assert_eq!(response.transaction_id, 0x0102);
    assert_eq!(response.function_code, 0x04);
    assert_eq!(response.payload, vec![0x02, 0x12, 0x34]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn connections_share_one_table() {
    let server = TcpServer::bind(&server_config()).await.unwrap().spawn().unwrap();
    let config = ClientConfig::new().with_server_address(server.local_addr());

    let mut writer = TcpClient::connect(&config).await.unwrap();
    let mut reader = TcpClient::connect(&config).await.unwrap();

    writer.write_single_register(7, 4242).await.unwrap();
    assert_eq!(reader.read_holding_registers(7, 1).await.unwrap(), vec![4242]);

    writer.write_single_coil(3, true).await.unwrap();
    assert_eq!(reader.read_coils(3, 1).await.unwrap(), vec![true]);

    server.stop().await.unwrap();
}
