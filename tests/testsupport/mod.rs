use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gregor::prelude::{Broker, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A loopback listener standing in for a broker.
pub async fn mock_broker() -> (TcpListener, String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr.ip().to_string(), addr.port())
}

/// One request frame as the mock broker received it.
#[allow(dead_code)]
pub struct RecordedRequest {
    /// Value of the length prefix, covering header and body.
    pub length: i32,
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: Bytes,
}

#[allow(dead_code)]
pub async fn read_request(stream: &mut TcpStream) -> RecordedRequest {
    let length = stream.read_i32().await.unwrap();
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await.unwrap();

    let mut payload = Bytes::from(payload);
    let api_key = payload.get_i16();
    let api_version = payload.get_i16();
    let correlation_id = payload.get_i32();
    let client_id_len = payload.get_i16();
    let client_id = String::from_utf8(payload.split_to(client_id_len as usize).to_vec()).unwrap();

    RecordedRequest {
        length,
        api_key,
        api_version,
        correlation_id,
        client_id,
        body: payload,
    }
}

#[allow(dead_code)]
pub async fn write_response(stream: &mut TcpStream, correlation_id: i32, body: &[u8]) {
    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_i32(4 + body.len() as i32);
    frame.put_i32(correlation_id);
    frame.put_slice(body);
    stream.write_all(&frame).await.unwrap();
}

/// Run the blocking connect wait off the runtime threads.
#[allow(dead_code)]
pub async fn wait_for_connect(broker: &Broker, timeout: Duration) -> Result<()> {
    let broker = broker.clone();
    tokio::task::spawn_blocking(move || broker.wait_for_connect(timeout))
        .await
        .unwrap()
}
