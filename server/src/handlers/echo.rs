//! UDP echo service for RRC inference
//!
//! Every datagram is answered with an empty one. The agent only times the
//! round trip, so the reply carries no payload.

use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error};

pub async fn serve_echo(socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, client_addr)) => {
                debug!("Echo {} bytes from {}", len, client_addr);
                if let Err(e) = socket.send_to(&[], client_addr).await {
                    error!("Failed to send echo to {}: {}", client_addr, e);
                }
            }
            Err(e) => {
                error!("Error receiving echo packet: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    
    #[tokio::test]
    async fn test_echo_replies_empty() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = server.local_addr().unwrap();
        tokio::spawn(serve_echo(server));
        
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        for size in [0usize, 31, 1024] {
            client.send(&vec![7u8; size]).await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }
}
