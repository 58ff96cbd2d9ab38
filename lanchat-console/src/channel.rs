//! Pieces shared by the multicast and unicast channels.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::{wire, Message, PACKET_SIZE};
use tokio::net::UdpSocket;

/// Called synchronously on the receive loop for every decoded datagram. Must not block.
pub type Listener = Arc<dyn Fn(Message, IpAddr) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(
        "No available listening port between {base} and {last}. \
         You will not be able to receive private messages!"
    )]
    PortExhausted { base: u16, last: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode and send straight through the OS socket, so a socket that was just created can send
/// before the runtime has polled it. False only on a local socket error.
pub fn send_datagram(socket: &std::net::UdpSocket, msg: &Message, to: SocketAddr) -> bool {
    let text = wire::encode(msg);
    if text.len() > PACKET_SIZE {
        log::warn!("outgoing {} is {} bytes, over the packet size", msg.kind(), text.len());
    }
    match socket.send_to(text.as_bytes(), to) {
        Ok(_) => {
            log::debug!("-> {to}: {text}");
            true
        }
        Err(e) => {
            log::warn!("send to {to} failed: {e}");
            false
        }
    }
}

/// Decode one datagram and hand it to the listener. Malformed input is logged and dropped.
pub fn dispatch(datagram: &[u8], from: IpAddr, listener: &Listener) {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    match wire::decode(text) {
        Ok(msg) => {
            log::debug!("<- {from}: {text}");
            listener(msg, from);
        }
        Err(e) => log::debug!("dropping datagram from {from}: {e}"),
    }
}

/// Receive until the task is aborted.
pub async fn receive_loop(socket: Arc<UdpSocket>, listener: Listener, name: &'static str) {
    let mut buf = vec![0u8; PACKET_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => dispatch(&buf[..n], from.ip(), &listener),
            Err(e) => {
                log::warn!("{name} receive failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanchat_core::{Body, PeerCode};
    use std::sync::Mutex;

    fn recorder() -> (Listener, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |m, _| sink.lock().unwrap().push(m));
        (listener, seen)
    }

    #[test]
    fn dispatch_trims_padding() {
        let (listener, seen) = recorder();
        dispatch(b"42!IDLE#Bob:\0\0\0 \n", "10.0.0.1".parse().unwrap(), &listener);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Message::new(PeerCode(42), "Bob", Body::Idle));
    }

    #[test]
    fn dispatch_drops_garbage() {
        let (listener, seen) = recorder();
        dispatch(b"hello there", "10.0.0.1".parse().unwrap(), &listener);
        dispatch(&[0xff, 0xfe], "10.0.0.1".parse().unwrap(), &listener);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn port_exhausted_text() {
        let e = ChannelError::PortExhausted {
            base: 50150,
            last: 50159,
        };
        assert_eq!(
            e.to_string(),
            "No available listening port between 50150 and 50159. \
             You will not be able to receive private messages!"
        );
    }
}
