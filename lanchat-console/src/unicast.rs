//! Unicast channel: private chat, point to point.
//!
//! Sending goes through its own socket on an ephemeral port, so it works even when no
//! private chat port could be bound for receiving.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use lanchat_core::Message;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::channel::{receive_loop, send_datagram, ChannelError, Listener};

pub struct UnicastChannel {
    sender: std::net::UdpSocket,
    receiver: Option<(u16, JoinHandle<()>)>,
}

impl UnicastChannel {
    /// Open the send socket.
    pub fn open() -> Result<Self, ChannelError> {
        Ok(Self {
            sender: std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?,
            receiver: None,
        })
    }

    /// Bind the first free port from `base` and start receiving on it. Returns the port.
    /// Needs a running runtime.
    pub fn listen(
        &mut self,
        base: u16,
        attempts: u16,
        listener: Listener,
    ) -> Result<u16, ChannelError> {
        let (std_sock, port) = bind_first_free(base, attempts)?;
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);
        let task = tokio::spawn(receive_loop(socket, listener, "unicast"));
        log::info!("private chat on port {port}");
        self.receiver = Some((port, task));
        Ok(port)
    }

    /// This peer's private chat port, if one was bound.
    pub fn port(&self) -> Option<u16> {
        self.receiver.as_ref().map(|(port, _)| *port)
    }

    pub fn send(&self, msg: &Message, to: SocketAddr) -> bool {
        send_datagram(&self.sender, msg, to)
    }

    /// Stop receiving and wait until the listening socket is released.
    pub async fn stop(self) {
        if let Some((_, task)) = self.receiver {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Try `base`, `base + 1`, ... for `attempts` ports. The first successful bind wins.
pub fn bind_first_free(
    base: u16,
    attempts: u16,
) -> Result<(std::net::UdpSocket, u16), ChannelError> {
    let last = base.saturating_add(attempts.saturating_sub(1));
    for port in base..=last {
        match std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(sock) => return Ok((sock, port)),
            Err(e) => log::warn!("port {port} unavailable: {e}"),
        }
    }
    log::error!("no free port between {base} and {last}");
    Err(ChannelError::PortExhausted { base, last })
}
