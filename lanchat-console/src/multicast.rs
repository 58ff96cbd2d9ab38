//! Multicast channel: group chat and control messages on the chat port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use lanchat_core::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::channel::{receive_loop, send_datagram, ChannelError, Listener};

pub struct MulticastChannel {
    /// Same socket as the receive loop's, used directly for sending.
    sender: std::net::UdpSocket,
    group: SocketAddr,
    task: JoinHandle<()>,
}

impl MulticastChannel {
    /// Join `group` on the interface owning `iface` and start receiving. Needs a running runtime.
    pub fn start(
        group: Ipv4Addr,
        port: u16,
        iface: Ipv4Addr,
        listener: Listener,
    ) -> Result<Self, ChannelError> {
        let std_sock = multicast_socket(group, port, iface)?;
        let sender = std_sock.try_clone()?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);
        let task = tokio::spawn(receive_loop(socket, listener, "multicast"));
        log::debug!("joined {group}:{port} on {iface}");
        Ok(Self {
            sender,
            group: SocketAddr::from((group, port)),
            task,
        })
    }

    pub fn send(&self, msg: &Message) -> bool {
        send_datagram(&self.sender, msg, self.group)
    }

    /// Stop the receive loop and wait until it has let go of the socket.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Shared-port UDP socket joined to `group`, sending through `iface` with TTL 1.
pub fn multicast_socket(
    group: Ipv4Addr,
    port: u16,
    iface: Ipv4Addr,
) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &iface)?;
    socket.set_multicast_if_v4(&iface)?;
    socket.set_multicast_ttl_v4(1)?;
    // Other clients on this host must hear us too.
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// True if the interface owning `iface` can join `group`.
pub fn can_join(group: Ipv4Addr, iface: Ipv4Addr) -> bool {
    let try_join = || -> std::io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.join_multicast_v4(&group, &iface)
    };
    match try_join() {
        Ok(()) => true,
        Err(e) => {
            log::debug!("{iface} cannot join {group}: {e}");
            false
        }
    }
}
