//! Network link: picks a multicast-capable interface, owns the channels on it and re-validates
//! the choice periodically.
//!
//! States: Disconnected -> Connecting -> Connected -> Down -> Connecting ... Up and down
//! transitions are reported to a [`LinkObserver`] with a `silent` flag: an interface switch
//! is reported as a silent down followed by a silent up, and `disconnect` is always silent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use lanchat_core::Message;
use tokio::sync::Notify;

use crate::channel::{ChannelError, Listener};
use crate::multicast::{self, MulticastChannel};
use crate::unicast::UnicastChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub loopback: bool,
}

/// Where interfaces come from. The system one is used outside tests.
pub trait InterfaceSource: Send + Sync {
    /// IPv4 interfaces, most preferred first.
    fn candidates(&self) -> Vec<Interface>;
    fn supports_multicast(&self, iface: &Interface, group: Ipv4Addr) -> bool;
}

/// Interfaces of this host. Loopback and link-local addresses are last resorts.
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn candidates(&self) -> Vec<Interface> {
        let addrs = match if_addrs::get_if_addrs() {
            Ok(a) => a,
            Err(e) => {
                log::warn!("cannot list network interfaces: {e}");
                return Vec::new();
            }
        };
        let mut out: Vec<Interface> = addrs
            .into_iter()
            .filter_map(|i| match i.addr {
                if_addrs::IfAddr::V4(v4) => Some(Interface {
                    loopback: v4.ip.is_loopback(),
                    name: i.name,
                    addr: v4.ip,
                }),
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect();
        out.sort_by_key(|i| (i.loopback, i.addr.is_link_local()));
        out
    }

    fn supports_multicast(&self, iface: &Interface, group: Ipv4Addr) -> bool {
        multicast::can_join(group, iface.addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Down,
}

/// What came up with the link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub interface: Interface,
    /// None when no private chat port could be bound.
    pub private_port: Option<u16>,
    /// Shown to the user once for this link-up.
    pub warning: Option<String>,
}

/// Receives link transitions and every datagram from the channels.
pub trait LinkObserver: Send + Sync {
    fn link_up(&self, silent: bool, info: LinkInfo);
    fn link_down(&self, silent: bool);
    /// Called on a receive loop; must not block.
    fn datagram(&self, msg: Message, from: IpAddr);
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub group: Ipv4Addr,
    pub chat_port: u16,
    pub private_base: u16,
    pub port_attempts: u16,
}

struct Channels {
    interface: Interface,
    multicast: MulticastChannel,
    unicast: UnicastChannel,
}

impl Channels {
    async fn stop(self) {
        self.multicast.stop().await;
        self.unicast.stop().await;
    }
}

struct Shared {
    state: LinkState,
    channels: Option<Channels>,
}

pub struct NetworkLink {
    settings: LinkSettings,
    source: Box<dyn InterfaceSource>,
    observer: OnceLock<Weak<dyn LinkObserver>>,
    /// Serialises connect, disconnect and checks.
    transition: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
    recheck: Notify,
}

impl NetworkLink {
    pub fn new(settings: LinkSettings, source: Box<dyn InterfaceSource>) -> Self {
        Self {
            settings,
            source,
            observer: OnceLock::new(),
            transition: tokio::sync::Mutex::new(()),
            shared: Mutex::new(Shared {
                state: LinkState::Disconnected,
                channels: None,
            }),
            recheck: Notify::new(),
        }
    }

    /// Register the observer. Only the first call has an effect.
    pub fn set_observer(&self, observer: Weak<dyn LinkObserver>) {
        let _ = self.observer.set(observer);
    }

    pub fn state(&self) -> LinkState {
        self.shared().state
    }

    pub fn interface(&self) -> Option<Interface> {
        self.shared().channels.as_ref().map(|c| c.interface.clone())
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observer(&self) -> Option<Arc<dyn LinkObserver>> {
        self.observer.get().and_then(Weak::upgrade)
    }

    /// Send to the group. On a local failure a network check is requested.
    pub fn send_group(&self, msg: &Message) -> bool {
        let sent = self
            .shared()
            .channels
            .as_ref()
            .is_some_and(|c| c.multicast.send(msg));
        if !sent {
            self.request_check();
        }
        sent
    }

    /// Send to one peer. On a local failure a network check is requested.
    pub fn send_private(&self, msg: &Message, to: SocketAddr) -> bool {
        let sent = self
            .shared()
            .channels
            .as_ref()
            .is_some_and(|c| c.unicast.send(msg, to));
        if !sent {
            self.request_check();
        }
        sent
    }

    /// Ask the check loop to re-validate now instead of at the next interval.
    pub fn request_check(&self) {
        self.recheck.notify_one();
    }

    /// Best interface that can join the group.
    fn select_interface(&self) -> Option<Interface> {
        self.source
            .candidates()
            .into_iter()
            .find(|i| self.source.supports_multicast(i, self.settings.group))
    }

    fn listener(&self) -> Listener {
        let observer = self.observer.get().cloned();
        Arc::new(move |msg, from| {
            if let Some(o) = observer.as_ref().and_then(Weak::upgrade) {
                o.datagram(msg, from);
            }
        })
    }

    async fn start_channels(
        &self,
        iface: &Interface,
    ) -> Result<(Channels, LinkInfo), ChannelError> {
        let listener = self.listener();
        let multicast = MulticastChannel::start(
            self.settings.group,
            self.settings.chat_port,
            iface.addr,
            listener.clone(),
        )?;
        let mut unicast = match UnicastChannel::open() {
            Ok(u) => u,
            Err(e) => {
                multicast.stop().await;
                return Err(e);
            }
        };
        let (private_port, warning) = match unicast.listen(
            self.settings.private_base,
            self.settings.port_attempts,
            listener,
        ) {
            Ok(port) => (Some(port), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let info = LinkInfo {
            interface: iface.clone(),
            private_port,
            warning,
        };
        let channels = Channels {
            interface: iface.clone(),
            multicast,
            unicast,
        };
        Ok((channels, info))
    }

    /// Start channels on `iface` and report up. Leaves the link Down on failure.
    async fn bring_up(&self, iface: Interface, silent: bool) -> bool {
        match self.start_channels(&iface).await {
            Ok((channels, info)) => {
                {
                    let mut s = self.shared();
                    s.channels = Some(channels);
                    s.state = LinkState::Connected;
                }
                log::info!("link up on {} ({})", iface.name, iface.addr);
                if let Some(o) = self.observer() {
                    o.link_up(silent, info);
                }
                true
            }
            Err(e) => {
                log::warn!("cannot start channels on {}: {e}", iface.name);
                self.shared().state = LinkState::Down;
                false
            }
        }
    }

    /// Take the channels out and close them; returns whether there were any.
    async fn stop_channels(&self, next: LinkState) -> bool {
        let channels = {
            let mut s = self.shared();
            s.state = next;
            s.channels.take()
        };
        match channels {
            Some(c) => {
                c.stop().await;
                true
            }
            None => false,
        }
    }

    /// Select an interface and start the channels. True once Connected.
    pub async fn connect(&self) -> bool {
        let _t = self.transition.lock().await;
        if self.state() == LinkState::Connected {
            return true;
        }
        self.shared().state = LinkState::Connecting;
        match self.select_interface() {
            Some(iface) => self.bring_up(iface, false).await,
            None => {
                log::warn!("no multicast-capable network interface");
                self.shared().state = LinkState::Down;
                false
            }
        }
    }

    /// Stop the channels. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let _t = self.transition.lock().await;
        if self.state() == LinkState::Disconnected {
            return;
        }
        if self.stop_channels(LinkState::Disconnected).await {
            log::info!("link disconnected");
            if let Some(o) = self.observer() {
                o.link_down(true);
            }
        }
    }

    /// Re-validate the interface: keep it, switch to a better one, go down, or come back up.
    pub async fn check_network(&self) {
        let _t = self.transition.lock().await;
        if self.state() == LinkState::Disconnected {
            return;
        }
        let current = self.interface();
        let best = self.select_interface();
        match (current, best) {
            (Some(cur), Some(best)) if cur == best => {}
            (Some(cur), Some(best)) => {
                log::info!("switching from {} to {}", cur.name, best.name);
                self.stop_channels(LinkState::Connecting).await;
                if let Some(o) = self.observer() {
                    o.link_down(true);
                }
                self.bring_up(best, true).await;
            }
            (Some(cur), None) => {
                log::info!("lost {} ({})", cur.name, cur.addr);
                self.stop_channels(LinkState::Down).await;
                if let Some(o) = self.observer() {
                    o.link_down(false);
                }
            }
            (None, Some(best)) => {
                self.shared().state = LinkState::Connecting;
                self.bring_up(best, false).await;
            }
            (None, None) => {
                self.shared().state = LinkState::Down;
            }
        }
    }

    /// Periodic check loop. Also runs early when a check is requested.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.recheck.notified() => {}
            }
            self.check_network().await;
        }
    }
}
