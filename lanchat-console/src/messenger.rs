//! Messenger: carries out the core's actions over the link, the transfer engine and the event bus,
//! and feeds the core with link transitions, datagrams and ticks.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lanchat_core::{now_millis, Action, ChatCore, Event, Message};

use crate::events::EventBus;
use crate::link::{LinkInfo, LinkObserver, NetworkLink};
use crate::transfer::TransferEngine;

pub struct Messenger {
    core: Arc<Mutex<ChatCore>>,
    link: Arc<NetworkLink>,
    engine: Arc<TransferEngine>,
    events: Arc<EventBus>,
}

impl Messenger {
    /// Build the messenger and register it as the link's observer.
    pub fn new(
        core: Arc<Mutex<ChatCore>>,
        link: Arc<NetworkLink>,
        engine: Arc<TransferEngine>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let messenger = Arc::new(Self {
            core,
            link,
            engine,
            events,
        });
        let observer: Arc<dyn LinkObserver> = messenger.clone();
        messenger.link.set_observer(Arc::downgrade(&observer));
        messenger
    }

    /// Exclusive access to the core. Never hold the guard across an await.
    pub fn core(&self) -> MutexGuard<'_, ChatCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Send to the group. False on a local failure, which also schedules a network check.
    pub fn send_group(&self, msg: &Message) -> bool {
        self.link.send_group(msg)
    }

    pub fn send_private(&self, msg: &Message, to: SocketAddr) -> bool {
        self.link.send_private(msg, to)
    }

    pub fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Multicast(msg) => {
                    if !self.link.send_group(&msg) {
                        log::debug!("{} not sent", msg.kind());
                    }
                }
                Action::Private { message, addr } => {
                    if !self.link.send_private(&message, addr) {
                        log::debug!("{} to {addr} not sent", message.kind());
                    }
                }
                Action::StartSending { session, addr } => self.engine.start_sending(session, addr),
                Action::StopTransfer(session) => self.engine.stop(session),
                Action::Notify(event) => self.events.publish(event),
            }
        }
    }

    /// Bring the link up for the first time.
    pub async fn start(&self) -> bool {
        self.link.connect().await
    }

    /// Say goodbye, stop every transfer and close the sockets.
    pub async fn shutdown(&self) {
        let actions = self.core().logoff();
        self.execute(actions);
        self.engine.stop_all();
        self.link.disconnect().await;
    }

    /// Keepalive and peer expiry.
    pub async fn run_ticks(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let actions = self.core().tick(now_millis());
            self.execute(actions);
        }
    }
}

impl LinkObserver for Messenger {
    fn link_up(&self, silent: bool, info: LinkInfo) {
        let actions = {
            let mut core = self.core();
            core.set_my_ip(Some(IpAddr::V4(info.interface.addr)));
            core.set_private_chat_port(info.private_port.unwrap_or(0));
            core.logon(now_millis())
        };
        self.events.publish(Event::LinkUp { silent });
        if let Some(warning) = info.warning {
            log::error!("{warning}");
            self.events.publish(Event::Warning(warning));
        }
        self.execute(actions);
    }

    fn link_down(&self, silent: bool) {
        self.events.publish(Event::LinkDown { silent });
    }

    fn datagram(&self, msg: Message, from: IpAddr) {
        let actions = self.core().on_message_received(msg, from, now_millis());
        self.execute(actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Interface, InterfaceSource, LinkSettings};
    use crate::transfer::EngineSettings;
    use lanchat_core::{Body, JoinKind, PeerCode, PeerIdentity};
    use std::net::Ipv4Addr;

    struct NoInterfaces;

    impl InterfaceSource for NoInterfaces {
        fn candidates(&self) -> Vec<Interface> {
            Vec::new()
        }

        fn supports_multicast(&self, _: &Interface, _: Ipv4Addr) -> bool {
            false
        }
    }

    fn messenger() -> Arc<Messenger> {
        let core = Arc::new(Mutex::new(ChatCore::new(
            PeerIdentity::me(PeerCode(1), "Me", "test", 0),
            0,
            "/tmp",
        )));
        let events = Arc::new(EventBus::new());
        let link = Arc::new(NetworkLink::new(
            LinkSettings {
                group: Ipv4Addr::new(229, 5, 38, 17),
                chat_port: 50050,
                private_base: 50150,
                port_attempts: 10,
            },
            Box::new(NoInterfaces),
        ));
        let engine = Arc::new(TransferEngine::new(
            core.clone(),
            events.clone(),
            EngineSettings::default(),
        ));
        Messenger::new(core, link, engine, events)
    }

    #[tokio::test]
    async fn datagrams_reach_core_and_bus() {
        let m = messenger();
        let (_, mut rx) = m.events().subscribe();
        m.datagram(
            Message::new(PeerCode(2), "Bob", Body::Logon),
            "10.0.0.2".parse().unwrap(),
        );
        assert!(m.core().presence().contains(PeerCode(2)));
        assert!(matches!(
            rx.recv().await,
            Some(Event::PeerJoined { kind: JoinKind::Logon, .. })
        ));
    }

    #[tokio::test]
    async fn link_up_publishes_port_warning() {
        let m = messenger();
        let (_, mut rx) = m.events().subscribe();
        m.link_up(
            false,
            LinkInfo {
                interface: Interface {
                    name: "eth0".into(),
                    addr: Ipv4Addr::new(10, 0, 0, 1),
                    loopback: false,
                },
                private_port: None,
                warning: Some("no port".into()),
            },
        );
        assert_eq!(rx.recv().await, Some(Event::LinkUp { silent: false }));
        assert_eq!(rx.recv().await, Some(Event::Warning("no port".into())));
        let core = m.core();
        assert!(core.is_logged_on());
        assert_eq!(core.me().private_chat_port, 0);
        assert_eq!(core.me().ip, Some("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn sends_fail_without_link() {
        let m = messenger();
        let msg = m.core().chat_message("hi");
        assert!(!m.send_group(&msg));
        m.shutdown().await;
    }
}
