// lanchat console: serverless LAN chat with private messages and file transfer.

mod channel;
mod config;
mod console;
mod events;
mod link;
mod messenger;
mod multicast;
mod transfer;
mod unicast;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use lanchat_core::{default_nick, is_valid_nick, now_millis, ChatCore, PeerCode, PeerIdentity};

use crate::config::Config;
use crate::console::Console;
use crate::events::EventBus;
use crate::link::{LinkSettings, NetworkLink, SystemInterfaces};
use crate::messenger::Messenger;
use crate::transfer::{EngineSettings, TransferEngine};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: lanchat-console [--version|-V] [--help|-h] [--nick <nick>]";

/// What the command line asked for.
#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run { nick: Option<String> },
    Version,
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation, String> {
    let mut nick = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Invocation::Version),
            "--help" | "-h" => return Ok(Invocation::Help),
            "--nick" => {
                nick = Some(args.next().ok_or("--nick needs a value")?);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(Invocation::Run { nick })
}

fn main() -> anyhow::Result<()> {
    let nick_arg = match parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Run { nick }) => nick,
        Ok(Invocation::Version) => {
            println!("lanchat-console {VERSION}");
            return Ok(());
        }
        Ok(Invocation::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(2);
        }
    };

    let cfg = config::load();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();

    let code = PeerCode::generate();
    let nick = choose_nick(nick_arg.or_else(|| cfg.profile.nick.clone()), code);
    let mut me = PeerIdentity::me(
        code,
        nick,
        format!("lanchat-console v{VERSION}"),
        now_millis(),
    );
    me.host_name = local_host_name();
    log::info!("starting as {} ({code})", me.nick);

    let rt = tokio::runtime::Runtime::new().context("cannot start the async runtime")?;
    let result = rt.block_on(run(cfg, me));
    // A pending stdin read must not keep the process alive.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

/// The requested nick if it is valid, else one derived from the OS user name.
fn choose_nick(requested: Option<String>, code: PeerCode) -> String {
    let fallback = || default_nick(std::env::var("USER").ok().as_deref(), code);
    match requested {
        Some(nick) if is_valid_nick(&nick) => nick,
        Some(nick) => {
            log::warn!("'{nick}' is not a valid nick name, using the default");
            fallback()
        }
        None => fallback(),
    }
}

fn local_host_name() -> Option<String> {
    match hostname::get() {
        Ok(name) if !name.is_empty() => Some(name.to_string_lossy().into_owned()),
        Ok(_) => None,
        Err(e) => {
            log::debug!("no host name: {e}");
            None
        }
    }
}

async fn run(cfg: Config, me: PeerIdentity) -> anyhow::Result<()> {
    let download_dir = cfg.download_dir();
    tokio::fs::create_dir_all(&download_dir)
        .await
        .with_context(|| format!("cannot use download directory {}", download_dir.display()))?;

    let mut chat = ChatCore::new(me, cfg.profile.own_color, download_dir);
    chat.set_peer_timeout(cfg.peer_timeout_secs.saturating_mul(1000));
    let core = Arc::new(Mutex::new(chat));

    let bus = Arc::new(EventBus::new());
    let engine = Arc::new(TransferEngine::new(
        core.clone(),
        bus.clone(),
        EngineSettings {
            transfer_port: cfg.transfer_port,
            port_attempts: cfg.port_attempts,
            accept_timeout: cfg.accept_timeout(),
            ..EngineSettings::default()
        },
    ));
    let link = Arc::new(NetworkLink::new(
        LinkSettings {
            group: cfg.multicast_group,
            chat_port: cfg.chat_port,
            private_base: cfg.private_chat_port,
            port_attempts: cfg.port_attempts,
        },
        Box::new(SystemInterfaces),
    ));
    let messenger = Messenger::new(core, link.clone(), engine, bus);

    let (subscription, rx) = messenger.events().subscribe();
    let renderer = tokio::spawn(console::render_events(rx));

    if !messenger.start().await {
        log::warn!("no usable network interface yet, will keep checking");
    }
    tokio::spawn(link.clone().run(cfg.check_interval()));
    tokio::spawn(messenger.clone().run_ticks(cfg.idle_interval()));

    let console = Console::new(messenger.clone());
    tokio::select! {
        res = console.run() => {
            if let Err(e) = res {
                log::error!("stdin: {e}");
            }
        }
        res = shutdown_signal() => res?,
    }

    messenger.shutdown().await;
    messenger.events().unsubscribe(subscription);
    let _ = renderer.await;
    log::info!("bye");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("cannot install the SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
