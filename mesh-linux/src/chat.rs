//! Interactive chat node: stdin commands in, node events out.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use mesh_core::packet::PUB_KEY_SIZE;
use mesh_core::{
    ContactBook, ContactRecord, Dispatcher, DispatcherConfig, LocalIdentity, Node, NodeEvent,
    NodePrefs, VolatileRtcClock,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::air::AirTransceiver;
use crate::config::Config;

pub const CONTACTS_FILE: &str = "contacts.bin";

type ChatNode = Node<AirTransceiver, VolatileRtcClock>;

#[derive(Debug, PartialEq)]
pub enum ChatCommand<'a> {
    /// Pick the recipient for plain lines by name prefix.
    To(&'a str),
    Add {
        name: &'a str,
        key: [u8; PUB_KEY_SIZE],
    },
    List,
    Public(&'a str),
    Advert,
    Clock,
    SetTime(u32),
    Help,
    Send(&'a str),
    Empty,
    Invalid(&'static str),
}

impl<'a> ChatCommand<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ChatCommand::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return ChatCommand::Send(line);
        };
        let (cmd, arg) = match rest.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (rest, ""),
        };
        match cmd {
            "to" if !arg.is_empty() => ChatCommand::To(arg),
            "to" => ChatCommand::Invalid("usage: /to <name>"),
            "add" => parse_add(arg),
            "list" => ChatCommand::List,
            "public" if !arg.is_empty() => ChatCommand::Public(arg),
            "public" => ChatCommand::Invalid("usage: /public <text>"),
            "advert" => ChatCommand::Advert,
            "clock" => ChatCommand::Clock,
            "time" => match arg.parse() {
                Ok(ts) => ChatCommand::SetTime(ts),
                Err(_) => ChatCommand::Invalid("usage: /time <unix seconds>"),
            },
            "help" => ChatCommand::Help,
            _ => ChatCommand::Invalid("unknown command, try /help"),
        }
    }
}

fn parse_add(arg: &str) -> ChatCommand<'_> {
    const USAGE: &str = "usage: /add <name> <64 hex digit key>";
    let Some((name, key_hex)) = arg.split_once(char::is_whitespace) else {
        return ChatCommand::Invalid(USAGE);
    };
    let mut key = [0u8; PUB_KEY_SIZE];
    match hex::decode_to_slice(key_hex.trim(), &mut key) {
        Ok(()) => ChatCommand::Add { name, key },
        Err(_) => ChatCommand::Invalid(USAGE),
    }
}

const HELP: &str = "\
/to <name>           direct messages go to this contact
/add <name> <key>    add a contact by public key
/list                show contacts
/public <text>       send on the public channel
/advert              announce this node
/clock               show node time
/time <secs>         set node time forward
<text>               send to the current contact";

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub fn load_contacts(path: &Path) -> anyhow::Result<ContactBook> {
    if !path.exists() {
        return Ok(ContactBook::new());
    }
    let mut f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(ContactBook::load(&mut f)?)
}

fn save_contacts(path: &Path, book: &ContactBook) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
    book.save(&mut f)?;
    drop(f);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

struct ChatSession {
    recipient: Option<[u8; PUB_KEY_SIZE]>,
    colour: bool,
    contacts_path: PathBuf,
}

impl ChatSession {
    fn name<'a>(&self, name: &'a str) -> std::borrow::Cow<'a, str> {
        if self.colour {
            format!("\x1b[1;36m{name}\x1b[0m").into()
        } else {
            name.into()
        }
    }

    fn handle_line(&mut self, node: &mut ChatNode, line: &str) -> anyhow::Result<()> {
        match ChatCommand::parse(line) {
            ChatCommand::Empty => {}
            ChatCommand::Invalid(msg) => println!("{msg}"),
            ChatCommand::Help => println!("{HELP}"),
            ChatCommand::To(prefix) => match node.contacts().by_name_prefix(prefix) {
                Some(c) => {
                    println!("talking to {}", self.name(&c.name));
                    self.recipient = Some(c.public_key);
                }
                None => println!("no contact matches {prefix:?}"),
            },
            ChatCommand::Add { name, key } => {
                node.add_contact(ContactRecord::new(key, name))?;
                save_contacts(&self.contacts_path, node.contacts())?;
                println!("added {}", self.name(name));
            }
            ChatCommand::List => {
                for c in node.contacts().iter() {
                    let route = match &c.out_path {
                        Some(p) => format!("{} hops", p.len()),
                        None => "flood".to_owned(),
                    };
                    println!(
                        "{} {} {} last advert {}",
                        self.name(&c.name),
                        hex::encode(&c.public_key[..4]),
                        route,
                        c.last_advert
                    );
                }
            }
            ChatCommand::Public(text) => node.send_channel_text(text)?,
            ChatCommand::Advert => {
                node.send_advert()?;
                println!("advert sent");
            }
            ChatCommand::Clock => println!("node time {}", node.current_time()),
            ChatCommand::SetTime(ts) => {
                node.set_clock(ts)?;
                println!("node time {}", node.current_time());
            }
            ChatCommand::Send(text) => {
                let Some(key) = self.recipient else {
                    println!("no recipient, use /to <name> or /public <text>");
                    return Ok(());
                };
                node.send_text(&key, text)?;
            }
        }
        Ok(())
    }

    fn render(&self, node: &ChatNode, event: &NodeEvent) -> Option<String> {
        let name_of = |key: &[u8; PUB_KEY_SIZE]| match node.contacts().by_key(key) {
            Some(c) => self.name(&c.name).into_owned(),
            None => hex::encode(&key[..4]),
        };
        let line = match event {
            NodeEvent::MessageReceived { name, text, .. } => {
                format!("{}: {text}", self.name(name))
            }
            NodeEvent::ChannelMessage { text, .. } => format!("[public] {text}"),
            NodeEvent::Delivered { recipient, attempt } => {
                format!("delivered to {} (attempt {})", name_of(recipient), attempt + 1)
            }
            NodeEvent::SendFailed { recipient, text } => {
                format!("not delivered to {}: {text}", name_of(recipient))
            }
            NodeEvent::ContactHeard { name, .. } => format!("heard advert from {}", self.name(name)),
            NodeEvent::ClockAdjusted { from, to } => {
                tracing::info!(from, to, "clock adjusted from peers");
                return None;
            }
        };
        Some(line)
    }
}

/// Run the chat node until stdin closes or a shutdown signal arrives.
pub async fn run(cfg: &Config, identity: LocalIdentity, prefs: NodePrefs) -> anyhow::Result<()> {
    let air = AirTransceiver::open(cfg.air_port).context("join air")?;
    let dispatcher = Dispatcher::new(
        air,
        prefs.radio_params(),
        DispatcherConfig {
            airtime_factor: prefs.airtime_factor,
            ..cfg.dispatcher
        },
    )?;
    let contacts_path = cfg.data_dir.join(CONTACTS_FILE);
    let contacts = load_contacts(&contacts_path)?;
    let public_key = identity.public_key();
    let mut node = Node::new(
        dispatcher,
        identity,
        VolatileRtcClock::new(unix_now()),
        contacts,
        prefs.node_name.clone(),
    );
    let mut session = ChatSession {
        recipient: None,
        colour: prefs.colour,
        contacts_path,
    };
    println!(
        "{} {} ({} contacts), /help for commands",
        session.name(node.name()),
        hex::encode(public_key),
        node.contacts().len()
    );
    node.send_advert()?;

    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    let mut tick = tokio::time::interval(crate::POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = crate::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now_ms = start.elapsed().as_millis() as u64;
                let mut heard = false;
                for event in node.poll(now_ms) {
                    heard |= matches!(event, NodeEvent::ContactHeard { .. });
                    if let Some(line) = session.render(&node, &event) {
                        println!("{line}");
                    }
                }
                if heard {
                    if let Err(e) = save_contacts(&session.contacts_path, node.contacts()) {
                        tracing::warn!(error = %e, "contacts not saved");
                    }
                }
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = session.handle_line(&mut node, &line) {
                    println!("error: {e}");
                }
            }
            r = &mut shutdown => {
                r?;
                break;
            }
        }
    }
    save_contacts(&session.contacts_path, node.contacts())?;
    Ok(())
}
