//! Interactive console.
//!
//! Reads one command per line from stdin and runs it against the local node
//! under the node's own caller identity. Room events are printed as they
//! are delivered.

use room_core::{MeshEvent, Node, PeerId, Reply, Request, Transition};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

pub const HELP: &str = "\
Commands:
  propose|p <capacity> <level>   host a new room
  join|j <room>                  join a pending room
  leave|l <room>                 leave a room
  guess|g <room> <word>          guess a word in a running room
  say|s <room> <text...>         talk to the room
  status|i                       show peers and rooms
  help|h                         show this help
  exit|q                         quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(Request),
    Help,
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command {0:?}; type 'help'")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid room id {0:?}")]
    InvalidRoom(String),
    #[error("Invalid number {0:?}")]
    InvalidNumber(String),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    let Some((verb, rest)) = split_word(line) else {
        return Ok(None);
    };

    let command = match verb.to_lowercase().as_str() {
        "propose" | "p" => {
            const USAGE: &str = "propose <capacity> <level>";
            let (capacity, rest) = split_word(rest).ok_or(CommandError::Usage(USAGE))?;
            let (level, _) = split_word(rest).ok_or(CommandError::Usage(USAGE))?;
            Command::Call(Request::Propose {
                capacity: number(capacity)?,
                level: number(level)?,
            })
        }
        "join" | "j" => Command::Call(Request::Join {
            room: room_arg(rest, "join <room>")?.0,
        }),
        "leave" | "l" => Command::Call(Request::Leave {
            room: room_arg(rest, "leave <room>")?.0,
        }),
        "guess" | "g" => {
            const USAGE: &str = "guess <room> <word>";
            let (room, rest) = room_arg(rest, USAGE)?;
            let (guess, _) = split_word(rest).ok_or(CommandError::Usage(USAGE))?;
            Command::Call(Request::Guess {
                room,
                guess: guess.to_string(),
            })
        }
        "say" | "s" => {
            const USAGE: &str = "say <room> <text...>";
            let (room, text) = room_arg(rest, USAGE)?;
            if text.is_empty() {
                return Err(CommandError::Usage(USAGE));
            }
            Command::Call(Request::Say {
                room,
                text: text.to_string(),
            })
        }
        "status" | "i" => Command::Call(Request::Status),
        "help" | "h" | "?" => Command::Help,
        "exit" | "quit" | "q" => Command::Exit,
        _ => return Err(CommandError::Unknown(verb.to_string())),
    };
    Ok(Some(command))
}

/// First whitespace-separated word and the trimmed remainder.
fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((s, "")),
    }
}

fn room_arg<'a>(s: &'a str, usage: &'static str) -> Result<(PeerId, &'a str), CommandError> {
    let (room, rest) = split_word(s).ok_or(CommandError::Usage(usage))?;
    let room = room
        .parse()
        .map_err(|_| CommandError::InvalidRoom(room.to_string()))?;
    Ok((room, rest))
}

fn number<T: std::str::FromStr>(s: &str) -> Result<T, CommandError> {
    s.parse()
        .map_err(|_| CommandError::InvalidNumber(s.to_string()))
}

/// One-line (or, for status, multi-line) rendering of a reply.
pub fn describe_reply(reply: &Reply) -> String {
    match reply {
        Reply::Proposed { room, timestamp } => format!("Room {} proposed (t={})", room, timestamp),
        Reply::Joined { room, timestamp } => format!("Joined room {} (t={})", room, timestamp),
        Reply::Left { room, timestamp } => format!("Left room {} (t={})", room, timestamp),
        Reply::GuessSubmitted { room, timestamp } => {
            format!("Guess submitted to room {} (t={})", room, timestamp)
        }
        Reply::Said { .. } | Reply::Accepted | Reply::Pong => "ok".to_string(),
        Reply::Rejected { reason } => format!("Rejected: {}", reason),
        Reply::Duplicate { seq } => format!("Call #{} was already handled", seq),
        Reply::TimedOut { timestamp } => format!(
            "Not delivered yet (t={}); a peer may be unresponsive",
            timestamp
        ),
        Reply::Status { status } => {
            let mut out = format!(
                "{} ({}) clock={} pending={}",
                status.name, status.node_id, status.clock, status.pending_messages
            );
            for peer in &status.peers {
                let state = peer
                    .state
                    .map(|s| format!("{:?}", s))
                    .unwrap_or_else(|| "untracked".to_string());
                out.push_str(&format!("\n  peer {} {} [{}]", peer.id, peer.name, state));
            }
            for room in &status.rooms {
                let players: Vec<&str> = room.participants.iter().map(|p| p.name.as_str()).collect();
                out.push_str(&format!(
                    "\n  room {} host={} {:?} {}/{} level={} players=[{}]",
                    room.id,
                    room.host_name,
                    room.state,
                    room.participants.len(),
                    room.capacity,
                    room.level,
                    players.join(", ")
                ));
            }
            out
        }
    }
}

/// Rendering of the events a player cares about. Protocol noise is skipped.
pub fn describe_event(event: &MeshEvent) -> Option<String> {
    let line = match event {
        MeshEvent::Room { transition } => match transition {
            Transition::Created {
                room,
                capacity,
                level,
            } => format!("[{}] created for {} players, level {}", room, capacity, level),
            Transition::Joined { room, name, full, .. } => {
                let suffix = if *full { ", room is full" } else { "" };
                format!("[{}] {} joined{}", room, name, suffix)
            }
            Transition::Started { room, .. } => format!("[{}] game started", room),
            Transition::Guessed { room, player, guess } => {
                format!("[{}] {} guessed {:?}", room, player, guess)
            }
            Transition::Left { room, name, .. } => format!("[{}] {} left", room, name),
            Transition::Said { room, from, text } => format!("[{}] {}: {}", room, from, text),
            Transition::Ended { room, winner } => match winner {
                Some(winner) => format!("[{}] game over, {} wins", room, winner),
                None => format!("[{}] game over", room),
            },
        },
        MeshEvent::Refused { sender_name, reason } => {
            format!("(refused from {}: {})", sender_name, reason)
        }
        MeshEvent::PeerJoined { peer_id, name } => format!("* {} ({}) connected", name, peer_id),
        MeshEvent::PeerFailed { peer_id } => format!("* {} failed and was evicted", peer_id),
        MeshEvent::Delivered { .. }
        | MeshEvent::PeerSuspected { .. }
        | MeshEvent::PeerRecovered { .. } => return None,
    };
    Some(line)
}

/// Run the console until `exit` or end of input.
pub async fn run_console(node: Arc<Node>) {
    let _subscription = node.events().subscribe(|event| {
        if let Some(line) = describe_event(&event) {
            println!("{}", line);
        }
    });
    println!("{} ({}) ready. Type 'help' for commands.", node.name(), node.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Console input failed: {}", e);
                break;
            }
        };
        match parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Help)) => println!("{}", HELP),
            Ok(Some(Command::Exit)) => break,
            Ok(Some(Command::Call(request))) => {
                let reply = node.call_local(request).await;
                println!("{}", describe_reply(&reply));
            }
            Err(e) => println!("{}", e),
        }
    }
}
