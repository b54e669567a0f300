//! Reader manager commands.
//!
//! One command per line:
//!
//! ```text
//! attach <name>
//! detach <slot>
//! insert <slot> <atr-hex> [t0|t1|raw]
//! remove <slot>
//! mute <slot>
//! unavailable <slot>
//! open
//! close <token>
//! connect <slot> <token> shared|exclusive
//! disconnect <slot> <token>
//! ```

use crate::error::EngineError;
use keystone_state::{CardProtocol, ContextToken, MAX_ATR_SIZE, SlotIndex};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Shared,
    Exclusive,
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(format!("unknown access mode '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderEvent {
    Attach { name: String },
    Detach { slot: SlotIndex },
    Insert {
        slot: SlotIndex,
        atr: Vec<u8>,
        protocol: CardProtocol,
    },
    Remove { slot: SlotIndex },
    Mute { slot: SlotIndex },
    Unavailable { slot: SlotIndex },
    Open,
    Close { token: ContextToken },
    Connect {
        slot: SlotIndex,
        token: ContextToken,
        mode: AccessMode,
    },
    Disconnect { slot: SlotIndex, token: ContextToken },
}

impl ReaderEvent {
    pub fn parse(line: &str) -> Result<Self, EngineError> {
        let bad = |reason: String| EngineError::Parse {
            line: line.to_string(),
            reason,
        };

        let line_trimmed = line.trim();
        let (verb, rest) = line_trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((line_trimmed, ""));
        let rest = rest.trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(bad(format!("'{verb}' takes {n} argument(s), got {}", args.len())))
            }
        };
        let slot = |s: &str| {
            s.parse::<u16>()
                .map(SlotIndex)
                .map_err(|e| bad(format!("slot '{s}': {e}")))
        };
        let token = |s: &str| {
            s.parse::<ContextToken>()
                .map_err(|e| bad(format!("token '{s}': {e}")))
        };

        let event = match verb {
            "attach" => {
                if rest.is_empty() {
                    return Err(bad("reader name missing".into()));
                }
                Self::Attach {
                    name: rest.to_string(),
                }
            }
            "detach" => {
                arity(1)?;
                Self::Detach {
                    slot: slot(args[0])?,
                }
            }
            "insert" => {
                if !(2..=3).contains(&args.len()) {
                    return Err(bad("usage: insert <slot> <atr-hex> [t0|t1|raw]".into()));
                }
                let atr = hex::decode(args[1]).map_err(|e| bad(format!("atr: {e}")))?;
                if atr.is_empty() || atr.len() > MAX_ATR_SIZE {
                    return Err(bad(format!(
                        "atr must be 1..={MAX_ATR_SIZE} bytes, got {}",
                        atr.len()
                    )));
                }
                let protocol = match args.get(2) {
                    Some(p) => p.parse().map_err(bad)?,
                    None => CardProtocol::Undefined,
                };
                Self::Insert {
                    slot: slot(args[0])?,
                    atr,
                    protocol,
                }
            }
            "remove" => {
                arity(1)?;
                Self::Remove {
                    slot: slot(args[0])?,
                }
            }
            "mute" => {
                arity(1)?;
                Self::Mute {
                    slot: slot(args[0])?,
                }
            }
            "unavailable" => {
                arity(1)?;
                Self::Unavailable {
                    slot: slot(args[0])?,
                }
            }
            "open" => {
                arity(0)?;
                Self::Open
            }
            "close" => {
                arity(1)?;
                Self::Close {
                    token: token(args[0])?,
                }
            }
            "connect" => {
                arity(3)?;
                Self::Connect {
                    slot: slot(args[0])?,
                    token: token(args[1])?,
                    mode: args[2].parse().map_err(bad)?,
                }
            }
            "disconnect" => {
                arity(2)?;
                Self::Disconnect {
                    slot: slot(args[0])?,
                    token: token(args[1])?,
                }
            }
            "" => return Err(bad("empty command".into())),
            other => return Err(bad(format!("unknown command '{other}'"))),
        };
        Ok(event)
    }
}

impl FromStr for ReaderEvent {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
