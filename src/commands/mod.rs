//! Command parsing and execution.
//!
//! A request's parts are parsed into a [`Command`] up front, so every arity
//! and option error is reported before anything touches the keyspace. The
//! [`Dispatcher`] then executes the command.

pub mod blocking;
pub mod dispatcher;

pub use dispatcher::{Dispatcher, Outcome};

use crate::error::CommandError;
use crate::storage::stream::{Fields, IdSpec, StreamId};
use bytes::Bytes;
use std::time::Duration;

/// Starting point of one XREAD stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// `$`: only entries appended after the call
    Latest,
    /// Entries strictly after this ID
    After(StreamId),
}

/// REPLCONF subcommands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplConf {
    ListeningPort(u16),
    Capa(Vec<String>),
    GetAck,
    Ack(u64),
}

/// A parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping {
        message: Option<Bytes>,
    },
    Echo {
        message: Bytes,
    },
    Set {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Get {
        key: String,
    },
    ConfigGet {
        params: Vec<String>,
    },
    ConfigSet {
        param: String,
        value: String,
    },
    Keys {
        pattern: String,
    },
    Type {
        key: String,
    },
    Info {
        section: Option<String>,
    },
    ReplConf(ReplConf),
    Psync {
        replid: String,
        offset: i64,
    },
    Wait {
        replicas: usize,
        /// None waits forever
        timeout: Option<Duration>,
    },
    XAdd {
        key: String,
        id: IdSpec,
        fields: Fields,
    },
    XRange {
        key: String,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    },
    XRead {
        count: Option<usize>,
        /// `Some(ZERO)` blocks without a deadline
        block: Option<Duration>,
        streams: Vec<(String, ReadFrom)>,
    },
}

impl Command {
    /// Parse request parts; the name is matched case-insensitively.
    pub fn parse(parts: &[Bytes]) -> Result<Command, CommandError> {
        let Some(name) = parts.first() else {
            return Err(CommandError::Syntax);
        };
        let args = &parts[1..];

        match name.to_ascii_uppercase().as_slice() {
            b"PING" => match args {
                [] => Ok(Command::Ping { message: None }),
                [message] => Ok(Command::Ping {
                    message: Some(message.clone()),
                }),
                _ => Err(CommandError::WrongArity("ping")),
            },

            b"ECHO" => match args {
                [message] => Ok(Command::Echo {
                    message: message.clone(),
                }),
                _ => Err(CommandError::WrongArity("echo")),
            },

            b"SET" => parse_set(args),

            b"GET" => match args {
                [key] => Ok(Command::Get { key: text(key) }),
                _ => Err(CommandError::WrongArity("get")),
            },

            b"CONFIG" => parse_config(args),

            b"KEYS" => match args {
                [pattern] => Ok(Command::Keys {
                    pattern: text(pattern),
                }),
                _ => Err(CommandError::WrongArity("keys")),
            },

            b"TYPE" => match args {
                [key] => Ok(Command::Type { key: text(key) }),
                _ => Err(CommandError::WrongArity("type")),
            },

            b"INFO" => match args {
                [] => Ok(Command::Info { section: None }),
                [section] => Ok(Command::Info {
                    section: Some(text(section).to_ascii_lowercase()),
                }),
                _ => Err(CommandError::Syntax),
            },

            b"REPLCONF" => parse_replconf(args),

            b"PSYNC" => match args {
                [replid, offset] => Ok(Command::Psync {
                    replid: text(replid),
                    offset: integer(offset)?,
                }),
                _ => Err(CommandError::WrongArity("psync")),
            },

            b"WAIT" => match args {
                [replicas, timeout] => {
                    let replicas = integer(replicas)?;
                    let timeout = integer(timeout)?;
                    if timeout < 0 {
                        return Err(CommandError::NegativeTimeout);
                    }
                    Ok(Command::Wait {
                        replicas: replicas.max(0) as usize,
                        timeout: (timeout > 0).then(|| Duration::from_millis(timeout as u64)),
                    })
                }
                _ => Err(CommandError::WrongArity("wait")),
            },

            b"XADD" => parse_xadd(args),

            b"XRANGE" => parse_xrange(args),

            b"XREAD" => parse_xread(args),

            _ => Err(CommandError::UnknownCommand(text(name))),
        }
    }

    /// Whether the command mutates the keyspace and must be propagated.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set { .. } | Command::XAdd { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping { .. } => "ping",
            Command::Echo { .. } => "echo",
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::ConfigGet { .. } | Command::ConfigSet { .. } => "config",
            Command::Keys { .. } => "keys",
            Command::Type { .. } => "type",
            Command::Info { .. } => "info",
            Command::ReplConf(_) => "replconf",
            Command::Psync { .. } => "psync",
            Command::Wait { .. } => "wait",
            Command::XAdd { .. } => "xadd",
            Command::XRange { .. } => "xrange",
            Command::XRead { .. } => "xread",
        }
    }
}

fn text(part: &Bytes) -> String {
    String::from_utf8_lossy(part).into_owned()
}

fn integer(part: &Bytes) -> Result<i64, CommandError> {
    std::str::from_utf8(part)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}

fn option(part: &Bytes) -> Vec<u8> {
    part.to_ascii_uppercase()
}

fn parse_set(args: &[Bytes]) -> Result<Command, CommandError> {
    let [key, value, options @ ..] = args else {
        return Err(CommandError::WrongArity("set"));
    };

    let mut ttl = None;
    let mut options = options.iter();
    while let Some(opt) = options.next() {
        let unit_ms = match option(opt).as_slice() {
            b"PX" => 1,
            b"EX" => 1000,
            _ => return Err(CommandError::Syntax),
        };
        if ttl.is_some() {
            return Err(CommandError::Syntax);
        }
        let amount = integer(options.next().ok_or(CommandError::Syntax)?)?;
        if amount <= 0 {
            return Err(CommandError::InvalidExpire("set"));
        }
        let ms = (amount as u64)
            .checked_mul(unit_ms)
            .ok_or(CommandError::InvalidExpire("set"))?;
        ttl = Some(Duration::from_millis(ms));
    }

    Ok(Command::Set {
        key: text(key),
        value: value.clone(),
        ttl,
    })
}

fn parse_config(args: &[Bytes]) -> Result<Command, CommandError> {
    let Some(sub) = args.first() else {
        return Err(CommandError::WrongArity("config"));
    };
    match option(sub).as_slice() {
        b"GET" if args.len() >= 2 => Ok(Command::ConfigGet {
            params: args[1..].iter().map(|p| text(p).to_ascii_lowercase()).collect(),
        }),
        b"SET" if args.len() == 3 => Ok(Command::ConfigSet {
            param: text(&args[1]).to_ascii_lowercase(),
            value: text(&args[2]),
        }),
        b"GET" | b"SET" => Err(CommandError::WrongArity("config")),
        _ => Err(CommandError::UnknownSubcommand {
            command: "config",
            subcommand: text(sub),
        }),
    }
}

fn parse_replconf(args: &[Bytes]) -> Result<Command, CommandError> {
    let Some(sub) = args.first() else {
        return Err(CommandError::WrongArity("replconf"));
    };
    let rest = &args[1..];
    match option(sub).as_slice() {
        b"LISTENING-PORT" => match rest {
            [port] => {
                let port = integer(port)?;
                u16::try_from(port)
                    .map(|port| Command::ReplConf(ReplConf::ListeningPort(port)))
                    .map_err(|_| CommandError::NotAnInteger)
            }
            _ => Err(CommandError::WrongArity("replconf")),
        },
        b"CAPA" if !rest.is_empty() => {
            // `capa eof capa psync2` repeats the keyword between values
            let capabilities = rest
                .iter()
                .filter(|part| !part.eq_ignore_ascii_case(b"capa"))
                .map(text)
                .collect();
            Ok(Command::ReplConf(ReplConf::Capa(capabilities)))
        }
        b"GETACK" => Ok(Command::ReplConf(ReplConf::GetAck)),
        b"ACK" => match rest {
            [offset] => {
                let offset = integer(offset)?;
                Ok(Command::ReplConf(ReplConf::Ack(offset.max(0) as u64)))
            }
            _ => Err(CommandError::WrongArity("replconf")),
        },
        _ => Err(CommandError::Syntax),
    }
}

fn parse_xadd(args: &[Bytes]) -> Result<Command, CommandError> {
    let [key, id, pairs @ ..] = args else {
        return Err(CommandError::WrongArity("xadd"));
    };
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err(CommandError::WrongArity("xadd"));
    }

    let id = IdSpec::parse(&text(id))?;
    let fields = pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    Ok(Command::XAdd {
        key: text(key),
        id,
        fields,
    })
}

fn parse_count(part: Option<&Bytes>) -> Result<usize, CommandError> {
    let count = integer(part.ok_or(CommandError::Syntax)?)?;
    Ok(count.max(0) as usize)
}

fn parse_xrange(args: &[Bytes]) -> Result<Command, CommandError> {
    let (key, start, end, rest) = match args {
        [key, start, end, rest @ ..] => (key, start, end, rest),
        _ => return Err(CommandError::WrongArity("xrange")),
    };

    let count = match rest {
        [] => None,
        [opt, n] if option(opt) == b"COUNT" => Some(parse_count(Some(n))?),
        _ => return Err(CommandError::Syntax),
    };

    Ok(Command::XRange {
        key: text(key),
        start: StreamId::parse_range_start(&text(start))?,
        end: StreamId::parse_range_end(&text(end))?,
        count,
    })
}

fn parse_xread(args: &[Bytes]) -> Result<Command, CommandError> {
    let mut count = None;
    let mut block = None;
    let mut i = 0;

    loop {
        let Some(opt) = args.get(i) else {
            return Err(CommandError::Syntax);
        };
        match option(opt).as_slice() {
            b"COUNT" => {
                count = Some(parse_count(args.get(i + 1))?);
                i += 2;
            }
            b"BLOCK" => {
                let ms = integer(args.get(i + 1).ok_or(CommandError::Syntax)?)?;
                if ms < 0 {
                    return Err(CommandError::NegativeTimeout);
                }
                block = Some(Duration::from_millis(ms as u64));
                i += 2;
            }
            b"STREAMS" => {
                i += 1;
                break;
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    let rest = &args[i..];
    if rest.is_empty() {
        return Err(CommandError::WrongArity("xread"));
    }
    if rest.len() % 2 != 0 {
        return Err(CommandError::UnbalancedStreams);
    }

    let (keys, ids) = rest.split_at(rest.len() / 2);
    let streams = keys
        .iter()
        .zip(ids)
        .map(|(key, id)| -> Result<(String, ReadFrom), CommandError> {
            let from = match &id[..] {
                b"$" => ReadFrom::Latest,
                _ => ReadFrom::After(StreamId::parse_read_position(&text(id))?),
            };
            Ok((text(key), from))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Command::XRead {
        count,
        block,
        streams,
    })
}
