use ledgerd_primitives::{Block, BlockHeader, Hash256};

/// Typed peer message, already decoded by the framing layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version { nonce: u64, start_height: u32 },
    Verack,
    Ping { height: u32 },
    Pong { height: u32 },
    /// Headers following `locator`; `start_height` is the first height wanted.
    GetHeaders { start_height: u32, locator: Hash256 },
    Headers(Vec<BlockHeader>),
    GetBlock { hash: Hash256 },
    Block(Box<Block>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::Verack => "verack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetBlock { .. } => "getdata",
            Message::Block(_) => "block",
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Message::Version { .. } | Message::Verack)
    }
}
