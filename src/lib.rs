#![forbid(unsafe_code)]

extern crate aes;
extern crate byteorder;
extern crate ccm;
extern crate hex;
extern crate hmac;
#[macro_use]
extern crate log;
extern crate rand;
extern crate sha2;
extern crate subtle;
extern crate zeroize;

#[cfg(test)]
extern crate hex_literal;

mod codec;
mod cookie;
mod error;
mod prf;
mod record;
mod replay;
mod transcript;

mod context;
mod machine;

pub use self::context::{
    Config, Connect, Context, Event, Handler, Psk, Session, EVENT_CONNECTED,
    EVENT_HANDSHAKE_TIMEOUT,
};
pub use self::error::{AlertDescription, AlertLevel, Error};
pub use self::machine::State;
pub use self::record::{ContentType, ProtocolVersion};

#[cfg(test)]
mod test_handshake;
