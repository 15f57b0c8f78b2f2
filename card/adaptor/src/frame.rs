// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command framing for the adaptor's vendor protocol.
//!
//! Every command is a fixed skeleton beginning with the SIO2 memory card
//! target byte 0x81, wrapped in an `AA 42 <size> 00` header. Zero bytes in a
//! skeleton are slots filled in by either side: the slot following the
//! opcode (and its discriminator byte, on commands that carry one) returns
//! the card-flags snapshot, and data-carrying commands keep their variable
//! bytes at the tail, paired with a one-byte XOR checksum. Outbound data of
//! index-style commands is written in reverse order, which puts multi-byte
//! integers on the wire big-endian.

use ps2mc_err::{Error, Result};

/// Whether a command carries variable data, and in which direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Data {
    None,
    /// The last `n` response bytes are data, preceded by their XOR checksum.
    Get(usize),
    /// The last skeleton byte is the XOR checksum of the `n` data bytes
    /// preceding it.
    Put(usize),
}

pub(crate) struct Command {
    pub name: &'static str,
    pub skeleton: &'static [u8],
    pub data: Data,
    /// Data bytes are written (and read back) in reverse order.
    pub reverse: bool,
}

macro_rules! commands {
    ($($name:ident => $skeleton:expr, $data:expr, $reverse:expr;)*) => {
        $(pub(crate) const $name: Command = Command {
            name: stringify!($name),
            skeleton: $skeleton,
            data: $data,
            reverse: $reverse,
        };)*
    };
}

commands! {
    // MagicGate handshake, in issue order
    AUTHORIZE => &[0x81, 0xF7, 0x01, 0x00], Data::None, false;
    AUTH_00 => &[0x81, 0xF0, 0x00, 0x00, 0x00], Data::None, false;
    GET_VECTOR => &[0x81, 0xF0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    GET_PLAIN => &[0x81, 0xF0, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    AUTH_03 => &[0x81, 0xF0, 0x03, 0x00, 0x00], Data::None, false;
    GET_NONCE => &[0x81, 0xF0, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    AUTH_05 => &[0x81, 0xF0, 0x05, 0x00, 0x00], Data::None, false;
    PUT_CHALLENGE1 => &[0x81, 0xF0, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(8), true;
    PUT_CHALLENGE2 => &[0x81, 0xF0, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(8), true;
    AUTH_08 => &[0x81, 0xF0, 0x08, 0x00, 0x00], Data::None, false;
    AUTH_09 => &[0x81, 0xF0, 0x09, 0x00, 0x00], Data::None, false;
    AUTH_0A => &[0x81, 0xF0, 0x0A, 0x00, 0x00], Data::None, false;
    PUT_CHALLENGE3 => &[0x81, 0xF0, 0x0B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(8), true;
    AUTH_0C => &[0x81, 0xF0, 0x0C, 0x00, 0x00], Data::None, false;
    AUTH_0D => &[0x81, 0xF0, 0x0D, 0x00, 0x00], Data::None, false;
    AUTH_0E => &[0x81, 0xF0, 0x0E, 0x00, 0x00], Data::None, false;
    GET_RESPONSE1 => &[0x81, 0xF0, 0x0F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    AUTH_10 => &[0x81, 0xF0, 0x10, 0x00, 0x00], Data::None, false;
    GET_RESPONSE2 => &[0x81, 0xF0, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    AUTH_12 => &[0x81, 0xF0, 0x12, 0x00, 0x00], Data::None, false;
    GET_RESPONSE3 => &[0x81, 0xF0, 0x13, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;
    AUTH_14 => &[0x81, 0xF0, 0x14, 0x00, 0x00], Data::None, false;

    // housekeeping
    PUT_SENTINEL => &[0x81, 0x27, 0x5A, 0x00], Data::None, false;
    GET_SPECS => &[0x81, 0x26, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), true;

    // page I/O
    PUT_READ_INDEX => &[0x81, 0x23, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(4), true;
    GET_READ_8 => &[0x81, 0x43, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Get(8), false;
    PUT_WRITE_INDEX => &[0x81, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(4), true;
    PUT_WRITE_8 => &[0x81, 0x42, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(8), false;
    IO_FIN => &[0x81, 0x81, 0x00], Data::None, false;
    PUT_ERASE_INDEX => &[0x81, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], Data::Put(4), true;
    ERASE_CONFIRM => &[0x81, 0x82, 0x00], Data::None, false;
    ERASE_FIN => &[0x81, 0x81, 0x00], Data::None, false;
}

/// Decoded response: the card-flags snapshot every reply carries, plus the
/// data bytes of `Get` commands.
pub(crate) struct Reply {
    pub card_flags: u8,
    pub data: Vec<u8>,
}

pub(crate) fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &byte| acc ^ byte)
}

/// Offset of the card-flags slot within a frame body. The auth engine
/// commands (0xF0/0xF7), the sentinel and the byte-granular transfer
/// commands carry a discriminator byte after the opcode, pushing the slot
/// one position back. The step id of `AUTH_00` is itself a literal zero, so
/// this cannot be derived by scanning the skeleton for placeholders.
pub(crate) fn flags_slot(body: &[u8]) -> usize {
    match body[1] {
        0xF0 | 0xF7 | 0x27 | 0x43 | 0x42 => 3,
        _ => 2,
    }
}

/// Builds the wire frame for `command`, filling its data slot from
/// `payload`.
pub(crate) fn pack(command: &Command, payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = command.skeleton.to_vec();
    match command.data {
        Data::None | Data::Get(_) => {
            if !payload.is_empty() {
                return Err(Error::InvalidArgument("command takes no data"));
            }
        }
        Data::Put(length) => {
            if payload.len() != length {
                return Err(Error::InvalidArgument("command data length"));
            }
            let slot = body.len() - length - 1;
            for (index, &byte) in payload.iter().enumerate() {
                if command.reverse {
                    body[slot + length - 1 - index] = byte;
                } else {
                    body[slot + index] = byte;
                }
            }
            body[slot + length] = xor(payload);
        }
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&[0xAA, 0x42, (body.len() + 2) as u8, 0x00]);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validates a response and extracts the card flags and any returned data.
pub(crate) fn unpack(command: &Command, response: &[u8]) -> Result<Reply> {
    if response.len() < command.skeleton.len() || response[0] != 0x55 || response[1] != 0x5A {
        return Err(Error::Protocol(command.name));
    }

    let card_flags = response[flags_slot(command.skeleton)];

    let data = match command.data {
        Data::Get(length) => {
            let end = command.skeleton.len();
            let wire = &response[end - length..end];
            if xor(wire) != response[end - length - 1] {
                return Err(Error::ReadChecksum);
            }
            if command.reverse {
                wire.iter().rev().copied().collect()
            } else {
                wire.to_vec()
            }
        }
        _ => Vec::new(),
    };

    Ok(Reply { card_flags, data })
}
