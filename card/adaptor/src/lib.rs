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

//! Memory card reached through the USB "PS3 Memory Card Adaptor".
//!
//! The adaptor tunnels SIO2 memory card commands over two bulk endpoints.
//! It only honors page I/O after the MagicGate handshake has completed, so
//! opening a handle authenticates before anything else; a failed handshake
//! does not error out of the device, it silently yields corrupt reads.

mod auth;
mod frame;

use std::{collections::HashMap, time::Duration};

use log::{debug, info, trace, warn};
use ps2mc_card::{ecc, CardSpecs, MemoryCard, Page, Superblock, SUPERBLOCK_SIZE};
use ps2mc_err::{Error, Result};
use rusb::UsbContext;

use crate::frame::Command;

pub const VENDOR_ID: u16 = 0x054C;
pub const PRODUCT_ID: u16 = 0x02EA;

const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x81;
const TIMEOUT: Duration = Duration::from_secs(5);

/// Full handshake attempts before giving up.
const AUTH_ATTEMPTS: usize = 5;

/// A byte pipe to the adaptor. The protocol is strictly request/response;
/// one frame out, one reply in, never interleaved.
pub trait Transport {
    fn max_packet_size(&self) -> usize;

    fn send(&mut self, frame: &[u8]) -> Result<()>;

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize>;
}

/// Bulk transfers through the adaptor's single configuration.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    max_packet_size: usize,
}

impl UsbTransport {
    pub fn open() -> Result<Self> {
        let context = rusb::Context::new()?;
        let mut handle = context
            .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or(Error::DeviceAbsent)?;

        let config = handle.device().active_config_descriptor()?;
        let max_packet_size = config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .flat_map(|descriptor| descriptor.endpoint_descriptors())
            .find(|endpoint| endpoint.address() == ENDPOINT_IN)
            .map(|endpoint| endpoint.max_packet_size() as usize)
            .ok_or(Error::DeviceAbsent)?;

        handle.set_auto_detach_kernel_driver(true).ok();
        handle.claim_interface(0)?;
        Ok(Self {
            handle,
            max_packet_size,
        })
    }
}

impl Transport for UsbTransport {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.handle.write_bulk(ENDPOINT_OUT, frame, TIMEOUT)?;
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(self.handle.read_bulk(ENDPOINT_IN, buffer, TIMEOUT)?)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.handle.release_interface(0).ok();
    }
}

pub struct MemoryCardServer<T: Transport = UsbTransport> {
    transport: T,
    /// Card-flags snapshot returned with every reply.
    card_flags: u8,
    specs: Option<CardSpecs>,
    superblock: Option<Superblock>,
    pages: HashMap<u32, Page>,
}

impl MemoryCardServer<UsbTransport> {
    /// Finds the adaptor, authenticates and negotiates the card geometry.
    pub fn open() -> Result<Self> {
        Self::with_transport(UsbTransport::open()?)
    }
}

impl<T: Transport> MemoryCardServer<T> {
    pub fn with_transport(transport: T) -> Result<Self> {
        let mut server = Self {
            transport,
            card_flags: 0,
            specs: None,
            superblock: None,
            pages: HashMap::new(),
        };
        server.authenticate()?;
        // without the sentinel, reads after the handshake can hang
        server.command(&frame::PUT_SENTINEL, &[])?;
        server.specs()?;
        Ok(server)
    }

    fn command(&mut self, command: &Command, payload: &[u8]) -> Result<frame::Reply> {
        let request = frame::pack(command, payload)?;
        trace!("{} > {}", command.name, hex::encode(&request));
        self.transport.send(&request)?;

        let length = self
            .transport
            .max_packet_size()
            .max(command.skeleton.len());
        let mut buffer = vec![0u8; length];
        let length = self.transport.receive(&mut buffer)?;
        trace!("{} < {}", command.name, hex::encode(&buffer[..length]));

        let reply = frame::unpack(command, &buffer[..length])?;
        self.card_flags = reply.card_flags;
        Ok(reply)
    }

    fn get(&mut self, command: &Command) -> Result<[u8; 8]> {
        self.command(command, &[])?
            .data
            .try_into()
            .map_err(|_| Error::Protocol(command.name))
    }

    fn authenticate(&mut self) -> Result<()> {
        for attempt in 1..=AUTH_ATTEMPTS {
            match self.try_authenticate() {
                Ok(session_key) => {
                    debug!("Authenticated, session key {}", hex::encode(session_key));
                    return Ok(());
                }
                Err(error @ (Error::AuthFailure | Error::Protocol(_) | Error::ReadChecksum)) => {
                    warn!("Authentication attempt {attempt}/{AUTH_ATTEMPTS} failed: {error}")
                }
                Err(error) => return Err(error),
            }
        }
        Err(Error::AuthFailure)
    }

    /// One full pass of the MagicGate sequence. Not reentrant; any failure
    /// restarts from the beginning.
    fn try_authenticate(&mut self) -> Result<[u8; 8]> {
        self.command(&frame::AUTHORIZE, &[])?;
        self.command(&frame::AUTH_00, &[])?;

        let vector = self.get(&frame::GET_VECTOR)?;
        let plain = self.get(&frame::GET_PLAIN)?;
        let auth_key = auth::derive_auth_key(&vector, &plain);

        self.command(&frame::AUTH_03, &[])?;
        let nonce = self.get(&frame::GET_NONCE)?;
        let challenges = auth::derive_challenges(&auth_key, &nonce, &vector);

        self.command(&frame::AUTH_05, &[])?;
        self.command(&frame::PUT_CHALLENGE1, &challenges.challenge1)?;
        self.command(&frame::PUT_CHALLENGE2, &challenges.challenge2)?;
        self.command(&frame::AUTH_08, &[])?;
        self.command(&frame::AUTH_09, &[])?;
        self.command(&frame::AUTH_0A, &[])?;
        self.command(&frame::PUT_CHALLENGE3, &challenges.challenge3)?;
        self.command(&frame::AUTH_0C, &[])?;
        self.command(&frame::AUTH_0D, &[])?;
        self.command(&frame::AUTH_0E, &[])?;

        let response1 = self.get(&frame::GET_RESPONSE1)?;
        self.command(&frame::AUTH_10, &[])?;
        let response2 = self.get(&frame::GET_RESPONSE2)?;
        self.command(&frame::AUTH_12, &[])?;
        let response3 = self.get(&frame::GET_RESPONSE3)?;
        self.command(&frame::AUTH_14, &[])?;

        auth::verify_responses(&auth_key, &nonce, &response1, &response2, &response3)
    }

    /// Number of spare-area reads per page, 8 bytes each.
    fn spare_reads(specs: &CardSpecs) -> usize {
        (specs.page_size as usize / ecc::CHUNK_SIZE * ecc::ECC_SIZE + 4) / 8
    }
}

impl<T: Transport> MemoryCard for MemoryCardServer<T> {
    fn specs(&mut self) -> Result<CardSpecs> {
        if let Some(specs) = self.specs {
            return Ok(specs);
        }

        let reply = self.command(&frame::GET_SPECS, &[])?;
        let data: [u8; 8] = reply
            .data
            .try_into()
            .map_err(|_| Error::Protocol(frame::GET_SPECS.name))?;
        let specs = CardSpecs {
            card_size: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            block_size: u16::from_be_bytes([data[4], data[5]]),
            page_size: u16::from_be_bytes([data[6], data[7]]),
            card_flags: self.card_flags,
        };
        info!(
            "Card: {} pages of {} bytes, {} pages per block, flags {:#04x}",
            specs.card_size, specs.page_size, specs.block_size, specs.card_flags
        );
        self.specs = Some(specs);
        Ok(specs)
    }

    fn superblock(&mut self) -> Result<Superblock> {
        if let Some(superblock) = &self.superblock {
            return Ok(superblock.clone());
        }

        let mut buffer = Vec::with_capacity(SUPERBLOCK_SIZE);
        let mut page = 0;
        while buffer.len() < SUPERBLOCK_SIZE {
            buffer.extend_from_slice(&self.read_page(page)?.data);
            page += 1;
        }

        let superblock = Superblock::parse(&buffer)?;
        self.superblock = Some(superblock.clone());
        Ok(superblock)
    }

    fn read_page(&mut self, page: u32) -> Result<Page> {
        let specs = self.specs()?;
        if page >= specs.card_size {
            return Err(Error::InvalidArgument("page out of range"));
        }
        if let Some(contents) = self.pages.get(&page) {
            return Ok(contents.clone());
        }

        self.command(&frame::PUT_READ_INDEX, &page.to_le_bytes())?;
        let mut data = Vec::with_capacity(specs.page_size as usize);
        for _ in 0..specs.page_size as usize / 8 {
            data.extend_from_slice(&self.command(&frame::GET_READ_8, &[])?.data);
        }
        let mut spare = Vec::with_capacity(specs.ecc_size());
        if specs.has_ecc() {
            for _ in 0..Self::spare_reads(&specs) {
                spare.extend_from_slice(&self.command(&frame::GET_READ_8, &[])?.data);
            }
        }
        self.command(&frame::IO_FIN, &[])?;

        // a spare area ending in the erased byte marks a never-written page
        if specs.has_ecc() && spare.last() != Some(&specs.erased_byte()) {
            for (index, chunk) in data.chunks_mut(ecc::CHUNK_SIZE).enumerate() {
                let offset = index * ecc::ECC_SIZE;
                let stored = [spare[offset], spare[offset + 1], spare[offset + 2]];
                match ecc::verify(chunk, &stored) {
                    ecc::Check::Valid => {}
                    ecc::Check::DataCorrected { byte, bit } => {
                        debug!("Corrected bit {bit} of byte {byte} in page {page}")
                    }
                    ecc::Check::EccCorrected(computed) => {
                        // TODO: schedule a writeback of the corrected code
                        debug!("Replacing corrupt ECC of page {page}, chunk {index}");
                        spare[offset..offset + ecc::ECC_SIZE].copy_from_slice(&computed);
                    }
                    ecc::Check::Invalid => return Err(Error::Ecc { page, chunk: index }),
                }
            }
        }

        let contents = Page { data, spare };
        self.pages.insert(page, contents.clone());
        Ok(contents)
    }

    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let specs = self.specs()?;
        if page >= specs.card_size {
            return Err(Error::InvalidArgument("page out of range"));
        }
        if data.len() != specs.page_size as usize {
            return Err(Error::InvalidArgument("page data length"));
        }
        if spare.len() != specs.ecc_size() {
            return Err(Error::InvalidArgument("spare area length"));
        }

        self.command(&frame::PUT_WRITE_INDEX, &page.to_le_bytes())?;
        for chunk in data.chunks(8) {
            self.command(&frame::PUT_WRITE_8, chunk)?;
        }
        for chunk in spare.chunks(8) {
            self.command(&frame::PUT_WRITE_8, chunk)?;
        }
        self.command(&frame::IO_FIN, &[])?;

        self.pages.insert(
            page,
            Page {
                data: data.to_vec(),
                spare: spare.to_vec(),
            },
        );
        if (page as u64) * (specs.page_size as u64) < SUPERBLOCK_SIZE as u64 {
            self.superblock = None;
        }
        Ok(())
    }

    fn erase_block(&mut self, page: u32) -> Result<()> {
        let specs = self.specs()?;
        if page >= specs.card_size {
            return Err(Error::InvalidArgument("page out of range"));
        }

        self.command(&frame::PUT_ERASE_INDEX, &page.to_le_bytes())?;
        self.command(&frame::ERASE_CONFIRM, &[])?;
        self.command(&frame::ERASE_FIN, &[])?;

        self.pages.clear();
        self.superblock = None;
        Ok(())
    }
}
