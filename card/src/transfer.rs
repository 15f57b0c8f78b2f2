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

//! Whole-card bulk operations.
//!
//! All three operations are iterators that advance one page (or block) per
//! `next` call, so a front-end can drive them from whatever threading model
//! it likes and report progress between steps. Each checks a cooperative
//! stop flag between pages; once stopped, the current page is already
//! complete and the iterator ends.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::warn;
use ps2mc_err::{Error, Result};

use crate::{CardSpecs, MemoryCard};

/// Cards settle for this long between a full erase and the first write.
const SETTLE_DELAY: Duration = Duration::from_secs(5);

fn stopped(stop: &Option<Arc<AtomicBool>>) -> bool {
    stop.as_ref()
        .is_some_and(|stop| stop.load(Ordering::Relaxed))
}

/// Dumps every physical page, data followed by spare bytes, to `sink`.
/// Produces a byte-identical `.ps2` image of the card.
///
/// A page that fails to read is recorded, its slot filled with erased bytes
/// so later pages keep their offsets, and the dump keeps going; the failures
/// are reported per page and collected in [`Dump::skipped`].
pub struct Dump<'card, MC: MemoryCard, W: Write> {
    card: &'card mut MC,
    sink: W,
    page: u32,
    card_size: u32,
    filler: Vec<u8>,
    skipped: Vec<u32>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'card, MC: MemoryCard, W: Write> Dump<'card, MC, W> {
    pub fn new(card: &'card mut MC, sink: W) -> Result<Self> {
        let specs = card.specs()?;
        Ok(Self {
            card,
            sink,
            page: 0,
            card_size: specs.card_size,
            filler: vec![specs.erased_byte(); specs.spare_page_size()],
            skipped: Vec::new(),
            stop: None,
        })
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn pages(&self) -> u32 {
        self.card_size
    }

    /// Pages that failed to read and were replaced by erased filler.
    pub fn skipped(&self) -> &[u32] {
        &self.skipped
    }
}

impl<MC: MemoryCard, W: Write> Iterator for Dump<'_, MC, W> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page >= self.card_size || stopped(&self.stop) {
            return None;
        }

        let page = self.page;
        self.page += 1;

        Some(match self.card.read_page(page) {
            Ok(contents) => {
                let result = self
                    .sink
                    .write_all(&contents.data)
                    .and_then(|_| self.sink.write_all(&contents.spare));
                match result {
                    Ok(_) => Ok(page),
                    Err(error) => Err(error.into()),
                }
            }
            Err(error) => {
                warn!("Skipping unreadable page {page}: {error}");
                self.skipped.push(page);
                match self.sink.write_all(&self.filler) {
                    Ok(_) => Err(error),
                    Err(error) => Err(error.into()),
                }
            }
        })
    }
}

/// Progress of a [`Restore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The block starting at this page has been erased.
    Erased(u32),
    /// The post-erase settle delay has elapsed.
    Settled,
    /// This page has been written with its spare bytes.
    Written(u32),
}

/// Restores a card from an image, or copies one card onto another.
///
/// The destination geometry must match the source unless the destination is
/// unformatted; the check happens in [`Restore::new`], before anything is
/// destroyed. Every block is erased first, then the card settles for five
/// seconds, then pages are written front to back. Unlike a dump, a restore
/// aborts on the first failure: continuing past a failed write would leave
/// the card silently corrupt.
pub struct Restore<'a, S: MemoryCard, D: MemoryCard> {
    source: &'a mut S,
    dest: &'a mut D,
    phase: Phase,
    page: u32,
    card_size: u32,
    block_size: u32,
    settle_delay: Duration,
    stop: Option<Arc<AtomicBool>>,
}

enum Phase {
    Erase,
    Settle,
    Write,
    Done,
}

impl<'a, S: MemoryCard, D: MemoryCard> Restore<'a, S, D> {
    pub fn new(source: &'a mut S, dest: &'a mut D) -> Result<Self> {
        let source_specs = source.specs()?;
        let dest_specs = dest.specs()?;
        if dest.is_formatted()? && !Self::geometry_matches(source_specs, dest_specs) {
            return Err(Error::GeometryMismatch);
        }

        Ok(Self {
            source,
            dest,
            phase: Phase::Erase,
            page: 0,
            card_size: source_specs.card_size,
            block_size: dest_specs.block_size.max(1) as u32,
            settle_delay: SETTLE_DELAY,
            stop: None,
        })
    }

    #[cfg(test)]
    fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn pages(&self) -> u32 {
        self.card_size
    }

    fn geometry_matches(source: CardSpecs, dest: CardSpecs) -> bool {
        source.page_size == dest.page_size
            && source.block_size == dest.block_size
            && source.card_size == dest.card_size
    }
}

impl<S: MemoryCard, D: MemoryCard> Iterator for Restore<'_, S, D> {
    type Item = Result<Progress>;

    fn next(&mut self) -> Option<Self::Item> {
        if stopped(&self.stop) {
            self.phase = Phase::Done;
        }

        match self.phase {
            Phase::Erase => {
                let page = self.page;
                match self.dest.erase_block(page) {
                    Ok(_) => {
                        self.page += self.block_size;
                        if self.page >= self.card_size {
                            self.phase = Phase::Settle;
                        }
                        Some(Ok(Progress::Erased(page)))
                    }
                    Err(error) => {
                        self.phase = Phase::Done;
                        Some(Err(error))
                    }
                }
            }
            Phase::Settle => {
                thread::sleep(self.settle_delay);
                self.phase = Phase::Write;
                self.page = 0;
                Some(Ok(Progress::Settled))
            }
            Phase::Write => {
                let page = self.page;
                let result = self.source.read_page(page).and_then(|contents| {
                    self.dest.write_page(page, &contents.data, &contents.spare)
                });
                match result {
                    Ok(_) => {
                        self.page += 1;
                        if self.page >= self.card_size {
                            self.phase = Phase::Done;
                        }
                        Some(Ok(Progress::Written(page)))
                    }
                    Err(error) => {
                        self.phase = Phase::Done;
                        Some(Err(error))
                    }
                }
            }
            Phase::Done => None,
        }
    }
}

/// Erases every block on the card. Erasing also drops the handle's cached
/// superblock and pages.
pub struct EraseAll<'card, MC: MemoryCard> {
    card: &'card mut MC,
    page: u32,
    card_size: u32,
    block_size: u32,
    stop: Option<Arc<AtomicBool>>,
}

impl<'card, MC: MemoryCard> EraseAll<'card, MC> {
    pub fn new(card: &'card mut MC) -> Result<Self> {
        let specs = card.specs()?;
        Ok(Self {
            card,
            page: 0,
            card_size: specs.card_size,
            block_size: (specs.block_size.max(1)) as u32,
            stop: None,
        })
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn pages(&self) -> u32 {
        self.card_size
    }
}

impl<MC: MemoryCard> Iterator for EraseAll<'_, MC> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page >= self.card_size || stopped(&self.stop) {
            return None;
        }

        let page = self.page;
        self.page += self.block_size;
        Some(self.card.erase_block(page).map(|_| page))
    }
}
