// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The bounded set of in-flight pictures.
//!
//! Pictures live in an arena of slots and are addressed through [`PictureHandle`]s carrying the
//! generation of the slot they were issued for. A slot changes generation every time it is handed
//! out again, so a handle kept past the lifetime of its picture resolves to nothing instead of to
//! an unrelated picture. A picture leaves the ring only once it is no longer referenced.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::Sps;
use crate::codec::h265::picture::PictureData;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Stable reference to a picture of a [`PictureRing`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PictureHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    picture: Option<PictureData>,
}

#[derive(Debug)]
pub struct PictureRing {
    slots: Vec<Slot>,
    /// Occupied slots, oldest admission first.
    order: VecDeque<usize>,
    capacity: usize,
    adaptive_qp: bool,
    /// POC of the last admitted picture, -1 before the first one.
    poc_last: i32,
}

impl PictureRing {
    /// Creates an empty ring holding at most `capacity` pictures. Pictures get adaptive QP layers
    /// when `adaptive_qp` is set.
    pub fn new(capacity: usize, adaptive_qp: bool) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            adaptive_qp,
            poc_last: -1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn poc_last(&self) -> i32 {
        self.poc_last
    }

    fn handle(&self, index: usize) -> PictureHandle {
        PictureHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Hands out a writable picture for a new input picture coded with `sps` and `pps`.
    ///
    /// The first unreferenced picture in admission order is reused. If it was sized for another
    /// PPS it is destroyed and a fresh picture takes its slot. With no unreferenced picture a new
    /// one is allocated, which fails once the ring is full. The returned picture is referenced,
    /// not reconstructed, and carries the next POC. `rec_out` is rotated by one entry so that it
    /// stays paired with the ring.
    pub fn acquire<T>(
        &mut self,
        sps: &Arc<Sps>,
        pps: &Arc<Pps>,
        rec_out: &mut VecDeque<T>,
    ) -> EncodeResult<PictureHandle> {
        if !rec_out.is_empty() {
            rec_out.rotate_left(1);
        }

        let reusable = self.order.iter().position(|index| {
            self.slots[*index]
                .picture
                .as_ref()
                .is_some_and(|p| !p.referenced)
        });

        let index = match reusable {
            Some(pos) => {
                let index = self.order.remove(pos).ok_or(EncodeError::InvalidInternalState)?;
                let slot = &mut self.slots[index];
                slot.generation += 1;

                match slot.picture.as_mut() {
                    Some(picture) if picture.pps_id() == pps.pps_id => {
                        log::trace!("reusing picture of POC {}", picture.poc);
                        picture.sps = Arc::clone(sps);
                        picture.pps = Arc::clone(pps);
                    }
                    _ => {
                        if let Some(mut stale) = slot.picture.take() {
                            log::trace!(
                                "reallocating picture of POC {}: PPS {} replaced by {}",
                                stale.poc,
                                stale.pps_id(),
                                pps.pps_id
                            );
                            stale.destroy_aq_layers();
                        }
                        slot.picture = Some(PictureData::new(
                            Arc::clone(sps),
                            Arc::clone(pps),
                            self.adaptive_qp,
                        ));
                    }
                }

                index
            }
            None if self.order.len() < self.capacity => {
                let picture = PictureData::new(Arc::clone(sps), Arc::clone(pps), self.adaptive_qp);

                // Slots freed by eviction are reused before growing the arena.
                match self.slots.iter().position(|slot| slot.picture.is_none()) {
                    Some(index) => {
                        let slot = &mut self.slots[index];
                        slot.generation += 1;
                        slot.picture = Some(picture);
                        index
                    }
                    None => {
                        self.slots.push(Slot {
                            generation: 0,
                            picture: Some(picture),
                        });
                        self.slots.len() - 1
                    }
                }
            }
            None => {
                log::error!(
                    "no picture can be recycled, all {} are referenced",
                    self.capacity
                );
                return Err(EncodeError::RingExhausted {
                    capacity: self.capacity,
                });
            }
        };

        self.order.push_back(index);
        self.poc_last += 1;

        let poc = self.poc_last;
        let picture = self.slots[index]
            .picture
            .as_mut()
            .ok_or(EncodeError::InvalidInternalState)?;
        picture.poc = poc;
        picture.referenced = true;
        picture.reconstructed = false;
        picture.field_pic = false;
        picture.top_field = false;

        log::trace!("acquired picture for POC {} in slot {}", poc, index);

        Ok(self.handle(index))
    }

    pub fn get(&self, handle: PictureHandle) -> Option<&PictureData> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.picture.as_ref())
    }

    pub fn get_mut(&mut self, handle: PictureHandle) -> Option<&mut PictureData> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.picture.as_mut())
    }

    /// Handles of the pictures in admission order.
    pub fn handles(&self) -> Vec<PictureHandle> {
        self.order.iter().map(|index| self.handle(*index)).collect()
    }

    /// Pictures in admission order.
    pub fn iter(&self) -> impl Iterator<Item = (PictureHandle, &PictureData)> + '_ {
        self.order.iter().filter_map(|index| {
            let picture = self.slots[*index].picture.as_ref()?;
            Some((self.handle(*index), picture))
        })
    }

    /// Looks up the picture with `poc`.
    pub fn find_poc(&self, poc: i32) -> Option<PictureHandle> {
        self.iter().find(|(_, p)| p.poc == poc).map(|(handle, _)| handle)
    }

    /// Marks the picture as no longer needed for reference, making it recyclable.
    pub fn release(&mut self, handle: PictureHandle) -> EncodeResult<()> {
        let picture = self
            .get_mut(handle)
            .ok_or(EncodeError::InvalidPictureHandle)?;
        picture.referenced = false;
        Ok(())
    }

    /// Removes an unreferenced picture from the ring, freeing its slot.
    pub fn evict(&mut self, handle: PictureHandle) -> EncodeResult<PictureData> {
        let picture = self.get(handle).ok_or(EncodeError::InvalidPictureHandle)?;
        if picture.referenced {
            return Err(EncodeError::PictureReferenced { poc: picture.poc });
        }

        self.order.retain(|index| *index != handle.index);
        let slot = &mut self.slots[handle.index];
        slot.generation += 1;
        let mut picture = slot
            .picture
            .take()
            .ok_or(EncodeError::InvalidInternalState)?;
        picture.destroy_aq_layers();

        log::trace!("evicted picture of POC {}", picture.poc);

        Ok(picture)
    }

    /// Destroys every picture regardless of its reference state, freeing the AQ layers first.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(mut picture) = slot.picture.take() {
                picture.destroy_aq_layers();
            }
            slot.generation += 1;
        }

        self.order.clear();
    }
}
