//! Bucketized cuckoo hash table keyed by 5-tuple
//!
//! The table is a single contiguous array of `size * bucket_depth` slots.
//! A key lives either in its primary bucket (`hash & (size - 1)`) or in its
//! alternate bucket, derived from the hash and the primary index. Each slot
//! stores the padded key inline, with a 15-bit gate and an occupied flag
//! packed into the otherwise unused top 16 bits of the key's second word.
//!
//! ## Layout of a slot
//!
//! ```text
//! word 0 : src_addr | dst_addr << 32
//! word 1 : src_port | dst_port << 16 | protocol << 32 | gate << 48 | occupied << 63
//! counter: u64
//! ```
//!
//! Insertion tries the primary bucket first and then performs at most one
//! level of cuckoo displacement. There is no eviction: entries leave the
//! table only through `delete` or `flush`.

use crate::error::{DataplaneError, Result};
use flowtrace_common::{constants::*, FlowKey};
use log::{debug, info, trace};

/// High bit of word 1; set on every live slot
const OCCUPIED_BIT: u64 = 1 << 63;

/// Bits of word 1 that belong to the key (ports, protocol, first pad byte)
const KEY_WORD_MASK: u64 = 0x0000_ffff_ffff_ffff;

const GATE_SHIFT: u32 = 48;
const GATE_MASK: u64 = 0x7fff << GATE_SHIFT;

/// Odd multiplier used to spread the hash's high bits into the alternate index
const ALT_INDEX_MULTIPLIER: u64 = 0x5bd1_e995;

/// One table slot
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowEntry {
    words: [u64; 2],
    counter: u64,
}

impl FlowEntry {
    fn occupied(key: &FlowKey) -> Self {
        let words = key.to_words();
        Self {
            words: [words[0], words[1] | OCCUPIED_BIT],
            counter: 0,
        }
    }

    /// Stored key, with gate and occupied bits masked out
    pub fn key(&self) -> FlowKey {
        FlowKey::from_words([self.words[0], self.words[1] & KEY_WORD_MASK])
    }

    pub fn is_occupied(&self) -> bool {
        self.words[1] & OCCUPIED_BIT != 0
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn counter_mut(&mut self) -> &mut u64 {
        &mut self.counter
    }

    pub fn gate(&self) -> u16 {
        ((self.words[1] & GATE_MASK) >> GATE_SHIFT) as u16
    }

    /// Assign the output gate; gates are 15 bits wide
    pub fn set_gate(&mut self, gate: u16) -> Result<()> {
        if gate >= INVALID_GATE {
            return Err(DataplaneError::invalid(format!(
                "gate {} must be below {}",
                gate, INVALID_GATE
            )));
        }
        self.words[1] = (self.words[1] & !GATE_MASK) | ((gate as u64) << GATE_SHIFT);
        Ok(())
    }

    /// Compare against a probe key in word form, ignoring the gate bits
    #[inline(always)]
    fn matches(&self, probe: &[u64; 2]) -> bool {
        (self.words[1] & (KEY_WORD_MASK | OCCUPIED_BIT)) == (probe[1] | OCCUPIED_BIT)
            && self.words[0] == probe[0]
    }
}

/// 32-bit CRC over the padded key bytes
#[inline(always)]
pub fn flow_hash(key: &FlowKey) -> u32 {
    crc32fast::hash(&key.to_bytes())
}

/// Primary bucket index for a hash
#[inline(always)]
pub fn primary_index(hash: u32, size: u64) -> u32 {
    (hash as u64 & (size - 1)) as u32
}

/// Alternate bucket index
///
/// The result is masked to `size_power - 1` bits, so alternate buckets
/// always fall in the lower half of the index space.
#[inline(always)]
pub fn alternate_index(hash: u32, size_power: u32, index: u32) -> u32 {
    if size_power == 0 {
        return 0;
    }
    let tag = ((hash >> size_power) as u64 + 1).wrapping_mul(ALT_INDEX_MULTIPLIER);
    ((index as u64 ^ tag) & ((1u64 << (size_power - 1)) - 1)) as u32
}

/// Cuckoo flow table
///
/// Not internally synchronised. Share it between modules through
/// [`crate::shared::SharedFlowTable`].
pub struct FlowTable {
    slots: Vec<FlowEntry>,
    size: u64,
    size_power: u32,
    bucket_depth: usize,
    count: u64,
    ref_count: u32,
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("size", &self.size)
            .field("bucket_depth", &self.bucket_depth)
            .field("count", &self.count)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

impl FlowTable {
    /// Allocate a zeroed table
    ///
    /// # Arguments
    ///
    /// * `size` - Number of buckets (power of two, 1..=2^30)
    /// * `bucket_depth` - Slots per bucket (power of two, 1..=4)
    pub fn new(size: u64, bucket_depth: usize) -> Result<Self> {
        crate::config::FlowTableConfig { size, bucket_depth }.validate()?;

        let slots_len = size * bucket_depth as u64;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slots_len as usize)
            .map_err(|_| DataplaneError::OutOfMemory { slots: slots_len })?;
        slots.resize(slots_len as usize, FlowEntry::default());

        info!(
            "Flow table allocated: {} buckets x {} slots ({} KiB)",
            size,
            bucket_depth,
            slots_len * std::mem::size_of::<FlowEntry>() as u64 / 1024
        );

        Ok(Self {
            slots,
            size,
            size_power: size.trailing_zeros(),
            bucket_depth,
            count: 0,
            ref_count: 1,
        })
    }

    /// Register one more owner
    pub fn attach(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.ref_count += 1;
        debug!("Flow table attached (ref_count = {})", self.ref_count);
        Ok(())
    }

    /// Drop one owner; storage is released with the last one
    ///
    /// # Returns
    ///
    /// `true` when this call released the storage
    pub fn detach(&mut self) -> Result<bool> {
        self.ensure_live()?;

        if self.ref_count > 1 {
            self.ref_count -= 1;
            debug!("Flow table detached (ref_count = {})", self.ref_count);
            return Ok(false);
        }

        info!("Flow table released ({} live entries)", self.count);
        *self = Self {
            slots: Vec::new(),
            size: 0,
            size_power: 0,
            bucket_depth: 0,
            count: 0,
            ref_count: 0,
        };
        Ok(true)
    }

    /// Look up a key's counter
    pub fn find(&mut self, key: &FlowKey) -> Result<&mut u64> {
        self.ensure_live()?;
        match self.find_offset(key) {
            Some(offset) => Ok(&mut self.slots[offset].counter),
            None => Err(DataplaneError::NotFound),
        }
    }

    /// Look up a key's entry
    pub fn find_entry(&mut self, key: &FlowKey) -> Result<&mut FlowEntry> {
        self.ensure_live()?;
        match self.find_offset(key) {
            Some(offset) => Ok(&mut self.slots[offset]),
            None => Err(DataplaneError::NotFound),
        }
    }

    /// Read-only lookup
    pub fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        if self.slots.is_empty() {
            return None;
        }
        self.find_offset(key).map(|offset| &self.slots[offset])
    }

    /// Insert a new key with a zero counter and gate
    pub fn insert(&mut self, key: &FlowKey) -> Result<&mut u64> {
        self.ensure_live()?;
        if self.find_offset(key).is_some() {
            return Err(DataplaneError::AlreadyExists);
        }
        let offset = self.insert_offset(key)?;
        Ok(&mut self.slots[offset].counter)
    }

    /// Existing entry for `key`, or a freshly inserted one
    pub fn find_or_insert(&mut self, key: &FlowKey) -> Result<&mut FlowEntry> {
        self.ensure_live()?;
        let offset = match self.find_offset(key) {
            Some(offset) => offset,
            None => self.insert_offset(key)?,
        };
        Ok(&mut self.slots[offset])
    }

    /// Free slot for `key` as `(bucket index, offset within bucket)`
    ///
    /// Looks for a free slot in the primary bucket. When the bucket is full,
    /// tries to move one occupant into its own alternate bucket and hands
    /// back the slot it vacated. Only one level of displacement is tried.
    pub fn find_slot_for_insert(&mut self, key: &FlowKey) -> Result<(u32, usize)> {
        self.ensure_live()?;

        let hash = flow_hash(key);
        let index = primary_index(hash, self.size);
        let base = self.bucket_offset(index);

        if let Some(slot) = self.free_slot(base) {
            return Ok((index, slot));
        }

        for slot in 0..self.bucket_depth {
            let occupant = self.slots[base + slot];
            let occupant_hash = flow_hash(&occupant.key());
            let occupant_primary = primary_index(occupant_hash, self.size);
            let occupant_alt = alternate_index(occupant_hash, self.size_power, occupant_primary);

            if occupant_alt == occupant_primary || occupant_alt == index {
                continue;
            }

            let alt_base = self.bucket_offset(occupant_alt);
            if let Some(free) = self.free_slot(alt_base) {
                self.slots[alt_base + free] = occupant;
                self.slots[base + slot] = FlowEntry::default();
                trace!(
                    "Displaced {} from bucket {} to bucket {}",
                    occupant.key(),
                    index,
                    occupant_alt
                );
                return Ok((index, slot));
            }
        }

        Err(DataplaneError::ResourceExhausted)
    }

    /// Remove a key
    pub fn delete(&mut self, key: &FlowKey) -> Result<()> {
        self.ensure_live()?;
        let offset = self.find_offset(key).ok_or(DataplaneError::NotFound)?;
        self.slots[offset] = FlowEntry::default();
        self.count -= 1;
        Ok(())
    }

    /// Zero every slot
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.slots.fill(FlowEntry::default());
        self.count = 0;
        Ok(())
    }

    /// Bucket index and offset within the bucket holding `key`
    pub fn locate(&self, key: &FlowKey) -> Option<(u32, usize)> {
        if self.slots.is_empty() {
            return None;
        }
        let depth = self.bucket_depth;
        self.find_offset(key)
            .map(|offset| ((offset / depth) as u32, offset % depth))
    }

    /// Occupied entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.slots.iter().filter(|entry| entry.is_occupied())
    }

    /// Number of live entries
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total number of slots
    pub fn capacity(&self) -> u64 {
        self.size * self.bucket_depth as u64
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_power(&self) -> u32 {
        self.size_power
    }

    pub fn bucket_depth(&self) -> usize {
        self.bucket_depth
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the storage has been released by the last detach
    pub fn is_released(&self) -> bool {
        self.slots.is_empty()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.slots.is_empty() || self.ref_count == 0 {
            return Err(DataplaneError::invalid("flow table has been released"));
        }
        Ok(())
    }

    #[inline(always)]
    fn bucket_offset(&self, index: u32) -> usize {
        index as usize * self.bucket_depth
    }

    #[inline(always)]
    fn free_slot(&self, base: usize) -> Option<usize> {
        (0..self.bucket_depth).find(|&slot| !self.slots[base + slot].is_occupied())
    }

    #[inline(always)]
    fn scan_bucket(&self, base: usize, probe: &[u64; 2]) -> Option<usize> {
        (0..self.bucket_depth)
            .find(|&slot| self.slots[base + slot].matches(probe))
            .map(|slot| base + slot)
    }

    fn find_offset(&self, key: &FlowKey) -> Option<usize> {
        let probe = key.to_words();
        let hash = flow_hash(key);
        let index = primary_index(hash, self.size);

        self.scan_bucket(self.bucket_offset(index), &probe).or_else(|| {
            let alt = alternate_index(hash, self.size_power, index);
            self.scan_bucket(self.bucket_offset(alt), &probe)
        })
    }

    fn insert_offset(&mut self, key: &FlowKey) -> Result<usize> {
        let (index, slot) = self.find_slot_for_insert(key)?;
        let offset = self.bucket_offset(index) + slot;
        self.slots[offset] = FlowEntry::occupied(key);
        self.count += 1;
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> FlowKey {
        FlowKey::new(0x0a00_0000 | n, 0x0a01_0000 | (n >> 8), (n & 0xffff) as u16, 80, IPPROTO_UDP)
    }

    #[test]
    fn test_init_rejects_bad_geometry() {
        assert!(matches!(FlowTable::new(0, 4), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(FlowTable::new(6, 4), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(FlowTable::new(8, 0), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(FlowTable::new(8, 3), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(
            FlowTable::new(MAX_TABLE_SIZE << 1, 1),
            Err(DataplaneError::InvalidArgument(_))
        ));

        let table = FlowTable::new(1024, 4).unwrap();
        assert_eq!(table.size_power(), 10);
        assert_eq!(table.capacity(), 4096);
        assert_eq!(table.ref_count(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_alternate_index_half_space() {
        for hash in [0u32, 1, 0xdead_beef, u32::MAX] {
            for size_power in 1..=20 {
                let index = primary_index(hash, 1 << size_power);
                let alt = alternate_index(hash, size_power, index);
                assert!(alt < 1 << (size_power - 1));
            }
        }
        assert_eq!(alternate_index(0xffff_ffff, 0, 0), 0);
    }

    #[test]
    fn test_alternate_index_formula() {
        let hash = 0x1234_5678u32;
        let size_power = 8;
        let index = primary_index(hash, 256);
        let tag = ((hash >> 8) as u64 + 1) * 0x5bd1e995;
        assert_eq!(alternate_index(hash, size_power, index), ((index as u64 ^ tag) & 0x7f) as u32);
    }

    #[test]
    fn test_insert_then_find_same_counter() {
        let mut table = FlowTable::new(64, 4).unwrap();
        let k = key(1);

        *table.insert(&k).unwrap() = 41;
        let counter = table.find(&k).unwrap();
        assert_eq!(*counter, 41);
        *counter += 1;

        assert_eq!(table.get(&k).unwrap().counter(), 42);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = FlowTable::new(64, 4).unwrap();
        table.insert(&key(7)).unwrap();
        assert_eq!(table.insert(&key(7)), Err(DataplaneError::AlreadyExists));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_keys_are_unique() {
        let mut table = FlowTable::new(256, 4).unwrap();
        for n in 0..300 {
            let k = key(n);
            let _ = table.find_or_insert(&k);
            let _ = table.find_or_insert(&k);
        }

        let mut seen: Vec<FlowKey> = table.iter().map(|e| e.key()).collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), total);
        assert_eq!(total as u64, table.len());
    }

    #[test]
    fn test_gate_does_not_affect_lookup() {
        let mut table = FlowTable::new(16, 2).unwrap();
        let k = key(3);
        table.insert(&k).unwrap();

        let entry = table.find_entry(&k).unwrap();
        entry.set_gate(0x1abc).unwrap();
        assert_eq!(entry.gate(), 0x1abc);
        assert!(entry.set_gate(INVALID_GATE).is_err());

        let entry = table.get(&k).unwrap();
        assert_eq!(entry.key(), k);
        assert_eq!(entry.gate(), 0x1abc);
        assert!(entry.is_occupied());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut table = FlowTable::new(4, 2).unwrap();
        let mut inserted = Vec::new();

        for n in 0..200 {
            let k = key(n);
            match table.insert(&k) {
                Ok(counter) => {
                    *counter = n as u64;
                    inserted.push(k);
                }
                Err(err) => assert_eq!(err, DataplaneError::ResourceExhausted),
            }
            assert!(table.len() <= table.capacity());
        }

        assert_eq!(table.len(), inserted.len() as u64);
        for k in &inserted {
            let n = k.src_port as u64;
            assert_eq!(table.get(k).map(|e| e.counter()), Some(n));
        }
    }

    #[test]
    fn test_full_table_is_deterministic() {
        let mut table = FlowTable::new(1, 1).unwrap();
        table.insert(&key(1)).unwrap();

        for n in 2..20 {
            assert_eq!(table.insert(&key(n)), Err(DataplaneError::ResourceExhausted));
        }
        assert_eq!(table.len(), 1);
        assert!(table.get(&key(1)).is_some());
    }

    #[test]
    fn test_displaced_entry_stays_findable() {
        let size = 16u64;
        let size_power = 4;

        // Find two keys sharing a primary bucket where the first can move
        let mut pair = None;
        'search: for a in 0..2000u32 {
            let ha = flow_hash(&key(a));
            let pa = primary_index(ha, size);
            let alt = alternate_index(ha, size_power, pa);
            if alt == pa {
                continue;
            }
            for b in a + 1..4000u32 {
                if primary_index(flow_hash(&key(b)), size) == pa {
                    pair = Some((key(a), key(b), pa, alt));
                    break 'search;
                }
            }
        }
        let (first, second, primary, alt) = pair.expect("colliding keys");

        let mut table = FlowTable::new(size, 1).unwrap();
        *table.insert(&first).unwrap() = 9;
        assert_eq!(table.locate(&first), Some((primary, 0)));

        table.insert(&second).unwrap();

        assert_eq!(table.locate(&second), Some((primary, 0)));
        assert_eq!(table.locate(&first), Some((alt, 0)));
        assert_eq!(*table.find(&first).unwrap(), 9);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_delete_and_flush() {
        let mut table = FlowTable::new(32, 4).unwrap();
        for n in 0..10 {
            table.insert(&key(n)).unwrap();
        }

        table.delete(&key(4)).unwrap();
        assert_eq!(table.delete(&key(4)), Err(DataplaneError::NotFound));
        assert_eq!(table.find(&key(4)), Err(DataplaneError::NotFound));
        assert_eq!(table.len(), 9);

        table.flush().unwrap();
        assert!(table.is_empty());
        for n in 0..10 {
            assert_eq!(table.find(&key(n)), Err(DataplaneError::NotFound));
        }
    }

    #[test]
    fn test_refcounted_release() {
        let mut table = FlowTable::new(8, 1).unwrap();
        table.attach().unwrap();
        assert_eq!(table.ref_count(), 2);

        assert_eq!(table.detach(), Ok(false));
        assert_eq!(table.ref_count(), 1);
        assert!(!table.is_released());

        assert_eq!(table.detach(), Ok(true));
        assert!(table.is_released());
        assert_eq!(table.ref_count(), 0);

        assert!(matches!(table.find(&key(1)), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(table.insert(&key(1)), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(table.attach(), Err(DataplaneError::InvalidArgument(_))));
        assert!(matches!(table.detach(), Err(DataplaneError::InvalidArgument(_))));
        assert!(table.get(&key(1)).is_none());
    }
}
