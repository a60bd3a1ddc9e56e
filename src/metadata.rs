//! Per-packet metadata
//!
//! Each slot of the shared packet buffer carries a metadata record parallel to
//! its TS packet: the input timestamp and its source, a 256-bit label set used
//! for application-level tagging, and a few processing hints exchanged between
//! plugins and the pipeline.

/// Origin of an input timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeSource {
    /// No timestamp available
    #[default]
    Undefined,
    /// Hardware timestamp from the capture device
    Hardware,
    /// Timestamp carried by the RTP transport
    Rtp,
    /// Synthetic timestamp assigned by the engine on reception
    Tsp,
}

/// Number of distinct packet labels.
pub const LABEL_COUNT: usize = 256;

/// Highest valid label value.
pub const LABEL_MAX: usize = LABEL_COUNT - 1;

/// A fixed set of 256 packet labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelSet {
    bits: [u64; 4],
}

impl LabelSet {
    /// The empty label set.
    pub const fn none() -> Self {
        Self { bits: [0; 4] }
    }

    /// A set containing a single label.
    pub fn single(label: usize) -> Self {
        let mut set = Self::none();
        set.set(label);
        set
    }

    /// Add a label to the set. Out-of-range labels are ignored.
    pub fn set(&mut self, label: usize) {
        if label < LABEL_COUNT {
            self.bits[label / 64] |= 1 << (label % 64);
        }
    }

    /// Remove a label from the set.
    pub fn clear(&mut self, label: usize) {
        if label < LABEL_COUNT {
            self.bits[label / 64] &= !(1 << (label % 64));
        }
    }

    /// Check one label.
    pub fn has(&self, label: usize) -> bool {
        label < LABEL_COUNT && (self.bits[label / 64] & (1 << (label % 64))) != 0
    }

    /// True when no label is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// True when this set intersects `other`.
    pub fn intersects(&self, other: &LabelSet) -> bool {
        self.bits.iter().zip(other.bits.iter()).any(|(a, b)| a & b != 0)
    }

    /// Merge all labels from `other` into this set.
    pub fn union_with(&mut self, other: &LabelSet) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }
}

/// Metadata record attached to one packet slot.
///
/// Lifetime is strictly parallel to the packet in the buffer: reset when the
/// packet is (re)filled by the input stage, mutated by processors, read by the
/// output stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMetadata {
    /// Input timestamp in nanoseconds from an arbitrary origin, when known
    input_stamp: Option<u64>,
    /// Origin of the input timestamp
    time_source: TimeSource,
    /// Application-level packet labels
    pub labels: LabelSet,
    /// Plugin hint: push this packet downstream without further buffering
    flush: bool,
    /// Plugin hint: the plugin changed its reported bitrate at this packet
    bitrate_changed: bool,
    /// Packet was inserted by artificial input stuffing
    input_stuffing: bool,
    /// Packet was turned into a null packet by a processing stage
    nullified: bool,
}

impl PacketMetadata {
    /// Reset the record for a freshly received packet.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Input timestamp in nanoseconds, when one was recorded.
    pub fn input_stamp(&self) -> Option<u64> {
        self.input_stamp
    }

    /// Origin of the input timestamp.
    pub fn time_source(&self) -> TimeSource {
        self.time_source
    }

    /// Record the input timestamp.
    pub fn set_input_stamp(&mut self, nanos: u64, source: TimeSource) {
        self.input_stamp = Some(nanos);
        self.time_source = source;
    }

    pub fn has_input_stamp(&self) -> bool {
        self.input_stamp.is_some()
    }

    pub fn flush(&self) -> bool {
        self.flush
    }

    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }

    pub fn bitrate_changed(&self) -> bool {
        self.bitrate_changed
    }

    pub fn set_bitrate_changed(&mut self, changed: bool) {
        self.bitrate_changed = changed;
    }

    pub fn input_stuffing(&self) -> bool {
        self.input_stuffing
    }

    pub fn set_input_stuffing(&mut self, stuffing: bool) {
        self.input_stuffing = stuffing;
    }

    pub fn nullified(&self) -> bool {
        self.nullified
    }

    pub fn set_nullified(&mut self, nullified: bool) {
        self.nullified = nullified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_set() {
        let mut set = LabelSet::none();
        assert!(set.is_empty());
        set.set(0);
        set.set(63);
        set.set(64);
        set.set(255);
        assert!(set.has(0) && set.has(63) && set.has(64) && set.has(255));
        assert!(!set.has(1));
        set.clear(63);
        assert!(!set.has(63));

        let other = LabelSet::single(64);
        assert!(set.intersects(&other));
        assert!(!set.intersects(&LabelSet::single(10)));
    }

    #[test]
    fn test_metadata_reset() {
        let mut meta = PacketMetadata::default();
        meta.set_input_stamp(1234, TimeSource::Tsp);
        meta.set_flush(true);
        meta.labels.set(5);
        meta.reset();
        assert!(!meta.has_input_stamp());
        assert!(!meta.flush());
        assert!(meta.labels.is_empty());
    }
}
