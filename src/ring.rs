//! Fixed-capacity ring buffer decoupling hardware cadence from the callback.
//!
//! One slot is always kept empty, so a ring constructed with capacity `n`
//! holds at most `n - 1` elements. Writers never block: enqueueing into a
//! full ring evicts the oldest element. Readers never block either: dequeue
//! on an empty ring yields the element type's default value (silence for
//! sample types).

pub struct RingBuffer<T> {
    storage: Box<[T]>,
    read: usize,
    write: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Creates a ring that can hold `capacity - 1` elements.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 2);
        RingBuffer {
            storage: vec![T::default(); capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Number of elements currently buffered.
    pub fn len(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.storage.len() - self.read + self.write
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Free slots remaining before the ring is full.
    pub fn space(&self) -> usize {
        self.storage.len() - self.len() - 1
    }

    /// Appends an element, evicting the oldest one when the ring is full.
    pub fn enqueue(&mut self, value: T) {
        if self.space() == 0 {
            self.read = (self.read + 1) % self.storage.len();
        }
        self.storage[self.write] = value;
        self.write = (self.write + 1) % self.storage.len();
    }

    /// Removes and returns the oldest element, or the default value when
    /// the ring is empty.
    pub fn dequeue(&mut self) -> T {
        if self.is_empty() {
            return T::default();
        }
        let value = self.storage[self.read];
        self.read = (self.read + 1) % self.storage.len();
        value
    }

    /// Drops all buffered elements.
    pub fn clear(&mut self) {
        self.read = self.write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elements_come_out_in_fifo_order() {
        let mut ring = RingBuffer::new(8);
        for v in 1..=5u8 {
            ring.enqueue(v);
        }
        assert_eq!(ring.len(), 5);
        for v in 1..=5u8 {
            assert_eq!(ring.dequeue(), v);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn one_slot_stays_empty() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.space(), 3);
        ring.enqueue(1u8);
        ring.enqueue(2);
        ring.enqueue(3);
        assert_eq!(ring.space(), 0);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn enqueue_on_full_evicts_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.enqueue(1u8);
        ring.enqueue(2);
        ring.enqueue(3);
        ring.enqueue(4);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.dequeue(), 2);
        assert_eq!(ring.dequeue(), 3);
        assert_eq!(ring.dequeue(), 4);
    }

    #[test]
    fn dequeue_on_empty_yields_silence() {
        let mut ring: RingBuffer<f32> = RingBuffer::new(4);
        assert_eq!(ring.dequeue(), 0.0);
        ring.enqueue(0.5);
        assert_eq!(ring.dequeue(), 0.5);
        assert_eq!(ring.dequeue(), 0.0);
    }

    #[test]
    fn wraparound_keeps_accounting_straight() {
        let mut ring = RingBuffer::new(4);
        for round in 0..10u8 {
            ring.enqueue(round);
            ring.enqueue(round + 100);
            assert_eq!(ring.dequeue(), round);
            assert_eq!(ring.dequeue(), round + 100);
            assert_eq!(ring.space(), 3);
        }
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut ring = RingBuffer::new(8);
        ring.enqueue(1u8);
        ring.enqueue(2);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.dequeue(), 0);
    }
}
