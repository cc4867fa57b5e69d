use crate::types::{u256_be, u256_from_be, EVMU256};

/// Byte-addressed call memory. Grows by 32-byte words and never shrinks; the
/// backing buffer length is the high-water mark.
#[derive(Default, Debug, Clone)]
pub struct Memory {
    store: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.store
    }

    /// Ensure `offset + size` bytes are addressable, rounded up to a word.
    pub fn resize(&mut self, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let end = offset + size;
        let aligned = (end + 31) / 32 * 32;
        if self.store.len() < aligned {
            self.store.resize(aligned, 0);
        }
    }

    pub fn set(&mut self, offset: usize, data: &[u8]) {
        self.resize(offset, data.len());
        self.store[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn set_word(&mut self, offset: usize, value: EVMU256) {
        self.set(offset, &u256_be(value));
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.resize(offset, 1);
        self.store[offset] = value;
    }

    pub fn word(&mut self, offset: usize) -> EVMU256 {
        self.resize(offset, 32);
        u256_from_be(&self.store[offset..offset + 32])
    }

    /// Raw slice read; the region is grown first so the slice always exists.
    pub fn slice(&mut self, offset: usize, size: usize) -> &[u8] {
        self.resize(offset, size);
        &self.store[offset..offset + size]
    }
}
