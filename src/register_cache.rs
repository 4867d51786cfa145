const WORDS: usize = 256 / u64::BITS as usize;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegisterBitmask([u64; WORDS]);

impl RegisterBitmask {
    pub fn new() -> Self {
        Self([0; _])
    }

    fn word_bit_mask(address: u8) -> (usize, u64) {
        let word = usize::from(address) / u64::BITS as usize;
        let bit_mask = 1 << (u32::from(address) % u64::BITS);
        (word, bit_mask)
    }

    pub fn is_set(&self, address: u8) -> bool {
        let (word, bitmask) = Self::word_bit_mask(address);
        (self.0[word] & bitmask) != 0
    }

    pub fn set(&mut self, address: u8) {
        let (word, bitmask) = Self::word_bit_mask(address);
        self.0[word] |= bitmask;
    }

    pub fn clear(&mut self) {
        self.0 = [0; _];
    }
}

/// Last raw byte seen for each register during the current session.
///
/// Bit flags are written by modifying this byte, so it must never outlive the connection it was
/// read over.
pub struct RawRegisterCache {
    values: [u8; 256],
    have_value: RegisterBitmask,
}

impl Default for RawRegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRegisterCache {
    pub fn new() -> Self {
        Self { values: [0; _], have_value: RegisterBitmask::new() }
    }

    pub fn get(&self, address: u8) -> Option<u8> {
        self.have_value.is_set(address).then(|| self.values[usize::from(address)])
    }

    pub fn set(&mut self, address: u8, value: u8) {
        self.values[usize::from(address)] = value;
        self.have_value.set(address);
    }

    pub fn clear(&mut self) {
        self.have_value.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_covers_every_word() {
        let mut mask = RegisterBitmask::new();
        for address in [0, 63, 64, 0xA3, 255] {
            mask.set(address);
        }
        for address in 0..=255 {
            assert_eq!(mask.is_set(address), [0, 63, 64, 0xA3, 255].contains(&address));
        }
        mask.clear();
        assert!((0..=255).all(|address| !mask.is_set(address)));
    }

    #[test]
    fn cache_tracks_presence_separately_from_value() {
        let mut cache = RawRegisterCache::new();
        assert_eq!(cache.get(0xA3), None);
        cache.set(0xA3, 0);
        assert_eq!(cache.get(0xA3), Some(0));
        assert_eq!(cache.get(0xA2), None);
        cache.set(0xA3, 0x88);
        assert_eq!(cache.get(0xA3), Some(0x88));
        cache.clear();
        assert_eq!(cache.get(0xA3), None);
    }
}
