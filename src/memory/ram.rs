/// Simple RAM backed by a Vec<u8>. Offsets are relative to the RAM base;
/// out-of-range accesses return `None` so the bus can report them.
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0; size as usize],
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn span(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    pub fn read8(&self, offset: u64) -> Option<u8> {
        self.span(offset, 1).map(|r| self.data[r.start])
    }

    pub fn read64(&self, offset: u64) -> Option<u64> {
        let r = self.span(offset, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[r]);
        Some(u64::from_le_bytes(bytes))
    }

    pub fn write8(&mut self, offset: u64, val: u8) -> bool {
        match self.span(offset, 1) {
            Some(r) => {
                self.data[r.start] = val;
                true
            }
            None => false,
        }
    }

    pub fn write64(&mut self, offset: u64, val: u64) -> bool {
        match self.span(offset, 8) {
            Some(r) => {
                self.data[r].copy_from_slice(&val.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Copy `data` into RAM at `offset`; returns false if it does not fit.
    pub fn load(&mut self, data: &[u8], offset: u64) -> bool {
        match self.span(offset, data.len()) {
            Some(r) => {
                self.data[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}
