/// An append-only machine code buffer.
///
/// The x86_64 instruction stream is byte-addressable, so no alignment is maintained.
#[derive(Debug, Default)]
pub struct Assembly {
    code: Vec<u8>,
}

impl Assembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw instruction bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// The accumulated bytes, ready to be copied into executable memory.
    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
