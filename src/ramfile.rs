//! In-memory download target.

/// Growable byte store that a channel can download a document into.
///
/// Wrap one in `Rc<RefCell<..>>` and hand it to
/// [`crate::channel::HttpChannel::download_to_ram`]; the channel appends bytes as
/// they arrive while the owner is free to inspect or drain the data between
/// `run()` calls.
#[derive(Debug, Default)]
pub struct Ramfile {
    pos: usize,
    data: Vec<u8>,
}

impl Ramfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The full contents, independent of the read position.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Reads up to `n` bytes from the current position, advancing it.
    pub fn read(&mut self, n: usize) -> &[u8] {
        let start = self.pos.min(self.data.len());
        let end = (start + n).min(self.data.len());
        self.pos = end;
        &self.data[start..end]
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.pos = self.pos.min(self.data.len());
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_advances_position() {
        let mut r = Ramfile::new();
        r.append(b"document body");
        assert_eq!(r.read(8), b"document");
        assert_eq!(r.read(100), b" body");
        assert_eq!(r.read(1), b"");
        r.seek(0);
        assert_eq!(r.read(3), b"doc");
    }

    #[test]
    fn truncate_clamps_position() {
        let mut r = Ramfile::new();
        r.append(b"0123456789");
        r.seek(8);
        r.truncate(4);
        assert_eq!(r.tell(), 4);
        assert_eq!(r.data(), b"0123");
    }
}
