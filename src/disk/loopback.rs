use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::{CloseReason, Disk, DiskError, ReadCompletion, SwapFile};
use crate::store::ClientHandle;

/// A handle to a file of a [Loopback] disk.
#[derive(Debug, PartialEq, Eq)]
pub struct LoopbackHandle {
    id: u32,
    file: SwapFile,
}

impl LoopbackHandle {
    pub fn file(&self) -> SwapFile {
        self.file
    }
}

#[derive(Debug)]
struct PendingRead {
    file: SwapFile,
    offset: u64,
    len: usize,
    token: ClientHandle,
}

/// A disk that keeps its files in memory.
///
/// Reads are queued and complete, in order, on the next [poll_read]. Faults
/// can be injected to exercise error paths, and `max_read` splits every
/// read into short ones the way a slow or fragmented device would.
///
/// [poll_read]: ../trait.Disk.html#tymethod.poll_read
#[derive(Debug, Default)]
pub struct Loopback {
    files: BTreeMap<SwapFile, Vec<u8>>,
    queue: VecDeque<PendingRead>,
    next_id: u32,
    open: BTreeMap<u32, SwapFile>,
    max_read: Option<usize>,
    failing_reads: usize,
    failing_opens: bool,
    failing_writes: bool,
    reads_issued: usize,
    closed: Vec<(SwapFile, CloseReason)>,
}

impl Loopback {
    /// Create an empty loopback disk.
    pub fn new() -> Loopback {
        Loopback::default()
    }

    /// Store a file, replacing any previous contents.
    pub fn insert(&mut self, file: SwapFile, data: Vec<u8>) {
        self.files.insert(file, data);
    }

    /// Return the contents of a file.
    pub fn file(&self, file: SwapFile) -> Option<&[u8]> {
        self.files.get(&file).map(|data| &data[..])
    }

    /// Return at most `max_read` bytes per read.
    pub fn set_max_read(&mut self, max_read: Option<usize>) {
        self.max_read = max_read;
    }

    /// Fail the next `count` reads with an I/O error.
    pub fn fail_reads(&mut self, count: usize) {
        self.failing_reads = count;
    }

    /// Refuse every open.
    pub fn fail_opens(&mut self, fail: bool) {
        self.failing_opens = fail;
    }

    /// Refuse every write.
    pub fn fail_writes(&mut self, fail: bool) {
        self.failing_writes = fail;
    }

    /// Return how many reads were started so far.
    pub fn reads_issued(&self) -> usize {
        self.reads_issued
    }

    /// Return how many reads are waiting for a poll.
    pub fn reads_in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Return how many handles are open.
    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    /// Return the closed files with the reason given for closing them.
    pub fn closed(&self) -> &[(SwapFile, CloseReason)] {
        &self.closed
    }
}

impl Disk for Loopback {
    type Handle = LoopbackHandle;

    fn open(&mut self, file: SwapFile) -> Option<LoopbackHandle> {
        if self.failing_opens || !self.files.contains_key(&file) {
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.open.insert(id, file);
        Some(LoopbackHandle { id, file })
    }

    fn read(&mut self, handle: &LoopbackHandle, offset: u64, len: usize, token: ClientHandle) {
        self.reads_issued += 1;
        self.queue.push_back(PendingRead {
            file: handle.file,
            offset,
            len,
            token,
        });
    }

    fn poll_read(&mut self) -> Option<ReadCompletion> {
        let read = self.queue.pop_front()?;
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Some(ReadCompletion {
                token: read.token,
                result: Err(DiskError::Io),
            });
        }
        let Some(data) = self.files.get(&read.file) else {
            return Some(ReadCompletion {
                token: read.token,
                result: Err(DiskError::NotFound),
            });
        };
        let len = match self.max_read {
            Some(max_read) => core::cmp::min(read.len, max_read),
            None => read.len,
        };
        let start = core::cmp::min(read.offset, data.len() as u64) as usize;
        let end = core::cmp::min(start + len, data.len());
        Some(ReadCompletion {
            token: read.token,
            result: Ok(data[start..end].to_vec()),
        })
    }

    fn close(&mut self, handle: LoopbackHandle, reason: CloseReason) {
        self.open.remove(&handle.id);
        self.closed.push((handle.file, reason));
    }

    fn write(&mut self, file: SwapFile, data: &[u8]) -> Result<(), DiskError> {
        if self.failing_writes {
            return Err(DiskError::Io);
        }
        self.files.insert(file, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> ClientHandle {
        ClientHandle::new(0, 0)
    }

    #[test]
    fn test_read_completes_on_poll() {
        let mut disk = Loopback::new();
        disk.insert(SwapFile(1), b"0123456789".to_vec());
        let handle = disk.open(SwapFile(1)).unwrap();

        disk.read(&handle, 2, 4, token());
        assert_eq!(disk.reads_in_flight(), 1);
        let done = disk.poll_read().unwrap();
        assert_eq!(done.result, Ok(b"2345".to_vec()));
        assert_eq!(disk.poll_read(), None);
    }

    #[test]
    fn test_read_past_end() {
        let mut disk = Loopback::new();
        disk.insert(SwapFile(1), b"01234".to_vec());
        let handle = disk.open(SwapFile(1)).unwrap();

        disk.read(&handle, 3, 10, token());
        disk.read(&handle, 5, 10, token());
        assert_eq!(disk.poll_read().unwrap().result, Ok(b"34".to_vec()));
        assert_eq!(disk.poll_read().unwrap().result, Ok(Vec::new()));
    }

    #[test]
    fn test_max_read_and_faults() {
        let mut disk = Loopback::new();
        disk.insert(SwapFile(1), b"0123456789".to_vec());
        let handle = disk.open(SwapFile(1)).unwrap();
        disk.set_max_read(Some(3));
        disk.fail_reads(1);

        disk.read(&handle, 0, 10, token());
        disk.read(&handle, 0, 10, token());
        assert_eq!(disk.poll_read().unwrap().result, Err(DiskError::Io));
        assert_eq!(disk.poll_read().unwrap().result, Ok(b"012".to_vec()));
    }

    #[test]
    fn test_open_close() {
        let mut disk = Loopback::new();
        assert!(disk.open(SwapFile(9)).is_none());

        disk.insert(SwapFile(9), Vec::new());
        let handle = disk.open(SwapFile(9)).unwrap();
        assert_eq!(disk.open_handles(), 1);
        disk.close(handle, CloseReason::ReaderDone);
        assert_eq!(disk.open_handles(), 0);
        assert_eq!(disk.closed(), &[(SwapFile(9), CloseReason::ReaderDone)]);

        disk.fail_opens(true);
        assert!(disk.open(SwapFile(9)).is_none());
    }
}
