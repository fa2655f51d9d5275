use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

use rand::{Rng, SeedableRng};
use rstest::rstest;

use super::*;
use crate::disk::{CloseReason, Loopback, SwapFile};
use crate::entry::{CacheKey, EntryFlags, RequestFlags};
use crate::store::{Config, EntryHandle};
use crate::wire::SwapMetaRepr;

const KEY: CacheKey = CacheKey([0x42; 16]);
const HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
const BODY: &[u8] = b"0123456789";
const FILE: SwapFile = SwapFile(3);

type Answers = Rc<RefCell<Vec<StoreIoBuffer>>>;

macro_rules! assert_failed {
    ($answer:expr) => {{
        let answer = $answer;
        assert!(answer.is_error(), "expected a failed answer, got {:?}", answer);
        assert!(answer.is_empty());
        assert!(!answer.is_eof());
    }};
}

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn reply() -> Vec<u8> {
    [HEAD, BODY].concat()
}

/// A stored object: metadata prefix for `key`, then `reply`.
fn stored(key: CacheKey, reply: &[u8]) -> Vec<u8> {
    let mut image = SwapMetaRepr {
        key: Some(key),
        object_size: None,
    }
    .to_vec();
    image.extend_from_slice(reply);
    image
}

fn store_with(config: Config) -> Store<Loopback> {
    setup();
    Store::new(config, Loopback::new())
}

fn store() -> Store<Loopback> {
    store_with(Config::default())
}

fn pending_entry(store: &mut Store<Loopback>) -> EntryHandle {
    store.create_entry(KEY, Some(RequestFlags::CACHABLE), EntryFlags::empty())
}

/// A hit whose stored object is `image`, claiming the size of the whole reply.
fn disk_entry(store: &mut Store<Loopback>, image: Vec<u8>) -> EntryHandle {
    let size = stored(KEY, &reply()).len() as u64;
    store.disk_mut().insert(FILE, image);
    store.open_hit(KEY, FILE, size)
}

fn recorder(answers: &Answers) -> impl FnOnce(&mut Store<Loopback>, ClientHandle, StoreIoBuffer) + 'static {
    let answers = answers.clone();
    move |_: &mut Store<Loopback>, _: ClientHandle, answer: StoreIoBuffer| answers.borrow_mut().push(answer)
}

/// Ask for one range and run the store until it is answered.
fn fetch(
    store: &mut Store<Loopback>,
    reader: ClientHandle,
    entry: EntryHandle,
    request: CopyRequest,
) -> StoreIoBuffer {
    let answers = Answers::default();
    store.copy(reader, entry, request, recorder(&answers));
    store.poll();
    let mut answers = answers.borrow_mut();
    assert_eq!(answers.len(), 1, "expected exactly one answer");
    answers.pop().unwrap()
}

/// Read the whole body, `length` bytes at a time.
fn read_all(store: &mut Store<Loopback>, reader: ClientHandle, entry: EntryHandle, length: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for _ in 0..10_000 {
        let answer = fetch(store, reader, entry, CopyRequest::new(body.len() as u64, length));
        assert!(!answer.is_error(), "unexpected error at {}", body.len());
        assert_eq!(answer.offset, body.len() as u64);
        assert!(answer.len() <= length);
        if answer.is_eof() {
            return body;
        }
        body.extend_from_slice(&answer.data);
    }
    panic!("no end of object after {} bytes", body.len());
}

#[test]
fn test_memory_reader_follows_producer() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    assert!(!store.client(r).kind().is_disk());

    let answers = Answers::default();
    store.copy(r, e, CopyRequest::new(0, 4096), recorder(&answers));
    assert!(!store.poll());
    assert!(answers.borrow().is_empty());
    assert!(store.copy_pending(r, e));

    store.append(e, HEAD).unwrap();
    store.append(e, b"01234").unwrap();
    store.poll();
    let answer = answers.borrow_mut().pop().unwrap();
    assert_eq!(answer.data, b"01234");
    assert_eq!(answer.offset, 0);
    assert!(!answer.is_eof());
    assert_eq!(store.entry(e).mem().base_reply().hdr_sz(), HEAD.len() as u64);
    assert_eq!(store.entry(e).mem().base_reply().status(), 200);
    assert!(store.client(r).answered_once());

    store.copy(r, e, CopyRequest::new(5, 4096), recorder(&answers));
    store.poll();
    assert!(answers.borrow().is_empty(), "nothing new yet");

    store.append(e, b"56789").unwrap();
    store.complete(e);
    store.poll();
    let answer = answers.borrow_mut().pop().unwrap();
    assert_eq!(answer.data, b"56789");
    assert_eq!(answer.offset, 5);

    let answer = fetch(&mut store, r, e, CopyRequest::new(10, 4096));
    assert!(answer.is_eof());
    assert!(answer.is_empty());
    assert!(!answer.is_error());
}

#[test]
fn test_head_only_answer() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.append(e, HEAD).unwrap();

    let answer = fetch(&mut store, r, e, CopyRequest::new(0, 4096));
    assert!(answer.is_empty());
    assert!(!answer.is_eof(), "the body is still to come");
    assert!(store.client(r).answered_once());
}

#[test]
fn test_delivery_carries_fresh_bytes() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);

    let answers = Answers::default();
    store.copy(r, e, CopyRequest::new(0, 4096), recorder(&answers));
    store.append(e, HEAD).unwrap();
    assert!(store.client(r).notifier_pending());
    store.append(e, b"0123").unwrap();
    store.append(e, b"45").unwrap();
    store.poll();

    let answers = answers.borrow();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].data, b"012345");
}

#[test]
fn test_answer_capped_by_length() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.append(e, &reply()).unwrap();
    store.complete(e);

    assert_eq!(read_all(&mut store, r, e, 3), BODY);
}

#[test]
#[should_panic(expected = "copy requested while another copy is pending")]
fn test_second_copy_while_pending() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.copy(r, e, CopyRequest::new(0, 10), |_, _, _| {});
    store.copy(r, e, CopyRequest::new(0, 10), |_, _, _| {});
}

#[test]
#[should_panic(expected = "body offset requested before the reply head was delivered")]
fn test_first_copy_at_body_offset() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.copy(r, e, CopyRequest::new(5, 10), |_, _, _| {});
}

#[test]
#[should_panic(expected = "copy requested from an aborted entry")]
fn test_copy_from_aborted_entry() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.abort(e);
    store.copy(r, e, CopyRequest::new(0, 10), |_, _, _| {});
}

#[test]
fn test_memory_before_disk() {
    let mut store = store();
    let e = pending_entry(&mut store);
    store.append(e, &reply()).unwrap();
    store.complete(e);
    assert!(store.swap_out(e));

    let r = store.register(e);
    assert!(!store.client(r).kind().is_disk());
    assert_eq!(read_all(&mut store, r, e, 4096), BODY);
    assert_eq!(store.disk().reads_issued(), 0);
}

#[test]
fn test_disk_hit() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    let r = store.register(e);
    assert!(store.client(r).kind().is_disk());

    assert_eq!(read_all(&mut store, r, e, 4096), BODY);
    assert_eq!(store.entry(e).mem().base_reply().hdr_sz(), HEAD.len() as u64);
    assert_eq!(store.entry(e).object_len(), Some(reply().len() as u64));
    assert_eq!(store.open_disk_files(), 1);

    assert!(store.unregister(r, e));
    assert_eq!(store.open_disk_files(), 0);
    assert_eq!(store.disk().closed(), &[(FILE, CloseReason::ReaderDone)]);
    assert_eq!(store.stats().swap_ins, 1);
    assert_eq!(store.entry(e).lock_count(), 0);
}

#[rstest]
#[case::byte_by_byte(Some(1), 4096)]
#[case::inside_prefix(Some(3), 4096)]
#[case::prefix_boundary(Some(26), 4096)]
#[case::inside_head(Some(40), 4096)]
#[case::whole(None, 4096)]
#[case::small_answers(Some(7), 4)]
#[case::tiny_buffer(None, 1)]
fn test_disk_hit_fragmented(#[case] max_read: Option<usize>, #[case] length: usize) {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    store.disk_mut().set_max_read(max_read);
    let r = store.register(e);

    assert_eq!(read_all(&mut store, r, e, length), BODY);
    assert_eq!(store.entry(e).mem().base_reply().hdr_sz(), HEAD.len() as u64);
}

#[test]
fn test_disk_hit_fragmented_random() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x5107e);
    let body: Vec<u8> = (0..3000).map(|_| rng.r#gen()).collect();
    let head = alloc::format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    let object = [head.as_bytes(), &body].concat();

    for _ in 0..20 {
        let mut config = Config::default();
        config.memory_cache_disk = rng.gen_bool(0.5);
        let mut store = store_with(config);
        store.disk_mut().insert(FILE, stored(KEY, &object));
        store.disk_mut().set_max_read(Some(rng.gen_range(1..200)));
        let e = store.open_hit(KEY, FILE, stored(KEY, &object).len() as u64);
        let r = store.register(e);

        let length = rng.gen_range(1..1000);
        assert_eq!(read_all(&mut store, r, e, length), body);
    }
}

#[test]
fn test_disk_hit_warms_memory() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    let first = store.register(e);
    assert_eq!(read_all(&mut store, first, e, 4096), BODY);
    assert_eq!(store.entry(e).mem().bytes_from(0), &reply()[..]);

    let reads = store.disk().reads_issued();
    let second = store.register(e);
    assert!(!store.client(second).kind().is_disk());
    assert_eq!(read_all(&mut store, second, e, 4096), BODY);
    assert_eq!(store.disk().reads_issued(), reads);
}

#[test]
fn test_disk_hit_without_memory_cache() {
    let mut config = Config::default();
    config.memory_cache_disk = false;
    let mut store = store_with(config);
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    let r = store.register(e);
    assert_eq!(read_all(&mut store, r, e, 4), BODY);
    assert_eq!(store.entry(e).mem().end_offset(), 0);
}

#[test]
fn test_disk_object_truncated_in_body() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()[..HEAD.len() + 5]));
    let r = store.register(e);

    let answer = fetch(&mut store, r, e, CopyRequest::new(0, 4096));
    assert_eq!(answer.data, b"01234");
    let answer = fetch(&mut store, r, e, CopyRequest::new(5, 4096));
    assert!(answer.is_eof());
    assert!(answer.is_empty());
    assert!(!answer.is_error());
}

#[rstest]
#[case::in_head(stored(KEY, &HEAD[..17]))]
#[case::in_prefix(stored(KEY, b"")[..10].to_vec())]
#[case::empty(Vec::new())]
#[case::wrong_key(stored(CacheKey([1; 16]), &reply()))]
#[case::malformed_head(stored(KEY, b"SPDY/3 200 OK\r\n\r\n0123456789"))]
#[case::bad_magic({
    let mut image = stored(KEY, &reply());
    image[0] ^= 0xff;
    image
})]
fn test_disk_object_unusable(#[case] image: Vec<u8>) {
    let mut store = store();
    let e = disk_entry(&mut store, image);
    let r = store.register(e);

    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)));
    assert!(!store.client(r).object_ok());

    // A failed reader stays failed.
    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)));

    store.unregister(r, e);
    assert_eq!(store.disk().closed(), &[(FILE, CloseReason::ReaderFailed)]);
}

#[test]
fn test_disk_head_too_large() {
    let mut config = Config::default();
    config.max_reply_header_size = 64;
    let mut store = store_with(config);
    let head = alloc::format!("HTTP/1.1 200 OK\r\nX-Padding: {}\r\n\r\n", "x".repeat(100));
    let e = disk_entry(&mut store, stored(KEY, head.as_bytes()));
    let r = store.register(e);

    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)));
}

#[test]
fn test_disk_read_error() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    store.disk_mut().fail_reads(1);
    let r = store.register(e);

    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)));
}

#[test]
fn test_disk_open_failure() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    store.disk_mut().fail_opens(true);
    let r = store.register(e);

    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)));
    assert_eq!(store.open_disk_files(), 0);
    assert_eq!(store.disk().reads_issued(), 0);
}

#[test]
fn test_too_many_open_files() {
    let mut config = Config::default();
    config.max_open_disk_files = 1;
    let mut store = store_with(config);
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    let a = store.register(e);
    let b = store.register(e);

    let first = Answers::default();
    let second = Answers::default();
    store.copy(a, e, CopyRequest::new(0, 4096), recorder(&first));
    store.copy(b, e, CopyRequest::new(0, 4096), recorder(&second));
    store.poll();

    assert_eq!(first.borrow()[0].data, BODY);
    let second = second.borrow();
    assert_failed!(&second[0]);
    assert_eq!(store.open_disk_files(), 1);
}

#[test]
fn test_memory_reader_cannot_use_disk() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.append(e, &reply()).unwrap();
    let answer = fetch(&mut store, r, e, CopyRequest::new(0, 3));
    assert_eq!(answer.data, b"012");

    store.trim_memory(e, HEAD.len() as u64 + 5);
    assert_failed!(fetch(&mut store, r, e, CopyRequest::new(3, 3)));
}

#[test]
fn test_disk_reader_prefers_memory() {
    let mut store = store();
    let e = disk_entry(&mut store, stored(KEY, &reply()));
    let first = store.register(e);
    let second = store.register(e);
    assert!(store.client(second).kind().is_disk());

    assert_eq!(read_all(&mut store, first, e, 4096), BODY);
    let reads = store.disk().reads_issued();

    let answer = fetch(&mut store, second, e, CopyRequest::new(0, 4));
    assert_eq!(answer.data, b"0123");
    assert!(matches!(
        store.client(second).kind(),
        ClientKind::Disk { swapin: Some(_) }
    ));
    assert_eq!(store.open_disk_files(), 2);

    let answer = fetch(&mut store, second, e, CopyRequest::new(4, 4096));
    assert_eq!(answer.data, b"456789");
    assert!(fetch(&mut store, second, e, CopyRequest::new(10, 4096)).is_eof());
    assert_eq!(store.disk().reads_issued(), reads);
}

#[test]
fn test_zero_length_copy() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);

    let answers = Answers::default();
    store.copy(r, e, CopyRequest::new(0, 0), recorder(&answers));
    store.poll();
    assert!(answers.borrow().is_empty(), "the head is still to come");
    assert!(store.copy_pending(r, e));
    assert!(!store.client(r).answered_once());

    store.append(e, HEAD).unwrap();
    store.append(e, b"01").unwrap();
    store.poll();
    let answer = answers.borrow_mut().pop().unwrap();
    assert!(answer.is_empty());
    assert!(!answer.is_eof());
    assert!(!answer.is_error());
    assert!(store.client(r).answered_once());

    let answer = fetch(&mut store, r, e, CopyRequest::new(1, 0));
    assert!(answer.is_empty());
    assert!(!answer.is_eof());
    assert!(!answer.is_error());
}

#[test]
fn test_offset_far_past_the_end() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.append(e, &reply()).unwrap();
    store.complete(e);
    assert_eq!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)).data, BODY);

    let answer = fetch(&mut store, r, e, CopyRequest::new(u64::MAX - 1, 4096));
    assert!(answer.is_eof());
    assert!(answer.is_empty());
    assert!(!answer.is_error());
}

#[test]
fn test_unregister_cancels_delivery() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);

    let answers = Answers::default();
    store.copy(r, e, CopyRequest::new(0, 4096), recorder(&answers));
    store.append(e, &reply()).unwrap();
    assert!(store.client(r).notifier_pending());

    assert!(store.unregister(r, e));
    assert!(!store.copy_pending(r, e));
    store.poll();
    assert!(answers.borrow().is_empty());
}

#[test]
fn test_callback_unregisters() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    let other = store.register(e);

    let seen = Answers::default();
    let record = recorder(&seen);
    store.copy(r, e, CopyRequest::new(0, 4096), move |store, reader, answer| {
        assert!(store.unregister(reader, e));
        record(store, reader, answer);
    });
    store.append(e, &reply()).unwrap();
    store.poll();

    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(store.pending_clients(e), 1);
    assert_eq!(store.entry(e).lock_count(), 1);
    assert!(store.unregister(other, e));
    assert!(!store.entry(e).is_aborted(), "little is left to fetch");
}

#[test]
fn test_callback_copies_again() {
    let mut store = store();
    let e = pending_entry(&mut store);
    store.append(e, &reply()).unwrap();
    store.complete(e);
    let r = store.register(e);

    let seen = Answers::default();
    let record = recorder(&seen);
    let record_next = recorder(&seen);
    store.copy(r, e, CopyRequest::new(0, 4), move |store, reader, answer| {
        let next = answer.offset + answer.len() as u64;
        record(store, reader, answer);
        store.copy(reader, e, CopyRequest::new(next, 4096), record_next);
    });
    store.poll();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2, "the second answer arrives in the same poll");
    assert_eq!(seen[0].data, b"0123");
    assert_eq!(seen[1].data, b"456789");
}

#[test]
fn test_aborted_entry_delivers_what_arrived() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store.append(e, HEAD).unwrap();
    store.append(e, b"01234").unwrap();
    assert_eq!(fetch(&mut store, r, e, CopyRequest::new(0, 4096)).data, b"01234");

    let answers = Answers::default();
    store.copy(r, e, CopyRequest::new(5, 4096), recorder(&answers));
    store.abort(e);
    store.poll();

    let answers = answers.borrow();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].is_eof());
    assert!(!answers[0].is_error());
}

#[test]
fn test_quick_abort_on_last_unregister() {
    let mut store = store();
    let e = pending_entry(&mut store);
    let r = store.register(e);
    store
        .append(e, b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n")
        .unwrap();
    store.append(e, &[0; 100]).unwrap();

    assert!(store.unregister(r, e));
    assert!(store.entry(e).is_aborted());
    assert_eq!(store.stats().quick_aborts, 1);
}

#[test]
fn test_quick_abort_keeps_special_entries() {
    let mut store = store();
    let e = store.create_entry(KEY, Some(RequestFlags::CACHABLE), EntryFlags::SPECIAL);
    let r = store.register(e);
    store
        .append(e, b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n")
        .unwrap();

    assert!(store.unregister(r, e));
    assert!(!store.entry(e).is_aborted());
    assert_eq!(store.stats().quick_aborts, 0);
}

struct CountingWaker(AtomicUsize);

impl Wake for CountingWaker {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_read_ahead_waker() {
    let mut config = Config::default();
    config.read_ahead_gap = 32;
    let mut store = store_with(config);
    let e = pending_entry(&mut store);
    store
        .append(e, b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
        .unwrap();
    let hdr_sz = store.entry(e).mem().end_offset();
    store.append(e, &vec![b'x'; 42]).unwrap();
    let r = store.register(e);

    let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
    store.register_read_waker(e, &Waker::from(counter.clone()));

    assert_eq!(fetch(&mut store, r, e, CopyRequest::new(0, 10)).len(), 10);
    assert_eq!(store.read_ahead_allowance(e), 0);
    assert_eq!(fetch(&mut store, r, e, CopyRequest::new(10, 10)).len(), 10);
    assert_eq!(store.lowest_mem_reader_offset(e), hdr_sz + 20);
    assert_eq!(store.read_ahead_allowance(e), 10);
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);

    // The next request lets the producer go on.
    store.copy(r, e, CopyRequest::new(20, 10), |_, _, _| {});
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}
