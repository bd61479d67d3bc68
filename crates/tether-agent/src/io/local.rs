//! In-process IO transport
//!
//! Channels are bounded MPMC queues over a private element pool, so
//! producer-side helpers stay allocation-free. Output reservations are
//! per-thread slots, which makes `get_output_buf`/`send_output`
//! naturally single-producer per thread while `ringbuf_output` stays
//! multi-producer.

use crate::config::{MAX_INPUT_CHANNELS, MAX_OUTPUT_CHANNELS, MAX_REG_THREADS};
use crate::io::{ChannelDirection, IoChannel, IoError, OutputHandler, StreamId, Transport};
use crate::mempool::Mempool;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Largest batch handed to the output handler per channel per drain.
const DRAIN_BATCH: usize = 16;

struct LocalChannel {
    stream_id: StreamId,
    direction: ChannelDirection,
    elem_size: usize,
    queue: ArrayQueue<usize>,
    pool: Mempool,
    /// Per-thread uncommitted reservation (pointer, or 0 when none).
    reservations: Box<[AtomicUsize]>,
    #[allow(dead_code)]
    serde_obj: Option<Vec<u8>>,
}

impl LocalChannel {
    fn new(
        direction: ChannelDirection,
        num_elems: u32,
        elem_size: u32,
        stream_id: StreamId,
        serde_obj: Option<&[u8]>,
    ) -> Result<Self, IoError> {
        let num_elems = num_elems.max(1) as usize;
        // Elements in flight: queued records, per-thread reservations
        // and the drain batch currently handed to the output handler.
        let pool_elems = num_elems + MAX_REG_THREADS + DRAIN_BATCH;
        let pool = Mempool::new(pool_elems, elem_size as usize).ok_or(IoError::Alloc)?;
        let reservations = (0..MAX_REG_THREADS).map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            stream_id,
            direction,
            elem_size: elem_size as usize,
            queue: ArrayQueue::new(num_elems),
            pool,
            reservations,
            serde_obj: serde_obj.map(<[u8]>::to_vec),
        })
    }

    fn push_record(&self, ptr: *mut u8) -> Result<(), IoError> {
        self.queue.push(ptr as usize).map_err(|_| IoError::Full)
    }
}

impl IoChannel for LocalChannel {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn elem_size(&self) -> usize {
        self.elem_size
    }

    fn reserve_buf(&self, thread_id: usize) -> *mut u8 {
        if self.direction != ChannelDirection::Output || thread_id >= MAX_REG_THREADS {
            return std::ptr::null_mut();
        }
        let slot = &self.reservations[thread_id];
        let existing = slot.load(Ordering::Relaxed);
        if existing != 0 {
            // Repeated reserve without submit returns the same slot.
            return existing as *mut u8;
        }
        let ptr = self.pool.alloc();
        if !ptr.is_null() {
            slot.store(ptr as usize, Ordering::Relaxed);
        }
        ptr
    }

    fn submit_buf(&self, thread_id: usize) -> i32 {
        if self.direction != ChannelDirection::Output || thread_id >= MAX_REG_THREADS {
            return -1;
        }
        let slot = &self.reservations[thread_id];
        let ptr = slot.swap(0, Ordering::Relaxed);
        if ptr == 0 {
            return -1;
        }
        match self.push_record(ptr as *mut u8) {
            Ok(()) => 0,
            Err(_) => {
                // Queue rejected the record; the reservation stays.
                slot.store(ptr, Ordering::Relaxed);
                -1
            }
        }
    }

    unsafe fn send(&self, data: *const u8, size: usize) -> i32 {
        if self.direction != ChannelDirection::Output || size > self.elem_size {
            return -1;
        }
        let ptr = self.pool.alloc();
        if ptr.is_null() {
            return -1;
        }
        std::ptr::copy_nonoverlapping(data, ptr, size);
        match self.push_record(ptr) {
            Ok(()) => 0,
            Err(_) => {
                self.pool.free(ptr);
                -1
            }
        }
    }

    unsafe fn recv(&self, out: *mut u8) -> i32 {
        if self.direction != ChannelDirection::Input {
            return -1;
        }
        match self.queue.pop() {
            Some(addr) => {
                let ptr = addr as *mut u8;
                std::ptr::copy_nonoverlapping(ptr, out, self.elem_size);
                self.pool.free(ptr);
                1
            }
            None => 0,
        }
    }
}

/// Reference transport keeping all channels in process memory.
pub struct LocalTransport {
    channels: Mutex<Vec<Arc<LocalChannel>>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
        }
    }

    fn count(&self, direction: ChannelDirection) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|ch| ch.direction == direction)
            .count()
    }

    /// Pop up to one record from the output channel bound to
    /// `stream_id`, for tests and embedding hosts that poll instead of
    /// registering a handler.
    pub fn pop_output(&self, stream_id: &StreamId) -> Option<Vec<u8>> {
        let channel = self
            .channels
            .lock()
            .iter()
            .find(|ch| ch.stream_id == *stream_id && ch.direction == ChannelDirection::Output)
            .cloned()?;
        let addr = channel.queue.pop()?;
        let ptr = addr as *mut u8;
        let record = unsafe { std::slice::from_raw_parts(ptr, channel.elem_size) }.to_vec();
        channel.pool.free(ptr);
        Some(record)
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn create_channel(
        &self,
        direction: ChannelDirection,
        num_elems: u32,
        elem_size: u32,
        stream_id: StreamId,
        serde_obj: Option<&[u8]>,
    ) -> Result<Arc<dyn IoChannel>, IoError> {
        let limit = match direction {
            ChannelDirection::Input => MAX_INPUT_CHANNELS,
            ChannelDirection::Output => MAX_OUTPUT_CHANNELS,
        };
        if self.count(direction) >= limit {
            return Err(IoError::ChannelCapacity(direction));
        }
        let mut channels = self.channels.lock();
        if channels.iter().any(|ch| ch.stream_id == stream_id) {
            return Err(IoError::DuplicateStreamId(stream_id));
        }
        let channel = Arc::new(LocalChannel::new(
            direction, num_elems, elem_size, stream_id, serde_obj,
        )?);
        channels.push(channel.clone());
        Ok(channel)
    }

    fn destroy_channel(&self, stream_id: &StreamId) {
        self.channels.lock().retain(|ch| ch.stream_id != *stream_id);
    }

    fn handle_out_bufs(&self, handler: &OutputHandler) {
        let channels: Vec<_> = self
            .channels
            .lock()
            .iter()
            .filter(|ch| ch.direction == ChannelDirection::Output)
            .cloned()
            .collect();
        for channel in channels {
            loop {
                let mut ptrs = Vec::with_capacity(DRAIN_BATCH);
                while ptrs.len() < DRAIN_BATCH {
                    match channel.queue.pop() {
                        Some(addr) => ptrs.push(addr as *mut u8),
                        None => break,
                    }
                }
                if ptrs.is_empty() {
                    break;
                }
                let records: Vec<&[u8]> = ptrs
                    .iter()
                    .map(|&p| unsafe { std::slice::from_raw_parts(p, channel.elem_size) })
                    .collect();
                handler(&channel.stream_id, &records);
                for ptr in ptrs {
                    channel.pool.free(ptr);
                }
            }
        }
    }

    fn send_input(&self, stream_id: &StreamId, data: &[u8]) -> Result<(), IoError> {
        let channel = self
            .channels
            .lock()
            .iter()
            .find(|ch| ch.stream_id == *stream_id && ch.direction == ChannelDirection::Input)
            .cloned()
            .ok_or(IoError::UnknownStreamId(*stream_id))?;
        if data.len() > channel.elem_size {
            return Err(IoError::BadSize {
                got: data.len(),
                elem: channel.elem_size,
            });
        }
        let ptr = channel.pool.alloc();
        if ptr.is_null() {
            return Err(IoError::Full);
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        channel.push_record(ptr).map_err(|err| {
            channel.pool.free(ptr);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(tag: u8) -> StreamId {
        StreamId::from_bytes([tag; 16])
    }

    fn output_channel(transport: &LocalTransport, tag: u8) -> Arc<dyn IoChannel> {
        transport
            .create_channel(ChannelDirection::Output, 8, 8, stream(tag), None)
            .unwrap()
    }

    #[test]
    fn test_reserve_submit_cycle() {
        let transport = LocalTransport::new();
        let channel = output_channel(&transport, 1);

        // Submit without reservation fails.
        assert_eq!(channel.submit_buf(0), -1);

        let first = channel.reserve_buf(0);
        assert!(!first.is_null());
        // Repeated reserve returns the same slot.
        assert_eq!(channel.reserve_buf(0), first);

        unsafe { std::ptr::write(first as *mut u64, 7) };
        assert_eq!(channel.submit_buf(0), 0);
        // Second submit without a new reservation fails.
        assert_eq!(channel.submit_buf(0), -1);

        // A fresh cycle yields a distinct record.
        let second = channel.reserve_buf(0);
        assert!(!second.is_null());
        unsafe { std::ptr::write(second as *mut u64, 8) };
        assert_eq!(channel.submit_buf(0), 0);

        assert_eq!(
            transport.pop_output(&stream(1)).unwrap(),
            7u64.to_le_bytes()
        );
        assert_eq!(
            transport.pop_output(&stream(1)).unwrap(),
            8u64.to_le_bytes()
        );
    }

    #[test]
    fn test_reservations_are_per_thread() {
        let transport = LocalTransport::new();
        let channel = output_channel(&transport, 1);
        let a = channel.reserve_buf(0);
        let b = channel.reserve_buf(1);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_eq!(channel.submit_buf(1), 0);
        assert_eq!(channel.submit_buf(0), 0);
    }

    #[test]
    fn test_ringbuf_send_and_drain() {
        let transport = LocalTransport::new();
        let channel = output_channel(&transport, 2);
        for i in 0..3u64 {
            let data = i.to_le_bytes();
            assert_eq!(unsafe { channel.send(data.as_ptr(), 8) }, 0);
        }

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        let handler: OutputHandler = Arc::new(move |id, records| {
            let mut sink = sink.lock();
            for rec in records {
                sink.push((*id, rec.to_vec()));
            }
        });
        transport.handle_out_bufs(&handler);

        let got = got.lock();
        assert_eq!(got.len(), 3);
        for (i, (id, rec)) in got.iter().enumerate() {
            assert_eq!(*id, stream(2));
            assert_eq!(rec.as_slice(), (i as u64).to_le_bytes());
        }
    }

    #[test]
    fn test_send_oversized_record_fails() {
        let transport = LocalTransport::new();
        let channel = output_channel(&transport, 3);
        let data = [0u8; 16];
        assert_eq!(unsafe { channel.send(data.as_ptr(), 16) }, -1);
    }

    #[test]
    fn test_queue_full_rejects_and_releases() {
        let transport = LocalTransport::new();
        let channel = transport
            .create_channel(ChannelDirection::Output, 2, 8, stream(4), None)
            .unwrap();
        let data = 1u64.to_le_bytes();
        assert_eq!(unsafe { channel.send(data.as_ptr(), 8) }, 0);
        assert_eq!(unsafe { channel.send(data.as_ptr(), 8) }, 0);
        assert_eq!(unsafe { channel.send(data.as_ptr(), 8) }, -1);
        // Draining frees space again.
        assert!(transport.pop_output(&stream(4)).is_some());
        assert_eq!(unsafe { channel.send(data.as_ptr(), 8) }, 0);
    }

    #[test]
    fn test_control_input_roundtrip() {
        let transport = LocalTransport::new();
        let channel = transport
            .create_channel(ChannelDirection::Input, 4, 8, stream(5), None)
            .unwrap();

        let mut out = [0u8; 8];
        assert_eq!(unsafe { channel.recv(out.as_mut_ptr()) }, 0);

        transport
            .send_input(&stream(5), &42u64.to_le_bytes())
            .unwrap();
        assert_eq!(unsafe { channel.recv(out.as_mut_ptr()) }, 1);
        assert_eq!(u64::from_le_bytes(out), 42);

        assert!(matches!(
            transport.send_input(&stream(9), &out),
            Err(IoError::UnknownStreamId(_))
        ));
    }

    #[test]
    fn test_duplicate_stream_id_rejected() {
        let transport = LocalTransport::new();
        output_channel(&transport, 6);
        assert!(matches!(
            transport.create_channel(ChannelDirection::Output, 8, 8, stream(6), None),
            Err(IoError::DuplicateStreamId(_))
        ));
        transport.destroy_channel(&stream(6));
        output_channel(&transport, 6);
    }
}
