//! IO channel layer
//!
//! Codelets exchange typed records with external consumers through
//! channels identified by 16-byte stream ids. The transport moving
//! those records is an external collaborator; this module pins its
//! interface (`Transport`/`IoChannel`) and ships `LocalTransport`, an
//! in-process reference implementation backed by bounded queues, used
//! by the agent's drain loop and the test-suite.

pub mod local;

pub use local::LocalTransport;
pub use tether_lcm::stream_id::StreamId;

use std::sync::Arc;

/// Direction of a channel relative to the codelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Host/consumer → codelet (control input).
    Input,
    /// Codelet → consumer (ringbuf, output).
    Output,
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A channel with this stream id already exists.
    #[error("channel with stream id {0} already exists")]
    DuplicateStreamId(StreamId),

    /// The per-direction channel budget is exhausted.
    #[error("too many {0:?} channels")]
    ChannelCapacity(ChannelDirection),

    /// The channel's element pool could not be allocated.
    #[error("failed to allocate channel storage")]
    Alloc,

    /// No channel is bound to this stream id.
    #[error("no channel with stream id {0}")]
    UnknownStreamId(StreamId),

    /// Record size does not match the channel element size.
    #[error("record size {got} does not fit channel element size {elem}")]
    BadSize {
        /// Size handed in by the caller.
        got: usize,
        /// Channel element size.
        elem: usize,
    },

    /// The channel queue is full.
    #[error("channel queue full")]
    Full,
}

/// One endpoint the codelet side reads or writes.
///
/// Implementations must be callable from hook dispatch: no blocking,
/// no allocation outside the channel's own pool.
pub trait IoChannel: Send + Sync {
    /// Stream id this channel is bound to.
    fn stream_id(&self) -> StreamId;

    /// Element size in bytes; every record has exactly this size.
    fn elem_size(&self) -> usize;

    /// Reserve (or re-fetch) the calling thread's uncommitted output
    /// slot. Returns null when the pool is exhausted or the channel is
    /// not an output channel.
    fn reserve_buf(&self, thread_id: usize) -> *mut u8;

    /// Commit the calling thread's reserved slot. Returns 0 on
    /// success, −1 without a prior reservation or when the queue
    /// rejects the record (the reservation then stays valid).
    fn submit_buf(&self, thread_id: usize) -> i32;

    /// Reserve+copy+commit one record of `size` bytes. Returns 0 on
    /// success, −1 on failure.
    ///
    /// # Safety
    /// `data` must be readable for `size` bytes.
    unsafe fn send(&self, data: *const u8, size: usize) -> i32;

    /// Dequeue one record into `out`. Returns 1 on success, 0 when
    /// empty, −1 on failure.
    ///
    /// # Safety
    /// `out` must be writable for the channel element size.
    unsafe fn recv(&self, out: *mut u8) -> i32;
}

/// Callback receiving batches of committed output records.
pub type OutputHandler = Arc<dyn Fn(&StreamId, &[&[u8]]) + Send + Sync>;

/// The external IO transport, specified at its interface.
pub trait Transport: Send + Sync {
    /// Create a channel of `num_elems` records of `elem_size` bytes.
    /// The optional serde object is attached opaquely for consumers.
    fn create_channel(
        &self,
        direction: ChannelDirection,
        num_elems: u32,
        elem_size: u32,
        stream_id: StreamId,
        serde_obj: Option<&[u8]>,
    ) -> Result<Arc<dyn IoChannel>, IoError>;

    /// Remove a channel; its stream id becomes reusable.
    fn destroy_channel(&self, stream_id: &StreamId);

    /// Drain committed output records into `handler`, releasing each
    /// record buffer afterwards.
    fn handle_out_bufs(&self, handler: &OutputHandler);

    /// Feed one record into the input channel bound to `stream_id`.
    fn send_input(&self, stream_id: &StreamId, data: &[u8]) -> Result<(), IoError>;
}
