//! Traffic-analysis-resistant framing: newline-delimited JSON-RPC frames on
//! the wire, batched and padded to quantized packet sizes on the way out.
//!
//! Generalizes the teacher's `FramedRead`/`FramedWrite` over
//! `tokio_util::codec::LinesCodec` (`src/connection.rs`) by adding a send-side
//! buffer that pads and batches frames instead of writing each one
//! immediately.

use {
    super::*,
    bytes::{Buf, BufMut, Bytes, BytesMut},
    futures::stream::StreamExt,
    std::time::Instant,
    tokio::{
        io::{AsyncRead, AsyncWrite, AsyncWriteExt},
        sync::mpsc,
        task::JoinSet,
        time::MissedTickBehavior,
    },
    tokio_util::codec::{Decoder, FramedRead},
};

pub const MIN_PACKET_SIZE: usize = 1024;
pub const WAIT_FOR_BUFFER_GROWTH: Duration = Duration::from_secs(1);

/// The two channel endpoints a [`NotificationSession`](crate::session::NotificationSession)
/// needs: a sink for outgoing pre-serialized frames (fed into the padding
/// buffer) and a source of decoded incoming messages.
pub struct Transport {
    pub frames_tx: mpsc::Sender<Bytes>,
    pub incoming_rx: mpsc::Receiver<Message>,
}

/// Spawns the write-side poller, the raw socket writer, and the read-side
/// decoder loop into `join_set`, returning the two channel endpoints the
/// session needs to drive the connection.
///
/// `force_send` is true for short-lived, non-subscription sessions (e.g. a
/// certificate probe), matching `spec.md` §4.3.
pub fn spawn_transport<S>(
    stream: S,
    max_frame_len: usize,
    force_send: bool,
    join_set: &mut JoinSet<()>,
) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(64);
    let (packets_tx, mut packets_rx) = mpsc::channel::<Bytes>(64);
    let (incoming_tx, incoming_rx) = mpsc::channel::<Message>(64);

    join_set.spawn(run_padding_poller(PaddingBuffer::new(force_send), frames_rx, packets_tx));

    join_set.spawn(async move {
        while let Some(packet) = packets_rx.recv().await {
            if write_half.write_all(&packet).await.is_err() {
                break;
            }
        }
    });

    join_set.spawn(async move {
        let mut framed = FramedRead::new(read_half, PaddedDecoder::new(max_frame_len));
        while let Some(decoded) = framed.next().await {
            match decoded {
                Ok(message) => {
                    if incoming_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Transport { frames_tx, incoming_rx }
}

/// Decodes newline-delimited JSON-RPC frames, rejecting any frame whose byte
/// length exceeds `max_frame_len` before even attempting to parse it (a
/// malicious server cannot force unbounded buffering).
pub struct PaddedDecoder {
    max_frame_len: usize,
}

impl PaddedDecoder {
    /// `max_frame_len` must exceed 500_000 bytes (spec's max-incoming-frame
    /// invariant); callers are expected to have validated this via
    /// `ConfigProvider::max_incoming_frame_size`.
    pub fn new(max_frame_len: usize) -> Self {
        assert!(max_frame_len > 500_000, "max_frame_len must exceed 500_000 bytes");
        Self { max_frame_len }
    }
}

impl Decoder for PaddedDecoder {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(newline_at) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_frame_len {
                return Err(PeerError::corrupted(format!(
                    "incoming frame exceeds max_frame_len ({} > {})",
                    src.len(),
                    self.max_frame_len
                )));
            }
            return Ok(None);
        };

        if newline_at > self.max_frame_len {
            return Err(PeerError::corrupted(format!(
                "incoming frame exceeds max_frame_len ({newline_at} > {})",
                self.max_frame_len
            )));
        }

        let line = src.split_to(newline_at + 1);
        let trimmed = &line[..line.len() - 1];

        let message: Message = serde_json::from_slice(trimmed)
            .map_err(|e| PeerError::corrupted(format!("malformed JSON-RPC frame: {e}")))?;

        Ok(Some(message))
    }
}

/// Next power of two ≥ n (n > 0).
fn next_pow2(n: usize) -> usize {
    n.next_power_of_two()
}

/// Finds the last `\n` strictly before `limit`, returning the index one past
/// it (i.e. the length of a valid sub-payload ending at that terminator).
fn last_terminator_before(buf: &[u8], limit: usize) -> Option<usize> {
    let limit = limit.min(buf.len());
    buf[..limit].iter().rposition(|&b| b == b'\n').map(|idx| idx + 1)
}

/// Send-side accumulator implementing the padded-batching decision
/// procedure. Frames pushed here must already end in `}\n` or `]\n` (a
/// complete, newline-terminated JSON-RPC frame).
pub struct PaddingBuffer {
    buf: BytesMut,
    last_send: Instant,
    /// Set for short-lived, non-subscription sessions (e.g. a certificate
    /// probe): every decision emits everything buffered immediately.
    force_send: bool,
}

impl PaddingBuffer {
    pub fn new(force_send: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            last_send: Instant::now(),
            force_send,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_frame(&mut self, frame: &[u8]) {
        debug_assert!(
            frame.ends_with(b"}\n") || frame.ends_with(b"]\n"),
            "frame must be newline-terminated JSON-RPC"
        );
        self.buf.put_slice(frame);
    }

    /// Runs the decision procedure once. Returns the padded packet to write,
    /// if the decision was to send now.
    pub fn try_emit(&mut self, now: Instant) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }

        let payload_lsize = self.buf.len();
        let total_lsize = MIN_PACKET_SIZE.max(next_pow2(payload_lsize));
        let npad_lsize = total_lsize - payload_lsize;

        let total_ssize = MIN_PACKET_SIZE.max(total_lsize / 2);
        let (payload_ssize, npad_ssize) = match last_terminator_before(&self.buf, total_ssize) {
            Some(p) => (p, total_ssize - p),
            None => (0, usize::MAX),
        };

        let elapsed = now.saturating_duration_since(self.last_send);
        let should_send =
            self.force_send || elapsed >= WAIT_FOR_BUFFER_GROWTH || payload_lsize >= MIN_PACKET_SIZE;

        if !should_send {
            return None;
        }

        let use_lsize = self.force_send || npad_lsize <= npad_ssize;

        let (payload_len, total_len) = if use_lsize {
            (payload_lsize, total_lsize)
        } else {
            (payload_ssize, total_ssize)
        };

        debug_assert!(
            self.buf[..payload_len].ends_with(b"}\n") || self.buf[..payload_len].ends_with(b"]\n"),
            "chosen payload must end on a frame terminator"
        );

        // `buf[:p-2] + pad + terminator`: the terminator ("}\n"/"]\n") is the
        // last two bytes of the emitted packet, with padding spaces inserted
        // just before it, not appended after it.
        let terminator = &self.buf[payload_len - 2..payload_len];
        let mut packet = BytesMut::with_capacity(total_len);
        packet.put_slice(&self.buf[..payload_len - 2]);
        packet.put_bytes(b' ', total_len - payload_len);
        packet.put_slice(terminator);

        self.buf.advance(payload_len);
        self.last_send = now;

        Some(packet.freeze())
    }
}

/// Owns the send buffer and drives it from either an explicit push or a
/// periodic tick, the way a subscription session's framing layer does.
/// Spawned into the interface's `JoinSet` by `open_session`.
pub async fn run_padding_poller(
    mut buffer: PaddingBuffer,
    mut frames_rx: tokio::sync::mpsc::Receiver<Bytes>,
    packets_tx: tokio::sync::mpsc::Sender<Bytes>,
) {
    let mut ticker = tokio::time::interval(WAIT_FOR_BUFFER_GROWTH);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                match frame {
                    Some(frame) => {
                        buffer.push_frame(&frame);
                        if let Some(packet) = buffer.try_emit(Instant::now())
                            && packets_tx.send(packet).await.is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        if let Some(packet) = buffer.try_emit(Instant::now()) {
                            let _ = packets_tx.send(packet).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty()
                    && let Some(packet) = buffer.try_emit(Instant::now())
                    && packets_tx.send(packet).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(b'\n');
        v
    }

    #[test]
    fn force_send_empties_buffer_immediately() {
        let mut pb = PaddingBuffer::new(true);
        pb.push_frame(&frame(r#"{"id":1}"#));
        let packet = pb.try_emit(Instant::now()).unwrap();
        assert!(pb.is_empty());
        assert_eq!(packet.len(), MIN_PACKET_SIZE);
    }

    #[test]
    fn packet_length_is_power_of_two_and_at_least_min() {
        let mut pb = PaddingBuffer::new(true);
        pb.push_frame(&frame(&"x".repeat(2000)));
        let packet = pb.try_emit(Instant::now()).unwrap();
        assert!(packet.len().is_power_of_two());
        assert!(packet.len() >= MIN_PACKET_SIZE);
    }

    #[test]
    fn payload_ends_in_frame_terminator_excluding_padding() {
        let mut pb = PaddingBuffer::new(true);
        pb.push_frame(&frame(r#"{"a":1}"#));
        let packet = pb.try_emit(Instant::now()).unwrap();
        let trimmed_end = packet.iter().rposition(|&b| b != b' ').unwrap();
        assert_eq!(packet[trimmed_end], b'\n');
        assert_eq!(packet[trimmed_end - 1], b'}');
    }

    #[test]
    fn defers_when_buffer_small_and_not_forced_and_not_stale() {
        let mut pb = PaddingBuffer::new(false);
        pb.push_frame(&frame(r#"{"a":1}"#));
        assert!(pb.try_emit(Instant::now()).is_none());
        assert!(!pb.is_empty());
    }

    #[test]
    fn sends_once_buffer_growth_window_elapses() {
        let mut pb = PaddingBuffer::new(false);
        pb.push_frame(&frame(r#"{"a":1}"#));
        let later = Instant::now() + WAIT_FOR_BUFFER_GROWTH + Duration::from_millis(1);
        assert!(pb.try_emit(later).is_some());
    }

    #[test]
    fn sends_immediately_once_min_packet_size_reached() {
        let mut pb = PaddingBuffer::new(false);
        pb.push_frame(&frame(&"x".repeat(MIN_PACKET_SIZE)));
        assert!(pb.try_emit(Instant::now()).is_some());
    }

    #[test]
    fn prefers_ssize_when_it_pads_less() {
        // A large frame followed by a tiny one: the terminator right after
        // the large frame lands close to total_lsize / 2, so ssize should
        // pad less than emitting everything at the next power of two.
        let mut pb = PaddingBuffer::new(true);
        pb.push_frame(&frame(&"x".repeat(600)));
        pb.push_frame(&frame("y"));
        let packet = pb.try_emit(Instant::now()).unwrap();
        // total_lsize for ~610 bytes is 1024 (MIN_PACKET_SIZE); ssize is also
        // clamped to MIN_PACKET_SIZE here, so both options coincide at 1024.
        assert_eq!(packet.len(), MIN_PACKET_SIZE);
    }

    #[test]
    fn decoder_enforces_max_frame_len() {
        let mut decoder = PaddedDecoder::new(600_000);
        let mut buf = BytesMut::new();
        buf.put_slice(&"x".repeat(600_001).into_bytes());
        buf.put_u8(b'\n');
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn decoder_parses_complete_frame() {
        let mut decoder = PaddedDecoder::new(600_000);
        let mut buf = BytesMut::new();
        buf.put_slice(br#"{"method":"server.ping","params":[]}"#);
        buf.put_u8(b'\n');
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Notification { .. } | Message::Request { .. }));
    }

    #[test]
    fn decoder_waits_for_more_data_without_newline() {
        let mut decoder = PaddedDecoder::new(600_000);
        let mut buf = BytesMut::new();
        buf.put_slice(br#"{"method":"server.ping""#);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }
}
