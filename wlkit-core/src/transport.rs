//! Buffered Wayland transport.
//!
//! [`BufferedSocket`] sits between the connection engine and a raw
//! [`Transport`] (usually a Unix stream socket). It owns the byte and file
//! descriptor queues in both directions and implements per-argument
//! encoding and decoding driven by static message signatures.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::{
    ArgType, ArgValue, ByteBuffer, Fixed, IoMode, Message, MessageBuffersPool, MessageHeader,
    ObjectId,
};

mod unix;

/// Bytes requested from the socket per read.
pub const BYTES_PER_READ: usize = 4096;
/// Ancillary descriptors accepted per read.
pub const FDS_PER_READ: usize = 32;
/// Encoded size limit for a single message.
pub const MAX_MESSAGE_SIZE: usize = 4096;
/// Descriptor limit for a single message.
pub const MAX_MESSAGE_FDS: usize = 28;

/// Malformed data or a protocol constraint violation during pack/unpack.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    TooManyBytes,
    #[error("message exceeds the {MAX_MESSAGE_FDS} file descriptor limit")]
    TooManyFds,
    #[error("message header has a null object id")]
    NullObjectId,
    #[error("unexpected null in a non-nullable argument")]
    UnexpectedNull,
    #[error("string argument is not null-terminated")]
    NullInString,
}

/// Failed to hand a message to the transport. Ownership of the message is
/// returned so the caller can retry or report it.
pub struct SendMessageError {
    pub msg: Message,
    pub err: SendError,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Failed to receive a message.
#[derive(Debug, thiserror::Error)]
pub enum RecvMessageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// An abstraction over the underlying byte-and-descriptor stream.
///
/// Implemented for [`UnixStream`](std::os::unix::net::UnixStream); tests
/// substitute in-memory doubles.
pub trait Transport {
    fn pollable_fd(&self) -> RawFd;

    /// Send bytes plus out-of-band descriptors. Descriptors are borrowed;
    /// the caller closes them after the call reports success.
    fn send(&mut self, bytes: &[u8], fds: &[OwnedFd], mode: IoMode) -> io::Result<usize>;

    /// Receive bytes into `bytes`, appending any descriptors found in the
    /// ancillary data to `fds` in arrival order. Returns the number of
    /// bytes read; zero means the peer closed the connection.
    fn recv(&mut self, bytes: &mut [u8], fds: &mut VecDeque<OwnedFd>, mode: IoMode)
        -> io::Result<usize>;
}

/// A buffered Wayland socket: message framing, argument marshalling and
/// descriptor queues over a [`Transport`].
pub struct BufferedSocket<T> {
    socket: T,
    bytes_in: ByteBuffer,
    bytes_out: ByteBuffer,
    fds_in: VecDeque<OwnedFd>,
    fds_out: VecDeque<OwnedFd>,
}

impl<T: Transport> From<T> for BufferedSocket<T> {
    fn from(socket: T) -> Self {
        Self {
            socket,
            bytes_in: ByteBuffer::new(),
            bytes_out: ByteBuffer::new(),
            fds_in: VecDeque::new(),
            fds_out: VecDeque::new(),
        }
    }
}

impl<T: Transport> AsRawFd for BufferedSocket<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.pollable_fd()
    }
}

impl<T: Transport> BufferedSocket<T> {
    /// Encode a message into the outbound buffer, flushing beforehand if
    /// the buffered data would otherwise grow past a socket-write's worth.
    ///
    /// Oversized messages are rejected with a [`WireError`]; the connection
    /// remains usable.
    pub fn write_message(
        &mut self,
        msg: Message,
        pool: &mut MessageBuffersPool,
        mode: IoMode,
    ) -> Result<(), SendMessageError> {
        let size = MessageHeader::SIZE + msg.args.iter().map(ArgValue::size).sum::<usize>();
        let fds_cnt = msg
            .args
            .iter()
            .filter(|arg| matches!(arg, ArgValue::Fd(_)))
            .count();

        if size > MAX_MESSAGE_SIZE {
            return Err(SendMessageError {
                msg,
                err: WireError::TooManyBytes.into(),
            });
        }
        if fds_cnt > MAX_MESSAGE_FDS {
            return Err(SendMessageError {
                msg,
                err: WireError::TooManyFds.into(),
            });
        }

        if self.bytes_out.len() + size > MAX_MESSAGE_SIZE
            || self.fds_out.len() + fds_cnt > MAX_MESSAGE_FDS
        {
            if let Err(err) = self.flush(mode) {
                return Err(SendMessageError {
                    msg,
                    err: err.into(),
                });
            }
        }

        self.bytes_out.write_u32(msg.header.object_id.as_u32());
        self.bytes_out
            .write_u32((size as u32) << 16 | msg.header.opcode as u32);

        let mut msg = msg;
        for arg in msg.args.drain(..) {
            match arg {
                ArgValue::Int(x) | ArgValue::Fixed(Fixed(x)) => self.bytes_out.write_i32(x),
                ArgValue::Uint(x) => self.bytes_out.write_u32(x),
                ArgValue::Object(id)
                | ArgValue::OptObject(Some(id))
                | ArgValue::NewId(id) => self.bytes_out.write_u32(id.as_u32()),
                ArgValue::OptObject(None) | ArgValue::OptString(None) => {
                    self.bytes_out.write_u32(0)
                }
                ArgValue::AnyNewId(iface, version, id) => {
                    self.write_chunk(iface.to_bytes_with_nul());
                    self.bytes_out.write_u32(version);
                    self.bytes_out.write_u32(id.as_u32());
                }
                ArgValue::String(s) | ArgValue::OptString(Some(s)) => {
                    self.write_chunk(s.to_bytes_with_nul())
                }
                ArgValue::Array(array) => self.write_chunk(&array),
                ArgValue::Fd(fd) => self.fds_out.push_back(fd),
            }
        }
        pool.reuse_args(msg.args);
        Ok(())
    }

    /// Peek the header of the next message, filling the inbound buffer as
    /// needed. The header stays buffered.
    pub fn peek_message_header(&mut self, mode: IoMode) -> Result<MessageHeader, RecvMessageError> {
        while self.bytes_in.len() < MessageHeader::SIZE {
            self.fill_incoming(mode)?;
        }

        let mut raw = [0; MessageHeader::SIZE];
        self.bytes_in.peek_bytes(&mut raw);
        let object_id = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let size_and_opcode = u32::from_le_bytes(raw[4..8].try_into().unwrap());

        Ok(MessageHeader {
            object_id: ObjectId(NonZeroU32::new(object_id).ok_or(WireError::NullObjectId)?),
            size: (size_and_opcode >> 16) as u16,
            opcode: (size_and_opcode & 0xFFFF) as u16,
        })
    }

    /// Receive the message whose header was just peeked, decoding arguments
    /// according to `signature`. Blocks (or returns `WouldBlock`) until the
    /// whole message and every descriptor it requires are buffered; a
    /// partial message is never produced.
    pub fn recv_message(
        &mut self,
        header: MessageHeader,
        signature: &[ArgType],
        pool: &mut MessageBuffersPool,
        mode: IoMode,
    ) -> Result<Message, RecvMessageError> {
        let fds_cnt = signature
            .iter()
            .filter(|arg| matches!(arg, ArgType::Fd))
            .count();

        while (header.size as usize) > self.bytes_in.len() || fds_cnt > self.fds_in.len() {
            self.fill_incoming(mode)?;
        }

        self.bytes_in.consume(MessageHeader::SIZE);

        let mut args = pool.get_args();
        for arg_type in signature {
            args.push(match arg_type {
                ArgType::Int => ArgValue::Int(self.bytes_in.read_i32()),
                ArgType::Uint => ArgValue::Uint(self.bytes_in.read_u32()),
                ArgType::Fixed => ArgValue::Fixed(Fixed(self.bytes_in.read_i32())),
                ArgType::Object => ArgValue::Object(
                    self.bytes_in.read_id().ok_or(WireError::UnexpectedNull)?,
                ),
                ArgType::OptObject => ArgValue::OptObject(self.bytes_in.read_id()),
                ArgType::NewId(_) => ArgValue::NewId(
                    self.bytes_in.read_id().ok_or(WireError::UnexpectedNull)?,
                ),
                ArgType::AnyNewId => ArgValue::AnyNewId(
                    Cow::Owned(self.recv_string()?),
                    self.bytes_in.read_u32(),
                    self.bytes_in.read_id().ok_or(WireError::UnexpectedNull)?,
                ),
                ArgType::String => ArgValue::String(self.recv_string()?),
                ArgType::OptString => ArgValue::OptString(match self.bytes_in.read_u32() {
                    0 => None,
                    len => Some(self.recv_string_with_len(len)?),
                }),
                ArgType::Array => ArgValue::Array(self.recv_array()),
                ArgType::Fd => {
                    // The n-th fd argument across all received messages
                    // consumes the n-th descriptor from the socket.
                    ArgValue::Fd(self.fds_in.pop_front().expect("fd count checked above"))
                }
            });
        }

        Ok(Message { header, args })
    }

    /// Transmit everything buffered. A short write keeps the residual
    /// bytes; `WouldBlock` suspends the caller's write pump.
    pub fn flush(&mut self, mode: IoMode) -> io::Result<()> {
        while !self.bytes_out.is_empty() {
            let sent = self
                .socket
                .send(self.bytes_out.readable(), self.fds_out.make_contiguous(), mode)?;

            self.bytes_out.consume(sent);
            // Descriptors travel with the first byte of the submission.
            self.fds_out.clear();
        }

        Ok(())
    }

    /// Drop all buffered state, closing any descriptors received but not
    /// yet consumed by a message.
    pub fn discard_pending(&mut self) {
        self.bytes_in.clear();
        self.bytes_out.clear();
        self.fds_in.clear();
        self.fds_out.clear();
    }

    pub fn transport(&self) -> &T {
        &self.socket
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.socket
    }

    fn fill_incoming(&mut self, mode: IoMode) -> io::Result<()> {
        let mut chunk = [0u8; BYTES_PER_READ];
        let read = self.socket.recv(&mut chunk, &mut self.fds_in, mode)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        self.bytes_in.write_bytes(&chunk[..read]);
        Ok(())
    }

    /// Length-prefixed, zero-padded chunk: the wire form of strings (length
    /// includes the terminating NUL) and arrays (length is the byte count).
    fn write_chunk(&mut self, bytes: &[u8]) {
        self.bytes_out.write_u32(bytes.len() as u32);
        self.bytes_out.write_bytes(bytes);

        let padding = bytes.len().next_multiple_of(4) - bytes.len();
        self.bytes_out.write_bytes(&[0, 0, 0][..padding]);
    }

    fn recv_array(&mut self) -> Vec<u8> {
        let len = self.bytes_in.read_u32() as usize;
        let mut buf = vec![0; len];
        self.bytes_in.read_bytes(&mut buf);
        self.bytes_in.consume(len.next_multiple_of(4) - len);
        buf
    }

    fn recv_string_with_len(&mut self, len: u32) -> Result<CString, RecvMessageError> {
        let len = len as usize;
        let mut buf = vec![0; len];
        self.bytes_in.read_bytes(&mut buf);
        self.bytes_in.consume(len.next_multiple_of(4) - len);

        CString::from_vec_with_nul(buf).map_err(|_| WireError::NullInString.into())
    }

    fn recv_string(&mut self) -> Result<CString, RecvMessageError> {
        match self.bytes_in.read_u32() {
            0 => Err(WireError::UnexpectedNull.into()),
            len => self.recv_string_with_len(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    /// In-memory transport: everything sent becomes immediately receivable.
    struct Loopback {
        bytes: VecDeque<u8>,
        fds: VecDeque<OwnedFd>,
        max_chunk: usize,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                bytes: VecDeque::new(),
                fds: VecDeque::new(),
                max_chunk: usize::MAX,
            }
        }
    }

    impl Transport for Loopback {
        fn pollable_fd(&self) -> RawFd {
            -1
        }

        fn send(&mut self, bytes: &[u8], fds: &[OwnedFd], _mode: IoMode) -> io::Result<usize> {
            self.bytes.extend(bytes);
            for fd in fds {
                self.fds.push_back(fd.try_clone()?);
            }
            Ok(bytes.len())
        }

        fn recv(
            &mut self,
            bytes: &mut [u8],
            fds: &mut VecDeque<OwnedFd>,
            _mode: IoMode,
        ) -> io::Result<usize> {
            fds.extend(self.fds.drain(..));
            let n = self.bytes.len().min(bytes.len()).min(self.max_chunk);
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            for slot in &mut bytes[..n] {
                *slot = self.bytes.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn message(id: u32, opcode: u16, args: Vec<ArgValue>) -> Message {
        Message {
            header: MessageHeader {
                object_id: ObjectId(NonZeroU32::new(id).unwrap()),
                size: 0,
                opcode,
            },
            args,
        }
    }

    /// Encode one message and return its raw payload (header stripped).
    fn encode(args: Vec<ArgValue>) -> Vec<u8> {
        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        sock.write_message(message(1, 0, args), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();
        let raw: Vec<u8> = sock.transport_mut().bytes.iter().copied().collect();
        raw[MessageHeader::SIZE..].to_vec()
    }

    /// Encode then decode through the loopback, returning the arguments.
    fn round_trip(args: Vec<ArgValue>, signature: &[ArgType]) -> Vec<ArgValue> {
        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        sock.write_message(message(1, 7, args), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        let header = sock.peek_message_header(IoMode::Blocking).unwrap();
        assert_eq!(header.opcode, 7);
        let msg = sock
            .recv_message(header, signature, &mut pool, IoMode::Blocking)
            .unwrap();
        msg.args
    }

    #[test]
    fn encode_int() {
        assert_eq!(encode(vec![ArgValue::Int(127)]), [0x7F, 0, 0, 0]);
    }

    #[test]
    fn encode_fixed() {
        // 127.31 = 0x7F4F in 24.8
        assert_eq!(
            encode(vec![ArgValue::Fixed(Fixed::from(127.31f64))]),
            [0x4F, 0x7F, 0, 0]
        );
    }

    #[test]
    fn encode_string() {
        assert_eq!(
            encode(vec![ArgValue::String(CString::new("string").unwrap())]),
            b"\x07\x00\x00\x00string\x00\x00"
        );
    }

    #[test]
    fn encode_array() {
        assert_eq!(
            encode(vec![ArgValue::Array(b"string".to_vec())]),
            b"\x06\x00\x00\x00string\x00\x00"
        );
    }

    #[test]
    fn header_layout() {
        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        sock.write_message(message(3, 2, vec![ArgValue::Uint(9)]), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        let raw: Vec<u8> = sock.transport_mut().bytes.iter().copied().collect();
        // id, then opcode in the low half and size (12) in the high half.
        assert_eq!(raw, [3, 0, 0, 0, 2, 0, 12, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn primitive_round_trips() {
        let args = round_trip(
            vec![
                ArgValue::Int(-42),
                ArgValue::Uint(42),
                ArgValue::Fixed(Fixed::from(127.31f64)),
                ArgValue::String(CString::new("string").unwrap()),
                ArgValue::Array(b"bytes".to_vec()),
                ArgValue::OptString(None),
                ArgValue::OptObject(None),
            ],
            &[
                ArgType::Int,
                ArgType::Uint,
                ArgType::Fixed,
                ArgType::String,
                ArgType::Array,
                ArgType::OptString,
                ArgType::OptObject,
            ],
        );

        assert!(matches!(args[0], ArgValue::Int(-42)));
        assert!(matches!(args[1], ArgValue::Uint(42)));
        let ArgValue::Fixed(fixed) = args[2] else {
            panic!()
        };
        assert!((fixed.as_f64() - 127.31).abs() < 0.004);
        let ArgValue::String(ref s) = args[3] else {
            panic!()
        };
        assert_eq!(s.to_bytes(), b"string");
        let ArgValue::Array(ref a) = args[4] else {
            panic!()
        };
        assert_eq!(a, b"bytes");
        assert!(matches!(args[5], ArgValue::OptString(None)));
        assert!(matches!(args[6], ArgValue::OptObject(None)));
    }

    #[test]
    fn short_reads_reassemble() {
        let mut sock = BufferedSocket::from(Loopback::new());
        sock.transport_mut().max_chunk = 3;
        let mut pool = MessageBuffersPool::default();

        sock.write_message(
            message(1, 0, vec![ArgValue::String(CString::new("a longer string").unwrap())]),
            &mut pool,
            IoMode::Blocking,
        )
        .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        let header = loop {
            match sock.peek_message_header(IoMode::Blocking) {
                Ok(h) => break h,
                Err(RecvMessageError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        };
        let msg = loop {
            match sock.recv_message(header, &[ArgType::String], &mut pool, IoMode::Blocking) {
                Ok(m) => break m,
                Err(RecvMessageError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        };
        let ArgValue::String(ref s) = msg.args[0] else {
            panic!()
        };
        assert_eq!(s.to_bytes(), b"a longer string");
    }

    #[test]
    fn null_object_is_rejected() {
        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        sock.write_message(
            message(1, 0, vec![ArgValue::OptObject(None)]),
            &mut pool,
            IoMode::Blocking,
        )
        .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        let header = sock.peek_message_header(IoMode::Blocking).unwrap();
        let err = sock
            .recv_message(header, &[ArgType::Object], &mut pool, IoMode::Blocking)
            .unwrap_err();
        assert!(matches!(
            err,
            RecvMessageError::Wire(WireError::UnexpectedNull)
        ));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        let err = sock
            .write_message(
                message(1, 0, vec![ArgValue::Array(vec![0; MAX_MESSAGE_SIZE])]),
                &mut pool,
                IoMode::Blocking,
            )
            .unwrap_err();
        assert!(matches!(err.err, SendError::Wire(WireError::TooManyBytes)));
        // The message is handed back for reporting.
        assert_eq!(err.msg.args.len(), 1);
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd, byte: u8) {
        let buf = [byte];
        assert_eq!(
            unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), 1) },
            1
        );
    }

    fn read_byte(fd: &OwnedFd) -> u8 {
        let mut buf = [0u8];
        assert_eq!(
            unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) },
            1
        );
        buf[0]
    }

    #[test]
    fn fds_are_consumed_in_arrival_order() {
        let (read_a, write_a) = pipe();
        let (read_b, write_b) = pipe();

        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();

        sock.write_message(message(1, 0, vec![ArgValue::Fd(write_a)]), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.write_message(message(1, 1, vec![ArgValue::Fd(write_b)]), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        for tag in [b'1', b'2'] {
            let header = sock.peek_message_header(IoMode::Blocking).unwrap();
            let msg = sock
                .recv_message(header, &[ArgType::Fd], &mut pool, IoMode::Blocking)
                .unwrap();
            let ArgValue::Fd(ref fd) = msg.args[0] else {
                panic!()
            };
            write_byte(fd, tag);
        }

        // First message carried pipe A's write end, second pipe B's.
        assert_eq!(read_byte(&read_a), b'1');
        assert_eq!(read_byte(&read_b), b'2');
    }

    #[test]
    fn discard_pending_clears_descriptor_queue() {
        let (_read_a, write_a) = pipe();

        let mut sock = BufferedSocket::from(Loopback::new());
        let mut pool = MessageBuffersPool::default();
        sock.write_message(message(1, 0, vec![ArgValue::Fd(write_a)]), &mut pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        sock.flush(IoMode::Blocking).unwrap();

        // Pull the bytes (and the descriptor) into the inbound queues.
        let _ = sock.peek_message_header(IoMode::Blocking).unwrap();
        assert_eq!(sock.fds_in.len(), 1);

        sock.discard_pending();
        assert!(sock.fds_in.is_empty());
        assert!(sock.bytes_in.is_empty());
    }
}
