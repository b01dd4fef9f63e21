//! Request framing for the store's wire protocol.
//!
//! Requests are multi-bulk arrays: an array header with the argument count,
//! then one bulk string per argument, each header carrying the argument's
//! byte length. Every segment ends with `\r\n`. Lengths are always taken from
//! the bytes being written so a declared length can never disagree with the
//! payload that follows it.
//!
//! Responses are never parsed by this crate.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Encoder;

const CRLF: &[u8] = b"\r\n";

/// One request: the verb followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            args: args
                .into_iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        }
    }

    /// Size of the frame [`RespEncoder`] writes for this command.
    pub fn encoded_len(&self) -> usize {
        frame_len(&self.args)
    }
}

/// Frames [`Command`]s for a `FramedWrite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespEncoder;

impl Encoder<Command> for RespEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> io::Result<()> {
        write_frame(&item.args, dst);
        Ok(())
    }
}

/// Encodes `args` (verb first) into one request frame.
pub fn encode<I, A>(args: I) -> Bytes
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let args: Vec<A> = args.into_iter().collect();
    let mut dst = BytesMut::new();
    write_frame(&args, &mut dst);
    dst.freeze()
}

fn write_frame<A: AsRef<[u8]>>(args: &[A], dst: &mut BytesMut) {
    dst.reserve(frame_len(args));
    write_header(b'*', args.len(), dst);
    for arg in args {
        let arg = arg.as_ref();
        write_header(b'$', arg.len(), dst);
        dst.put_slice(arg);
        dst.put_slice(CRLF);
    }
}

fn write_header(marker: u8, len: usize, dst: &mut BytesMut) {
    dst.put_u8(marker);
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(CRLF);
}

fn frame_len<A: AsRef<[u8]>>(args: &[A]) -> usize {
    let header = |n: usize| 1 + digits(n) + CRLF.len();
    args.iter().fold(header(args.len()), |acc, arg| {
        let n = arg.as_ref().len();
        acc + header(n) + n + CRLF.len()
    })
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}
